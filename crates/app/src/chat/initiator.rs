use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use snafu::{ResultExt, Snafu, ensure};
use url::Url;

/// Characters escaped in a route segment; everything except
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is percent-encoded.
const ROUTE_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitiatorError {
    #[snafu(display("'{raw}' is not a valid URL: {source}"))]
    InvalidUrl {
        stage: &'static str,
        raw: String,
        source: url::ParseError,
    },
    #[snafu(display("'{raw}' must be an http or https URL, got scheme '{scheme}'"))]
    UnsupportedScheme {
        stage: &'static str,
        raw: String,
        scheme: String,
    },
    #[snafu(display("route segment '{segment}' is not valid percent-encoded UTF-8"))]
    InvalidRouteEncoding {
        stage: &'static str,
        segment: String,
        source: std::str::Utf8Error,
    },
}

pub type InitiatorResult<T> = Result<T, InitiatorError>;

/// Where the chat view lives for one target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTarget {
    pub path: String,
    pub target_url: String,
}

impl NavigationTarget {
    pub fn for_url(target_url: impl Into<String>) -> Self {
        let target_url = target_url.into();
        Self {
            path: navigation_path(&target_url),
            target_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InitiatorState {
    #[default]
    Idle,
    Loading(NavigationTarget),
}

/// Landing form: collects a URL and hands over to the chat view.
#[derive(Debug, Default)]
pub struct SessionInitiator {
    input: String,
    state: InitiatorState,
    transition_delay: Duration,
}

impl SessionInitiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay = delay;
        self
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Updates the form field. Ignored while a transition is pending.
    pub fn set_input(&mut self, value: impl Into<String>) -> bool {
        if self.is_loading() {
            return false;
        }
        self.input = value.into();
        true
    }

    pub fn state(&self) -> &InitiatorState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, InitiatorState::Loading(_))
    }

    /// Validates the field and enters `Loading`.
    ///
    /// Returns `Ok(None)` without touching state for empty input or while a
    /// transition is already pending.
    pub fn submit(&mut self) -> InitiatorResult<Option<NavigationTarget>> {
        if self.is_loading() {
            return Ok(None);
        }

        let raw = self.input.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        validate_target_url(raw)?;

        let target = NavigationTarget::for_url(raw);
        tracing::debug!(path = %target.path, "landing form accepted target url");
        self.state = InitiatorState::Loading(target.clone());
        Ok(Some(target))
    }

    /// `submit`, then waits out the configured transition delay before
    /// handing back the navigation target.
    pub async fn submit_and_navigate(&mut self) -> InitiatorResult<Option<NavigationTarget>> {
        let Some(target) = self.submit()? else {
            return Ok(None);
        };

        if !self.transition_delay.is_zero() {
            tokio::time::sleep(self.transition_delay).await;
        }
        Ok(Some(target))
    }
}

pub fn validate_target_url(raw: &str) -> InitiatorResult<Url> {
    let url = Url::parse(raw.trim()).context(InvalidUrlSnafu {
        stage: "validate-target-url",
        raw: raw.to_string(),
    })?;
    ensure!(
        matches!(url.scheme(), "http" | "https"),
        UnsupportedSchemeSnafu {
            stage: "validate-target-url",
            raw: raw.to_string(),
            scheme: url.scheme().to_string(),
        }
    );
    Ok(url)
}

pub fn encode_route_segment(target_url: &str) -> String {
    utf8_percent_encode(target_url, ROUTE_SEGMENT).to_string()
}

pub fn navigation_path(target_url: &str) -> String {
    format!("/{}", encode_route_segment(target_url))
}

/// Recovers the target URL from a chat route; the leading `/` is optional.
pub fn decode_route_segment(path: &str) -> InitiatorResult<String> {
    let segment = path.strip_prefix('/').unwrap_or(path);
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .context(InvalidRouteEncodingSnafu {
            stage: "decode-route-segment",
            segment: segment.to_string(),
        })
}
