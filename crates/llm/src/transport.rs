use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::codec::WireFormat;

/// Speaker role on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportMessage {
    pub role: Role,
    pub content: String,
}

impl TransportMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Routing key for one request; events carrying another key are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

impl StreamTarget {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub session_id: String,
    pub messages: Vec<TransportMessage>,
    pub context_url: Option<String>,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        session_id: impl Into<String>,
        messages: Vec<TransportMessage>,
    ) -> Self {
        Self {
            target,
            session_id: session_id.into(),
            messages,
            context_url: None,
        }
    }

    pub fn with_context_url(mut self, url: impl Into<String>) -> Self {
        self.context_url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub transport_id: String,
    pub endpoint: String,
    pub wire_format: WireFormat,
    pub api_key: String,
    pub model_id: String,
    pub provider_base_url: String,
    pub connect_timeout: Option<Duration>,
    /// Longest silence tolerated between body chunks.
    pub read_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn new(transport_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            wire_format: WireFormat::default(),
            api_key: String::new(),
            model_id: String::new(),
            provider_base_url: String::new(),
            connect_timeout: None,
            read_timeout: None,
        }
    }

    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into().trim().to_string();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into().trim().to_string();
        self
    }

    pub fn with_provider_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.provider_base_url = base_url.into().trim().to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Transport-agnostic stream payload: chunk arrived, stream ended, stream failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("transport '{transport_id}' is not supported"))]
    UnsupportedTransport {
        stage: &'static str,
        transport_id: String,
    },
    #[snafu(display("missing API key for transport '{transport_id}'"))]
    MissingApiKey {
        stage: &'static str,
        transport_id: String,
    },
    #[snafu(display("endpoint '{endpoint}' is not a valid URL: {source}"))]
    InvalidEndpoint {
        stage: &'static str,
        endpoint: String,
        source: url::ParseError,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {endpoint} failed on `{stage}`: {source}"))]
    SendRequest {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("endpoint returned status {status}: {body}"))]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response chunk on `{stage}`: {source}"))]
    ReadChunk {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("malformed stream chunk on `{stage}`: {details}"))]
    Decode {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("endpoint reported an error: {message}"))]
    RemoteError {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Receiving half of one request's event channel.
///
/// Dropping it signals cancellation to the worker.
pub struct TransportEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TransportStreamHandle {
    pub stream: TransportEventStream,
    pub worker: TransportWorker,
}

impl TransportEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.events.close();
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for TransportEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait ChatTransport: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> TransportResult<TransportStreamHandle>;
}

pub(crate) fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    TransportEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        TransportEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

pub(crate) fn emit_error_event(
    event_tx: &mpsc::UnboundedSender<StreamEvent>,
    target: StreamTarget,
    error: TransportError,
) {
    let _ = event_tx.send(StreamEvent {
        target,
        payload: StreamEventPayload::Error(error.to_string()),
    });
}
