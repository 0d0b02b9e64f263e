use std::fmt;

use uuid::Uuid;

/// Opaque identifier shared with the backend for the lifetime of one chat view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Stable identifier for one message within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one request to the inference endpoint.
///
/// This must change on every submit/retry so stale chunks can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "You",
            Self::Assistant => "AI",
        }
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming(RequestId),
    Done,
    /// Partial reply whose stream failed or was stopped; kept visible.
    Incomplete(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            status,
        }
    }

    pub fn user(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content, MessageStatus::Done)
    }

    /// Creates an assistant message that receives deltas for `request_id`.
    pub fn assistant_streaming(
        id: MessageId,
        request_id: RequestId,
        first_delta: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Role::Assistant,
            first_delta,
            MessageStatus::Streaming(request_id),
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self.status, MessageStatus::Incomplete(_))
    }
}

/// Request status for one session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Loading(RequestId),
    Error {
        message: String,
        detail: Option<String>,
    },
}

/// State transition input for the request lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(RequestId),
    Complete(RequestId),
    Fail {
        request_id: RequestId,
        message: String,
        detail: Option<String>,
    },
    Cancel(RequestId),
    Raise {
        message: String,
        detail: Option<String>,
    },
    Dismiss,
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: RequestId,
        attempted: RequestId,
    },
    NoActiveStream,
    RequestMismatch {
        active: RequestId,
        attempted: RequestId,
    },
    StreamInFlight(RequestId),
}

impl fmt::Display for StreamTransitionRejection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStreaming { active, attempted } => write!(
                formatter,
                "request {} is already streaming, refused {}",
                active.0, attempted.0
            ),
            Self::NoActiveStream => formatter.write_str("no request is streaming"),
            Self::RequestMismatch { active, attempted } => write!(
                formatter,
                "event for request {} does not match active request {}",
                attempted.0, active.0
            ),
            Self::StreamInFlight(active) => {
                write!(formatter, "request {} is still streaming", active.0)
            }
        }
    }
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_request(&self) -> Option<RequestId> {
        match self {
            Self::Loading(request_id) => Some(*request_id),
            Self::Idle | Self::Error { .. } => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message, .. } => Some(message),
            Self::Idle | Self::Loading(_) => None,
        }
    }

    /// Returns true when incoming stream data matches the active request.
    pub fn accepts_stream_event(&self, request_id: RequestId) -> bool {
        matches!(self, Self::Loading(active) if *active == request_id)
    }

    /// Applies one transition deterministically.
    ///
    /// Idle and error states may start a new request directly. Terminal
    /// transitions (`Complete`/`Fail`/`Cancel`) must match the active request.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(request_id) => self.apply_start(request_id),
            StreamTransition::Complete(request_id) => {
                self.apply_terminal(request_id, Self::Idle)
            }
            StreamTransition::Fail {
                request_id,
                message,
                detail,
            } => self.apply_terminal(request_id, Self::Error { message, detail }),
            StreamTransition::Cancel(request_id) => self.apply_terminal(request_id, Self::Idle),
            StreamTransition::Raise { message, detail } => Ok(Self::Error { message, detail }),
            StreamTransition::Dismiss => self.apply_dismiss(),
        }
    }

    fn apply_start(&self, request_id: RequestId) -> StreamTransitionResult {
        match self {
            Self::Loading(active) if *active != request_id => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: request_id,
                })
            }
            Self::Loading(_) => Ok(self.clone()),
            Self::Idle | Self::Error { .. } => Ok(Self::Loading(request_id)),
        }
    }

    fn apply_terminal(&self, request_id: RequestId, next: Self) -> StreamTransitionResult {
        match self {
            Self::Loading(active) if *active == request_id => Ok(next),
            Self::Loading(active) => Err(StreamTransitionRejection::RequestMismatch {
                active: *active,
                attempted: request_id,
            }),
            Self::Idle | Self::Error { .. } => Err(StreamTransitionRejection::NoActiveStream),
        }
    }

    fn apply_dismiss(&self) -> StreamTransitionResult {
        match self {
            Self::Loading(active) => Err(StreamTransitionRejection::StreamInFlight(*active)),
            Self::Idle | Self::Error { .. } => Ok(Self::Idle),
        }
    }
}
