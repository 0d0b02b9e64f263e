use sitechat_llm::{StreamEvent, StreamEventPayload};

use crate::chat::message::{MessageId, RequestId, StreamTransition};

/// Emitted when the user submits a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    pub content: String,
}

impl Submit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Emitted when the user stops the active stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stop {
    pub request_id: RequestId,
}

impl Stop {
    pub fn into_transition(self) -> StreamTransition {
        StreamTransition::Cancel(self.request_id)
    }
}

/// Transport event translated into chat-domain request ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub request_id: RequestId,
    pub payload: StreamEventPayload,
}

impl From<StreamEvent> for StreamEventMapped {
    fn from(event: StreamEvent) -> Self {
        Self {
            request_id: RequestId::new(event.target.0),
            payload: event.payload,
        }
    }
}

impl StreamEventMapped {
    /// Maps terminal payloads to stream state transitions.
    ///
    /// Delta payloads return `None` because they mutate message content, not
    /// the request lifecycle.
    pub fn into_transition(self) -> Option<StreamTransition> {
        match self.payload {
            StreamEventPayload::Delta(_) => None,
            StreamEventPayload::Done => Some(StreamTransition::Complete(self.request_id)),
            StreamEventPayload::Error(detail) => Some(StreamTransition::Fail {
                request_id: self.request_id,
                message: crate::chat::session::STREAM_ERROR_MESSAGE.to_string(),
                detail: Some(detail),
            }),
        }
    }
}

/// What changed in the transcript after one stream event, for the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptChange {
    AssistantDelta {
        message_id: MessageId,
        delta: String,
    },
    AssistantFinalized {
        message_id: Option<MessageId>,
    },
    StreamFailed {
        message: String,
        detail: Option<String>,
        incomplete: Option<MessageId>,
    },
}

#[cfg(test)]
mod tests {
    use sitechat_llm::StreamTarget;

    use super::*;

    #[test]
    fn only_terminal_payloads_map_to_transitions() {
        let delta = StreamEventMapped::from(StreamEvent {
            target: StreamTarget::new(4),
            payload: StreamEventPayload::Delta("x".to_string()),
        });
        assert_eq!(delta.request_id, RequestId::new(4));
        assert_eq!(delta.into_transition(), None);

        let done = StreamEventMapped {
            request_id: RequestId::new(4),
            payload: StreamEventPayload::Done,
        };
        assert_eq!(done.into_transition(), Some(StreamTransition::Complete(RequestId::new(4))));

        let failed = StreamEventMapped {
            request_id: RequestId::new(4),
            payload: StreamEventPayload::Error("timeout".to_string()),
        };
        assert!(matches!(
            failed.into_transition(),
            Some(StreamTransition::Fail { detail: Some(detail), .. }) if detail == "timeout"
        ));
    }
}
