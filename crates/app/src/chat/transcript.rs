use sitechat_llm::{Role as TransportRole, TransportMessage};
use snafu::{Snafu, ensure};

use super::message::{
    Message, MessageId, MessageStatus, RequestId, Role, StreamState, StreamTransition,
    StreamTransitionRejection,
};
use super::scroll::ScrollManager;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TranscriptError {
    #[snafu(display("message text is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("stream transition refused on `{stage}`: {rejection}"))]
    TransitionRejected {
        stage: &'static str,
        rejection: StreamTransitionRejection,
    },
}

pub type TranscriptResult<T> = Result<T, TranscriptError>;

/// Ordered message log and request status for one session.
///
/// Messages are only ever appended (or, for retry, the trailing reply
/// removed); they are never reordered.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    stream_state: StreamState,
    in_progress: Option<MessageId>,
    next_message_id: u64,
    scroll: ScrollManager,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the transcript with finished messages, oldest first.
    pub fn with_history<I, S>(history: I) -> Self
    where
        I: IntoIterator<Item = (Role, S)>,
        S: Into<String>,
    {
        let mut transcript = Self::new();
        for (role, content) in history {
            let id = transcript.alloc_message_id();
            transcript
                .messages
                .push(Message::new(id, role, content, MessageStatus::Done));
        }
        if let Some(last) = transcript.messages.last() {
            transcript.scroll.request_scroll_to_bottom(last.id);
        }
        transcript
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn stream_state(&self) -> &StreamState {
        &self.stream_state
    }

    pub fn is_loading(&self) -> bool {
        self.stream_state.is_loading()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.stream_state.error_message()
    }

    pub fn in_progress(&self) -> Option<MessageId> {
        self.in_progress
    }

    pub fn scroll(&mut self) -> &mut ScrollManager {
        &mut self.scroll
    }

    pub fn append_user_message(&mut self, text: &str) -> TranscriptResult<MessageId> {
        ensure!(
            !text.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "append-user-message",
            }
        );

        let id = self.alloc_message_id();
        self.messages.push(Message::user(id, text));
        self.scroll.request_scroll_to_bottom(id);
        Ok(id)
    }

    /// Moves the transcript into `Loading` for `request_id`.
    pub fn begin_stream(&mut self, request_id: RequestId) -> TranscriptResult<()> {
        self.apply(StreamTransition::Start(request_id), "begin-stream")
    }

    /// Appends `delta` to the in-progress assistant message, creating it on
    /// the first non-empty delta.
    pub fn append_assistant_chunk(&mut self, delta: &str) -> Option<MessageId> {
        if let Some(id) = self.in_progress
            && let Some(message) = self.messages.iter_mut().find(|message| message.id == id)
        {
            message.content.push_str(delta);
            self.scroll.request_scroll_to_bottom(id);
            return Some(id);
        }

        if delta.is_empty() {
            return None;
        }

        let request_id = self.stream_state.active_request().unwrap_or(RequestId::new(0));
        let id = self.alloc_message_id();
        self.messages
            .push(Message::assistant_streaming(id, request_id, delta));
        self.in_progress = Some(id);
        self.scroll.request_scroll_to_bottom(id);
        Some(id)
    }

    /// Marks the in-progress assistant message complete. Its content is
    /// immutable afterwards.
    pub fn finalize_assistant_message(&mut self) -> Option<MessageId> {
        self.settle_in_progress(MessageStatus::Done)
    }

    /// Marks the in-progress assistant message as a kept partial reply.
    pub fn mark_assistant_incomplete(&mut self, reason: impl Into<String>) -> Option<MessageId> {
        self.settle_in_progress(MessageStatus::Incomplete(reason.into()))
    }

    /// Sets the error banner. Existing messages are kept; a reply still
    /// being written is marked incomplete.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.mark_assistant_incomplete(message.clone());
        if let Ok(next) = self.stream_state.apply(StreamTransition::Raise {
            message,
            detail: None,
        }) {
            self.stream_state = next;
        }
    }

    pub fn dismiss_error(&mut self) -> TranscriptResult<bool> {
        let had_error = self.error_message().is_some();
        self.apply(StreamTransition::Dismiss, "dismiss-error")?;
        Ok(had_error)
    }

    /// Applies a terminal transition and settles the in-progress reply:
    /// `Complete` finalizes it, `Fail` and `Cancel` keep it marked incomplete.
    pub fn finish_stream(
        &mut self,
        transition: StreamTransition,
    ) -> TranscriptResult<Option<MessageId>> {
        let settled_status = match &transition {
            StreamTransition::Complete(_) => MessageStatus::Done,
            StreamTransition::Fail {
                message, detail, ..
            } => MessageStatus::Incomplete(detail.clone().unwrap_or_else(|| message.clone())),
            StreamTransition::Cancel(_) => MessageStatus::Incomplete("stopped".to_string()),
            StreamTransition::Start(_)
            | StreamTransition::Raise { .. }
            | StreamTransition::Dismiss => {
                return TransitionRejectedSnafu {
                    stage: "finish-stream",
                    rejection: StreamTransitionRejection::NoActiveStream,
                }
                .fail();
            }
        };

        self.apply(transition, "finish-stream")?;
        Ok(self.settle_in_progress(settled_status))
    }

    /// Ends `request_id` successfully.
    pub fn complete_stream(
        &mut self,
        request_id: RequestId,
    ) -> TranscriptResult<Option<MessageId>> {
        self.finish_stream(StreamTransition::Complete(request_id))
    }

    /// Ends `request_id` with an error; whatever was streamed stays visible.
    pub fn fail_stream(
        &mut self,
        request_id: RequestId,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> TranscriptResult<Option<MessageId>> {
        self.finish_stream(StreamTransition::Fail {
            request_id,
            message: message.into(),
            detail,
        })
    }

    /// Ends `request_id` on user request; the partial reply is kept.
    pub fn cancel_stream(&mut self, request_id: RequestId) -> TranscriptResult<Option<MessageId>> {
        self.finish_stream(StreamTransition::Cancel(request_id))
    }

    /// Readies the last user turn to be requested again.
    ///
    /// A settled assistant reply directly after that turn is removed. Returns
    /// false, leaving the messages untouched, when no user turn is pending.
    pub fn prepare_retry(&mut self) -> bool {
        match self.messages.as_slice() {
            [.., preceding, last] if last.role == Role::Assistant => {
                if last.is_streaming() || preceding.role != Role::User {
                    return false;
                }
            }
            [.., last] => return last.role == Role::User,
            [] => return false,
        }

        self.messages.pop();
        true
    }

    /// History sent to the endpoint. Partial replies are left out so the
    /// model never continues from a truncated answer.
    pub fn request_history(&self) -> Vec<TransportMessage> {
        self.messages
            .iter()
            .filter(|message| !message.is_incomplete() && !message.content.is_empty())
            .map(|message| {
                let role = match message.role {
                    Role::User => TransportRole::User,
                    Role::Assistant => TransportRole::Assistant,
                };
                TransportMessage::new(role, message.content.clone())
            })
            .collect()
    }

    fn settle_in_progress(&mut self, status: MessageStatus) -> Option<MessageId> {
        let id = self.in_progress.take()?;
        let message = self.messages.iter_mut().find(|message| message.id == id)?;
        message.status = status;
        self.scroll.request_scroll_to_bottom(id);
        Some(id)
    }

    fn apply(&mut self, transition: StreamTransition, stage: &'static str) -> TranscriptResult<()> {
        match self.stream_state.apply(transition) {
            Ok(next) => {
                self.stream_state = next;
                Ok(())
            }
            Err(rejection) => TransitionRejectedSnafu { stage, rejection }.fail(),
        }
    }

    fn alloc_message_id(&mut self) -> MessageId {
        self.next_message_id = self.next_message_id.saturating_add(1);
        MessageId::new(self.next_message_id)
    }
}
