use std::sync::Arc;

use sitechat_llm::{
    ChatTransport, StreamEventPayload, StreamRequest, StreamTarget, TransportEventStream,
};
use tokio::task::JoinHandle;

use super::events::{Stop, StreamEventMapped, Submit, TranscriptChange};
use super::message::{RequestId, Role, SessionId, StreamState};
use super::transcript::Transcript;

/// Banner text shown for transport and decode failures.
pub const STREAM_ERROR_MESSAGE: &str =
    "An error occurred while processing your request. Please try again.";
/// Banner text shown when a request could not be started at all.
pub const SEND_ERROR_MESSAGE: &str = "Failed to send message. Please try again.";

/// Everything needed to open a chat view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSeed {
    pub session_id: SessionId,
    pub target_url: String,
    pub initial_messages: Vec<(Role, String)>,
}

impl SessionSeed {
    pub fn new(session_id: SessionId, target_url: impl Into<String>) -> Self {
        Self {
            session_id,
            target_url: target_url.into(),
            initial_messages: Vec::new(),
        }
    }

    pub fn with_initial_messages(mut self, messages: Vec<(Role, String)>) -> Self {
        self.initial_messages = messages;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitIgnored {
    EmptyInput,
    StreamInFlight,
    SessionClosed,
    NothingToRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(RequestId),
    Ignored(SubmitIgnored),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

struct ActiveStream {
    request_id: RequestId,
    events: TransportEventStream,
    worker: JoinHandle<()>,
}

/// One chat view: owns the transcript and at most one in-flight request.
///
/// Lifecycle is `open -> active -> closed`. Closing abandons the in-flight
/// stream and no transcript mutation happens afterwards.
pub struct ChatSession {
    session_id: SessionId,
    target_url: String,
    transcript: Transcript,
    transport: Arc<dyn ChatTransport>,
    phase: SessionPhase,
    next_request_id: u64,
    active_stream: Option<ActiveStream>,
}

impl ChatSession {
    pub fn open(seed: SessionSeed, transport: Arc<dyn ChatTransport>) -> Self {
        tracing::info!(
            session_id = %seed.session_id,
            target_url = %seed.target_url,
            transport = transport.id(),
            initial_messages = seed.initial_messages.len(),
            "chat session opened"
        );

        Self {
            session_id: seed.session_id,
            target_url: seed.target_url,
            transcript: Transcript::with_history(seed.initial_messages),
            transport,
            phase: SessionPhase::Active,
            next_request_id: 1,
            active_stream: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn title(&self) -> String {
        format!("Chat with {}", self.target_url)
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.active_stream.is_some()
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.active_stream.as_ref().map(|active| active.request_id)
    }

    /// Appends a user message and starts streaming the reply.
    ///
    /// Empty input, a request already in flight, or a closed session make
    /// this a no-op.
    pub fn submit(&mut self, event: Submit) -> SubmitOutcome {
        if let Some(ignored) = self.refuse_new_request() {
            return SubmitOutcome::Ignored(ignored);
        }

        if self.transcript.append_user_message(&event.content).is_err() {
            return SubmitOutcome::Ignored(SubmitIgnored::EmptyInput);
        }

        self.start_request()
    }

    /// Requests the last turn again. A finished or partial trailing reply is
    /// discarded first.
    pub fn retry(&mut self) -> SubmitOutcome {
        if let Some(ignored) = self.refuse_new_request() {
            return SubmitOutcome::Ignored(ignored);
        }

        if !self.transcript.prepare_retry() {
            return SubmitOutcome::Ignored(SubmitIgnored::NothingToRetry);
        }

        self.start_request()
    }

    /// Waits for the next stream event and applies it to the transcript.
    ///
    /// Returns `None` when no request is in flight or the session is closed.
    /// Events from a stale request are skipped.
    pub async fn pump(&mut self) -> Option<TranscriptChange> {
        loop {
            if self.phase == SessionPhase::Closed {
                return None;
            }

            let active = self.active_stream.as_mut()?;
            let request_id = active.request_id;
            let next_event = active.events.recv().await;

            let change = match next_event {
                Some(event) => self.handle_stream_event(request_id, event.into()),
                None => Some(self.handle_stream_closed(request_id)),
            };

            if change.is_some() {
                return change;
            }
        }
    }

    /// Stops the active request; the partial reply is kept as incomplete.
    pub fn stop(&mut self) -> bool {
        let Some(request_id) = self.active_request() else {
            return false;
        };
        self.handle_stop(Stop { request_id })
    }

    pub fn handle_stop(&mut self, event: Stop) -> bool {
        if self.active_request() != Some(event.request_id) {
            return false;
        }

        self.abandon_active_stream();
        if let Err(error) = self.transcript.finish_stream(event.into_transition()) {
            tracing::warn!(
                session_id = %self.session_id,
                error = %error,
                "stop transition refused"
            );
        }
        tracing::info!(
            session_id = %self.session_id,
            request_id = event.request_id.0,
            "chat stream stopped by user"
        );
        true
    }

    pub fn dismiss_error(&mut self) -> bool {
        if self.phase == SessionPhase::Closed {
            return false;
        }
        self.transcript.dismiss_error().unwrap_or(false)
    }

    pub fn close(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }

        self.abandon_active_stream();
        self.phase = SessionPhase::Closed;
        tracing::info!(session_id = %self.session_id, "chat session closed");
    }

    fn refuse_new_request(&self) -> Option<SubmitIgnored> {
        if self.phase == SessionPhase::Closed {
            return Some(SubmitIgnored::SessionClosed);
        }
        if self.active_stream.is_some() || self.transcript.is_loading() {
            // Single-stream rule: ignore submissions while one request is in flight.
            return Some(SubmitIgnored::StreamInFlight);
        }
        None
    }

    fn start_request(&mut self) -> SubmitOutcome {
        let request_id = RequestId::new(self.next_request_id);
        // Reserve the next id immediately so follow-up requests never reuse it.
        self.next_request_id = self.next_request_id.saturating_add(1);

        if let Err(error) = self.transcript.begin_stream(request_id) {
            tracing::warn!(session_id = %self.session_id, error = %error, "request start refused");
            return SubmitOutcome::Ignored(SubmitIgnored::StreamInFlight);
        }

        let request = StreamRequest::new(
            StreamTarget::new(request_id.0),
            self.session_id.as_str(),
            self.transcript.request_history(),
        )
        .with_context_url(self.target_url.clone());

        match self.transport.stream_chat(request) {
            Ok(handle) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    request_id = request_id.0,
                    "chat request started"
                );
                self.active_stream = Some(ActiveStream {
                    request_id,
                    events: handle.stream,
                    worker: tokio::spawn(handle.worker),
                });
            }
            Err(error) => {
                tracing::error!(
                    session_id = %self.session_id,
                    request_id = request_id.0,
                    error = %error,
                    "failed to start chat request"
                );
                let _ = self.transcript.fail_stream(
                    request_id,
                    SEND_ERROR_MESSAGE,
                    Some(error.to_string()),
                );
            }
        }

        SubmitOutcome::Accepted(request_id)
    }

    fn handle_stream_event(
        &mut self,
        active_request: RequestId,
        event: StreamEventMapped,
    ) -> Option<TranscriptChange> {
        if event.request_id != active_request
            || !self.transcript.stream_state().accepts_stream_event(event.request_id)
        {
            // Strict request equality keeps chunks of an abandoned request out.
            tracing::debug!(
                session_id = %self.session_id,
                request_id = event.request_id.0,
                "dropping stale stream event"
            );
            return None;
        }

        if let StreamEventPayload::Delta(delta) = &event.payload {
            let message_id = self.transcript.append_assistant_chunk(delta)?;
            return Some(TranscriptChange::AssistantDelta {
                message_id,
                delta: delta.clone(),
            });
        }

        let transition = event.into_transition()?;
        self.active_stream = None;

        match self.transcript.finish_stream(transition) {
            Ok(message_id) => match self.transcript.stream_state() {
                StreamState::Error { message, detail } => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        request_id = active_request.0,
                        detail = ?detail,
                        "chat stream failed"
                    );
                    Some(TranscriptChange::StreamFailed {
                        message: message.clone(),
                        detail: detail.clone(),
                        incomplete: message_id,
                    })
                }
                StreamState::Idle | StreamState::Loading(_) => {
                    Some(TranscriptChange::AssistantFinalized { message_id })
                }
            },
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %error,
                    "terminal event refused"
                );
                None
            }
        }
    }

    fn handle_stream_closed(&mut self, request_id: RequestId) -> TranscriptChange {
        self.active_stream = None;
        let detail = "transport stream ended before a terminal event".to_string();
        let incomplete = self
            .transcript
            .fail_stream(request_id, STREAM_ERROR_MESSAGE, Some(detail.clone()))
            .unwrap_or(None);
        TranscriptChange::StreamFailed {
            message: STREAM_ERROR_MESSAGE.to_string(),
            detail: Some(detail),
            incomplete,
        }
    }

    fn abandon_active_stream(&mut self) {
        let Some(mut active) = self.active_stream.take() else {
            return;
        };
        // Cancelling drops further events; aborting stops the worker's IO.
        active.events.cancel();
        active.worker.abort();
        tracing::debug!(
            session_id = %self.session_id,
            request_id = active.request_id.0,
            "abandoned in-flight chat stream"
        );
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sitechat_llm::{EchoTransport, ScriptStep};

    use super::*;
    use crate::chat::message::MessageStatus;

    fn open_session(transport: Arc<EchoTransport>) -> ChatSession {
        ChatSession::open(
            SessionSeed::new(SessionId::new("session-under-test"), "https://example.com"),
            transport,
        )
    }

    async fn drain(session: &mut ChatSession) -> Vec<TranscriptChange> {
        let mut changes = Vec::new();
        while let Some(change) = session.pump().await {
            changes.push(change);
        }
        changes
    }

    fn chunks(parts: &[&str]) -> Vec<ScriptStep> {
        parts
            .iter()
            .map(|part| ScriptStep::Chunk(part.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn streamed_chunks_become_one_finalized_reply() {
        let transport = Arc::new(EchoTransport::new().with_script(chunks(&["Hel", "lo"])));
        let mut session = open_session(transport.clone());

        assert!(session.submit(Submit::new("Say hello")).is_accepted());
        assert!(session.is_loading());
        let changes = drain(&mut session).await;

        assert!(matches!(
            changes.last(),
            Some(TranscriptChange::AssistantFinalized { message_id: Some(_) })
        ));
        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Say hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[1].status, MessageStatus::Done);
        assert_eq!(session.transcript().stream_state(), &StreamState::Idle);
        assert!(!session.is_loading());

        let requests = transport.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].session_id, "session-under-test");
        assert_eq!(requests[0].context_url.as_deref(), Some("https://example.com"));
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn failure_before_any_chunk_only_sets_error_state() {
        let transport = Arc::new(EchoTransport::new().with_script(vec![ScriptStep::Fail(
            "connection refused".to_string(),
        )]));
        let mut session = open_session(transport);

        session.submit(Submit::new("hi"));
        let messages_before = session.transcript().messages().to_vec();
        let changes = drain(&mut session).await;

        assert_eq!(session.transcript().messages(), messages_before.as_slice());
        let error = session.transcript().error_message().unwrap();
        assert!(!error.is_empty());
        assert!(matches!(
            changes.as_slice(),
            [TranscriptChange::StreamFailed { incomplete: None, detail: Some(detail), .. }]
                if detail == "connection refused"
        ));
    }

    #[tokio::test]
    async fn failure_mid_stream_keeps_partial_reply_as_incomplete() {
        let mut steps = chunks(&["Par", "tial"]);
        steps.push(ScriptStep::Fail("reset".to_string()));
        let transport = Arc::new(EchoTransport::new().with_script(steps));
        let mut session = open_session(transport);

        session.submit(Submit::new("hi"));
        drain(&mut session).await;

        let reply = &session.transcript().messages()[1];
        assert_eq!(reply.content, "Partial");
        assert_eq!(reply.status, MessageStatus::Incomplete("reset".to_string()));
        assert!(session.transcript().error_message().is_some());
    }

    #[tokio::test]
    async fn second_submit_while_loading_is_a_no_op() {
        let transport = Arc::new(EchoTransport::new().with_script(vec![ScriptStep::Stall]));
        let mut session = open_session(transport.clone());

        let first = session.submit(Submit::new("first"));
        assert!(first.is_accepted());
        let messages_before = session.transcript().messages().to_vec();

        assert_eq!(
            session.submit(Submit::new("second")),
            SubmitOutcome::Ignored(SubmitIgnored::StreamInFlight)
        );
        assert_eq!(session.retry(), SubmitOutcome::Ignored(SubmitIgnored::StreamInFlight));
        assert_eq!(session.transcript().messages(), messages_before.as_slice());
        assert_eq!(transport.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn empty_submit_changes_nothing() {
        let transport = Arc::new(EchoTransport::new());
        let mut session = open_session(transport.clone());

        assert_eq!(
            session.submit(Submit::new("  ")),
            SubmitOutcome::Ignored(SubmitIgnored::EmptyInput)
        );
        assert!(session.transcript().is_empty());
        assert!(!session.is_loading());
        assert!(transport.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn close_abandons_stream_without_further_mutation() {
        let mut steps = chunks(&["one"]);
        steps.push(ScriptStep::Stall);
        let transport = Arc::new(EchoTransport::new().with_script(steps));
        let mut session = open_session(transport);

        session.submit(Submit::new("hi"));
        assert!(matches!(
            session.pump().await,
            Some(TranscriptChange::AssistantDelta { .. })
        ));

        session.close();
        let snapshot = session.transcript().messages().to_vec();

        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(session.pump().await, None);
        assert_eq!(session.transcript().messages(), snapshot.as_slice());
        assert_eq!(
            session.submit(Submit::new("again")),
            SubmitOutcome::Ignored(SubmitIgnored::SessionClosed)
        );
    }

    #[tokio::test]
    async fn stop_keeps_partial_reply_and_allows_next_submit() {
        let transport = Arc::new(
            EchoTransport::new()
                .with_chunk_delay(Duration::from_millis(5))
                .with_script(vec![ScriptStep::Chunk("partial".to_string()), ScriptStep::Stall]),
        );
        let mut session = open_session(transport);

        session.submit(Submit::new("hi"));
        session.pump().await;
        assert!(session.stop());
        assert!(!session.stop());

        let reply = &session.transcript().messages()[1];
        assert_eq!(reply.status, MessageStatus::Incomplete("stopped".to_string()));
        assert_eq!(session.transcript().stream_state(), &StreamState::Idle);

        assert!(session.submit(Submit::new("next")).is_accepted());
        drain(&mut session).await;
        assert_eq!(session.transcript().messages().len(), 4);
    }

    #[tokio::test]
    async fn retry_after_error_resends_history_without_duplicate_user_turn() {
        let transport = Arc::new(
            EchoTransport::new().with_script(vec![ScriptStep::Fail("503".to_string())]),
        );
        transport.push_script(chunks(&["recovered"]));
        let mut session = open_session(transport.clone());

        session.submit(Submit::new("hello?"));
        drain(&mut session).await;
        assert!(session.transcript().error_message().is_some());

        assert!(session.retry().is_accepted());
        drain(&mut session).await;

        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "recovered");
        assert_eq!(session.transcript().error_message(), None);

        let requests = transport.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages, requests[0].messages);
        assert_ne!(requests[0].target, requests[1].target);
    }

    #[tokio::test]
    async fn initial_messages_are_sent_with_new_turns() {
        let transport = Arc::new(EchoTransport::new().with_script(chunks(&["ok"])));
        let seed = SessionSeed::new(SessionId::new("seeded"), "https://example.com")
            .with_initial_messages(vec![
                (Role::User, "earlier question".to_string()),
                (Role::Assistant, "earlier answer".to_string()),
            ]);
        let mut session = ChatSession::open(seed, transport.clone());

        session.submit(Submit::new("follow-up"));
        drain(&mut session).await;

        assert_eq!(session.transcript().messages().len(), 4);
        assert_eq!(transport.recorded_requests()[0].messages.len(), 3);
        assert_eq!(session.title(), "Chat with https://example.com");
    }

    #[tokio::test]
    async fn dismiss_clears_error_banner() {
        let transport = Arc::new(
            EchoTransport::new().with_script(vec![ScriptStep::Fail("down".to_string())]),
        );
        let mut session = open_session(transport);

        session.submit(Submit::new("hi"));
        drain(&mut session).await;

        assert!(session.dismiss_error());
        assert_eq!(session.transcript().stream_state(), &StreamState::Idle);
    }

    #[tokio::test]
    async fn retry_without_user_turn_is_ignored_and_keeps_messages() {
        let transport = Arc::new(EchoTransport::new());
        let seed = SessionSeed::new(SessionId::new("greeted"), "https://example.com")
            .with_initial_messages(vec![(Role::Assistant, "Welcome!".to_string())]);
        let mut session = ChatSession::open(seed, transport.clone());

        assert_eq!(session.retry(), SubmitOutcome::Ignored(SubmitIgnored::NothingToRetry));
        assert_eq!(session.transcript().messages().len(), 1);
        assert_eq!(session.transcript().messages()[0].content, "Welcome!");
        assert!(transport.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn events_for_another_request_are_dropped() {
        let transport = Arc::new(EchoTransport::new().with_script(vec![ScriptStep::Stall]));
        let mut session = open_session(transport);

        let SubmitOutcome::Accepted(active) = session.submit(Submit::new("hi")) else {
            panic!("submit should be accepted");
        };
        let snapshot = session.transcript().messages().to_vec();

        let stale = StreamEventMapped {
            request_id: RequestId::new(active.0 + 41),
            payload: StreamEventPayload::Delta("from an old request".to_string()),
        };
        assert_eq!(session.handle_stream_event(active, stale), None);

        let stale_done = StreamEventMapped {
            request_id: RequestId::new(active.0 + 41),
            payload: StreamEventPayload::Done,
        };
        assert_eq!(session.handle_stream_event(active, stale_done), None);

        assert_eq!(session.transcript().messages(), snapshot.as_slice());
        assert_eq!(session.transcript().stream_state(), &StreamState::Loading(active));
        assert!(session.is_loading());
    }
}
