use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::transport::{
    ChatTransport, EmptyMessageSetSnafu, Role, StreamEvent, StreamEventPayload, StreamRequest,
    StreamTarget, TransportResult, TransportStreamHandle, TransportWorker, make_event_stream,
};

pub const ECHO_TRANSPORT_ID: &str = "echo";

const ECHO_CHUNK_CHARS: usize = 8;

/// One step of a scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Chunk(String),
    Fail(String),
    /// Never finishes; the stream stays open until cancelled.
    Stall,
}

/// Offline transport that answers without any network IO.
///
/// Queued scripts are replayed one per request. When the queue is empty the
/// last user message is echoed back in small chunks.
pub struct EchoTransport {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<StreamRequest>>,
    chunk_delay: Duration,
}

impl EchoTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(steps);
    }

    /// Requests received so far, oldest first.
    pub fn recorded_requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn echo_script(request: &StreamRequest) -> Vec<ScriptStep> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default();

        let reply = match &request.context_url {
            Some(url) => format!("[{url}] You said: {last_user}"),
            None => format!("You said: {last_user}"),
        };

        let chars = reply.chars().collect::<Vec<_>>();
        chars
            .chunks(ECHO_CHUNK_CHARS)
            .map(|chunk| ScriptStep::Chunk(chunk.iter().collect()))
            .collect()
    }

    async fn run_script(
        target: StreamTarget,
        steps: Vec<ScriptStep>,
        chunk_delay: Duration,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in steps {
            if !chunk_delay.is_zero() {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(chunk_delay) => {}
                }
            }

            let payload = match step {
                ScriptStep::Chunk(text) => StreamEventPayload::Delta(text),
                ScriptStep::Fail(message) => {
                    let _ = event_tx.send(StreamEvent {
                        target,
                        payload: StreamEventPayload::Error(message),
                    });
                    return;
                }
                ScriptStep::Stall => {
                    let _ = (&mut cancel_rx).await;
                    tracing::debug!(target = ?target, "stalled echo stream released");
                    return;
                }
            };

            if event_tx.send(StreamEvent { target, payload }).is_err() {
                return;
            }
        }

        let _ = event_tx.send(StreamEvent {
            target,
            payload: StreamEventPayload::Done,
        });
    }
}

impl Default for EchoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatTransport for EchoTransport {
    fn id(&self) -> &str {
        ECHO_TRANSPORT_ID
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn stream_chat(&self, request: StreamRequest) -> TransportResult<TransportStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "echo-stream-chat",
                target: request.target,
            }
        );

        let steps = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| Self::echo_script(&request));

        let target = request.target;
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        let worker: TransportWorker = Box::pin(Self::run_script(
            target,
            steps,
            self.chunk_delay,
            event_tx,
            cancel_rx,
        ));

        Ok(TransportStreamHandle { stream, worker })
    }
}
