use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::transport::{
    ChatTransport, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu,
    MissingApiKeySnafu, Role, StreamEvent, StreamEventPayload, StreamRequest, StreamTarget,
    TransportConfig, TransportError, TransportMessage, TransportResult, TransportStreamHandle,
    TransportWorker, emit_error_event, make_event_stream,
};

pub const RIG_OPENAI_TRANSPORT_ID: &str = "rig-openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Talks to an OpenAI-compatible provider directly instead of going through
/// the chat-stream endpoint.
pub struct RigOpenAiTransport {
    config: TransportConfig,
}

impl RigOpenAiTransport {
    pub fn new(mut config: TransportConfig) -> TransportResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-transport-new",
                transport_id: config.transport_id.clone(),
            }
        );

        if config.model_id.is_empty() {
            config.model_id = DEFAULT_OPENAI_MODEL.to_string();
        }

        Ok(Self { config })
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn build_client(config: &TransportConfig) -> TransportResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.provider_base_url.is_empty() {
            builder = builder.base_url(config.provider_base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &TransportMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    fn preamble(request: &StreamRequest) -> Option<String> {
        let url = request.context_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }

        Some(format!(
            "You are an assistant answering questions about the website at {url}. \
             Keep answers grounded in that site's content and say so when you are unsure."
        ))
    }

    async fn open_stream(
        config: &TransportConfig,
        request: &StreamRequest,
    ) -> TransportResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(config.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::error!(
                target = ?request.target,
                model_id = %config.model_id,
                "message list became empty before prompt extraction"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: request.target,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::preamble(request) {
            builder = builder.preamble(preamble);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                StreamEventPayload::Delta(text.text)
            }
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(StreamEvent { target, payload })
    }

    async fn run_stream_worker(
        config: TransportConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    model_id = %config.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                emit_error_event(&event_tx, target, error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Stop provider IO as soon as the session abandons the request.
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = TransportError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            emit_error_event(&event_tx, target, error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEvent {
            target,
            payload: StreamEventPayload::Done,
        });
    }
}

impl ChatTransport for RigOpenAiTransport {
    fn id(&self) -> &str {
        RIG_OPENAI_TRANSPORT_ID
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn stream_chat(&self, request: StreamRequest) -> TransportResult<TransportStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(TransportStreamHandle { stream, worker })
    }
}
