use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::Serialize;
use snafu::{IntoError, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::codec::{ChunkDecoder, DecodedPart, WireFormat};
use super::transport::{
    BuildHttpClientSnafu, ChatTransport, EmptyMessageSetSnafu, InvalidEndpointSnafu,
    ReadChunkSnafu, RemoteSnafu, SendRequestSnafu, StreamEvent, StreamEventPayload,
    StreamRequest, StreamTarget, TransportConfig, TransportMessage, TransportResult,
    TransportStreamHandle, TransportWorker, UnexpectedStatusSnafu, emit_error_event,
    make_event_stream,
};

pub const HTTP_TRANSPORT_ID: &str = "http";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000/api/chat-stream";

/// Longest error body kept in an `UnexpectedStatus` message.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    session_id: &'a str,
    messages: &'a [TransportMessage],
}

enum PartFlow {
    Continue,
    Finished,
    Stopped,
}

/// Streams replies from a single HTTP endpoint that accepts
/// `{ sessionId, messages }` and answers with a chunked body.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    endpoint: Url,
    wire_format: WireFormat,
}

impl HttpStreamTransport {
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        let raw_endpoint = if config.endpoint.is_empty() {
            DEFAULT_ENDPOINT
        } else {
            config.endpoint.as_str()
        };
        let endpoint = Url::parse(raw_endpoint).context(InvalidEndpointSnafu {
            stage: "http-transport-new",
            endpoint: raw_endpoint.to_string(),
        })?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        let client = builder.build().context(BuildHttpClientSnafu {
            stage: "build-client",
        })?;

        Ok(Self {
            client,
            endpoint,
            wire_format: config.wire_format,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn open_stream(
        client: &reqwest::Client,
        endpoint: &Url,
        request: &StreamRequest,
    ) -> TransportResult<reqwest::Response> {
        let body = RequestBody {
            session_id: &request.session_id,
            messages: &request.messages,
        };

        let response = client
            .post(endpoint.clone())
            .header(ACCEPT, HeaderValue::from_static("text/plain, */*"))
            .json(&body)
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "send-chat-request",
                endpoint: endpoint.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return UnexpectedStatusSnafu {
                stage: "chat-http-status",
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>(),
            }
            .fail();
        }

        Ok(response)
    }

    fn forward_parts(
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        target: StreamTarget,
        parts: Vec<DecodedPart>,
    ) -> PartFlow {
        for part in parts {
            match part {
                DecodedPart::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let event = StreamEvent {
                        target,
                        payload: StreamEventPayload::Delta(text),
                    };
                    if event_tx.send(event).is_err() {
                        return PartFlow::Stopped;
                    }
                }
                DecodedPart::Error(message) => {
                    tracing::warn!(target = ?target, %message, "endpoint streamed an error part");
                    emit_error_event(
                        event_tx,
                        target,
                        RemoteSnafu {
                            stage: "stream-error-part",
                            message,
                        }
                        .build(),
                    );
                    return PartFlow::Stopped;
                }
                DecodedPart::Finish => return PartFlow::Finished,
            }
        }
        PartFlow::Continue
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        endpoint: Url,
        wire_format: WireFormat,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;

        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "chat request cancelled before response");
                return;
            }
            opened = Self::open_stream(&client, &endpoint, &request) => opened,
        };

        let response = match opened {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    endpoint = %endpoint,
                    error = %error,
                    "failed to open chat stream"
                );
                emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut body = response.bytes_stream();
        let mut decoder = ChunkDecoder::new(wire_format);
        let mut chunk_count = 0usize;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(target = ?target, chunk_count, "chat stream cancelled");
                    return;
                }
                next_chunk = body.next() => {
                    match next_chunk {
                        Some(Ok(bytes)) => {
                            chunk_count += 1;
                            let parts = match decoder.push(&bytes) {
                                Ok(parts) => parts,
                                Err(error) => {
                                    tracing::warn!(
                                        target = ?target,
                                        error = %error,
                                        "failed to decode chat stream chunk"
                                    );
                                    emit_error_event(&event_tx, target, error);
                                    return;
                                }
                            };
                            match Self::forward_parts(&event_tx, target, parts) {
                                PartFlow::Continue => {}
                                PartFlow::Finished => break,
                                PartFlow::Stopped => return,
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "chat stream read failed"
                            );
                            let error =
                                ReadChunkSnafu { stage: "read-chunk" }.into_error(source);
                            emit_error_event(&event_tx, target, error);
                            return;
                        }
                        None => {
                            let parts = match decoder.finish() {
                                Ok(parts) => parts,
                                Err(error) => {
                                    emit_error_event(&event_tx, target, error);
                                    return;
                                }
                            };
                            let flow = Self::forward_parts(&event_tx, target, parts);
                            if let PartFlow::Stopped = flow {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(target = ?target, chunk_count, "chat stream completed");
        let _ = event_tx.send(StreamEvent {
            target,
            payload: StreamEventPayload::Done,
        });
    }
}

impl ChatTransport for HttpStreamTransport {
    fn id(&self) -> &str {
        HTTP_TRANSPORT_ID
    }

    fn name(&self) -> &str {
        "HTTP chat stream"
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
            self.client.clone(),
            self.endpoint.clone(),
            self.wire_format,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(TransportStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::transport::{Role, TransportError};

    fn request(target: u64) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(target),
            "session-1",
            vec![TransportMessage::new(Role::User, "What is on this page?")],
        )
    }

    async fn collect_events(
        transport: &HttpStreamTransport,
        request: StreamRequest,
    ) -> Vec<StreamEvent> {
        let handle = transport.stream_chat(request).unwrap();
        let worker = tokio::spawn(handle.worker);
        let mut stream = handle.stream;
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        worker.await.unwrap();
        events
    }

    fn text_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match &event.payload {
                StreamEventPayload::Delta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn posts_session_and_history_then_streams_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat-stream"))
            .and(body_json(serde_json::json!({
                "sessionId": "session-1",
                "messages": [{ "role": "user", "content": "What is on this page?" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hello from the site"))
            .expect(1)
            .mount(&server)
            .await;

        let config = TransportConfig::new(
            HTTP_TRANSPORT_ID,
            format!("{}/api/chat-stream", server.uri()),
        );
        let transport = HttpStreamTransport::new(&config).unwrap();
        let events = collect_events(&transport, request(7)).await;

        assert_eq!(text_of(&events), "Hello from the site");
        assert!(events.iter().all(|event| event.target == StreamTarget::new(7)));
        assert_eq!(events.last().map(|event| &event.payload), Some(&StreamEventPayload::Done));
    }

    #[tokio::test]
    async fn decodes_data_stream_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("0:\"Hel\"\n0:\"lo\"\nd:{\"finishReason\":\"stop\"}\n"),
            )
            .mount(&server)
            .await;

        let config = TransportConfig::new(HTTP_TRANSPORT_ID, server.uri())
            .with_wire_format(WireFormat::DataStream);
        let transport = HttpStreamTransport::new(&config).unwrap();
        let events = collect_events(&transport, request(1)).await;

        assert_eq!(text_of(&events), "Hello");
        assert_eq!(events.last().map(|event| &event.payload), Some(&StreamEventPayload::Done));
    }

    #[tokio::test]
    async fn non_success_status_is_reported_without_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let config = TransportConfig::new(HTTP_TRANSPORT_ID, server.uri());
        let transport = HttpStreamTransport::new(&config).unwrap();
        let events = collect_events(&transport, request(2)).await;

        assert_eq!(events.len(), 1);
        match &events[0].payload {
            StreamEventPayload::Error(message) => {
                assert!(message.contains("500"));
                assert!(message.contains("boom"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streamed_error_part_stops_the_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("0:\"partial\"\n3:\"model overloaded\"\n"),
            )
            .mount(&server)
            .await;

        let config = TransportConfig::new(HTTP_TRANSPORT_ID, server.uri())
            .with_wire_format(WireFormat::DataStream);
        let transport = HttpStreamTransport::new(&config).unwrap();
        let events = collect_events(&transport, request(4)).await;

        assert_eq!(text_of(&events), "partial");
        assert!(matches!(
            events.last().map(|event| &event.payload),
            Some(StreamEventPayload::Error(message)) if message.contains("model overloaded")
        ));
        assert!(!events.iter().any(|event| event.payload == StreamEventPayload::Done));
    }

    #[tokio::test]
    async fn connection_failure_is_reported_as_error_event() {
        // Nothing listens on port 9 of the loopback interface in the test environment.
        let config = TransportConfig::new(HTTP_TRANSPORT_ID, "http://127.0.0.1:9/api/chat-stream");
        let transport = HttpStreamTransport::new(&config).unwrap();
        let events = collect_events(&transport, request(5)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, StreamEventPayload::Error(_)));
    }

    async fn stalled_transport(server: &MockServer) -> HttpStreamTransport {
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("never delivered")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(server)
            .await;
        HttpStreamTransport::new(&TransportConfig::new(HTTP_TRANSPORT_ID, server.uri())).unwrap()
    }

    #[tokio::test]
    async fn cancel_while_response_pending_ends_worker_silently() {
        let server = MockServer::start().await;
        let transport = stalled_transport(&server).await;

        let handle = transport.stream_chat(request(8)).unwrap();
        let worker = tokio::spawn(handle.worker);
        let mut stream = handle.stream;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stream.cancel());

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker should stop after cancel")
            .unwrap();
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_event_stream_stops_pending_worker() {
        let server = MockServer::start().await;
        let transport = stalled_transport(&server).await;

        let handle = transport.stream_chat(request(9)).unwrap();
        let worker = tokio::spawn(handle.worker);

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle.stream);

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker should stop once the stream is dropped")
            .unwrap();
    }

    #[test]
    fn read_timeout_is_accepted_by_client_builder() {
        let config = TransportConfig::new(HTTP_TRANSPORT_ID, "")
            .with_connect_timeout(Duration::from_secs(5))
            .with_read_timeout(Duration::from_secs(30));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
        assert!(HttpStreamTransport::new(&config).is_ok());
    }

    #[test]
    fn rejects_empty_history_and_invalid_endpoint() {
        let transport =
            HttpStreamTransport::new(&TransportConfig::new(HTTP_TRANSPORT_ID, "")).unwrap();
        assert_eq!(transport.endpoint().as_str(), DEFAULT_ENDPOINT);

        let empty = StreamRequest::new(StreamTarget::new(1), "s", Vec::new());
        assert!(matches!(
            transport.stream_chat(empty),
            Err(TransportError::EmptyMessageSet { .. })
        ));

        let invalid = TransportConfig::new(HTTP_TRANSPORT_ID, "not a url");
        assert!(matches!(
            HttpStreamTransport::new(&invalid),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }
}
