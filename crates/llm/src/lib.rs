use std::sync::Arc;

mod codec;
mod echo;
mod http_stream;
mod rig_adapter;
mod transport;

pub use codec::{ChunkDecoder, DecodedPart, WireFormat};
pub use echo::{ECHO_TRANSPORT_ID, EchoTransport, ScriptStep};
pub use http_stream::{DEFAULT_ENDPOINT, HTTP_TRANSPORT_ID, HttpStreamTransport};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_TRANSPORT_ID, RigOpenAiTransport};
pub use transport::{
    ChatTransport, Role, StreamEvent, StreamEventPayload, StreamRequest, StreamTarget,
    TransportConfig, TransportError, TransportEventStream, TransportMessage, TransportResult,
    TransportStreamHandle, TransportWorker,
};

pub fn create_transport(mut config: TransportConfig) -> TransportResult<Arc<dyn ChatTransport>> {
    if config.transport_id.trim().is_empty() {
        config.transport_id = HTTP_TRANSPORT_ID.to_string();
    }

    match config.transport_id.as_str() {
        "http" | "chat-stream" => {
            config.transport_id = HTTP_TRANSPORT_ID.to_string();
            Ok(Arc::new(HttpStreamTransport::new(&config)?))
        }
        "openai" | "rig-openai" => {
            config.transport_id = RIG_OPENAI_TRANSPORT_ID.to_string();
            Ok(Arc::new(RigOpenAiTransport::new(config)?))
        }
        "echo" => Ok(Arc::new(EchoTransport::new())),
        _ => Err(TransportError::UnsupportedTransport {
            stage: "create-transport",
            transport_id: config.transport_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_transport_resolves_aliases() {
        let transport = create_transport(TransportConfig::new("", "")).unwrap();
        assert_eq!(transport.id(), HTTP_TRANSPORT_ID);

        let transport = create_transport(TransportConfig::new("echo", "")).unwrap();
        assert_eq!(transport.id(), ECHO_TRANSPORT_ID);

        let transport =
            create_transport(TransportConfig::new("openai", "").with_api_key("sk-test")).unwrap();
        assert_eq!(transport.id(), RIG_OPENAI_TRANSPORT_ID);

        assert!(matches!(
            create_transport(TransportConfig::new("carrier-pigeon", "")),
            Err(TransportError::UnsupportedTransport { .. })
        ));
    }
}
