/// Event contracts between the session driver and the view.
pub mod events;
/// Landing form: URL validation and route encoding.
pub mod initiator;
/// Domain entities and deterministic stream state boundaries.
pub mod message;
pub mod scroll;
/// One chat view bound to a transport.
pub mod session;
pub mod transcript;

pub use events::{Stop, StreamEventMapped, Submit, TranscriptChange};
pub use initiator::{
    InitiatorError, InitiatorState, NavigationTarget, SessionInitiator, decode_route_segment,
    encode_route_segment, navigation_path, validate_target_url,
};
pub use message::{
    Message, MessageId, MessageStatus, RequestId, Role, SessionId, StreamState, StreamTransition,
    StreamTransitionRejection, StreamTransitionResult,
};
pub use scroll::ScrollManager;
pub use session::{
    ChatSession, SEND_ERROR_MESSAGE, STREAM_ERROR_MESSAGE, SessionPhase, SessionSeed,
    SubmitIgnored, SubmitOutcome,
};
pub use transcript::{Transcript, TranscriptError, TranscriptResult};
