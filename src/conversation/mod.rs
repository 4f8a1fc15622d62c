pub mod dedup;
pub mod error;
pub mod lock;
pub mod ports;
pub mod runtime;
mod slots;
mod state;
pub mod time;
pub mod types;

pub use dedup::{message_key, unpaired_tool_calls};
pub use error::{StageError, TurnError, TurnStage};
pub use lock::{LockTracker, LockTransition};
pub use ports::{
    ChunkMessage, ContextualizeRequest, ContextualizerPort, GenerateOutput, GenerateRequest,
    GeneratorPort, IdGenerator, MessagePatch, NoopStateEmitter, ParseOutput, ParserPort,
    ProgressLevel, ProgressPort, StateEmitter, TransformOutput, TransformRequest, TransformerPort,
    UuidIdGenerator, WorkflowEvent, WorkflowIntent, WorkflowPort, WorkflowResponse,
};
pub use runtime::{CustomerTurn, Spirits, TurnStages};
pub use time::{
    TimeValue, ToDate, enforce_monotonic_in_place, next_monotonic_iso, parse_time_utc,
    push_message,
};
pub use types::{
    Anticipate, AnticipateSlot, Change, Context, Conversation, ConversationChange,
    ConversationEvent, Customer, Environment, Forward, ForwardTarget, Instructions, Message,
    MessageDraft, Persona, ProjectConfig, Role, SlotMessage, WorkflowResponseSlot,
};
