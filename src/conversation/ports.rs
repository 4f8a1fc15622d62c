use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::conversation::{
    error::{StageError, TurnError, invalid_workflow_response},
    types::{
        Context, Conversation, Customer, Forward, Message, MessageDraft, Persona,
        WorkflowResponseSlot,
    },
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParseOutput {
    pub intent: Option<String>,
    pub intent_score: Option<f64>,
    pub context: Context,
    pub entities: Option<Value>,
    pub context_messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextualizeRequest {
    pub messages: Vec<Message>,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowIntent {
    pub current: Option<String>,
    pub flow: Vec<Option<String>>,
    pub initial: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub messages: Vec<Message>,
    pub conversation: Conversation,
    pub context: Context,
    pub message: Message,
    pub agent: Persona,
    pub customer: Customer,
    pub intent: WorkflowIntent,
    pub stagnation_count: u32,
}

/// What a workflow hands back: typed slots, or any JSON value shaped like a
/// slot or an array of slots.
#[derive(Debug, Clone)]
pub enum WorkflowResponse {
    Slot(Box<WorkflowResponseSlot>),
    Slots(Vec<WorkflowResponseSlot>),
    Json(Value),
}

impl From<WorkflowResponseSlot> for WorkflowResponse {
    fn from(slot: WorkflowResponseSlot) -> Self {
        WorkflowResponse::Slot(Box::new(slot))
    }
}

impl From<Vec<WorkflowResponseSlot>> for WorkflowResponse {
    fn from(slots: Vec<WorkflowResponseSlot>) -> Self {
        WorkflowResponse::Slots(slots)
    }
}

impl WorkflowResponse {
    pub fn from_serialize(value: &impl Serialize) -> Result<Self, StageError> {
        serde_json::to_value(value)
            .map(WorkflowResponse::Json)
            .map_err(|err| StageError::with_source("workflow response is not serializable", err))
    }

    pub fn into_slots(self) -> Result<Vec<WorkflowResponseSlot>, TurnError> {
        match self {
            WorkflowResponse::Slot(slot) => Ok(vec![*slot]),
            WorkflowResponse::Slots(slots) => Ok(slots),
            WorkflowResponse::Json(Value::Null) => Ok(Vec::new()),
            WorkflowResponse::Json(Value::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value(item)
                        .map_err(|err| invalid_workflow_response(format!("slot {index}: {err}")))
                })
                .collect(),
            WorkflowResponse::Json(value) => serde_json::from_value(value)
                .map(|slot| vec![slot])
                .map_err(|err| invalid_workflow_response(format!("slot 0: {err}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub persona: Persona,
    pub context: Context,
    pub llm: Option<Value>,
    pub pmt: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerateOutput {
    pub send: bool,
    pub messages: Vec<MessageDraft>,
    pub forward: Option<Forward>,
    pub forward_note: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequest {
    pub added_messages: Vec<Message>,
    pub persona: Persona,
    pub customer: String,
    pub messages: Vec<Message>,
    pub context: Context,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOutput {
    pub messages: Option<Vec<MessageDraft>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressLevel {
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub text: String,
    pub conversation_id: String,
    pub message_id: String,
    pub mode: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MessagePatch {
    pub fn time(id: impl Into<String>, time: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("time".to_string(), Value::String(time.into()));
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn from_message(message: &Message) -> Self {
        let fields = match serde_json::to_value(message) {
            Ok(Value::Object(mut fields)) => {
                fields.remove("id");
                fields
            }
            _ => Map::new(),
        };
        Self {
            id: message.id.clone(),
            fields,
        }
    }
}

#[async_trait]
pub trait ParserPort: Send + Sync {
    async fn parse(&self, content: &str, language: &str) -> Result<ParseOutput, StageError>;
}

#[async_trait]
pub trait ContextualizerPort: Send + Sync {
    async fn contextualize(
        &self,
        req: ContextualizeRequest,
    ) -> Result<Vec<MessageDraft>, StageError>;
}

#[async_trait]
pub trait WorkflowPort: Send + Sync {
    async fn run(&self, event: WorkflowEvent) -> Result<WorkflowResponse, StageError>;
}

#[async_trait]
pub trait GeneratorPort: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateOutput, StageError>;
}

#[async_trait]
pub trait TransformerPort: Send + Sync {
    async fn transform(&self, req: TransformRequest) -> Result<TransformOutput, StageError>;
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, prefix: &str) -> String;
}

#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::now_v7())
    }
}

/// Diagnostic sink. Never feeds back into control flow.
pub trait ProgressPort: Send + Sync {
    fn report(
        &self,
        message: &str,
        level: ProgressLevel,
        kind: Option<&str>,
        payload: Option<&Value>,
    );
}

/// Persistence signals. Failures are logged by the orchestrator and dropped.
pub trait StateEmitter: Send + Sync {
    fn on_set_context(&self, _context: &Context) -> Result<(), StageError> {
        Ok(())
    }

    fn on_update_context(&self, _patch: &Context) -> Result<(), StageError> {
        Ok(())
    }

    fn on_set_conversation(&self, _conversation: &Conversation) -> Result<(), StageError> {
        Ok(())
    }

    fn on_update_conversation(&self, _conversation: &Conversation) -> Result<(), StageError> {
        Ok(())
    }

    fn on_chunk_message(&self, _chunk: &ChunkMessage) -> Result<(), StageError> {
        Ok(())
    }

    fn on_add_message(&self, _message: &Message) -> Result<(), StageError> {
        Ok(())
    }

    fn on_update_message(&self, _patch: &MessagePatch) -> Result<(), StageError> {
        Ok(())
    }

    fn on_delete_message(&self, _id: &str) -> Result<(), StageError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopStateEmitter;

impl StateEmitter for NoopStateEmitter {}
