use std::{fs, path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::conversation::{
    ChunkMessage, Context, ContextualizeRequest, ContextualizerPort, Conversation,
    ConversationEvent, Customer, CustomerTurn, GenerateOutput, GenerateRequest, GeneratorPort,
    Message, MessageDraft, MessagePatch, ParseOutput, ParserPort, ProjectConfig, Spirits,
    StageError, StateEmitter, TransformOutput, TransformRequest, TransformerPort, TurnStages,
    WorkflowEvent, WorkflowPort, WorkflowResponse,
};

/// A recorded stage result: either the output the stage produced or the
/// error it failed with.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep<T> {
    Fail { error: String },
    Output(T),
}

impl<T: Clone> ScriptStep<T> {
    fn replay(&self) -> Result<T, StageError> {
        match self {
            ScriptStep::Fail { error } => Err(StageError::new(error.clone())),
            ScriptStep::Output(output) => Ok(output.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnScript {
    pub parse: Option<ScriptStep<ParseOutput>>,
    pub contextualize: Option<ScriptStep<Vec<MessageDraft>>>,
    pub workflow: Option<ScriptStep<Value>>,
    pub generate: Option<ScriptStep<GenerateOutput>>,
    pub transform: Option<ScriptStep<TransformOutput>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedTurn {
    pub conversation: Conversation,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub message: Message,
    #[serde(default)]
    pub customer: Customer,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub script: TurnScript,
}

pub fn load_turn(path: &Path) -> Result<RecordedTurn> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    json5::from_str(&content).with_context(|| format!("failed to parse turn {}", path.display()))
}

struct ScriptedParser(Option<ScriptStep<ParseOutput>>);

#[async_trait]
impl ParserPort for ScriptedParser {
    async fn parse(&self, _content: &str, _language: &str) -> Result<ParseOutput, StageError> {
        self.0.as_ref().map_or(Ok(ParseOutput::default()), ScriptStep::replay)
    }
}

struct ScriptedContextualizer(Option<ScriptStep<Vec<MessageDraft>>>);

#[async_trait]
impl ContextualizerPort for ScriptedContextualizer {
    async fn contextualize(
        &self,
        _req: ContextualizeRequest,
    ) -> Result<Vec<MessageDraft>, StageError> {
        self.0.as_ref().map_or(Ok(Vec::new()), ScriptStep::replay)
    }
}

struct ScriptedWorkflow(Option<ScriptStep<Value>>);

#[async_trait]
impl WorkflowPort for ScriptedWorkflow {
    async fn run(&self, _event: WorkflowEvent) -> Result<WorkflowResponse, StageError> {
        self.0
            .as_ref()
            .map_or(Ok(Value::Null), ScriptStep::replay)
            .map(WorkflowResponse::Json)
    }
}

struct ScriptedGenerator(Option<ScriptStep<GenerateOutput>>);

#[async_trait]
impl GeneratorPort for ScriptedGenerator {
    async fn generate(&self, _req: GenerateRequest) -> Result<GenerateOutput, StageError> {
        self.0
            .as_ref()
            .map_or(Ok(GenerateOutput::default()), ScriptStep::replay)
    }
}

struct ScriptedTransformer(ScriptStep<TransformOutput>);

#[async_trait]
impl TransformerPort for ScriptedTransformer {
    async fn transform(&self, _req: TransformRequest) -> Result<TransformOutput, StageError> {
        self.0.replay()
    }
}

/// Logs every state signal instead of persisting it.
struct TracingEmitter;

impl StateEmitter for TracingEmitter {
    fn on_set_context(&self, context: &Context) -> Result<(), StageError> {
        tracing::info!(target: "replay", keys = context.len(), "set_context");
        Ok(())
    }

    fn on_update_context(&self, patch: &Context) -> Result<(), StageError> {
        let patch = Value::Object(patch.clone());
        tracing::info!(target: "replay", patch = %patch, "update_context");
        Ok(())
    }

    fn on_set_conversation(&self, conversation: &Conversation) -> Result<(), StageError> {
        tracing::info!(target: "replay", conversation_id = %conversation.id, "set_conversation");
        Ok(())
    }

    fn on_update_conversation(&self, conversation: &Conversation) -> Result<(), StageError> {
        tracing::info!(
            target: "replay",
            conversation_id = %conversation.id,
            locked = conversation.locked,
            locked_reason = conversation.locked_reason.as_deref().unwrap_or_default(),
            lock_attempts = conversation.lock_attempts,
            "update_conversation"
        );
        Ok(())
    }

    fn on_chunk_message(&self, chunk: &ChunkMessage) -> Result<(), StageError> {
        tracing::info!(
            target: "replay",
            message_id = %chunk.message_id,
            source = %chunk.source,
            "chunk_message"
        );
        Ok(())
    }

    fn on_add_message(&self, message: &Message) -> Result<(), StageError> {
        tracing::info!(
            target: "replay",
            message_id = %message.id,
            role = %message.role,
            time = %message.time,
            "add_message"
        );
        Ok(())
    }

    fn on_update_message(&self, patch: &MessagePatch) -> Result<(), StageError> {
        tracing::info!(
            target: "replay",
            message_id = %patch.id,
            fields = ?patch.fields.keys().collect::<Vec<_>>(),
            "update_message"
        );
        Ok(())
    }

    fn on_delete_message(&self, id: &str) -> Result<(), StageError> {
        tracing::info!(target: "replay", message_id = %id, "delete_message");
        Ok(())
    }
}

pub fn scripted_stages(script: TurnScript) -> TurnStages {
    let stages = TurnStages::new(
        Arc::new(ScriptedParser(script.parse)),
        Arc::new(ScriptedContextualizer(script.contextualize)),
        Arc::new(ScriptedWorkflow(script.workflow)),
        Arc::new(ScriptedGenerator(script.generate)),
    )
    .with_emitter(Arc::new(TracingEmitter));

    match script.transform {
        Some(step) => stages.with_transformer(Arc::new(ScriptedTransformer(step))),
        None => stages,
    }
}

pub async fn run_recorded_turn(
    config: &ProjectConfig,
    turn: RecordedTurn,
) -> Result<ConversationEvent> {
    let spirits = Spirits::new(scripted_stages(turn.script));
    let customer_turn = CustomerTurn {
        config: config.clone(),
        conversation: turn.conversation,
        messages: turn.messages,
        message: turn.message,
        customer: turn.customer,
        context: turn.context,
    };

    let event = spirits
        .customer(customer_turn, |stage, err| {
            tracing::error!(target: "replay", stage = %stage, error = %err, "stage_error");
        })
        .await
        .context("recorded turn failed")?;
    Ok(event)
}
