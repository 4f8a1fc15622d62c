use std::{collections::HashSet, sync::Arc};

use crate::conversation::{
    dedup::{message_key, unpaired_tool_calls},
    error::{StageError, TurnError, TurnStage, invalid_input, stage_failed},
    lock::{self, LockTracker, LockTransition},
    ports::{
        ContextualizeRequest, ContextualizerPort, GenerateOutput, GenerateRequest, GeneratorPort,
        IdGenerator, ParserPort, ProgressLevel, ProgressPort, StateEmitter,
        TransformRequest, TransformerPort, UuidIdGenerator, WorkflowEvent, WorkflowIntent,
        WorkflowPort,
    },
    slots::{
        SlotEffects, apply_slots, draft_slot_messages, has_custom_message, has_instructions,
        record_forward,
    },
    state::TurnState,
    time::{TimeValue, enforce_monotonic_in_place, format_iso, next_monotonic_iso, parse_time_utc},
    types::{
        Change, Context, Conversation, ConversationChange, ConversationEvent, Customer, Message,
        MessageDraft, Persona, ProjectConfig, ResolvedForward, Role, WorkflowResponseSlot,
    },
};

/// The collaborators a turn calls out to.
#[derive(Clone)]
pub struct TurnStages {
    pub parser: Arc<dyn ParserPort>,
    pub contextualizer: Arc<dyn ContextualizerPort>,
    pub workflow: Arc<dyn WorkflowPort>,
    pub generator: Arc<dyn GeneratorPort>,
    pub transformer: Option<Arc<dyn TransformerPort>>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub progress: Option<Arc<dyn ProgressPort>>,
    pub emitter: Option<Arc<dyn StateEmitter>>,
}

impl TurnStages {
    pub fn new(
        parser: Arc<dyn ParserPort>,
        contextualizer: Arc<dyn ContextualizerPort>,
        workflow: Arc<dyn WorkflowPort>,
        generator: Arc<dyn GeneratorPort>,
    ) -> Self {
        Self {
            parser,
            contextualizer,
            workflow,
            generator,
            transformer: None,
            id_generator: Arc::new(UuidIdGenerator),
            progress: None,
            emitter: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn TransformerPort>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressPort>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn StateEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }
}

/// One inbound customer message plus the conversation state it lands in.
#[derive(Debug, Clone)]
pub struct CustomerTurn {
    pub config: ProjectConfig,
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub message: Message,
    pub customer: Customer,
    pub context: Context,
}

/// Conversation-turn orchestrator.
///
/// Callers must serialize turns per conversation: two concurrent turns over
/// the same conversation would race on time normalization and dedup.
#[derive(Clone)]
pub struct Spirits {
    stages: TurnStages,
}

fn validate(turn: &CustomerTurn) -> Result<Persona, TurnError> {
    let agent_id = turn.conversation.agent.trim();
    if agent_id.is_empty() {
        return Err(invalid_input("conversation.$agent is required"));
    }
    let persona = turn.config.persona(agent_id).ok_or_else(|| {
        invalid_input(format!(
            "no persona with id '{agent_id}' in config.agents"
        ))
    })?;

    if turn.message.id.trim().is_empty() {
        return Err(invalid_input("inbound message is missing an id"));
    }
    let mut seen = HashSet::new();
    for (index, message) in turn.messages.iter().enumerate() {
        if message.id.trim().is_empty() {
            return Err(invalid_input(format!("messages[{index}] is missing an id")));
        }
        if !seen.insert(message.id.as_str()) {
            return Err(invalid_input(format!(
                "duplicate message id '{}'",
                message.id
            )));
        }
    }

    Ok(persona.clone())
}

fn fail_stage<F>(state: &mut TurnState<'_>, stage: TurnStage, err: StageError, on_error: &F)
where
    F: Fn(TurnStage, &StageError),
{
    tracing::warn!(
        target: "spirits",
        conversation_id = %state.conversation.id,
        stage = %stage,
        error = %err,
        "stage_failed_locked"
    );
    state.lock(format!("API: {}", err.message));
    state.report(
        ProgressLevel::Error,
        "stage_failed",
        &format!("{stage} failed: {}", err.message),
    );
    on_error(stage, &err);
}

impl Spirits {
    pub fn new(stages: TurnStages) -> Self {
        Self { stages }
    }

    pub async fn customer<F>(
        &self,
        turn: CustomerTurn,
        on_error: F,
    ) -> Result<ConversationEvent, TurnError>
    where
        F: Fn(TurnStage, &StageError) + Send + Sync,
    {
        let persona = validate(&turn)?;
        let CustomerTurn {
            config,
            conversation,
            messages,
            message,
            customer,
            context,
        } = turn;

        let conversation_before = conversation.clone();
        let messages_before = messages.clone();
        let message_before = message.clone();
        let context_before = context.clone();
        let locked_at_start = conversation.locked;

        tracing::info!(
            target: "spirits",
            conversation_id = %conversation.id,
            message_id = %message.id,
            agent = %persona.id,
            "turn_started"
        );

        let mut state = TurnState::new(
            &self.stages,
            messages,
            conversation,
            context,
            config.min_step_seconds,
        );
        state.normalize_times();
        state.publish_snapshots();
        if state.position(&message.id).is_none() {
            state.append(&message);
        }

        let context_added = self.parse(&mut state, &message, &config).await?;
        self.contextualize(&mut state).await?;
        let slots = self.workflow(&mut state, &message, &persona, &customer).await?;
        let mut queued = draft_slot_messages(&state, &slots);

        let transition = lock::settle_turn(
            &mut state.conversation,
            has_instructions(&slots),
            context_added,
            config.max_lock_attempts,
        );
        if let LockTransition::Locked { reason } = &transition {
            state.report(ProgressLevel::Warn, "lock_attempts_exceeded", reason);
        }
        let locked_after_settle = state.conversation.locked;
        let custom_message = has_custom_message(&slots);

        let tracker = LockTracker::capture(&state.conversation, config.max_lock_attempts);
        let mut effects = apply_slots(&mut state, slots, &tracker);
        if effects.reset_intent && effects.forward.is_none() {
            lock::reset_intent(&mut state.conversation);
        }
        state.sync_conversation();

        if locked_at_start {
            state.report(
                ProgressLevel::Info,
                "generate_skipped",
                "conversation was locked at turn start",
            );
        } else if (!locked_after_settle || effects.instructions_added) && !custom_message {
            self.generate(&mut state, &persona, &config, &mut effects, &mut queued, &on_error)
                .await;
        }

        if !queued.is_empty() {
            self.transform(&mut state, &persona, &customer, queued, &on_error)
                .await;
        }

        state.normalize_times();
        report_diagnostics(&state);
        state.sync_conversation();

        let message_after = state
            .position(&message.id)
            .map(|index| state.messages[index].clone())
            .unwrap_or_else(|| message_before.clone());

        tracing::info!(
            target: "spirits",
            conversation_id = %state.conversation.id,
            locked = state.conversation.locked,
            lock_attempts = state.conversation.lock_attempts,
            message_count = state.messages.len(),
            "turn_completed"
        );

        Ok(ConversationEvent {
            conversation: ConversationChange {
                before: conversation_before,
                after: state.conversation,
                forward: effects.forward.as_ref().map(|forward| forward.target.clone()),
                forward_note: effects.forward.and_then(|forward| forward.note),
            },
            messages: Change {
                before: messages_before,
                after: state.messages,
            },
            message: Change {
                before: message_before,
                after: message_after,
            },
            context: Change {
                before: context_before,
                after: state.context,
            },
            followup: effects.followup,
            entity_context_upsert: effects.entity_context_upsert,
        })
    }

    /// Returns whether the parse added context keys that did not exist before.
    async fn parse(
        &self,
        state: &mut TurnState<'_>,
        inbound: &Message,
        config: &ProjectConfig,
    ) -> Result<bool, TurnError> {
        let parsed = self
            .stages
            .parser
            .parse(&inbound.content, &config.language)
            .await
            .map_err(|err| stage_failed(TurnStage::Parse, err))?;

        let inbound_key = message_key(inbound);
        let found = state.position(&inbound.id).or_else(|| {
            state
                .messages
                .iter()
                .position(|message| message_key(message) == inbound_key)
        });
        let index = match found {
            Some(index) => index,
            None => {
                state.append(inbound);
                state.messages.len() - 1
            }
        };
        state.update_message(index, |message| {
            if parsed.intent.is_some() {
                message.intent = parsed.intent.clone();
                message.intent_score = parsed.intent_score;
            }
            if !parsed.context.is_empty() {
                message.context = Some(parsed.context.clone());
            }
            if parsed.entities.is_some() {
                message.entities = parsed.entities.clone();
            }
        });

        let customer_messages = state
            .messages
            .iter()
            .filter(|message| message.role == Role::Customer)
            .count();
        if parsed.intent.is_some()
            && (customer_messages <= 1 || state.conversation.intent.is_none())
        {
            state.conversation.intent = parsed.intent.clone();
            state.conversation.intent_score = parsed.intent_score;
        }

        let added = state.merge_context(&parsed.context);
        if !state.conversation.locked && !added.is_empty() {
            state.conversation.lock_attempts = 0;
        }

        for content in parsed.context_messages {
            if content.trim().is_empty()
                || state.messages.iter().any(|message| message.content == content)
            {
                continue;
            }
            let id = state.next_id(Role::System);
            state.append(&Message::new(id, Role::System, content));
        }

        state.sync_conversation();
        Ok(!added.is_empty())
    }

    async fn contextualize(&self, state: &mut TurnState<'_>) -> Result<(), TurnError> {
        let candidates = self
            .stages
            .contextualizer
            .contextualize(ContextualizeRequest {
                messages: state.messages.clone(),
                conversation: state.conversation.clone(),
            })
            .await
            .map_err(|err| stage_failed(TurnStage::Contextualize, err))?;

        for draft in candidates {
            if !draft.has_content() {
                state.report(
                    ProgressLevel::Warn,
                    "contextualizer_empty_message",
                    "rejected a context message with empty content",
                );
                continue;
            }
            let id = draft
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| state.next_id(Role::System));
            let time = draft
                .time
                .as_ref()
                .and_then(parse_time_utc)
                .map(format_iso)
                .unwrap_or_default();
            let candidate = draft.into_message(id, Role::System, time);
            if state.position(&candidate.id).is_some()
                || state.contains_key(&message_key(&candidate))
            {
                continue;
            }
            state.append(&candidate);
        }

        Ok(())
    }

    async fn workflow(
        &self,
        state: &mut TurnState<'_>,
        inbound: &Message,
        persona: &Persona,
        customer: &Customer,
    ) -> Result<Vec<WorkflowResponseSlot>, TurnError> {
        let current = state
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Customer)
            .and_then(|message| message.intent.clone());
        let message = state
            .position(&inbound.id)
            .map(|index| state.messages[index].clone())
            .unwrap_or_else(|| inbound.clone());
        let event = WorkflowEvent {
            messages: state.messages.clone(),
            conversation: state.conversation.clone(),
            context: state.context.clone(),
            message,
            agent: persona.without_lore(),
            customer: customer.clone(),
            intent: WorkflowIntent {
                current,
                flow: state
                    .messages
                    .iter()
                    .map(|message| message.intent.clone())
                    .collect(),
                initial: state.conversation.intent.clone(),
            },
            stagnation_count: state.conversation.lock_attempts,
        };

        let response = self
            .stages
            .workflow
            .run(event)
            .await
            .map_err(|err| stage_failed(TurnStage::Workflow, err))?;
        response.into_slots()
    }

    async fn generate<F>(
        &self,
        state: &mut TurnState<'_>,
        persona: &Persona,
        config: &ProjectConfig,
        effects: &mut SlotEffects,
        queued: &mut Vec<Message>,
        on_error: &F,
    ) where
        F: Fn(TurnStage, &StageError) + Send + Sync,
    {
        let request = GenerateRequest {
            messages: state.messages.clone(),
            persona: persona.clone(),
            context: state.context.clone(),
            llm: persona.llm.clone().or_else(|| config.llm.clone()),
            pmt: persona.pmt.clone().or_else(|| config.pmt.clone()),
            tasks: (!effects.tasks.is_empty()).then(|| effects.tasks.clone()),
        };

        let output: GenerateOutput = match self.stages.generator.generate(request).await {
            Ok(output) => output,
            Err(err) => {
                fail_stage(state, TurnStage::Generate, err, on_error);
                state.sync_conversation();
                return;
            }
        };

        if output.send {
            accept_generated(state, output.messages, queued);
        } else {
            let reason = if output.errors.is_empty() {
                output
                    .forward_note
                    .clone()
                    .unwrap_or_else(|| "Generator declined to send".to_string())
            } else {
                output.errors.join("; ")
            };
            state.report(ProgressLevel::Warn, "generator_not_sent", &reason);
            state.lock(reason);
        }

        let resolved = output
            .forward
            .as_ref()
            .and_then(|forward| forward.resolve(&state.conversation.agent));
        if let Some(forward) = resolved {
            if effects.forward.is_some() {
                state.report(
                    ProgressLevel::Info,
                    "forward_ignored",
                    "generator forward ignored, the workflow already forwarded this turn",
                );
            } else {
                let forward = ResolvedForward {
                    note: forward.note.or(output.forward_note),
                    ..forward
                };
                record_forward(state, &forward);
                effects.forward = Some(forward);
            }
        }

        state.sync_conversation();
    }

    async fn transform<F>(
        &self,
        state: &mut TurnState<'_>,
        persona: &Persona,
        customer: &Customer,
        queued: Vec<Message>,
        on_error: &F,
    ) where
        F: Fn(TurnStage, &StageError) + Send + Sync,
    {
        let Some(transformer) = self.stages.transformer.clone() else {
            for draft in &queued {
                let stored = state.append(draft);
                if stored.role == Role::Agent && !stored.has_tool_calls() {
                    state.emit_chunk(&stored, "draft");
                }
            }
            return;
        };

        let request = TransformRequest {
            added_messages: queued.clone(),
            persona: persona.clone(),
            customer: customer.id.clone(),
            messages: state.messages.clone(),
            context: state.context.clone(),
        };
        let output = match transformer.transform(request).await {
            Ok(output) => output,
            Err(err) => {
                fail_stage(state, TurnStage::Transform, err, on_error);
                state.sync_conversation();
                return;
            }
        };

        let transformed = match (output.messages, output.message) {
            (Some(messages), _) => messages,
            (None, Some(text)) => vec![MessageDraft::text(Role::Agent, text)],
            (None, None) => Vec::new(),
        };
        if transformed.is_empty() {
            state.report(
                ProgressLevel::Warn,
                "transformer_empty",
                "transformer returned no messages",
            );
        }

        // Position only pairs drafts when the batch kept its shape.
        let same_shape = transformed.len() == queued.len();
        for (index, draft) in transformed.into_iter().enumerate() {
            let role = draft.role.unwrap_or(Role::Agent);
            let id = draft
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| state.next_id(role));
            let source = match queued.iter().find(|queued| queued.id == id) {
                Some(source) => Some(source),
                None if same_shape => {
                    let source = queued.get(index);
                    if let Some(source) = source {
                        tracing::debug!(
                            target: "spirits",
                            message_id = %id,
                            draft_id = %source.id,
                            "transformer_positional_match"
                        );
                    }
                    source
                }
                None => None,
            };
            let time = draft
                .time
                .as_ref()
                .and_then(parse_time_utc)
                .map(format_iso)
                .or_else(|| source.map(|source| source.time.clone()))
                .unwrap_or_default();

            let mut message = draft.into_message(id, role, time);
            if let Some(source) = source {
                if message.scheduled.is_none() {
                    message.scheduled = source.scheduled.clone();
                }
                if message.delay_in_seconds.is_none() {
                    message.delay_in_seconds = source.delay_in_seconds;
                }
            }
            if role == Role::Agent
                && !message.has_tool_calls()
                && !message.ignore_transform.unwrap_or(false)
            {
                message.content_generated = source
                    .and_then(|source| source.content_generated.clone())
                    .or(message.content_generated.take());
                if message.content_transformed.is_none() {
                    state.report(
                        ProgressLevel::Warn,
                        "content_transformed_missing",
                        &format!(
                            "transformer did not set contentTransformed on {}, using content",
                            message.id
                        ),
                    );
                    message.content_transformed = Some(message.content.clone());
                }
            }

            let stored = state.append(&message);
            if stored.role == Role::Agent && !stored.has_tool_calls() {
                state.emit_chunk(&stored, "transformer");
            }
        }
    }
}

/// Fresh ids and monotonic times for a generated batch, exact repeats dropped.
fn accept_generated(state: &mut TurnState<'_>, drafts: Vec<MessageDraft>, queued: &mut Vec<Message>) {
    let step = state.min_step_seconds();
    let mut seen = HashSet::new();
    let mut survivors = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let role = draft.role.unwrap_or(Role::Agent);
        let proposed = draft
            .time
            .clone()
            .unwrap_or(TimeValue::Other(serde_json::Value::Null));
        let time = next_monotonic_iso(&state.messages, &proposed, step);
        let id = state.next_id(role);
        let mut message = draft.into_message(id, role, time);
        if role == Role::Agent && !message.has_tool_calls() && message.content_generated.is_none()
        {
            message.content_generated = Some(message.content.clone());
        }

        let key = message_key(&message);
        if !seen.insert(key.clone()) {
            state.report_with(
                ProgressLevel::Warn,
                "duplicate_message_removed",
                &format!("Removed duplicate message {}", message.id),
                Some(&serde_json::json!({ "key": key })),
            );
            continue;
        }
        survivors.push(message);
    }
    enforce_monotonic_in_place(&mut survivors, step);

    let unpaired = unpaired_tool_calls(state.messages.iter().chain(survivors.iter()));
    if !unpaired.is_empty() {
        state.report(
            ProgressLevel::Warn,
            "unpaired_tool_calls",
            &format!("tool calls without a tool response: {}", unpaired.join(", ")),
        );
    }

    let repeats_last_agent = state
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::Agent && !message.content.is_empty())
        .is_some_and(|last| {
            survivors
                .iter()
                .any(|message| message.content == last.content)
        });
    if repeats_last_agent {
        state.report(
            ProgressLevel::Warn,
            "duplicate_agent_message",
            "generated message repeats the last agent message",
        );
        state.lock("Duplicate message");
        return;
    }

    queued.extend(survivors);
    enforce_monotonic_in_place(queued, step);
}

fn report_diagnostics(state: &TurnState<'_>) {
    for message in state
        .messages
        .iter()
        .filter(|message| message.role == Role::System && message.content.trim().is_empty())
    {
        state.report(
            ProgressLevel::Warn,
            "empty_system_message",
            &format!("system message {} has empty content", message.id),
        );
    }

    let unpaired = unpaired_tool_calls(&state.messages);
    if !unpaired.is_empty() {
        state.report(
            ProgressLevel::Warn,
            "unpaired_tool_calls",
            &format!("tool calls without a tool response: {}", unpaired.join(", ")),
        );
    }
}
