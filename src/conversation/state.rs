use serde_json::Value;

use crate::conversation::{
    dedup::message_key,
    error::StageError,
    lock,
    ports::{ChunkMessage, MessagePatch, ProgressLevel, StateEmitter},
    runtime::TurnStages,
    time::{enforce_monotonic_in_place, push_message},
    types::{Context, Conversation, Message, Role, merge_context},
};

/// Everything one turn mutates, plus the plumbing that reports each mutation.
pub(crate) struct TurnState<'a> {
    pub messages: Vec<Message>,
    pub conversation: Conversation,
    pub context: Context,
    min_step_seconds: u32,
    stages: &'a TurnStages,
    emitted_conversation: Conversation,
}

impl<'a> TurnState<'a> {
    pub fn new(
        stages: &'a TurnStages,
        messages: Vec<Message>,
        conversation: Conversation,
        context: Context,
        min_step_seconds: u32,
    ) -> Self {
        Self {
            messages,
            emitted_conversation: conversation.clone(),
            conversation,
            context,
            min_step_seconds,
            stages,
        }
    }

    pub fn min_step_seconds(&self) -> u32 {
        self.min_step_seconds
    }

    pub fn next_id(&self, role: Role) -> String {
        self.stages.id_generator.next_id(role.as_str())
    }

    pub fn report(&self, level: ProgressLevel, kind: &str, message: &str) {
        self.report_with(level, kind, message, None);
    }

    pub fn report_with(
        &self,
        level: ProgressLevel,
        kind: &str,
        message: &str,
        payload: Option<&Value>,
    ) {
        let conversation_id = self.conversation.id.as_str();
        match level {
            ProgressLevel::Error => {
                tracing::error!(target: "spirits", conversation_id, kind, "{message}")
            }
            ProgressLevel::Warn => {
                tracing::warn!(target: "spirits", conversation_id, kind, "{message}")
            }
            ProgressLevel::Info | ProgressLevel::Success => {
                tracing::debug!(target: "spirits", conversation_id, kind, "{message}")
            }
        }
        if let Some(progress) = &self.stages.progress {
            progress.report(message, level, Some(kind), payload);
        }
    }

    fn emit(
        &self,
        event: &'static str,
        call: impl FnOnce(&dyn StateEmitter) -> Result<(), StageError>,
    ) {
        let Some(emitter) = &self.stages.emitter else {
            return;
        };
        if let Err(err) = call(emitter.as_ref()) {
            tracing::warn!(
                target: "spirits",
                conversation_id = %self.conversation.id,
                event,
                error = %err,
                "state_emit_failed"
            );
        }
    }

    pub fn publish_snapshots(&mut self) {
        self.emit("set_conversation", |emitter| {
            emitter.on_set_conversation(&self.conversation)
        });
        self.emit("set_context", |emitter| emitter.on_set_context(&self.context));
        self.emitted_conversation = self.conversation.clone();
    }

    /// Emits the conversation when it differs from what was last emitted.
    pub fn sync_conversation(&mut self) {
        if self.conversation == self.emitted_conversation {
            return;
        }
        self.emit("update_conversation", |emitter| {
            emitter.on_update_conversation(&self.conversation)
        });
        self.emitted_conversation = self.conversation.clone();
    }

    pub fn normalize_times(&mut self) -> usize {
        let changed = enforce_monotonic_in_place(&mut self.messages, self.min_step_seconds);
        for index in &changed {
            let message = &self.messages[*index];
            if message.id.is_empty() {
                continue;
            }
            let patch = MessagePatch::time(&message.id, &message.time);
            self.emit("update_message", |emitter| emitter.on_update_message(&patch));
        }
        changed.len()
    }

    /// Appends a monotonic copy of `message` and returns what was stored.
    pub fn append(&mut self, message: &Message) -> Message {
        let stored = push_message(&mut self.messages, message, self.min_step_seconds);
        self.emit("add_message", |emitter| emitter.on_add_message(&stored));
        stored
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.messages.iter().any(|message| message_key(message) == key)
    }

    pub fn update_message(&mut self, index: usize, update: impl FnOnce(&mut Message)) {
        let Some(message) = self.messages.get_mut(index) else {
            return;
        };
        update(message);
        let patch = MessagePatch::from_message(message);
        self.emit("update_message", |emitter| emitter.on_update_message(&patch));
    }

    pub fn remove_message(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.messages.remove(index);
        self.emit("delete_message", |emitter| emitter.on_delete_message(id));
        true
    }

    pub fn merge_context(&mut self, patch: &Context) -> Vec<String> {
        if patch.is_empty() {
            return Vec::new();
        }
        let added = merge_context(&mut self.context, patch);
        self.emit("update_context", |emitter| emitter.on_update_context(patch));
        added
    }

    pub fn lock(&mut self, reason: impl Into<String>) {
        lock::lock(&mut self.conversation, reason);
    }

    pub fn last_content(&self, role: Role) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == role)
            .map(|message| message.content.as_str())
    }

    pub fn emit_chunk(&self, message: &Message, source: &str) {
        let chunk = ChunkMessage {
            text: message.content.clone(),
            conversation_id: self.conversation.id.clone(),
            message_id: message.id.clone(),
            mode: "replace".to_string(),
            source: source.to_string(),
        };
        self.emit("chunk_message", |emitter| emitter.on_chunk_message(&chunk));
    }
}
