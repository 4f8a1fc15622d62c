use crate::conversation::types::{Conversation, ResolvedForward};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTransition {
    Unchanged,
    Incremented { attempts: u32 },
    Locked { reason: String },
}

/// Bumps `lock_attempts`, locking once the count passes `max_attempts`.
pub fn increment_attempts(conversation: &mut Conversation, max_attempts: u32) -> LockTransition {
    let next = conversation.lock_attempts.saturating_add(1);
    conversation.lock_attempts = next;
    if next > max_attempts {
        let reason = format!("Max lock attempts exceeded ({next} > {max_attempts})");
        lock(conversation, reason.clone());
        return LockTransition::Locked { reason };
    }
    LockTransition::Incremented { attempts: next }
}

pub fn lock(conversation: &mut Conversation, reason: impl Into<String>) {
    conversation.locked = true;
    conversation.locked_reason = Some(reason.into());
}

/// The turn made progress: attempts reset and any lock clears.
pub fn record_progress(conversation: &mut Conversation) {
    conversation.lock_attempts = 0;
    conversation.locked = false;
    conversation.locked_reason = None;
}

/// Turn-level accounting before the slot loop runs.
pub fn settle_turn(
    conversation: &mut Conversation,
    instructions_present: bool,
    context_added: bool,
    max_attempts: u32,
) -> LockTransition {
    if !instructions_present && !context_added {
        return increment_attempts(conversation, max_attempts);
    }
    record_progress(conversation);
    LockTransition::Unchanged
}

pub fn apply_forward(conversation: &mut Conversation, forward: &ResolvedForward) {
    conversation.forwarded = Some(forward.target.clone());
    conversation.forward_note = forward.note.clone();
    let reason = forward
        .note
        .clone()
        .unwrap_or_else(|| format!("Forwarded to {}", forward.target));
    lock(conversation, reason);
}

pub fn reset_intent(conversation: &mut Conversation) {
    conversation.intent = None;
    conversation.intent_score = None;
    record_progress(conversation);
}

/// Guards repeated-instruction bumps so a turn counts at most once, however
/// many slots repeat the last instruction.
#[derive(Debug, Clone)]
pub struct LockTracker {
    max_attempts: u32,
    attempts_at_loop_start: u32,
}

impl LockTracker {
    pub fn capture(conversation: &Conversation, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts_at_loop_start: conversation.lock_attempts,
        }
    }

    pub fn on_repeated_instruction(&self, conversation: &mut Conversation) -> LockTransition {
        if conversation.lock_attempts != self.attempts_at_loop_start {
            return LockTransition::Unchanged;
        }
        increment_attempts(conversation, self.max_attempts)
    }
}
