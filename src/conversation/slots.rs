use serde_json::Value;

use crate::conversation::{
    lock::{self, LockTracker, LockTransition},
    ports::ProgressLevel,
    state::TurnState,
    time::{
        TimeValue, enforce_monotonic_in_place, format_iso, iso_after_delay, now_utc,
        parse_time_utc,
    },
    types::{InstructionEntry, Message, ResolvedForward, Role, WorkflowResponseSlot},
};

/// What the slot loop accumulated over a turn.
#[derive(Debug, Default)]
pub(crate) struct SlotEffects {
    pub forward: Option<ResolvedForward>,
    pub instructions_added: bool,
    pub reset_intent: bool,
    pub tasks: Vec<Value>,
    pub followup: Vec<Value>,
    pub entity_context_upsert: Vec<Value>,
}

pub(crate) fn has_instructions(slots: &[WorkflowResponseSlot]) -> bool {
    slots
        .iter()
        .any(|slot| !slot.instruction_entries().is_empty())
}

pub(crate) fn has_custom_message(slots: &[WorkflowResponseSlot]) -> bool {
    slots.iter().any(|slot| slot.message.is_some())
}

fn slot_message_time(
    state: &TurnState<'_>,
    index: usize,
    slot: &WorkflowResponseSlot,
    proposed: Option<&TimeValue>,
) -> String {
    if let Some(scheduled) = slot
        .scheduled
        .as_deref()
        .and_then(|scheduled| parse_time_utc(&TimeValue::from(scheduled)))
    {
        return format_iso(scheduled);
    }
    if let Some(delay) = slot.seconds_delay {
        if let Some(time) = iso_after_delay(delay) {
            return time;
        }
        state.report(
            ProgressLevel::Warn,
            "seconds_delay_out_of_range",
            &format!("slot {index} secondsDelay {delay} is out of range, sending now"),
        );
        return format_iso(now_utc());
    }
    format_iso(proposed.and_then(parse_time_utc).unwrap_or_else(now_utc))
}

/// Turns slot-supplied messages into agent drafts queued for the transformer.
pub(crate) fn draft_slot_messages(
    state: &TurnState<'_>,
    slots: &[WorkflowResponseSlot],
) -> Vec<Message> {
    let mut drafts = Vec::new();

    for (index, slot) in slots.iter().enumerate() {
        let Some(slot_message) = slot.message.clone() else {
            continue;
        };
        let draft = slot_message.into_draft();
        if !draft.has_content() && !draft.has_tool_calls() {
            state.report(
                ProgressLevel::Error,
                "workflow_message_rejected",
                &format!("slot {index} message has neither content nor tool_calls"),
            );
            continue;
        }

        let time = slot_message_time(state, index, slot, draft.time.as_ref());
        let role = draft.role.unwrap_or(Role::Agent);
        let id = draft
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| state.next_id(role));
        let mut message = draft.into_message(id, role, time);
        if slot.scheduled.is_some() {
            message.scheduled = slot.scheduled.clone();
        }
        if slot.seconds_delay.is_some() {
            message.delay_in_seconds = slot.seconds_delay;
        }
        if !message.has_tool_calls() && message.content_generated.is_none() {
            message.content_generated = Some(message.content.clone());
        }
        drafts.push(message);
    }

    enforce_monotonic_in_place(&mut drafts, state.min_step_seconds());
    drafts
}

/// Locks the conversation for `forward` and leaves a system trace of it.
pub(crate) fn record_forward(state: &mut TurnState<'_>, forward: &ResolvedForward) {
    lock::apply_forward(&mut state.conversation, forward);
    let mut content = format!("forwarded to \"{}\"", forward.target);
    if let Some(mode) = &forward.mode {
        content.push_str(&format!(" ({mode})"));
    }
    let id = state.next_id(Role::System);
    state.append(&Message::new(id, Role::System, content));
    state.report(
        ProgressLevel::Info,
        "conversation_forwarded",
        &format!("forwarded to {}", forward.target),
    );
}

fn add_instruction(
    state: &mut TurnState<'_>,
    tracker: &LockTracker,
    entry: InstructionEntry,
    effects: &mut SlotEffects,
) {
    if entry.content.trim().is_empty() {
        state.report(
            ProgressLevel::Warn,
            "empty_instruction",
            "ignored an instruction with empty content",
        );
        return;
    }

    if state.last_content(Role::System) == Some(entry.content.as_str()) {
        match tracker.on_repeated_instruction(&mut state.conversation) {
            LockTransition::Locked { reason } => {
                state.report(ProgressLevel::Warn, "lock_attempts_exceeded", &reason)
            }
            LockTransition::Incremented { attempts } => state.report(
                ProgressLevel::Info,
                "instruction_repeated",
                &format!("repeated instruction, lock attempts now {attempts}"),
            ),
            LockTransition::Unchanged => {}
        }
        return;
    }

    let existing = entry
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .and_then(|id| state.position(id));
    match existing {
        Some(index) => {
            let content = entry.content;
            state.update_message(index, |message| message.content = content);
        }
        None => {
            let id = entry
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| state.next_id(Role::System));
            state.append(&Message::new(id, Role::System, entry.content));
        }
    }
    effects.instructions_added = true;
}

/// Applies slot effects in array order; later slots see earlier effects.
pub(crate) fn apply_slots(
    state: &mut TurnState<'_>,
    slots: Vec<WorkflowResponseSlot>,
    tracker: &LockTracker,
) -> SlotEffects {
    let mut effects = SlotEffects::default();

    for slot in slots {
        let instructions = slot.instruction_entries();
        if let Some(anticipate) = slot.anticipate {
            state.conversation.anticipate = Some(anticipate.into_anticipate());
        }
        if let Some(tasks) = slot.tasks {
            effects.tasks.extend(tasks);
        }
        if let Some(followup) = slot.followup {
            effects.followup.push(followup);
        }
        match slot.entity_context_upsert {
            Some(Value::Array(upserts)) => effects.entity_context_upsert.extend(upserts),
            Some(upsert) => effects.entity_context_upsert.push(upsert),
            None => {}
        }

        let resolved = slot
            .forward
            .as_ref()
            .and_then(|forward| forward.resolve(&state.conversation.agent));
        if let Some(mut forward) = resolved {
            if let Some(first) = &effects.forward {
                state.report(
                    ProgressLevel::Info,
                    "forward_ignored",
                    &format!(
                        "already forwarded to {} this turn, ignoring {}",
                        first.target, forward.target
                    ),
                );
            } else {
                if forward.note.is_none() {
                    forward.note = slot.forward_note.clone();
                }
                record_forward(state, &forward);
                effects.forward = Some(forward);
            }
        }

        for entry in instructions {
            add_instruction(state, tracker, entry, &mut effects);
        }

        for id in slot.remove_instructions.unwrap_or_default() {
            if !state.remove_message(&id) {
                state.report(
                    ProgressLevel::Warn,
                    "instruction_not_found",
                    &format!("cannot remove instruction {id}: no such message"),
                );
            }
        }

        if let Some(upsert) = &slot.context_upsert {
            state.merge_context(upsert);
        }
        if slot.reset_intent {
            effects.reset_intent = true;
        }
    }

    effects
}
