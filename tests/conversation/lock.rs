use serde_json::json;
use spirits::conversation::{
    Conversation, LockTracker, LockTransition, ParseOutput, Role,
    lock::{increment_attempts, settle_turn},
};

use crate::support::{Harness, conversation, inbound, message, turn};

fn stalled(attempts: u32) -> Conversation {
    Conversation {
        lock_attempts: attempts,
        ..conversation()
    }
}

#[test]
fn attempts_lock_only_past_the_ceiling() {
    let mut conv = stalled(2);
    assert_eq!(
        increment_attempts(&mut conv, 3),
        LockTransition::Incremented { attempts: 3 }
    );
    assert!(!conv.locked);

    let transition = increment_attempts(&mut conv, 3);
    assert_eq!(
        transition,
        LockTransition::Locked {
            reason: "Max lock attempts exceeded (4 > 3)".to_string()
        }
    );
    assert!(conv.locked);
}

#[test]
fn progress_clears_an_existing_lock() {
    let mut conv = stalled(3);
    conv.locked = true;
    conv.locked_reason = Some("stuck".to_string());

    assert_eq!(settle_turn(&mut conv, true, false, 3), LockTransition::Unchanged);
    assert_eq!(conv.lock_attempts, 0);
    assert!(!conv.locked);
    assert!(conv.locked_reason.is_none());
}

#[test]
fn repeated_instructions_count_once_per_turn() {
    let mut conv = stalled(1);
    let tracker = LockTracker::capture(&conv, 3);

    assert_eq!(
        tracker.on_repeated_instruction(&mut conv),
        LockTransition::Incremented { attempts: 2 }
    );
    assert_eq!(tracker.on_repeated_instruction(&mut conv), LockTransition::Unchanged);
    assert_eq!(conv.lock_attempts, 2);
}

#[tokio::test]
async fn turn_without_progress_bumps_attempts() {
    let harness = Harness::new();
    let mut turn = turn(Vec::new(), inbound("anyone there?"));
    turn.conversation.lock_attempts = 1;

    let event = harness.run(turn).await.expect("turn should complete");

    assert_eq!(event.conversation.after.lock_attempts, 2);
    assert!(!event.conversation.after.locked);
}

#[tokio::test]
async fn turn_past_the_ceiling_locks_and_skips_generation() {
    let harness = Harness::new();
    let mut turn = turn(Vec::new(), inbound("anyone there?"));
    turn.conversation.lock_attempts = 3;

    let event = harness.run(turn).await.expect("turn should complete");

    let after = &event.conversation.after;
    assert!(after.locked);
    assert!(
        after
            .locked_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("Max lock attempts exceeded"))
    );
    assert_eq!(harness.generator.call_count(), 0);
}

#[tokio::test]
async fn new_context_resets_attempts() {
    let harness = Harness::new();
    let mut parsed = ParseOutput::default();
    parsed
        .context
        .insert("order_id".to_string(), json!("A-1001"));
    harness.parser.returns(parsed);

    let mut turn = turn(Vec::new(), inbound("my order is A-1001"));
    turn.conversation.lock_attempts = 2;

    let event = harness.run(turn).await.expect("turn should complete");

    assert_eq!(event.conversation.after.lock_attempts, 0);
    assert_eq!(event.context.after.get("order_id"), Some(&json!("A-1001")));
}

#[tokio::test]
async fn identical_instruction_slots_bump_attempts_once() {
    let harness = Harness::new();
    harness.workflow.returns(json!([
        { "instructions": "ask for the order number" },
        { "instructions": "ask for the order number" }
    ]));
    let history = vec![message(
        "sys-1",
        Role::System,
        "ask for the order number",
        "2024-01-01T00:00:00.000Z",
    )];

    let event = harness
        .run(turn(history, inbound("hi")))
        .await
        .expect("turn should complete");

    assert_eq!(event.conversation.after.lock_attempts, 1);
    let system_messages = event
        .messages
        .after
        .iter()
        .filter(|message| message.role == Role::System)
        .count();
    assert_eq!(system_messages, 1);
}

#[tokio::test]
async fn reset_intent_clears_intent_and_lock_state() {
    let harness = Harness::new();
    harness
        .workflow
        .returns(json!({ "resetIntent": true, "instructions": "start over" }));
    let mut turn = turn(Vec::new(), inbound("never mind"));
    turn.conversation.intent = Some("refund".to_string());
    turn.conversation.intent_score = Some(0.9);

    let event = harness.run(turn).await.expect("turn should complete");

    let after = &event.conversation.after;
    assert!(after.intent.is_none());
    assert!(after.intent_score.is_none());
    assert_eq!(after.lock_attempts, 0);
    assert!(!after.locked);
}
