use serde_json::json;
use spirits::conversation::{Message, ProjectConfig, Role, TurnError, TurnStage};

use crate::support::{Harness, inbound, message, turn};

async fn rejected(turn: spirits::conversation::CustomerTurn) -> (Harness, TurnError) {
    let harness = Harness::new();
    let err = harness.run(turn).await.expect_err("input should be rejected");
    (harness, err)
}

#[tokio::test]
async fn missing_agent_is_rejected() {
    let mut turn = turn(Vec::new(), inbound("hello"));
    turn.conversation.agent = String::new();

    let (harness, err) = rejected(turn).await;

    assert_eq!(err.stage(), TurnStage::Validate);
    assert!(err.to_string().contains("$agent"));
    assert!(harness.parser.calls.lock().expect("lock").is_empty());
    assert!(harness.emitter.added.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn unknown_persona_is_rejected() {
    let mut turn = turn(Vec::new(), inbound("hello"));
    turn.conversation.agent = "agent-404".to_string();

    let (_, err) = rejected(turn).await;

    assert!(matches!(err, TurnError::InvalidInput { .. }));
    assert!(err.to_string().contains("agent-404"));
}

#[tokio::test]
async fn duplicate_message_ids_are_rejected() {
    let history = vec![
        message("dup", Role::Customer, "a", "2024-01-01T00:00:00.000Z"),
        message("dup", Role::Agent, "b", "2024-01-01T00:00:01.000Z"),
    ];

    let (_, err) = rejected(turn(history, inbound("hello"))).await;

    assert!(err.to_string().contains("duplicate message id 'dup'"));
}

#[tokio::test]
async fn blank_message_ids_are_rejected() {
    let history = vec![message("  ", Role::Customer, "a", "2024-01-01T00:00:00.000Z")];
    let (_, err) = rejected(turn(history, inbound("hello"))).await;
    assert!(err.to_string().contains("messages[0]"));

    let (_, err) = rejected(turn(Vec::new(), message("", Role::Customer, "hi", ""))).await;
    assert!(err.to_string().contains("inbound message"));
}

#[test]
fn unknown_roles_fail_to_deserialize() {
    let err = serde_json::from_value::<Message>(json!({
        "id": "m-1",
        "role": "bot",
        "content": "beep"
    }))
    .expect_err("bot is not a role");
    assert!(err.to_string().contains("invalid message role 'bot'"));
}

#[test]
fn negative_min_step_is_unrepresentable() {
    let err = serde_json::from_value::<ProjectConfig>(json!({ "minStepSeconds": -1 }))
        .expect_err("a negative step would let times go backwards");
    assert!(err.to_string().contains("-1"));

    let config: ProjectConfig =
        serde_json::from_value(json!({ "minStepSeconds": 0 })).expect("zero is allowed");
    assert_eq!(config.min_step_seconds, 0);
}
