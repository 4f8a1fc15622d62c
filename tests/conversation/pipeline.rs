use serde_json::json;
use spirits::conversation::{MessageDraft, ParseOutput, ProgressLevel, Role};

use crate::support::{
    Harness, agent_text, contents, inbound, message, sent, turn,
};

fn greet_gary(content: &str) -> String {
    content.replace("sir", "Gary")
}

#[tokio::test]
async fn hello_turn_is_generated_and_transformed() {
    let harness = Harness::new().with_transformer(greet_gary);
    harness.workflow.returns(json!({ "instructions": "be helpful" }));
    harness.generator.returns(sent(vec![agent_text("hello there sir")]));

    let event = harness
        .run(turn(Vec::new(), inbound("hello")))
        .await
        .expect("turn should complete");

    assert_eq!(
        contents(&event.messages.after),
        vec![
            (Role::Customer, "hello".to_string()),
            (Role::System, "be helpful".to_string()),
            (Role::Agent, "hello there Gary".to_string()),
        ]
    );
    let reply = &event.messages.after[2];
    assert_eq!(reply.content_generated.as_deref(), Some("hello there sir"));
    assert_eq!(reply.content_transformed.as_deref(), Some("hello there Gary"));
    assert!(!event.conversation.after.locked);

    let chunks = harness.emitter.chunks.lock().expect("lock").clone();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "hello there Gary");
    assert_eq!(chunks[0].mode, "replace");
    assert_eq!(chunks[0].source, "transformer");
    assert_eq!(chunks[0].message_id, reply.id);
}

#[tokio::test]
async fn missing_transformed_content_is_backfilled_with_a_warning() {
    let harness = Harness::new().with_transformer(greet_gary);
    harness.workflow.returns(json!({ "instructions": "be helpful" }));
    harness.generator.returns(sent(vec![agent_text("hi sir")]));

    harness
        .run(turn(Vec::new(), inbound("hello")))
        .await
        .expect("turn should complete");

    let reports = harness.progress.reports.lock().expect("lock").clone();
    assert!(reports.iter().any(|report| {
        report.level == ProgressLevel::Warn
            && report.kind.as_deref() == Some("content_transformed_missing")
    }));
}

#[tokio::test]
async fn duplicate_generated_messages_collapse_to_one() {
    let harness = Harness::new();
    harness.workflow.returns(json!({ "instructions": "repeat yourself" }));
    harness.generator.returns(sent(vec![
        agent_text("DUPLICATE_ME"),
        agent_text("DUPLICATE_ME"),
    ]));

    let event = harness
        .run(turn(Vec::new(), inbound("hello")))
        .await
        .expect("turn should complete");

    let copies = event
        .messages
        .after
        .iter()
        .filter(|message| message.content == "DUPLICATE_ME")
        .count();
    assert_eq!(copies, 1);
    assert!(
        harness
            .progress
            .kinds()
            .contains(&"duplicate_message_removed".to_string())
    );
}

#[tokio::test]
async fn tool_replies_with_identical_content_both_survive() {
    let harness = Harness::new();
    harness.workflow.returns(json!({ "instructions": "look it up" }));
    let drafts: Vec<MessageDraft> = serde_json::from_value(json!([
        {
            "role": "agent",
            "content": "",
            "tool_calls": [
                { "id": "call-1", "type": "function" },
                { "id": "call-2", "type": "function" }
            ]
        },
        { "role": "tool", "tool_call_id": "call-1", "content": "42" },
        { "role": "tool", "tool_call_id": "call-2", "content": "42" }
    ]))
    .expect("drafts should parse");
    harness.generator.returns(sent(drafts));

    let event = harness
        .run(turn(Vec::new(), inbound("what is the answer?")))
        .await
        .expect("turn should complete");

    let tool_replies: Vec<_> = event
        .messages
        .after
        .iter()
        .filter(|message| message.role == Role::Tool)
        .map(|message| message.tool_call_id.clone())
        .collect();
    assert_eq!(
        tool_replies,
        vec![Some("call-1".to_string()), Some("call-2".to_string())]
    );
    assert!(!harness.progress.kinds().contains(&"unpaired_tool_calls".to_string()));
}

#[tokio::test]
async fn unpaired_tool_calls_are_reported() {
    let harness = Harness::new();
    harness.workflow.returns(json!({ "instructions": "look it up" }));
    let drafts: Vec<MessageDraft> = serde_json::from_value(json!([
        { "role": "agent", "tool_calls": [{ "id": "call-9", "type": "function" }] }
    ]))
    .expect("drafts should parse");
    harness.generator.returns(sent(drafts));

    let event = harness
        .run(turn(Vec::new(), inbound("what is the answer?")))
        .await
        .expect("turn should complete");

    assert!(!event.conversation.after.locked);
    let reports = harness.progress.reports.lock().expect("lock").clone();
    assert!(reports.iter().any(|report| {
        report.kind.as_deref() == Some("unpaired_tool_calls") && report.message.contains("call-9")
    }));
}

#[tokio::test]
async fn repeating_the_last_agent_message_locks() {
    let harness = Harness::new();
    harness.workflow.returns(json!({ "instructions": "answer" }));
    harness.generator.returns(sent(vec![agent_text("We open at nine.")]));
    let history = vec![
        message("c-0", Role::Customer, "when do you open?", "2024-01-01T00:00:00.000Z"),
        message("a-0", Role::Agent, "We open at nine.", "2024-01-01T00:00:01.000Z"),
    ];

    let event = harness
        .run(turn(history, inbound("when do you open?!")))
        .await
        .expect("turn should complete");

    assert!(event.conversation.after.locked);
    assert_eq!(
        event.conversation.after.locked_reason.as_deref(),
        Some("Duplicate message")
    );
    let replies = event
        .messages
        .after
        .iter()
        .filter(|message| message.content == "We open at nine.")
        .count();
    assert_eq!(replies, 1);
}

#[tokio::test]
async fn declined_generation_locks_with_its_errors() {
    let harness = Harness::new();
    harness.workflow.returns(json!({ "instructions": "answer" }));
    harness.generator.returns(spirits::conversation::GenerateOutput {
        send: false,
        errors: vec!["content filtered".to_string(), "retry later".to_string()],
        ..Default::default()
    });

    let event = harness
        .run(turn(Vec::new(), inbound("hello")))
        .await
        .expect("turn should complete");

    assert!(event.conversation.after.locked);
    assert_eq!(
        event.conversation.after.locked_reason.as_deref(),
        Some("content filtered; retry later")
    );
}

#[tokio::test]
async fn parse_results_land_on_the_inbound_message() {
    let harness = Harness::new();
    harness.parser.returns(ParseOutput {
        intent: Some("greeting".to_string()),
        intent_score: Some(0.75),
        entities: Some(json!([{ "type": "name", "value": "Gary" }])),
        context_messages: vec!["Customer is a returning buyer".to_string(), String::new()],
        ..ParseOutput::default()
    });
    harness.workflow.returns(json!({ "instructions": "greet back" }));

    let event = harness
        .run(turn(Vec::new(), inbound("hello")))
        .await
        .expect("turn should complete");

    assert_eq!(
        harness.parser.calls.lock().expect("lock").clone(),
        vec![("hello".to_string(), "en".to_string())]
    );
    assert_eq!(event.message.after.intent.as_deref(), Some("greeting"));
    assert_eq!(event.message.after.intent_score, Some(0.75));
    assert!(event.message.before.intent.is_none());
    assert_eq!(event.conversation.after.intent.as_deref(), Some("greeting"));
    let context_notes = event
        .messages
        .after
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(context_notes, ["Customer is a returning buyer", "greet back"]);
}

#[tokio::test]
async fn contextualizer_skips_empty_and_known_messages() {
    let harness = Harness::new();
    let history = vec![message(
        "sys-0",
        Role::System,
        "VIP customer",
        "2024-01-01T00:00:00.000Z",
    )];
    harness.contextualizer.returns(vec![
        MessageDraft::text(Role::System, "VIP customer"),
        MessageDraft::text(Role::System, "   "),
        MessageDraft::text(Role::System, "Prefers email"),
    ]);
    harness.workflow.returns(json!({ "instructions": "be nice" }));

    let event = harness
        .run(turn(history, inbound("hi")))
        .await
        .expect("turn should complete");

    let system: Vec<_> = event
        .messages
        .after
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(system, ["VIP customer", "Prefers email", "be nice"]);
    assert!(
        harness
            .progress
            .kinds()
            .contains(&"contextualizer_empty_message".to_string())
    );
}

#[tokio::test]
async fn workflow_sees_intent_flow_and_persona_without_lore() {
    let harness = Harness::new();
    harness.parser.returns(ParseOutput {
        intent: Some("refund".to_string()),
        ..ParseOutput::default()
    });
    let mut earlier = message("c-0", Role::Customer, "hi", "2024-01-01T00:00:00.000Z");
    earlier.intent = Some("greeting".to_string());
    let mut turn = turn(vec![earlier], inbound("I want my money back"));
    turn.conversation.intent = Some("greeting".to_string());
    turn.conversation.lock_attempts = 2;

    harness.run(turn).await.expect("turn should complete");

    let event = harness.workflow.last_event();
    assert!(event.agent.lore.is_none());
    assert_eq!(event.agent.name.as_deref(), Some("Gary"));
    assert_eq!(event.intent.current.as_deref(), Some("refund"));
    assert_eq!(event.intent.initial.as_deref(), Some("greeting"));
    assert_eq!(
        event.intent.flow,
        vec![Some("greeting".to_string()), Some("refund".to_string())]
    );
    assert_eq!(event.stagnation_count, 2);
    assert_eq!(event.message.id, "msg-in");
}

#[tokio::test]
async fn history_times_are_normalized_and_patched() {
    let harness = Harness::new();
    harness.workflow.returns(json!({ "instructions": "be nice" }));
    let history = vec![
        message("c-0", Role::Customer, "first", "2024-01-01T00:00:05.000Z"),
        message("a-0", Role::Agent, "second", "2024-01-01T00:00:01.000Z"),
    ];

    let event = harness
        .run(turn(history, inbound("third")))
        .await
        .expect("turn should complete");

    assert_eq!(event.messages.after[1].time, "2024-01-01T00:00:06.000Z");
    assert_eq!(event.messages.after[2].time, "2024-01-01T00:00:10.000Z");
    assert_eq!(event.messages.before[1].time, "2024-01-01T00:00:01.000Z");
    let patches = harness.emitter.updated.lock().expect("lock").clone();
    assert!(patches.iter().any(|patch| {
        patch.id == "a-0" && patch.fields.get("time") == Some(&json!("2024-01-01T00:00:06.000Z"))
    }));
}

#[tokio::test]
async fn emitter_failures_never_abort_the_turn() {
    let harness = Harness::new().with_failing_emitter();
    harness.workflow.returns(json!({ "instructions": "be helpful" }));
    harness.generator.returns(sent(vec![agent_text("hi there")]));

    let event = harness
        .run(turn(Vec::new(), inbound("hello")))
        .await
        .expect("turn should complete");

    assert_eq!(event.messages.after.len(), 3);
    assert!(!harness.emitter.added.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn tasks_are_handed_to_the_generator() {
    let harness = Harness::new();
    harness.workflow.returns(json!([
        { "instructions": "collect details", "tasks": [{ "name": "lookup_order" }] },
        { "tasks": [{ "name": "check_stock" }] }
    ]));

    harness
        .run(turn(Vec::new(), inbound("where is my order?")))
        .await
        .expect("turn should complete");

    let requests = harness.generator.requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].tasks,
        Some(vec![json!({ "name": "lookup_order" }), json!({ "name": "check_stock" })])
    );
    assert_eq!(requests[0].persona.id, "agent-1");
}
