use std::collections::BTreeSet;

use serde_json::Value;

use crate::conversation::types::{Message, Role};

/// Identity used to decide whether two messages are the same logical event.
/// The role is always part of the key; tool responses are further scoped by
/// the call they answer.
pub fn message_key(message: &Message) -> String {
    if message.role == Role::Tool {
        let call_id = message.tool_call_id.as_deref().unwrap_or(&message.id);
        return format!("tool::{call_id}::{}", message.content);
    }

    if let Some(tool_calls) = message.tool_calls.as_ref().filter(|calls| !calls.is_null()) {
        let serialized = serde_json::to_string(tool_calls).unwrap_or_default();
        return format!("assistant::tool_calls::{serialized}");
    }

    format!("{}::{}", message.role.as_str(), message.content)
}

fn tool_call_ids(message: &Message) -> Vec<String> {
    match message.tool_calls.as_ref() {
        Some(Value::Array(calls)) => calls
            .iter()
            .filter_map(|call| call.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Ids of requested tool calls that no tool message answers, in request order.
pub fn unpaired_tool_calls<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Vec<String> {
    let mut requested = Vec::new();
    let mut answered = BTreeSet::new();

    for message in messages {
        if message.role == Role::Tool {
            if let Some(call_id) = message.tool_call_id.as_deref() {
                answered.insert(call_id.to_string());
            }
            continue;
        }
        for call_id in tool_call_ids(message) {
            if !requested.contains(&call_id) {
                requested.push(call_id);
            }
        }
    }

    requested
        .into_iter()
        .filter(|call_id| !answered.contains(call_id))
        .collect()
}
