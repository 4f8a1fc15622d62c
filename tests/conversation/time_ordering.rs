use std::sync::Arc;

use spirits::conversation::{
    Message, Role, TimeValue, ToDate, enforce_monotonic_in_place, next_monotonic_iso,
    parse_time_utc, push_message,
};
use time::{OffsetDateTime, macros::datetime};

use crate::support::{Harness, inbound, message, turn};

fn at(time: &str) -> Message {
    message("m", Role::Customer, "hi", time)
}

struct LazyTimestamp(OffsetDateTime);

impl ToDate for LazyTimestamp {
    fn to_date(&self) -> Option<OffsetDateTime> {
        Some(self.0)
    }
}

#[test]
fn wrapped_and_native_values_resolve() {
    let wrapped = TimeValue::Wrapped(Arc::new(LazyTimestamp(datetime!(2024-05-01 08:00 UTC))));
    assert_eq!(
        parse_time_utc(&wrapped),
        Some(datetime!(2024-05-01 08:00 UTC))
    );
    assert_eq!(
        parse_time_utc(&TimeValue::Native(datetime!(2024-05-01 10:00 +02:00))),
        Some(datetime!(2024-05-01 08:00 UTC))
    );
}

#[test]
fn proposed_time_below_floor_is_raised() {
    let existing = vec![at("2024-01-01T00:00:00.000Z"), at("2024-01-01T00:00:05.000Z")];

    let next = next_monotonic_iso(&existing, &TimeValue::from("2024-01-01T00:00:03.000Z"), 1);
    assert_eq!(next, "2024-01-01T00:00:06.000Z");

    let next = next_monotonic_iso(&existing, &TimeValue::from("2024-01-01T00:00:06.000Z"), 1);
    assert_eq!(next, "2024-01-01T00:00:06.000Z");
}

#[test]
fn proposed_time_is_kept_without_a_floor() {
    let existing = vec![at("garbage")];
    let next = next_monotonic_iso(&existing, &TimeValue::from("2020-02-02T02:02:02.000Z"), 1);
    assert_eq!(next, "2020-02-02T02:02:02.000Z");
}

#[test]
fn invalid_proposal_falls_back_to_now() {
    let before = OffsetDateTime::now_utc() - time::Duration::seconds(1);
    let next = next_monotonic_iso(&[], &TimeValue::Other(serde_json::json!(12345)), 1);
    let parsed = parse_time_utc(&TimeValue::from(next)).expect("result should parse");
    assert!(parsed >= before);
}

#[test]
fn push_message_leaves_the_input_untouched() {
    let mut messages = vec![at("2024-01-01T00:00:10.000Z")];
    let original = message("m-2", Role::Agent, "reply", "2024-01-01T00:00:00.000Z");

    let stored = push_message(&mut messages, &original, 2);

    assert_eq!(original.time, "2024-01-01T00:00:00.000Z");
    assert_eq!(stored.time, "2024-01-01T00:00:12.000Z");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1], stored);
}

#[test]
fn enforce_keeps_order_and_spaces_times() {
    let mut messages = vec![
        message("a", Role::Customer, "1", "2024-01-01T00:00:10.000Z"),
        message("b", Role::Agent, "2", "2024-01-01T00:00:05.000Z"),
        message("c", Role::System, "3", ""),
        message("d", Role::Agent, "4", "2030-01-01T00:00:00.000Z"),
    ];

    let changed = enforce_monotonic_in_place(&mut messages, 1);

    let ids: Vec<_> = messages.iter().map(|message| message.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c", "d"]);
    assert_eq!(messages[1].time, "2024-01-01T00:00:11.000Z");
    assert!(changed.contains(&1));
    assert!(changed.contains(&2));
    assert!(!changed.contains(&0));

    let times: Vec<_> = messages
        .iter()
        .map(|message| parse_time_utc(&TimeValue::from(message.time.as_str())).expect("valid"))
        .collect();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= time::Duration::seconds(1));
    }
}

const LAST_INSTANT: &str = "9999-12-31T23:59:59.999Z";

#[test]
fn floors_saturate_at_the_calendar_maximum() {
    let existing = vec![at(LAST_INSTANT)];
    let next = next_monotonic_iso(&existing, &TimeValue::from("2024-01-01T00:00:00.000Z"), 1);
    assert_eq!(next, LAST_INSTANT);

    let mut messages = vec![at(LAST_INSTANT), at("2024-01-01T00:00:00.000Z")];
    assert_eq!(enforce_monotonic_in_place(&mut messages, 1), vec![1]);
    assert_eq!(messages[1].time, LAST_INSTANT);
}

#[tokio::test]
async fn history_at_the_calendar_maximum_still_completes_a_turn() {
    let harness = Harness::new();
    harness
        .workflow
        .returns(serde_json::json!({ "instructions": "be helpful" }));
    let history = vec![message("m-late", Role::Agent, "see you", LAST_INSTANT)];

    let event = harness
        .run(turn(history, inbound("hello")))
        .await
        .expect("turn should complete");

    assert!(
        event
            .messages
            .after
            .iter()
            .all(|message| message.time == LAST_INSTANT)
    );
}
