use std::{fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{
    Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset,
    format_description::well_known::{Iso8601, Rfc3339},
    macros::format_description,
};

use crate::conversation::types::Message;

pub const DEFAULT_MIN_STEP_SECONDS: u32 = 1;

/// Anything that can hand back a concrete instant on request, e.g. a
/// database timestamp wrapper that is only resolved lazily.
pub trait ToDate: Send + Sync {
    fn to_date(&self) -> Option<OffsetDateTime>;
}

/// A timestamp as it arrives from collaborators. Only ISO strings, native
/// instants and [`ToDate`] wrappers resolve; everything else is invalid.
#[derive(Clone)]
pub enum TimeValue {
    Iso(String),
    Native(OffsetDateTime),
    Wrapped(Arc<dyn ToDate>),
    Other(Value),
}

impl fmt::Debug for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeValue::Iso(text) => f.debug_tuple("Iso").field(text).finish(),
            TimeValue::Native(at) => f.debug_tuple("Native").field(at).finish(),
            TimeValue::Wrapped(_) => f.write_str("Wrapped(..)"),
            TimeValue::Other(value) => f.debug_tuple("Other").field(value).finish(),
        }
    }
}

impl From<&str> for TimeValue {
    fn from(value: &str) -> Self {
        TimeValue::Iso(value.to_string())
    }
}

impl From<String> for TimeValue {
    fn from(value: String) -> Self {
        TimeValue::Iso(value)
    }
}

impl From<OffsetDateTime> for TimeValue {
    fn from(value: OffsetDateTime) -> Self {
        TimeValue::Native(value)
    }
}

impl Serialize for TimeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TimeValue::Iso(text) => serializer.serialize_str(text),
            TimeValue::Native(at) => serializer.serialize_str(&format_iso(*at)),
            TimeValue::Wrapped(wrapper) => match wrapper.to_date() {
                Some(at) => serializer.serialize_str(&format_iso(at)),
                None => serializer.serialize_none(),
            },
            TimeValue::Other(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TimeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(text) => TimeValue::Iso(text),
            other => TimeValue::Other(other),
        })
    }
}

pub fn parse_time_utc(value: &TimeValue) -> Option<OffsetDateTime> {
    let parsed = match value {
        TimeValue::Iso(text) => parse_iso(text),
        TimeValue::Native(at) => Some(*at),
        TimeValue::Wrapped(wrapper) => wrapper.to_date(),
        TimeValue::Other(_) => None,
    }?;
    Some(truncate_to_millis(parsed.to_offset(UtcOffset::UTC)))
}

fn parse_iso(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    OffsetDateTime::parse(text, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(text, &Iso8601::DEFAULT))
        .ok()
}

// Stored times carry millisecond precision; comparisons happen on the same grid.
fn truncate_to_millis(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_millisecond(at.millisecond()).unwrap_or(at)
}

pub fn now_utc() -> OffsetDateTime {
    truncate_to_millis(OffsetDateTime::now_utc())
}

pub fn format_iso(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        ))
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Now plus `seconds`, or `None` when the delay leaves the representable range.
/// Non-positive and non-finite delays mean now.
pub fn iso_after_delay(seconds: f64) -> Option<String> {
    let now = now_utc();
    if !seconds.is_finite() || seconds <= 0.0 {
        return Some(format_iso(now));
    }
    let delay = Duration::checked_seconds_f64(seconds)?;
    now.checked_add(delay).map(truncate_to_millis).map(format_iso)
}

fn latest_representable() -> OffsetDateTime {
    truncate_to_millis(PrimitiveDateTime::MAX.assume_utc())
}

// Saturates at the calendar maximum instead of overflowing.
fn step_after(at: OffsetDateTime, step: Duration) -> OffsetDateTime {
    at.checked_add(step)
        .unwrap_or_else(|| latest_representable().max(at))
}

fn latest_time(existing: &[Message]) -> Option<OffsetDateTime> {
    existing
        .iter()
        .filter_map(|message| parse_time_utc(&TimeValue::from(message.time.as_str())))
        .max()
}

/// Picks the time for a message appended after `existing`: the proposed time
/// when it clears `max(existing) + min_step_seconds`, the floor otherwise.
/// Invalid proposals fall back to now.
pub fn next_monotonic_iso(
    existing: &[Message],
    proposed: &TimeValue,
    min_step_seconds: u32,
) -> String {
    let step = Duration::seconds(i64::from(min_step_seconds));
    let floor = latest_time(existing).map(|max| step_after(max, step));
    let proposed = parse_time_utc(proposed).unwrap_or_else(now_utc);
    match floor {
        Some(floor) if proposed < floor => format_iso(floor),
        _ => format_iso(proposed),
    }
}

/// Appends a copy of `message` with a monotonic time and returns the copy.
/// `message` itself is left untouched.
pub fn push_message(arr: &mut Vec<Message>, message: &Message, min_step_seconds: u32) -> Message {
    let mut copy = message.clone();
    copy.time = next_monotonic_iso(arr, &TimeValue::from(message.time.as_str()), min_step_seconds);
    arr.push(copy.clone());
    copy
}

/// Rewrites times in array order so each is at least `min_step_seconds` after
/// its predecessor. Never reorders. Returns the indices whose time changed.
/// Past the calendar maximum, times saturate there.
pub fn enforce_monotonic_in_place(arr: &mut [Message], min_step_seconds: u32) -> Vec<usize> {
    let step = Duration::seconds(i64::from(min_step_seconds));
    let mut previous: Option<OffsetDateTime> = None;
    let mut changed = Vec::new();

    for (index, message) in arr.iter_mut().enumerate() {
        let mut at =
            parse_time_utc(&TimeValue::from(message.time.as_str())).unwrap_or_else(now_utc);
        if let Some(previous) = previous {
            let floor = step_after(previous, step);
            if at < floor {
                at = floor;
            }
        }

        let normalized = format_iso(at);
        if normalized != message.time {
            message.time = normalized;
            changed.push(index);
        }
        previous = Some(at);
    }

    changed
}
