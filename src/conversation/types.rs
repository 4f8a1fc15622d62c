use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation::time::{DEFAULT_MIN_STEP_SECONDS, TimeValue};

pub type Context = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Role {
    Customer,
    Agent,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Agent => "agent",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "customer" => Ok(Role::Customer),
            "agent" => Ok(Role::Agent),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!(
                "invalid message role '{other}', expected one of customer, agent, system, tool"
            )),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "tool_calls", default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(rename = "tool_call_id", default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_generated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_transformed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_transform: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_in_seconds: Option<f64>,
    /// Pass-through fields the orchestrator does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            time: String::new(),
            intent: None,
            intent_score: None,
            entities: None,
            context: None,
            tool_calls: None,
            tool_call_id: None,
            content_generated: None,
            content_transformed: None,
            ignore_transform: None,
            scheduled: None,
            delay_in_seconds: None,
            extra: Map::new(),
        }
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = time.into();
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        has_tool_calls(self.tool_calls.as_ref())
    }
}

fn has_tool_calls(tool_calls: Option<&Value>) -> bool {
    match tool_calls {
        None | Some(Value::Null) => false,
        Some(Value::Array(calls)) => !calls.is_empty(),
        Some(_) => true,
    }
}

const BASE_MESSAGE_FIELDS: [&str; 4] = ["id", "role", "time", "content"];

/// A message as proposed by a stage before the orchestrator assigns its
/// identity and time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeValue>,
    #[serde(rename = "tool_calls", skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(rename = "tool_call_id", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_generated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_transformed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_transform: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_in_seconds: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageDraft {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        has_tool_calls(self.tool_calls.as_ref())
    }

    pub fn has_content(&self) -> bool {
        self.content
            .as_deref()
            .is_some_and(|content| !content.trim().is_empty())
    }

    /// Lays the draft over a base carrying `id`, `role` and `time`. Null
    /// pass-through values are dropped and never clobber the base.
    pub fn into_message(self, id: String, role: Role, time: String) -> Message {
        let mut message = Message::new(id, role, self.content.unwrap_or_default()).with_time(time);
        message.tool_calls = self.tool_calls.filter(|value| !value.is_null());
        message.tool_call_id = self.tool_call_id;
        message.content_generated = self.content_generated;
        message.content_transformed = self.content_transformed;
        message.ignore_transform = self.ignore_transform;
        message.scheduled = self.scheduled;
        message.delay_in_seconds = self.delay_in_seconds;
        message.extra = self
            .extra
            .into_iter()
            .filter(|(key, value)| !value.is_null() && !BASE_MESSAGE_FIELDS.contains(&key.as_str()))
            .collect();
        message
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Phone,
    Email,
    #[default]
    Web,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "$id", default)]
    pub id: String,
    #[serde(rename = "$agent", default)]
    pub agent: String,
    #[serde(rename = "$customer", default)]
    pub customer: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<String>,
    #[serde(default)]
    pub lock_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_score: Option<f64>,
    #[serde(flatten)]
    pub anticipate: Option<Anticipate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lore: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmt: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Persona {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            lore: None,
            llm: None,
            pmt: None,
            extra: Map::new(),
        }
    }

    pub fn without_lore(&self) -> Self {
        Self {
            lore: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_lock_attempts() -> u32 {
    3
}

fn default_min_step_seconds() -> u32 {
    DEFAULT_MIN_STEP_SECONDS
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub agents: Vec<Persona>,
    #[serde(default = "default_max_lock_attempts")]
    pub max_lock_attempts: u32,
    #[serde(default = "default_min_step_seconds")]
    pub min_step_seconds: u32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmt: Option<Value>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            max_lock_attempts: default_max_lock_attempts(),
            min_step_seconds: default_min_step_seconds(),
            language: default_language(),
            llm: None,
            pmt: None,
        }
    }
}

impl ProjectConfig {
    pub fn persona(&self, id: &str) -> Option<&Persona> {
        self.agents.iter().find(|persona| persona.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Forward {
    Flag(bool),
    Target(String),
    Detailed(ForwardTarget),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedForward {
    pub target: String,
    pub mode: Option<String>,
    pub note: Option<String>,
}

impl Forward {
    /// `None` when the value does not ask for a forward at all.
    pub fn resolve(&self, default_target: &str) -> Option<ResolvedForward> {
        let non_empty = |value: &Option<String>| value.clone().filter(|text| !text.is_empty());
        match self {
            Forward::Flag(false) => None,
            Forward::Flag(true) => Some(ResolvedForward {
                target: default_target.to_string(),
                mode: None,
                note: None,
            }),
            Forward::Target(target) if target.is_empty() => None,
            Forward::Target(target) => Some(ResolvedForward {
                target: target.clone(),
                mode: None,
                note: None,
            }),
            Forward::Detailed(detail) => Some(ResolvedForward {
                target: non_empty(&detail.to).unwrap_or_else(|| default_target.to_string()),
                mode: non_empty(&detail.mode),
                note: non_empty(&detail.note),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstructionItem {
    Text(String),
    Entry(InstructionEntry),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instructions {
    Text(String),
    Entry(InstructionEntry),
    List(Vec<InstructionItem>),
}

impl InstructionItem {
    fn into_entry(self) -> InstructionEntry {
        match self {
            InstructionItem::Text(content) => InstructionEntry { id: None, content },
            InstructionItem::Entry(entry) => entry,
        }
    }
}

impl Instructions {
    pub fn entries(&self) -> Vec<InstructionEntry> {
        match self.clone() {
            Instructions::Text(content) => vec![InstructionEntry { id: None, content }],
            Instructions::Entry(entry) => vec![entry],
            Instructions::List(items) => items.into_iter().map(InstructionItem::into_entry).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotMessage {
    Text(String),
    Draft(MessageDraft),
}

impl SlotMessage {
    pub fn into_draft(self) -> MessageDraft {
        match self {
            SlotMessage::Text(content) => MessageDraft {
                content: Some(content),
                ..MessageDraft::default()
            },
            SlotMessage::Draft(draft) => draft,
        }
    }
}

/// One unit of workflow output. Slots are applied in order and their effects
/// accumulate over the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowResponseSlot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward: Option<Forward>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Instructions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_instructions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<SlotMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_upsert: Option<Context>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reset_intent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anticipate: Option<AnticipateSlot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followup: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_context_upsert: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Value>>,
}

impl WorkflowResponseSlot {
    pub fn instruction_entries(&self) -> Vec<InstructionEntry> {
        self.instructions
            .as_ref()
            .map(Instructions::entries)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordBranch {
    pub keywords: Vec<String>,
    #[serde(flatten)]
    pub slot: WorkflowResponseSlot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionBranches {
    yes: WorkflowResponseSlot,
    no: WorkflowResponseSlot,
    did: String,
}

/// The `anticipate` field of a slot: either keyword-matched branches or a
/// yes/no decision on a question.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum AnticipateSlot {
    Literal(Vec<KeywordBranch>),
    Decision {
        yes: Box<WorkflowResponseSlot>,
        no: Box<WorkflowResponseSlot>,
        did: String,
    },
}

impl TryFrom<Value> for AnticipateSlot {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<KeywordBranch>(item)
                        .map_err(|err| format!("anticipate[{index}] is not a keyword branch: {err}"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(AnticipateSlot::Literal),
            Value::Object(map)
                if map.contains_key("yes") && map.contains_key("no") && map.contains_key("did") =>
            {
                let decision: DecisionBranches = serde_json::from_value(Value::Object(map))
                    .map_err(|err| format!("anticipate decision is malformed: {err}"))?;
                Ok(AnticipateSlot::Decision {
                    yes: Box::new(decision.yes),
                    no: Box::new(decision.no),
                    did: decision.did,
                })
            }
            _ => Err(
                "anticipate must be an array of keyword branches or an object with yes, no and did"
                    .to_string(),
            ),
        }
    }
}

impl From<AnticipateSlot> for Value {
    fn from(slot: AnticipateSlot) -> Self {
        let value = match slot {
            AnticipateSlot::Literal(branches) => serde_json::to_value(branches),
            AnticipateSlot::Decision { yes, no, did } => serde_json::to_value(DecisionBranches {
                yes: *yes,
                no: *no,
                did,
            }),
        };
        value.unwrap_or_default()
    }
}

impl AnticipateSlot {
    pub fn into_anticipate(self) -> Anticipate {
        match self {
            AnticipateSlot::Literal(branches) => {
                let mut slots = BTreeMap::new();
                let mut map = Vec::with_capacity(branches.len());
                for (index, branch) in branches.into_iter().enumerate() {
                    let key = index.to_string();
                    slots.insert(key.clone(), branch.slot);
                    map.push(AnticipateKeywords {
                        slot: key,
                        keywords: branch.keywords,
                    });
                }
                Anticipate::Literal { slots, map }
            }
            AnticipateSlot::Decision { yes, no, did } => Anticipate::Decision {
                slots: DecisionSlots { yes, no },
                did,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnticipateKeywords {
    pub slot: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSlots {
    pub yes: Box<WorkflowResponseSlot>,
    pub no: Box<WorkflowResponseSlot>,
}

/// Next-turn branches stored on the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anticipate {
    Literal {
        slots: BTreeMap<String, WorkflowResponseSlot>,
        map: Vec<AnticipateKeywords>,
    },
    #[serde(rename = "did")]
    Decision { slots: DecisionSlots, did: String },
}

// Slots carry untyped payloads; equality goes through their JSON form.
impl PartialEq for Anticipate {
    fn eq(&self, other: &Self) -> bool {
        serde_json::to_value(self).ok() == serde_json::to_value(other).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub before: T,
    pub after: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationChange {
    pub before: Conversation,
    pub after: Conversation,
    pub forward: Option<String>,
    pub forward_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub conversation: ConversationChange,
    pub messages: Change<Vec<Message>>,
    pub message: Change<Message>,
    pub context: Change<Context>,
    pub followup: Vec<Value>,
    pub entity_context_upsert: Vec<Value>,
}

/// Deep-merges `patch` into `target` and returns the top-level keys that did
/// not exist before.
pub fn merge_context(target: &mut Context, patch: &Context) -> Vec<String> {
    let mut added = Vec::new();
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_context(existing, incoming);
            }
            (Some(existing), _) => *existing = value.clone(),
            (None, _) => {
                added.push(key.clone());
                target.insert(key.clone(), value.clone());
            }
        }
    }
    added
}
