//! The `[AI Task]` block embedded in an event description.
//!
//! The block is YAML between two marker lines. Parsing always yields a usable
//! [`TaskBlock`]: a missing or malformed block decodes to the calendar's
//! defaults, tagged so callers can tell the difference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::TaskDefaults;
use crate::error::{ReconcileError, ReconcileResult};

pub const BLOCK_START: &str = "[AI Task]";
pub const BLOCK_END: &str = "[/AI Task]";

const BLOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub earliest_start: Option<String>,
    #[serde(default)]
    pub latest_end: Option<String>,
    #[serde(default = "default_true")]
    pub avoid_overlap_with_mandatory: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            earliest_start: None,
            latest_end: None,
            avoid_overlap_with_mandatory: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Typed contents of an `[AI Task]` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBlock {
    pub version: u32,
    /// The planner may never mutate a locked event.
    pub locked: bool,
    /// Informational for the planner: the event must happen.
    pub mandatory: bool,
    pub editable_fields: Vec<String>,
    /// One-shot instruction. Only events with an intent may be changed.
    #[serde(serialize_with = "serialize_intent", deserialize_with = "deserialize_intent")]
    pub user_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub constraints: Constraints,
    pub priority: String,
    pub source: String,
    pub last_editor: String,
    pub updated_at: Option<DateTime<Utc>>,
}

fn serialize_intent<S: Serializer>(intent: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(intent.as_deref().unwrap_or(""))
}

fn deserialize_intent<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.filter(|text| !text.trim().is_empty()))
}

impl TaskBlock {
    pub fn from_defaults(defaults: &TaskDefaults, now: DateTime<Utc>) -> Self {
        TaskBlock {
            version: BLOCK_VERSION,
            locked: defaults.locked,
            mandatory: defaults.mandatory,
            editable_fields: defaults.editable_fields(),
            user_intent: None,
            category: None,
            constraints: Constraints::default(),
            priority: "medium".to_string(),
            source: "system".to_string(),
            last_editor: "system".to_string(),
            updated_at: Some(now),
        }
    }

    pub fn has_intent(&self) -> bool {
        self.user_intent.is_some()
    }

    pub fn allows_field(&self, field: &str) -> bool {
        self.editable_fields.iter().any(|f| f == field)
    }

    fn to_yaml(&self) -> ReconcileResult<String> {
        serde_yaml::to_string(self)
            .map(|yaml| yaml.trim().to_string())
            .map_err(|e| ReconcileError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultReason {
    Missing,
    Malformed,
}

/// Result of decoding a description.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    WellFormed(TaskBlock),
    Defaulted { block: TaskBlock, reason: DefaultReason },
}

impl Decoded {
    pub fn block(&self) -> &TaskBlock {
        match self {
            Decoded::WellFormed(block) | Decoded::Defaulted { block, .. } => block,
        }
    }

    pub fn into_block(self) -> TaskBlock {
        match self {
            Decoded::WellFormed(block) | Decoded::Defaulted { block, .. } => block,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        matches!(self, Decoded::WellFormed(_))
    }
}

/// Byte range of the whole block (markers included) and of its YAML body.
fn locate(description: &str) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    let start = description.find(BLOCK_START)?;
    let body_start = start + BLOCK_START.len();
    let end = body_start + description[body_start..].find(BLOCK_END)?;
    Some((start..end + BLOCK_END.len(), body_start..end))
}

/// Decode the block embedded in `description`, filling absent keys from `defaults`.
pub fn parse(description: &str, defaults: &TaskDefaults, now: DateTime<Utc>) -> Decoded {
    let fallback = TaskBlock::from_defaults(defaults, now);
    let Some((_, body)) = locate(description) else {
        return Decoded::Defaulted {
            block: fallback,
            reason: DefaultReason::Missing,
        };
    };
    let body = &description[body];

    match decode_body(body, &fallback) {
        Some(block) => Decoded::WellFormed(block),
        None => {
            tracing::debug!("malformed task block replaced with defaults");
            Decoded::Defaulted {
                block: salvage(body, fallback),
                reason: DefaultReason::Malformed,
            }
        }
    }
}

fn decode_body(body: &str, fallback: &TaskBlock) -> Option<TaskBlock> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(body).ok()?;
    let parsed = match parsed {
        serde_yaml::Value::Mapping(map) => map,
        serde_yaml::Value::Null => serde_yaml::Mapping::new(),
        _ => return None,
    };

    let serde_yaml::Value::Mapping(mut merged) = serde_yaml::to_value(fallback).ok()? else {
        return None;
    };
    for (key, value) in parsed {
        // `updated_at: null` keeps the default timestamp
        if value.is_null() && key.as_str() == Some("updated_at") {
            continue;
        }
        merged.insert(key, value);
    }

    let mut block: TaskBlock = serde_yaml::from_value(serde_yaml::Value::Mapping(merged)).ok()?;
    block.editable_fields = block
        .editable_fields
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if block.editable_fields.is_empty() {
        block.editable_fields = fallback.editable_fields.clone();
    }
    Some(block)
}

/// Recover `user_intent` and `locked` from a block that no longer parses as
/// YAML. An intent is only kept when the lock state is known.
fn salvage(body: &str, fallback: TaskBlock) -> TaskBlock {
    let intent = salvage_line(body, "user_intent")
        .map(unquote)
        .filter(|intent| !intent.is_empty())
        .map(str::to_string);
    let locked = match salvage_line(body, "locked") {
        None => Some(fallback.locked),
        Some(raw) => parse_flag(unquote(raw)),
    };

    match locked {
        Some(locked) => TaskBlock {
            locked,
            user_intent: intent,
            ..fallback
        },
        None => TaskBlock {
            user_intent: None,
            ..fallback
        },
    }
}

fn salvage_line<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.lines()
        .find_map(|line| line.trim_start().strip_prefix(key)?.strip_prefix(':'))
        .map(str::trim)
}

fn unquote(raw: &str) -> &str {
    raw.trim_matches(|c| c == '"' || c == '\'').trim()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `description` with the block removed.
pub fn strip(description: &str) -> String {
    match locate(description) {
        Some((whole, _)) => {
            let mut cleaned = String::with_capacity(description.len());
            cleaned.push_str(&description[..whole.start]);
            cleaned.push_str(&description[whole.end..]);
            cleaned.trim().to_string()
        }
        None => description.trim().to_string(),
    }
}

/// Replace the block in `description` with `block`, or append it.
pub fn upsert(description: &str, block: &TaskBlock) -> ReconcileResult<String> {
    let rendered = format!("{BLOCK_START}\n{}\n{BLOCK_END}", block.to_yaml()?);

    if description.trim().is_empty() {
        return Ok(rendered);
    }

    let updated = match locate(description) {
        Some((whole, _)) => {
            format!("{}{}{}", &description[..whole.start], rendered, &description[whole.end..])
        }
        None => format!("{}\n\n{}", description.trim_end(), rendered),
    };
    Ok(updated.trim().to_string())
}

/// A description whose block has been normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Ensured {
    pub description: String,
    pub block: TaskBlock,
    /// The normalized description differs from the input.
    pub changed: bool,
}

/// Normalize the block in `description`, inserting a default one if missing.
pub fn ensure(description: &str, defaults: &TaskDefaults, now: DateTime<Utc>) -> ReconcileResult<Ensured> {
    let block = parse(description, defaults, now).into_block();
    let normalized = upsert(description, &block)?;
    Ok(Ensured {
        changed: normalized != description,
        description: normalized,
        block,
    })
}

/// Best-effort classification from free text.
pub fn infer_category(text: &str) -> &'static str {
    const RULES: [(&str, &[&str]); 5] = [
        ("study", &["class", "lecture", "school", "study", "course"]),
        ("meeting", &["meeting", "sync", "review", "standup"]),
        ("health", &["gym", "workout", "exercise", "running"]),
        ("travel", &["travel", "trip", "flight"]),
        ("family", &["family", "home", "parents"]),
    ];

    let text = text.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or("general")
}
