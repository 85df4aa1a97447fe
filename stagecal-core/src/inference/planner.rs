//! Planning payload, prompt and response normalization.

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, InferenceResult};
use crate::event::Event;
use crate::task_block::{self, TaskBlock};
use crate::window::Window;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a scheduling assistant that rearranges a user's calendar.
You receive a JSON object with the planning window, the ids of immutable calendars and the events in the window.
Each event carries `locked`, `mandatory`, `editable_fields` and `user_intent`.
Only propose changes for events whose `user_intent` is non-empty and whose `locked` is false.
Only touch fields listed in `editable_fields`. Never move an event onto a mandatory event.
Use RFC3339 timestamps with an offset for `start` and `end`.
Reply with a single JSON object: {\"changes\": [{\"calendar_id\": ..., \"uid\": ..., \"start\"?: ..., \"end\"?: ..., \
\"summary\"?: ..., \"location\"?: ..., \"description\"?: ..., \"category\"?: ..., \"reason\": ...}]}.
Reply with {\"changes\": []} when nothing should change.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadWindow {
    pub start: String,
    pub end: String,
    pub timezone: String,
}

/// An event as the planner sees it: the description without its task block,
/// and the block's permissions as plain fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningEvent {
    pub calendar_id: String,
    pub uid: String,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub start: String,
    pub end: String,
    pub all_day: bool,
    pub locked: bool,
    pub mandatory: bool,
    pub editable_fields: Vec<String>,
    pub user_intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl PlanningEvent {
    pub fn new(calendar_id: &str, event: &Event, block: &TaskBlock) -> Self {
        PlanningEvent {
            calendar_id: calendar_id.to_string(),
            uid: event.uid.clone(),
            summary: event.summary.clone(),
            description: task_block::strip(event.description_text()),
            location: event.location_text().to_string(),
            start: event.start.to_rfc3339(),
            end: event.end.to_rfc3339(),
            all_day: event.start.is_all_day(),
            locked: block.locked,
            mandatory: block.mandatory,
            editable_fields: block.editable_fields.clone(),
            user_intent: block.user_intent.clone().unwrap_or_default(),
            category: block.category.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningPayload {
    pub window: PayloadWindow,
    pub immutable_calendar_ids: Vec<String>,
    pub events: Vec<PlanningEvent>,
}

impl PlanningPayload {
    /// Events are sorted by start, then uid, so equal inputs give equal payloads.
    pub fn new(window: &Window, timezone: &str, mut immutable_calendar_ids: Vec<String>, mut events: Vec<PlanningEvent>) -> Self {
        immutable_calendar_ids.sort();
        immutable_calendar_ids.dedup();
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.uid.cmp(&b.uid)));
        PlanningPayload {
            window: PayloadWindow {
                start: window.start.to_rfc3339(),
                end: window.end.to_rfc3339(),
                timezone: timezone.to_string(),
            },
            immutable_calendar_ids,
            events,
        }
    }
}

/// Custom prompt when set and non-blank, else the built-in one.
pub fn system_prompt(custom: Option<&str>) -> String {
    custom
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string()
}

/// One change proposed by the planner. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProposedChange {
    /// Names of the event fields this change touches.
    pub fn touched_fields(&self) -> Vec<&'static str> {
        [
            ("start", self.start.is_some()),
            ("end", self.end.is_some()),
            ("summary", self.summary.is_some()),
            ("location", self.location.is_some()),
            ("description", self.description.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }

    pub fn drop_field(&mut self, field: &str) {
        match field {
            "start" => self.start = None,
            "end" => self.end = None,
            "summary" => self.summary = None,
            "location" => self.location = None,
            "description" => self.description = None,
            _ => {}
        }
    }
}

fn text_field(item: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    match item.get(key)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

const EXCERPT_CHARS: usize = 200;

/// A planner entry that could not be read as a change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedChange {
    pub index: usize,
    pub reason: &'static str,
    pub excerpt: String,
}

/// Changes read from a planner reply, plus the entries that were unusable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedChanges {
    pub accepted: Vec<ProposedChange>,
    pub rejected: Vec<RejectedChange>,
}

fn excerpt(item: &serde_json::Value) -> String {
    item.to_string().chars().take(EXCERPT_CHARS).collect()
}

/// Keep object entries with a `uid`; ignore unknown keys. Every other entry
/// is reported back as rejected.
pub fn normalize_changes(raw: &[serde_json::Value]) -> NormalizedChanges {
    let mut normalized = NormalizedChanges::default();
    for (index, item) in raw.iter().enumerate() {
        let reject = |reason| RejectedChange {
            index,
            reason,
            excerpt: excerpt(item),
        };
        let Some(fields) = item.as_object() else {
            normalized.rejected.push(reject("not_an_object"));
            continue;
        };
        let uid = text_field(fields, "uid").map(|u| u.trim().to_string()).unwrap_or_default();
        if uid.is_empty() {
            normalized.rejected.push(reject("missing_uid"));
            continue;
        }
        normalized.accepted.push(ProposedChange {
            calendar_id: text_field(fields, "calendar_id")
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            uid,
            start: text_field(fields, "start"),
            end: text_field(fields, "end"),
            summary: text_field(fields, "summary"),
            location: text_field(fields, "location"),
            description: text_field(fields, "description"),
            category: text_field(fields, "category")
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            reason: text_field(fields, "reason"),
        });
    }
    normalized
}

/// Pull the JSON object out of model output that may be fenced or prefixed.
pub fn extract_json(content: &str) -> InferenceResult<serde_json::Value> {
    let text = content.trim();
    let candidate = if text.starts_with('{') && text.ends_with('}') {
        text
    } else if let Some(fenced) = fenced_block(text) {
        fenced
    } else {
        match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if end > start => &text[start..=end],
            _ => {
                return Err(InferenceError::MalformedResponse(
                    "response does not contain a JSON object".into(),
                ));
            }
        }
    };
    let value: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;
    if !value.is_object() {
        return Err(InferenceError::MalformedResponse("response root must be an object".into()));
    }
    Ok(value)
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let close = after.find("```")?;
    let inner = after[..close].trim();
    (inner.starts_with('{') && inner.ends_with('}')).then_some(inner)
}

/// The `changes` array of a parsed response; missing or non-array means none.
pub fn changes_of(response: &serde_json::Value) -> Vec<serde_json::Value> {
    response
        .get("changes")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Drop blank and repeated ids, keeping first occurrence order.
pub fn dedupe_models(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
