//! Plan applicator.
//!
//! Applies planner changes to user-layer events under the task block guards,
//! snapshotting every write so it can be undone. Operator actions (undo,
//! re-instruct) live here too because they edit the same blocks.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::TaskDefaults;
use crate::error::{ReconcileError, ReconcileResult, StoreError};
use crate::event::{Event, EventTime};
use crate::inference::ProposedChange;
use crate::layers::Layer;
use crate::ledger::{AuditAction, AuditTrail};
use crate::redact::redact;
use crate::store::CalendarStore;
use crate::task_block::{self, TaskBlock};
use crate::uid::{self, Namespace};

/// An event the planner may address.
#[derive(Debug, Clone)]
pub struct Target {
    pub calendar_id: String,
    pub event: Event,
    pub block: TaskBlock,
    /// Immutable source images are listed for the planner but never written.
    pub writable: bool,
}

/// Events addressable by a change, keyed by the UID shown to the planner.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    by_uid: BTreeMap<String, Target>,
}

impl Targets {
    pub fn new(
        user: &Layer,
        user_defaults: &TaskDefaults,
        read_only: impl IntoIterator<Item = (String, Event, TaskBlock)>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut by_uid = BTreeMap::new();
        for (calendar_id, event, block) in read_only {
            by_uid.insert(
                event.uid.clone(),
                Target {
                    calendar_id,
                    event,
                    block,
                    writable: false,
                },
            );
        }
        for event in user.iter() {
            let block = task_block::parse(event.description_text(), user_defaults, now).into_block();
            by_uid.insert(
                event.uid.clone(),
                Target {
                    calendar_id: user.calendar_id.clone(),
                    event: event.clone(),
                    block,
                    writable: true,
                },
            );
        }
        Targets { by_uid }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.by_uid.values()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }

    /// Exact UID, then `(calendar_id, uid)` canonicalized, then a unique raw-UID match.
    pub fn resolve(&self, change: &ProposedChange) -> Option<&Target> {
        if let Some(target) = self.by_uid.get(&change.uid) {
            return Some(target);
        }
        if let Some(calendar_id) = &change.calendar_id {
            let canonical = uid::canonicalize(&change.uid, &Namespace::for_calendar(calendar_id));
            if let Some(target) = self.by_uid.get(&canonical) {
                return Some(target);
            }
        }
        let raw = uid::strip(&change.uid);
        let mut matches = self.by_uid.values().filter(|t| uid::strip(&t.event.uid) == raw);
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    fn replace(&mut self, event: Event, block: TaskBlock) {
        if let Some(target) = self.by_uid.get_mut(&event.uid) {
            target.event = event;
            target.block = block;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
}

fn parse_time(value: &str, current: &EventTime) -> Option<EventTime> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(EventTime::DateTime(dt.with_timezone(&Utc)));
    }
    match current {
        EventTime::Date(_) => NaiveDate::parse_from_str(value, "%Y-%m-%d").ok().map(EventTime::Date),
        EventTime::DateTime(_) => None,
    }
}

/// The event content after `change`, without touching the task block.
struct Patched {
    event: Event,
    /// Free text of the description, block removed.
    text: String,
}

fn patch(current: &Event, change: &ProposedChange, start: Option<EventTime>, end: Option<EventTime>) -> Patched {
    let mut event = current.clone();
    if let Some(summary) = &change.summary {
        event.summary = summary.clone();
    }
    if let Some(location) = &change.location {
        event.location = Some(location.clone()).filter(|l| !l.is_empty());
    }
    if let Some(start) = start {
        event.start = start;
    }
    if let Some(end) = end {
        event.end = end;
    }
    let text = match &change.description {
        Some(description) => task_block::strip(description),
        None => task_block::strip(current.description_text()),
    };
    Patched { event, text }
}

/// Apply planner changes to the user-layer. Every change ends in exactly one
/// terminal audit record (applied, skipped, conflict or failure).
pub async fn apply(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    targets: &mut Targets,
    user: &mut Layer,
    changes: Vec<ProposedChange>,
    now: DateTime<Utc>,
) -> ReconcileResult<ApplyReport> {
    let mut report = ApplyReport::default();

    for mut change in changes {
        let Some(target) = targets.resolve(&change).cloned() else {
            trail.record(
                AuditAction::SkipUnknownUid,
                change.calendar_id.as_deref().unwrap_or_default(),
                &change.uid,
                json!({"change": change}),
            )?;
            report.skipped += 1;
            continue;
        };
        let calendar_id = target.calendar_id.as_str();
        let uid = target.event.uid.as_str();

        if target.block.locked || !target.writable {
            trail.record(
                AuditAction::AiChangeSkippedLocked,
                calendar_id,
                uid,
                json!({"immutable_source": !target.writable}),
            )?;
            report.skipped += 1;
            continue;
        }
        if !target.block.has_intent() {
            trail.record(AuditAction::AiChangeSkippedNoIntent, calendar_id, uid, json!({}))?;
            report.skipped += 1;
            continue;
        }

        for field in change.touched_fields() {
            if !target.block.allows_field(field) {
                change.drop_field(field);
                trail.record(AuditAction::AiChangeFieldDropped, calendar_id, uid, json!({"field": field}))?;
            }
        }

        let mut start = None;
        let mut end = None;
        for (field, value, current, slot) in [
            ("start", change.start.clone(), &target.event.start, &mut start),
            ("end", change.end.clone(), &target.event.end, &mut end),
        ] {
            let Some(value) = value else { continue };
            match parse_time(&value, current) {
                Some(time) => *slot = Some(time),
                None => {
                    trail.record(
                        AuditAction::AiChangeInvalidDatetime,
                        calendar_id,
                        uid,
                        json!({"field": field, "value": value}),
                    )?;
                }
            }
        }
        let new_start = start.clone().unwrap_or_else(|| target.event.start.clone());
        let new_end = end.clone().unwrap_or_else(|| target.event.end.clone());
        if new_end.to_utc() <= new_start.to_utc() && (start.is_some() || end.is_some()) {
            trail.record(
                AuditAction::AiChangeInvalidDatetime,
                calendar_id,
                uid,
                json!({"field": "end", "value": new_end.to_rfc3339(), "reason": "end_not_after_start"}),
            )?;
            start = None;
            end = None;
        }

        let patched = patch(&target.event, &change, start, end);
        if patched.event.same_content(&target.event)
            && patched.text == task_block::strip(target.event.description_text())
        {
            trail.record(AuditAction::AiChangeSkippedNoEffect, calendar_id, uid, json!({}))?;
            report.skipped += 1;
            continue;
        }

        let intent = target.block.user_intent.clone();
        let mut block = target.block.clone();
        block.user_intent = None;
        block.last_editor = "ai".to_string();
        block.updated_at = Some(now);
        block.category = Some(match change.category.clone() {
            Some(category) => category,
            None => task_block::infer_category(&format!("{} {}", patched.event.summary, patched.text)).to_string(),
        });

        let mut next = patched.event;
        next.description = Some(task_block::upsert(&patched.text, &block)?);

        match store.upsert_event(calendar_id, &next).await {
            Ok(stored) => {
                trail.record(
                    AuditAction::ApplyAiChange,
                    calendar_id,
                    uid,
                    json!({
                        "before_event": target.event,
                        "after_event": stored,
                        "after_etag": stored.etag,
                        "patch": change,
                        "intent": intent,
                        "reason": change.reason,
                    }),
                )?;
                tracing::info!(calendar_id, uid, "Applied planner change");
                targets.replace(stored.clone(), block);
                user.put(stored);
                report.applied += 1;
            }
            Err(StoreError::Conflict(message)) => {
                trail.record(
                    AuditAction::AiChangeConflict,
                    calendar_id,
                    uid,
                    json!({"error": redact(&message)}),
                )?;
                report.conflicts += 1;
            }
            Err(e) => {
                trail.record(
                    AuditAction::AiChangeWriteFailed,
                    calendar_id,
                    uid,
                    json!({"error_kind": e.kind(), "error": redact(&e.to_string())}),
                )?;
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Restore the snapshot held by an `apply_ai_change` record.
///
/// The restored event keeps its intent cleared: undoing a change does not
/// re-arm the instruction that caused it.
pub async fn undo(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    audit_id: i64,
    defaults: &TaskDefaults,
    now: DateTime<Utc>,
) -> ReconcileResult<Event> {
    let record = trail
        .ledger()
        .get_audit(audit_id)?
        .ok_or(ReconcileError::AuditNotFound(audit_id))?;
    let before = match record.details.get("before_event") {
        Some(value) if record.action() == Some(AuditAction::ApplyAiChange) && !value.is_null() => {
            serde_json::from_value::<Event>(value.clone())
                .map_err(|e| ReconcileError::Serialization(e.to_string()))?
        }
        _ => return Err(ReconcileError::NoSnapshot(audit_id)),
    };
    let after_etag = record.details.get("after_etag").and_then(|v| v.as_str());

    let current = store
        .get_event(&record.calendar_id, &record.uid)
        .await?
        .ok_or_else(|| ReconcileError::EventNotFound(record.uid.clone()))?;
    if after_etag.is_none() || current.etag.as_deref() != after_etag {
        return Err(ReconcileError::ChangeTokenMismatch {
            audit_id,
            uid: record.uid.clone(),
        });
    }

    let mut block = task_block::parse(before.description_text(), defaults, now).into_block();
    block.user_intent = None;
    block.last_editor = "user".to_string();
    block.updated_at = Some(now);
    let mut restored = before.rehomed(&current.uid);
    restored.href = current.href.clone();
    restored.description = Some(task_block::upsert(before.description_text(), &block)?);

    let stored = store.upsert_event(&record.calendar_id, &restored).await?;
    trail.record(
        AuditAction::UndoAiChange,
        &record.calendar_id,
        &record.uid,
        json!({"audit_id": audit_id, "restored_etag": stored.etag}),
    )?;
    tracing::info!(audit_id, uid = %record.uid, "Undid planner change");
    Ok(stored)
}

/// Give a user-layer event a fresh instruction. Blank text clears it.
pub async fn reinstruct(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    user_calendar_id: &str,
    uid: &str,
    text: &str,
    defaults: &TaskDefaults,
    now: DateTime<Utc>,
) -> ReconcileResult<Event> {
    let current = store
        .get_event(user_calendar_id, uid)
        .await?
        .ok_or_else(|| ReconcileError::EventNotFound(uid.to_string()))?;

    let mut block = task_block::parse(current.description_text(), defaults, now).into_block();
    let intent = text.trim();
    block.user_intent = Some(intent.to_string()).filter(|i| !i.is_empty());
    block.last_editor = "user".to_string();
    block.updated_at = Some(now);

    let mut updated = current.clone();
    updated.description = Some(task_block::upsert(current.description_text(), &block)?);
    let stored = store.upsert_event(user_calendar_id, &updated).await?;
    trail.record(
        AuditAction::ReinstructUserIntent,
        user_calendar_id,
        uid,
        json!({"intent": block.user_intent}),
    )?;
    Ok(stored)
}
