//! Layer sanitation run before anything is read as truth.
//!
//! Cleans the artifacts an eventually-consistent store and older buggy runs
//! leave behind: several resources sharing one UID, nested UIDs, and stray
//! calendars carrying a managed calendar's name.

use std::collections::BTreeMap;

use serde_json::json;

use crate::error::{ReconcileResult, StoreError};
use crate::event::Event;
use crate::layers::Layer;
use crate::ledger::{AuditAction, AuditTrail};
use crate::redact::redact;
use crate::store::CalendarStore;
use crate::uid::{self, NestedResolution};

fn store_failure(operation: &str, e: &StoreError) -> serde_json::Value {
    json!({"operation": operation, "error_kind": e.kind(), "error": redact(&e.to_string())})
}

/// Newest `updated` first; copies without a timestamp lose, ties keep listing order.
fn pick_survivor(copies: &[Event]) -> usize {
    let mut best = 0;
    for (i, candidate) in copies.iter().enumerate().skip(1) {
        if candidate.updated > copies[best].updated {
            best = i;
        }
    }
    best
}

/// Keep one copy per UID, deleting the others by href.
pub async fn dedupe(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    calendar_id: &str,
    events: Vec<Event>,
    action: AuditAction,
) -> ReconcileResult<Vec<Event>> {
    let mut by_uid: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for event in events {
        by_uid.entry(event.uid.clone()).or_default().push(event);
    }

    let mut unique = Vec::with_capacity(by_uid.len());
    for (uid, mut copies) in by_uid {
        if copies.len() == 1 {
            unique.extend(copies);
            continue;
        }
        let keep = copies.swap_remove(pick_survivor(&copies));
        for extra in copies {
            match store.delete_event(calendar_id, &extra.reference()).await {
                Ok(()) => {
                    trail.record(
                        action,
                        calendar_id,
                        &uid,
                        json!({"kept_href": keep.href, "removed_href": extra.href}),
                    )?;
                }
                Err(e) => {
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        calendar_id,
                        &uid,
                        store_failure(action.as_str(), &e),
                    )?;
                }
            }
        }
        unique.push(keep);
    }
    Ok(unique)
}

/// Delete nested UIDs from stage. Stage is rebuilt from the projection, so
/// nothing is reseeded here.
pub async fn purge_nested_stage(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    calendar_id: &str,
    events: Vec<Event>,
) -> ReconcileResult<Vec<Event>> {
    let mut kept = Vec::with_capacity(events.len());
    for event in events {
        if !uid::is_nested(&event.uid) {
            kept.push(event);
            continue;
        }
        match store.delete_event(calendar_id, &event.reference()).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                trail.record(
                    AuditAction::PurgeNestedStageUid,
                    calendar_id,
                    &event.uid,
                    json!({"depth": uid::depth(&event.uid)}),
                )?;
            }
            Err(e) => {
                trail.record(
                    AuditAction::StoreOperationFailed,
                    calendar_id,
                    &event.uid,
                    store_failure("purge_nested_stage_uid", &e),
                )?;
            }
        }
    }
    Ok(kept)
}

/// Collapse nested user-layer UIDs to depth 1.
///
/// The nested copy is always deleted. Its content survives at the collapsed
/// UID when no depth-1 copy exists or when it is the newer of the two.
pub async fn cleanup_nested_user(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    user: &mut Layer,
) -> ReconcileResult<()> {
    let nested: Vec<Event> = user.iter().filter(|e| uid::is_nested(&e.uid)).cloned().collect();
    let calendar_id = user.calendar_id.clone();

    for event in nested {
        user.remove(&event.uid);
        let collapsed = uid::collapse(&event.uid);
        let resolution = uid::resolve_nested(&event, user.get(&collapsed));

        if matches!(resolution, NestedResolution::Reseed | NestedResolution::ReplaceExisting) {
            match store.upsert_event(&calendar_id, &event.rehomed(&collapsed)).await {
                Ok(stored) => user.put(stored),
                Err(e) => {
                    // keep the nested copy so its content is not lost
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        &calendar_id,
                        &event.uid,
                        store_failure("cleanup_nested_uid", &e),
                    )?;
                    continue;
                }
            }
        }

        let deleted = match store.delete_event(&calendar_id, &event.reference()).await {
            Ok(()) | Err(StoreError::NotFound(_)) => true,
            Err(e) => {
                trail.record(
                    AuditAction::StoreOperationFailed,
                    &calendar_id,
                    &event.uid,
                    store_failure("cleanup_nested_uid", &e),
                )?;
                false
            }
        };
        trail.record(
            AuditAction::CleanupNestedUid,
            &calendar_id,
            &event.uid,
            json!({
                "collapsed_uid": collapsed,
                "resolution": resolution_name(resolution),
                "deleted": deleted,
            }),
        )?;
    }
    Ok(())
}

fn resolution_name(resolution: NestedResolution) -> &'static str {
    match resolution {
        NestedResolution::Reseed => "reseed",
        NestedResolution::KeepExisting => "keep_existing",
        NestedResolution::ReplaceExisting => "replace_existing",
    }
}

/// Delete every in-window event of a managed-duplicate calendar.
pub async fn purge_duplicate_calendar(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    calendar_id: &str,
    events: &[Event],
) -> ReconcileResult<usize> {
    let mut purged = 0;
    for event in events {
        match store.delete_event(calendar_id, &event.reference()).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                trail.record(AuditAction::PurgeDuplicateCalendarEvent, calendar_id, &event.uid, json!({}))?;
                purged += 1;
            }
            Err(e) => {
                trail.record(
                    AuditAction::StoreOperationFailed,
                    calendar_id,
                    &event.uid,
                    store_failure("purge_duplicate_calendar_event", &e),
                )?;
            }
        }
    }
    Ok(purged)
}
