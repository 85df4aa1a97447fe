//! Task block normalization and source seeding into the user-layer.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::{Config, TaskDefaults};
use crate::error::{ReconcileResult, StoreError};
use crate::event::Event;
use crate::layers::{Layer, SourceLayer};
use crate::ledger::{AuditAction, AuditTrail, Ledger};
use crate::redact::redact;
use crate::store::CalendarStore;
use crate::task_block::{self, TaskBlock};
use crate::uid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub seeded: usize,
    pub normalized: usize,
    pub propagated: usize,
}

fn store_failure(operation: &str, e: &StoreError) -> serde_json::Value {
    json!({"operation": operation, "error_kind": e.kind(), "error": redact(&e.to_string())})
}

fn intent_key(user_uid: &str) -> String {
    format!("propagated_intent:{user_uid}")
}

/// Write `event` back with a normalized block if its description was not canonical.
/// Returns the stored copy, or the input when nothing had to change or the write failed.
async fn normalize_block(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    calendar_id: &str,
    event: &Event,
    defaults: &TaskDefaults,
    now: DateTime<Utc>,
    report: &mut SeedReport,
) -> ReconcileResult<(Event, TaskBlock)> {
    let decoded = task_block::parse(event.description_text(), defaults, now);
    let well_formed = decoded.is_well_formed();
    let ensured = task_block::ensure(event.description_text(), defaults, now)?;
    if !ensured.changed {
        return Ok((event.clone(), ensured.block));
    }

    let mut updated = event.clone();
    updated.description = Some(ensured.description);
    match store.upsert_event(calendar_id, &updated).await {
        Ok(stored) => {
            trail.record(
                AuditAction::NormalizeTaskBlock,
                calendar_id,
                &event.uid,
                json!({"was_well_formed": well_formed}),
            )?;
            report.normalized += 1;
            Ok((stored, ensured.block))
        }
        Err(e) => {
            trail.record(
                AuditAction::StoreOperationFailed,
                calendar_id,
                &event.uid,
                store_failure("normalize_task_block", &e),
            )?;
            Ok((event.clone(), ensured.block))
        }
    }
}

/// Normalize editable source blocks and seed each source event into the
/// user-layer at its canonical UID. Immutable sources are never written.
pub async fn seed_sources(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    config: &Config,
    sources: &mut [SourceLayer],
    user: &mut Layer,
    now: DateTime<Utc>,
) -> ReconcileResult<SeedReport> {
    let mut report = SeedReport::default();
    let ledger = trail.ledger();

    for layer in sources.iter_mut().filter(|l| !l.immutable) {
        let calendar_id = layer.calendar.id.clone();
        let defaults = config.defaults_for(&calendar_id, false);
        let namespace = layer.namespace();

        for slot in layer.events.iter_mut() {
            if uid::is_nested(&slot.uid) {
                trail.record(
                    AuditAction::SkipNestedSourceUid,
                    &calendar_id,
                    &slot.uid,
                    json!({"depth": uid::depth(&slot.uid)}),
                )?;
                continue;
            }

            let (source_event, block) =
                normalize_block(store, trail, &calendar_id, slot, &defaults, now, &mut report).await?;
            *slot = source_event;
            let user_uid = uid::canonicalize(&slot.uid, &namespace);
            if user_uid != slot.uid && user.contains(&slot.uid) && !user.contains(&user_uid) {
                migrate_legacy_uid(store, trail, user, &slot.uid, &user_uid, &calendar_id).await?;
            }

            if user.contains(&user_uid) {
                propagate_intent(store, trail, ledger, user, &user_uid, &calendar_id, &block, now, &mut report)
                    .await?;
                continue;
            }
            match user.holds(store, &user_uid).await {
                Ok(false) => {}
                Ok(true) => {
                    trail.record(
                        AuditAction::SkipSeedOutsideWindow,
                        &user.calendar_id,
                        &user_uid,
                        json!({"source_calendar_id": calendar_id, "source_uid": slot.uid}),
                    )?;
                    continue;
                }
                Err(e) => {
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        &user.calendar_id,
                        &user_uid,
                        store_failure("seed_user_event", &e),
                    )?;
                    continue;
                }
            }

            let seeded = slot.rehomed(&user_uid);
            match store.upsert_event(&user.calendar_id, &seeded).await {
                Ok(stored) => {
                    trail.record(
                        AuditAction::SeedUserEvent,
                        &user.calendar_id,
                        &user_uid,
                        json!({"source_calendar_id": calendar_id, "source_uid": slot.uid}),
                    )?;
                    if let Some(intent) = &block.user_intent {
                        ledger.set_meta(&intent_key(&user_uid), intent)?;
                    }
                    user.put(stored);
                    report.seeded += 1;
                }
                Err(StoreError::Conflict(message)) => {
                    trail.record(
                        AuditAction::SkipSeedUidConflict,
                        &user.calendar_id,
                        &user_uid,
                        json!({"source_calendar_id": calendar_id, "error": redact(&message)}),
                    )?;
                }
                Err(e) => {
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        &user.calendar_id,
                        &user_uid,
                        store_failure("seed_user_event", &e),
                    )?;
                }
            }
        }
    }
    Ok(report)
}

/// Move a user-layer copy still stored under the plain source UID to its
/// namespaced UID, so seeding does not create a twin next to it.
async fn migrate_legacy_uid(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    user: &mut Layer,
    legacy_uid: &str,
    user_uid: &str,
    source_calendar_id: &str,
) -> ReconcileResult<()> {
    let Some(legacy) = user.get(legacy_uid).cloned() else {
        return Ok(());
    };
    match user.holds(store, user_uid).await {
        Ok(false) => {}
        Ok(true) => {
            trail.record(
                AuditAction::SkipSeedUidConflict,
                &user.calendar_id,
                user_uid,
                json!({"legacy_uid": legacy_uid, "reason": "namespaced_copy_exists"}),
            )?;
            return Ok(());
        }
        Err(e) => {
            trail.record(
                AuditAction::StoreOperationFailed,
                &user.calendar_id,
                user_uid,
                store_failure("migrate_user_uid", &e),
            )?;
            return Ok(());
        }
    }

    match store.upsert_event(&user.calendar_id, &legacy.rehomed(user_uid)).await {
        Ok(stored) => {
            let deleted = match store.delete_event(&user.calendar_id, &legacy.reference()).await {
                Ok(()) | Err(StoreError::NotFound(_)) => true,
                Err(e) => {
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        &user.calendar_id,
                        legacy_uid,
                        store_failure("delete_legacy_user_uid", &e),
                    )?;
                    false
                }
            };
            trail.record(
                AuditAction::MigrateUserUid,
                &user.calendar_id,
                user_uid,
                json!({"legacy_uid": legacy_uid, "source_calendar_id": source_calendar_id, "deleted": deleted}),
            )?;
            user.remove(legacy_uid);
            user.put(stored);
        }
        Err(StoreError::Conflict(message)) => {
            trail.record(
                AuditAction::SkipSeedUidConflict,
                &user.calendar_id,
                user_uid,
                json!({"legacy_uid": legacy_uid, "reason": "duplicate_uid_on_migrate", "error": redact(&message)}),
            )?;
        }
        Err(e) => {
            trail.record(
                AuditAction::StoreOperationFailed,
                &user.calendar_id,
                user_uid,
                store_failure("migrate_user_uid", &e),
            )?;
        }
    }
    Ok(())
}

/// Copy a source intent onto the user-layer copy, once per distinct intent.
#[allow(clippy::too_many_arguments)]
async fn propagate_intent(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    ledger: &Ledger,
    user: &mut Layer,
    user_uid: &str,
    source_calendar_id: &str,
    source_block: &TaskBlock,
    now: DateTime<Utc>,
    report: &mut SeedReport,
) -> ReconcileResult<()> {
    let Some(intent) = source_block.user_intent.as_deref() else {
        return Ok(());
    };
    let key = intent_key(user_uid);
    if ledger.get_meta(&key)?.as_deref() == Some(intent) {
        return Ok(());
    }
    let Some(target) = user.get(user_uid).cloned() else {
        return Ok(());
    };

    let mut block = task_block::parse(target.description_text(), &source_defaults(source_block), now).into_block();
    block.user_intent = Some(intent.to_string());
    block.last_editor = "user".to_string();
    block.updated_at = Some(now);
    let mut updated = target.clone();
    updated.description = Some(task_block::upsert(target.description_text(), &block)?);

    match store.upsert_event(&user.calendar_id, &updated).await {
        Ok(stored) => {
            trail.record(
                AuditAction::PropagateUserIntentFromSource,
                &user.calendar_id,
                user_uid,
                json!({"source_calendar_id": source_calendar_id, "intent": intent}),
            )?;
            ledger.set_meta(&key, intent)?;
            user.put(stored);
            report.propagated += 1;
        }
        Err(e) => {
            trail.record(
                AuditAction::StoreOperationFailed,
                &user.calendar_id,
                user_uid,
                store_failure("propagate_user_intent_from_source", &e),
            )?;
        }
    }
    Ok(())
}

fn source_defaults(block: &TaskBlock) -> TaskDefaults {
    TaskDefaults {
        locked: block.locked,
        mandatory: block.mandatory,
        editable_fields: block.editable_fields.clone(),
    }
}

/// Normalize the block of every user-layer event.
pub async fn normalize_user_layer(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    config: &Config,
    user: &mut Layer,
    now: DateTime<Utc>,
) -> ReconcileResult<usize> {
    let defaults = config.defaults_for(&user.calendar_id, false);
    let calendar_id = user.calendar_id.clone();
    let mut report = SeedReport::default();
    let events: Vec<Event> = user.iter().cloned().collect();
    for event in events {
        let (stored, _) = normalize_block(store, trail, &calendar_id, &event, &defaults, now, &mut report).await?;
        user.put(stored);
    }
    Ok(report.normalized)
}
