//! Intake importer: moves inbox events into the user-layer exactly once.
//!
//! Import is keyed by the namespaced UID, so an intake event whose delete
//! failed is recognized on the next run and only its intake copy is removed.

use serde_json::json;

use crate::error::{ReconcileResult, StoreError};
use crate::event::Event;
use crate::layers::Layer;
use crate::ledger::{AuditAction, AuditTrail};
use crate::redact::redact;
use crate::store::CalendarStore;
use crate::uid::{self, Namespace};

fn error_details(e: &StoreError) -> serde_json::Value {
    json!({"error_kind": e.kind(), "error": redact(&e.to_string())})
}

/// Delete the intake copy, auditing a failure. Returns whether it is gone.
async fn remove_from_intake(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    intake_calendar_id: &str,
    event: &Event,
) -> ReconcileResult<bool> {
    match store.delete_event(intake_calendar_id, &event.reference()).await {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(true),
        Err(e) => {
            trail.record(AuditAction::IntakeDeleteFailed, intake_calendar_id, &event.uid, error_details(&e))?;
            Ok(false)
        }
    }
}

/// Import raw intake events into `user` and clear them from intake.
/// Returns how many events were moved.
pub async fn import_intake(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    intake_calendar_id: &str,
    intake_events: &[Event],
    user: &mut Layer,
) -> ReconcileResult<usize> {
    let mut moved = 0;

    for event in intake_events {
        if uid::depth(&event.uid) >= 1 {
            let deleted = remove_from_intake(store, trail, intake_calendar_id, event).await?;
            if deleted {
                trail.record(
                    AuditAction::PurgeStrayIntakeUid,
                    intake_calendar_id,
                    &event.uid,
                    json!({"depth": uid::depth(&event.uid)}),
                )?;
            }
            continue;
        }

        let target_uid = uid::canonicalize(&event.uid, &Namespace::user());
        let imported = match user.holds(store, &target_uid).await {
            Ok(imported) => imported,
            Err(e) => {
                trail.record(AuditAction::IntakeImportFailed, intake_calendar_id, &event.uid, error_details(&e))?;
                continue;
            }
        };
        if imported {
            let deleted = remove_from_intake(store, trail, intake_calendar_id, event).await?;
            trail.record(
                AuditAction::IntakeEventAlreadyImported,
                intake_calendar_id,
                &event.uid,
                json!({"user_uid": target_uid, "deleted": deleted, "in_window": user.contains(&target_uid)}),
            )?;
            continue;
        }

        match store.upsert_event(&user.calendar_id, &event.rehomed(&target_uid)).await {
            Ok(stored) => {
                user.put(stored);
                let deleted = remove_from_intake(store, trail, intake_calendar_id, event).await?;
                trail.record(
                    AuditAction::ImportIntakeEvent,
                    &user.calendar_id,
                    &target_uid,
                    json!({"intake_uid": event.uid, "deleted": deleted}),
                )?;
                moved += 1;
            }
            Err(StoreError::Conflict(message)) => {
                trail.record(
                    AuditAction::SkipSeedUidConflict,
                    &user.calendar_id,
                    &target_uid,
                    json!({"intake_uid": event.uid, "error": redact(&message)}),
                )?;
            }
            Err(e) => {
                trail.record(AuditAction::IntakeImportFailed, intake_calendar_id, &event.uid, error_details(&e))?;
            }
        }
    }

    if moved > 0 {
        tracing::info!(moved, "Imported intake events");
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTime;
    use crate::event::fixtures::event;
    use crate::ledger::Ledger;
    use crate::store::MemoryStore;
    use crate::window::{TriggerKind, Window};
    use chrono::{TimeZone, Utc};

    const INTAKE: &str = "/cal/inbox/";
    const USER: &str = "/cal/plan/";

    fn setup() -> (MemoryStore, Ledger, String) {
        let store = MemoryStore::new();
        store.add_calendar(INTAKE, "Stagecal Inbox");
        store.add_calendar(USER, "Stagecal Plan");
        let ledger = Ledger::in_memory().unwrap();
        let window = Window::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let run_id = ledger.open_run(TriggerKind::Manual, &window).unwrap();
        (store, ledger, run_id)
    }

    fn last_action(ledger: &Ledger, run_id: &str) -> Option<AuditAction> {
        ledger.list_audit(Some(run_id), 1).unwrap().first().and_then(|e| e.action())
    }

    #[tokio::test]
    async fn raw_event_moves_to_user_layer() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(INTAKE, event("raw-42", "Dentist"));

        let mut user = Layer::new(USER, store.events(USER));
        let moved = import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();

        assert_eq!(moved, 1);
        assert_eq!(store.find(USER, "user:raw-42").len(), 1);
        assert!(store.events(INTAKE).is_empty());
        assert!(user.contains("user:raw-42"));
        assert_eq!(last_action(&ledger, &run_id), Some(AuditAction::ImportIntakeEvent));
    }

    #[tokio::test]
    async fn failed_delete_does_not_import_twice() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(INTAKE, event("raw-42", "Dentist"));
        store.fail_delete(INTAKE, "raw-42", StoreError::Transport("503".into()), 1);

        let mut user = Layer::new(USER, store.events(USER));
        import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();
        assert_eq!(store.events(INTAKE).len(), 1);

        let mut user = Layer::new(USER, store.events(USER));
        let moved = import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();

        assert_eq!(moved, 0);
        assert_eq!(store.find(USER, "user:raw-42").len(), 1);
        assert!(store.events(INTAKE).is_empty());
        assert_eq!(last_action(&ledger, &run_id), Some(AuditAction::IntakeEventAlreadyImported));
    }

    #[tokio::test]
    async fn user_copy_moved_out_of_the_window_is_not_reimported() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        let mut moved_copy = event("user:raw-42", "Dentist");
        moved_copy.start = EventTime::DateTime(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap());
        moved_copy.end = EventTime::DateTime(Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap());
        store.insert(USER, moved_copy.clone());
        store.insert(INTAKE, event("raw-42", "Dentist"));

        // the window only covers 2026-03-02, so the moved copy is not listed
        let mut user = Layer::new(USER, Vec::new());
        let moved = import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();

        assert_eq!(moved, 0);
        let copies = store.find(USER, "user:raw-42");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].start, moved_copy.start);
        assert!(store.events(INTAKE).is_empty());
        assert_eq!(last_action(&ledger, &run_id), Some(AuditAction::IntakeEventAlreadyImported));
    }

    #[tokio::test]
    async fn collision_leaves_user_copy_untouched() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(USER, event("user:raw-7", "Edited by hand"));
        store.insert(INTAKE, event("raw-7", "Original"));

        let mut user = Layer::new(USER, store.events(USER));
        import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();

        assert_eq!(store.find(USER, "user:raw-7")[0].summary, "Edited by hand");
        assert!(store.events(INTAKE).is_empty());
    }

    #[tokio::test]
    async fn namespaced_intake_events_are_purged_without_import() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(INTAKE, event("user:raw-9", "Stray"));

        let mut user = Layer::new(USER, store.events(USER));
        let moved = import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();

        assert_eq!(moved, 0);
        assert!(user.is_empty());
        assert!(store.events(INTAKE).is_empty());
        assert_eq!(last_action(&ledger, &run_id), Some(AuditAction::PurgeStrayIntakeUid));
    }

    #[tokio::test]
    async fn conflicting_write_is_skipped() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(INTAKE, event("raw-1", "Call"));
        store.fail_upsert(USER, "user:raw-1", StoreError::Conflict("duplicate".into()), 1);

        let mut user = Layer::new(USER, store.events(USER));
        let moved = import_intake(&store, &trail, INTAKE, &store.events(INTAKE), &mut user)
            .await
            .unwrap();

        assert_eq!(moved, 0);
        assert_eq!(store.events(INTAKE).len(), 1);
        assert_eq!(last_action(&ledger, &run_id), Some(AuditAction::SkipSeedUidConflict));
    }
}
