//! Stage mirror writer.
//!
//! Brings the stage calendar in line with the projection. Every item is
//! isolated: a failed write is audited and the batch carries on.

use serde::Serialize;
use serde_json::json;

use crate::drift::{DiffKind, StageDiff, diff_stage};
use crate::error::{ReconcileResult, StoreError};
use crate::event::{Event, EventRef};
use crate::layers::Layer;
use crate::ledger::{AuditAction, AuditTrail};
use crate::redact::redact;
use crate::store::CalendarStore;

const MAX_DUPLICATE_DELETES: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub written: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub pruned: usize,
}

enum WriteOutcome {
    Written(Event),
    Repaired(Event),
    GaveUp(StoreError),
    Failed(StoreError),
}

/// Upsert, and on a UID conflict delete every copy of the UID and retry once.
async fn write_with_repair(store: &dyn CalendarStore, calendar_id: &str, event: &Event) -> WriteOutcome {
    match store.upsert_event(calendar_id, event).await {
        Ok(stored) => WriteOutcome::Written(stored),
        Err(StoreError::Conflict(_)) => {
            // a bare-UID delete removes one resource per call; drain until NotFound
            for _ in 0..MAX_DUPLICATE_DELETES {
                match store.delete_event(calendar_id, &EventRef::uid(&event.uid)).await {
                    Ok(()) => continue,
                    Err(StoreError::NotFound(_)) => break,
                    Err(e) => return WriteOutcome::GaveUp(e),
                }
            }
            match store.upsert_event(calendar_id, event).await {
                Ok(stored) => WriteOutcome::Repaired(stored),
                Err(e) => WriteOutcome::GaveUp(e),
            }
        }
        Err(e) => WriteOutcome::Failed(e),
    }
}

/// Write missing or changed projected events to stage and delete stale ones.
///
/// `stage` must hold one copy per UID; it is updated to reflect what was
/// written.
pub async fn mirror(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    stage: &mut Layer,
    projection: &[Event],
) -> ReconcileResult<MirrorReport> {
    let current: Vec<Event> = stage.iter().cloned().collect();
    let diffs = diff_stage(projection, &current);
    let mut report = MirrorReport {
        unchanged: projection.len(),
        ..MirrorReport::default()
    };

    for diff in diffs {
        match diff.kind {
            DiffKind::Create | DiffKind::Update => {
                report.unchanged = report.unchanged.saturating_sub(1);
                write_one(store, trail, stage, &diff, &mut report).await?;
            }
            DiffKind::Delete => prune_one(store, trail, stage, &diff, &mut report).await?,
        }
    }

    tracing::debug!(
        calendar_id = %stage.calendar_id,
        written = report.written,
        unchanged = report.unchanged,
        skipped = report.skipped,
        pruned = report.pruned,
        "Stage mirrored"
    );
    Ok(report)
}

async fn write_one(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    stage: &mut Layer,
    diff: &StageDiff,
    report: &mut MirrorReport,
) -> ReconcileResult<()> {
    let Some(projected) = &diff.new else {
        return Ok(());
    };
    let calendar_id = stage.calendar_id.clone();
    let uid = projected.uid.as_str();
    let outgoing = projected.rehomed(uid);

    match write_with_repair(store, &calendar_id, &outgoing).await {
        WriteOutcome::Written(stored) => {
            trail.record(
                AuditAction::MirrorStageEvent,
                &calendar_id,
                uid,
                json!({"diff": diff.kind}),
            )?;
            stage.put(stored);
            report.written += 1;
        }
        WriteOutcome::Repaired(stored) => {
            trail.record(
                AuditAction::RepairStageDuplicateUid,
                &calendar_id,
                uid,
                json!({"diff": diff.kind}),
            )?;
            stage.put(stored);
            report.written += 1;
        }
        WriteOutcome::GaveUp(e) => {
            trail.record(
                AuditAction::SkipStageMirrorAfterDuplicate,
                &calendar_id,
                uid,
                json!({"error_kind": e.kind(), "error": redact(&e.to_string())}),
            )?;
            stage.remove(uid);
            report.skipped += 1;
        }
        WriteOutcome::Failed(e) => {
            trail.record(
                AuditAction::MirrorWriteFailed,
                &calendar_id,
                uid,
                json!({"error_kind": e.kind(), "error": redact(&e.to_string())}),
            )?;
            report.skipped += 1;
        }
    }
    Ok(())
}

async fn prune_one(
    store: &dyn CalendarStore,
    trail: &AuditTrail<'_>,
    stage: &mut Layer,
    diff: &StageDiff,
    report: &mut MirrorReport,
) -> ReconcileResult<()> {
    let Some(stale) = &diff.old else {
        return Ok(());
    };
    let calendar_id = stage.calendar_id.clone();
    match store.delete_event(&calendar_id, &stale.reference()).await {
        Ok(()) | Err(StoreError::NotFound(_)) => {
            trail.record(AuditAction::PruneStaleStageEvent, &calendar_id, &stale.uid, json!({}))?;
            stage.remove(&stale.uid);
            report.pruned += 1;
        }
        Err(e) => {
            trail.record(
                AuditAction::StoreOperationFailed,
                &calendar_id,
                &stale.uid,
                json!({"operation": "prune_stale_stage_event", "error_kind": e.kind(), "error": redact(&e.to_string())}),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::{at, event};
    use crate::ledger::Ledger;
    use crate::store::MemoryStore;
    use crate::window::TriggerKind;
    use chrono::{TimeZone, Utc};

    const STAGE: &str = "/cal/stage/";

    fn setup() -> (MemoryStore, Ledger, String) {
        let store = MemoryStore::new();
        store.add_calendar(STAGE, "Stagecal Staging");
        let ledger = Ledger::in_memory().unwrap();
        let window = crate::window::Window::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let run_id = ledger.open_run(TriggerKind::Manual, &window).unwrap();
        (store, ledger, run_id)
    }

    fn actions(ledger: &Ledger, run_id: &str) -> Vec<AuditAction> {
        let mut events = ledger.list_audit(Some(run_id), 100).unwrap();
        events.reverse();
        events.iter().filter_map(|e| e.action()).collect()
    }

    #[tokio::test]
    async fn mirroring_twice_writes_nothing_the_second_time() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        let projection = vec![event("user:a", "Gym"), event("user:b", "Read")];

        let mut stage = Layer::new(STAGE, store.events(STAGE));
        let first = mirror(&store, &trail, &mut stage, &projection).await.unwrap();
        assert_eq!(first.written, 2);

        store.clear_operations();
        let mut stage = Layer::new(STAGE, store.events(STAGE));
        let second = mirror(&store, &trail, &mut stage, &projection).await.unwrap();
        assert_eq!(second, MirrorReport { unchanged: 2, ..MirrorReport::default() });
        assert_eq!(store.writes_to(STAGE), 0);
    }

    #[tokio::test]
    async fn conflict_is_repaired_by_delete_then_retry() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(STAGE, event("user:x", "Old one"));
        store.insert(STAGE, event("user:x", "Old two"));

        let mut stage = Layer::new(STAGE, Vec::new());
        let report = mirror(&store, &trail, &mut stage, &[event("user:x", "New")]).await.unwrap();

        assert_eq!(report.written, 1);
        let copies = store.find(STAGE, "user:x");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].summary, "New");
        assert_eq!(actions(&ledger, &run_id), vec![AuditAction::RepairStageDuplicateUid]);
    }

    #[tokio::test]
    async fn failed_retry_skips_only_that_event() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.fail_upsert(STAGE, "user:x", StoreError::Conflict("duplicate".into()), 2);

        let mut stage = Layer::new(STAGE, Vec::new());
        let projection = vec![event("user:a", "Gym"), event("user:x", "Broken"), event("user:z", "Read")];
        let report = mirror(&store, &trail, &mut stage, &projection).await.unwrap();

        assert_eq!(report.written, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.find(STAGE, "user:a").len(), 1);
        assert_eq!(store.find(STAGE, "user:z").len(), 1);
        assert!(actions(&ledger, &run_id).contains(&AuditAction::SkipStageMirrorAfterDuplicate));
    }

    #[tokio::test]
    async fn transport_failure_is_audited_and_isolated() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.fail_upsert(STAGE, "user:a", StoreError::Timeout(10), 1);

        let mut stage = Layer::new(STAGE, Vec::new());
        let report = mirror(&store, &trail, &mut stage, &[event("user:a", "Gym"), event("user:b", "Read")])
            .await
            .unwrap();

        assert_eq!((report.written, report.skipped), (1, 1));
        assert_eq!(
            actions(&ledger, &run_id),
            vec![AuditAction::MirrorWriteFailed, AuditAction::MirrorStageEvent]
        );
    }

    #[tokio::test]
    async fn stale_and_changed_stage_events_are_reconciled() {
        let (store, ledger, run_id) = setup();
        let trail = AuditTrail::for_run(&ledger, &run_id);
        store.insert(STAGE, event("user:gone", "Cancelled"));
        store.insert(STAGE, event("user:a", "Gym"));

        let mut moved = event("user:a", "Gym");
        moved.start = at(18);
        moved.end = at(19);
        let mut stage = Layer::new(STAGE, store.events(STAGE));
        let report = mirror(&store, &trail, &mut stage, &[moved]).await.unwrap();

        assert_eq!((report.written, report.pruned), (1, 1));
        assert!(store.find(STAGE, "user:gone").is_empty());
        assert_eq!(store.find(STAGE, "user:a")[0].start, at(18));
        assert!(stage.get("user:gone").is_none());
    }
}
