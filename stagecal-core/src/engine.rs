//! Run sequencer.
//!
//! One reconciliation run: discover and classify calendars, sanitize the
//! layers, import intake, seed sources, decide whether to re-plan, apply the
//! plan and mirror the result into stage. Only one run is active at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::apply::{self, ApplyReport, Targets};
use crate::config::Config;
use crate::drift::{self, Decision};
use crate::error::{ReconcileError, ReconcileResult};
use crate::event::Event;
use crate::inference::planner::{normalize_changes, system_prompt};
use crate::inference::{InferenceService, OpenAiClient, PlanRequest, PlanningEvent, PlanningPayload};
use crate::intake::import_intake;
use crate::layers::{CopyMap, Layer, SourceLayer, project_immutable};
use crate::ledger::{AuditAction, AuditEvent, AuditTrail, Ledger, RunCounts, RunStatus, SyncRun};
use crate::mirror::{self, MirrorReport};
use crate::redact::redact;
use crate::roles::{CalendarRole, CalendarRoles, ManagedKind, classify};
use crate::sanitize;
use crate::seed::{normalize_user_layer, seed_sources};
use crate::store::{CalendarStore, ProviderStore, Timed};
use crate::task_block;
use crate::uid;
use crate::window::{Trigger, TriggerKind, Window, select_window};

/// Outcome of one `trigger` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub trigger: TriggerKind,
    pub window: Window,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub message: String,
    /// The planner was called and answered.
    pub replanned: bool,
    pub mirror: MirrorReport,
    /// Intake events moved into the user-layer.
    pub moved: usize,
}

#[derive(Debug, Default)]
struct Progress {
    replanned: bool,
    applied: Option<ApplyReport>,
    mirror: MirrorReport,
    moved: usize,
    planning: &'static str,
}

impl Progress {
    fn message(&self) -> String {
        let planning = match &self.applied {
            Some(report) => format!(
                "applied {} change(s), skipped {}, {} conflict(s)",
                report.applied, report.skipped, report.conflicts
            ),
            None => self.planning.to_string(),
        };
        format!(
            "{planning}; stage: {} written, {} pruned",
            self.mirror.written, self.mirror.pruned
        )
    }
}

pub struct Reconciler {
    config: Config,
    tz: Tz,
    store: Timed<Arc<dyn CalendarStore>>,
    inference: Arc<dyn InferenceService>,
    ledger: Ledger,
    run_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        store: Arc<dyn CalendarStore>,
        inference: Arc<dyn InferenceService>,
        ledger: Ledger,
    ) -> ReconcileResult<Self> {
        let tz = config.sync.tz()?;
        let limit = Duration::from_secs(config.store.timeout_secs.max(1));
        Ok(Reconciler {
            config,
            tz,
            store: Timed::new(store, limit),
            inference,
            ledger,
            run_lock: Mutex::new(()),
        })
    }

    /// Wire the provider store, the OpenAI-compatible planner and the on-disk ledger.
    pub fn from_config(config: Config) -> ReconcileResult<Self> {
        let provider = config
            .store
            .provider
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ReconcileError::Config("store.provider is not set".into()))?;
        let store = ProviderStore::new(provider, config.store.params.clone())?;
        let inference = OpenAiClient::new(&config.inference);
        let ledger = Ledger::open(&config.ledger_path())?;
        Self::new(config, Arc::new(store), Arc::new(inference), ledger)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run one reconciliation. A second call while a run is active is
    /// rejected with [`ReconcileError::RunInProgress`].
    ///
    /// A failed precondition closes the run as `failed` and is reported in the
    /// summary, not as an `Err`.
    pub async fn trigger(&self, trigger: Trigger) -> ReconcileResult<RunSummary> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Err(ReconcileError::RunInProgress);
        };

        let now = Utc::now();
        let window = select_window(now, &self.config.sync, self.tz, &trigger);
        let run_id = self.ledger.open_run(trigger.kind(), &window)?;
        let trail = AuditTrail::for_run(&self.ledger, &run_id);
        tracing::info!(run_id = %run_id, trigger = %trigger.kind(), window = %window.key(), "Run started");

        let (status, message, progress) = match self.reconcile(&trail, &trigger, &window, now).await {
            Ok(progress) => {
                let failures = self.ledger.tally(&run_id)?.failures;
                let status = if failures > 0 {
                    RunStatus::Partial
                } else {
                    RunStatus::Success
                };
                (status, progress.message(), progress)
            }
            Err(e) => {
                let message = redact(&e.to_string());
                trail.record(AuditAction::RunError, "", "", json!({"error": message}))?;
                tracing::error!(run_id = %run_id, error = %message, "Run failed");
                (RunStatus::Failed, message, Progress::default())
            }
        };

        let counts = self.ledger.tally(&run_id)?;
        self.ledger.close_run(&run_id, status, counts, &message)?;
        tracing::info!(
            run_id = %run_id,
            status = status.as_str(),
            applied = counts.changes_applied,
            skipped = counts.skipped,
            failures = counts.failures,
            "Run finished"
        );

        Ok(RunSummary {
            run_id,
            trigger: trigger.kind(),
            window,
            status,
            counts,
            message,
            replanned: progress.replanned,
            mirror: progress.mirror,
            moved: progress.moved,
        })
    }

    async fn reconcile(
        &self,
        trail: &AuditTrail<'_>,
        trigger: &Trigger,
        window: &Window,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Progress> {
        let store: &dyn CalendarStore = &self.store;
        let mut progress = Progress::default();

        let roles = self.discover(trail).await?;
        let stage_calendar = managed(&roles, ManagedKind::Stage)?;
        let user_calendar = managed(&roles, ManagedKind::UserLayer)?;
        let intake_calendar = managed(&roles, ManagedKind::Intake)?;

        for (calendar, kind) in roles.duplicates() {
            trail.record(
                AuditAction::SkipManagedDuplicateCalendar,
                &calendar.id,
                "",
                json!({"name": calendar.name, "duplicate_of": kind}),
            )?;
            match store.list_events(&calendar.id, window).await {
                Ok(events) => {
                    sanitize::purge_duplicate_calendar(store, trail, &calendar.id, &events).await?;
                }
                Err(e) => {
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        &calendar.id,
                        "",
                        json!({"operation": "purge_duplicate_calendar_event", "error_kind": e.kind(), "error": redact(&e.to_string())}),
                    )?;
                }
            }
        }

        let stage_events = self.list(&stage_calendar, window).await?;
        let stage_events =
            sanitize::dedupe(store, trail, &stage_calendar, stage_events, AuditAction::DedupeStageUid).await?;
        let stage_events = sanitize::purge_nested_stage(store, trail, &stage_calendar, stage_events).await?;
        let mut stage = Layer::new(&stage_calendar, stage_events);

        let user_events = self.list(&user_calendar, window).await?;
        let user_events =
            sanitize::dedupe(store, trail, &user_calendar, user_events, AuditAction::DedupeUserUid).await?;
        let mut user = Layer::new(&user_calendar, user_events);
        sanitize::cleanup_nested_user(store, trail, &mut user).await?;

        let intake_events = self.list(&intake_calendar, window).await?;
        progress.moved = import_intake(store, trail, &intake_calendar, &intake_events, &mut user).await?;

        let mut sources = Vec::new();
        for (calendar, immutable) in roles
            .with_role(CalendarRole::SourceEditable)
            .map(|c| (c, false))
            .chain(roles.with_role(CalendarRole::SourceImmutable).map(|c| (c, true)))
        {
            sources.push(SourceLayer {
                calendar: calendar.clone(),
                immutable,
                events: self.list(&calendar.id, window).await?,
            });
        }

        seed_sources(store, trail, &self.config, &mut sources, &mut user, now).await?;
        normalize_user_layer(store, trail, &self.config, &mut user, now).await?;

        let projection = CopyMap::build(&sources, &user, &stage).projection(&self.config)?;
        let stage_now: Vec<Event> = stage.iter().cloned().collect();
        let previous = drift::stored_fingerprint(&self.ledger, window)?;
        let drift = drift::detect(&projection, &stage_now, window, trigger, previous.as_deref());
        tracing::debug!(changed = drift.changed_uids.len(), decision = ?drift.decision, "Drift detected");

        let projection = match drift.decision {
            Decision::NoReplan => {
                trail.record(
                    AuditAction::SkipAiSamePayload,
                    &user_calendar,
                    "",
                    json!({"fingerprint": drift.fingerprint}),
                )?;
                progress.planning = "payload unchanged";
                projection
            }
            Decision::Replan if !self.inference.is_configured() => {
                trail.record(AuditAction::SkipAiNotConfigured, &user_calendar, "", json!({}))?;
                progress.planning = "inference not configured";
                projection
            }
            Decision::Replan => {
                match self.plan(trail, &roles, &sources, &mut user, window, now).await? {
                    Some(report) => {
                        progress.replanned = true;
                        progress.applied = Some(report);
                        let projection = CopyMap::build(&sources, &user, &stage).projection(&self.config)?;
                        drift::commit(&self.ledger, window, &drift::fingerprint(&projection, window))?;
                        projection
                    }
                    None => {
                        progress.planning = "inference failed";
                        projection
                    }
                }
            }
        };

        progress.mirror = mirror::mirror(store, trail, &mut stage, &projection).await?;
        Ok(progress)
    }

    /// Classify calendars, creating any managed calendar that is missing.
    async fn discover(&self, trail: &AuditTrail<'_>) -> ReconcileResult<CalendarRoles> {
        let rules = &self.config.calendar_rules;
        let mut calendars = self.store.list_calendars().await.map_err(ReconcileError::Discovery)?;
        let roles = classify(&calendars, rules);

        for kind in roles.missing() {
            let name = kind.configured_name(rules).trim();
            if name.is_empty() {
                return Err(ReconcileError::MissingCalendar(kind.as_str().to_string()));
            }
            match self.store.create_calendar(name).await {
                Ok(created) => {
                    trail.record(
                        AuditAction::CreateManagedCalendar,
                        &created.id,
                        "",
                        json!({"kind": kind, "name": created.name}),
                    )?;
                    calendars.push(created);
                }
                Err(e) => {
                    trail.record(
                        AuditAction::StoreOperationFailed,
                        "",
                        "",
                        json!({"operation": "create_managed_calendar", "kind": kind, "error_kind": e.kind(), "error": redact(&e.to_string())}),
                    )?;
                    return Err(ReconcileError::MissingCalendar(kind.as_str().to_string()));
                }
            }
        }

        Ok(classify(&calendars, rules))
    }

    async fn list(&self, calendar_id: &str, window: &Window) -> ReconcileResult<Vec<Event>> {
        self.store
            .list_events(calendar_id, window)
            .await
            .map_err(ReconcileError::Discovery)
    }

    /// Ask the planner for changes and apply them. `None` when the call failed.
    async fn plan(
        &self,
        trail: &AuditTrail<'_>,
        roles: &CalendarRoles,
        sources: &[SourceLayer],
        user: &mut Layer,
        window: &Window,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Option<ApplyReport>> {
        let mut read_only = Vec::new();
        for source in sources.iter().filter(|s| s.immutable) {
            let defaults = self.config.defaults_for(&source.calendar.id, true);
            for event in source.events.iter().filter(|e| !uid::is_nested(&e.uid)) {
                let projected = project_immutable(&self.config, source, event)?;
                let block = task_block::parse(projected.description_text(), &defaults, now).into_block();
                read_only.push((source.calendar.id.clone(), projected, block));
            }
        }
        let user_defaults = self.config.defaults_for(&user.calendar_id, false);
        let mut targets = Targets::new(user, &user_defaults, read_only, now);

        let events = targets
            .iter()
            .map(|t| PlanningEvent::new(&t.calendar_id, &t.event, &t.block))
            .collect();
        let request = PlanRequest {
            model: self.config.inference.model.clone(),
            system_prompt: system_prompt(self.config.inference.system_prompt.as_deref()),
            payload: PlanningPayload::new(window, &self.config.sync.timezone, roles.immutable_ids(), events),
        };
        let request_bytes = serde_json::to_vec(&request.payload).map(|b| b.len()).unwrap_or_default();
        trail.record(
            AuditAction::AiRequest,
            &user.calendar_id,
            "",
            json!({
                "model": request.model,
                "events": request.payload.events.len(),
                "request_bytes": request_bytes,
            }),
        )?;

        let raw = match self.inference.propose(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                trail.record(
                    AuditAction::AiRequestFailed,
                    &user.calendar_id,
                    "",
                    json!({"error_kind": e.kind(), "error": redact(&e.to_string())}),
                )?;
                return Ok(None);
            }
        };

        let normalized = normalize_changes(&raw);
        trail.record(
            AuditAction::AiResponse,
            &user.calendar_id,
            "",
            json!({
                "raw_changes": raw.len(),
                "changes": normalized.accepted.len(),
                "preview": normalized.accepted.iter().take(10).collect::<Vec<_>>(),
            }),
        )?;
        for rejected in &normalized.rejected {
            trail.record(
                AuditAction::SkipMalformedChange,
                &user.calendar_id,
                "",
                json!({
                    "index": rejected.index,
                    "reason": rejected.reason,
                    "excerpt": redact(&rejected.excerpt),
                }),
            )?;
        }

        let mut report = apply::apply(&self.store, trail, &mut targets, user, normalized.accepted, now).await?;
        report.skipped += normalized.rejected.len();
        Ok(Some(report))
    }

    pub fn list_runs(&self, limit: usize) -> ReconcileResult<Vec<SyncRun>> {
        Ok(self.ledger.list_runs(limit)?)
    }

    pub fn get_run(&self, run_id: &str) -> ReconcileResult<Option<SyncRun>> {
        Ok(self.ledger.get_run(run_id)?)
    }

    pub fn list_audit(&self, run_id: Option<&str>, limit: usize) -> ReconcileResult<Vec<AuditEvent>> {
        Ok(self.ledger.list_audit(run_id, limit)?)
    }

    /// Undo one applied change. Waits for an active run to finish.
    pub async fn undo(&self, audit_id: i64) -> ReconcileResult<Event> {
        let _guard = self.run_lock.lock().await;
        let trail = AuditTrail::detached(&self.ledger);
        apply::undo(&self.store, &trail, audit_id, &self.config.task_defaults, Utc::now()).await
    }

    /// Set a fresh intent on a user-layer event. Waits for an active run to finish.
    pub async fn reinstruct(&self, uid: &str, text: &str) -> ReconcileResult<Event> {
        let _guard = self.run_lock.lock().await;
        let roles = self.calendar_roles().await?;
        let user_calendar = managed(&roles, ManagedKind::UserLayer)?;
        let defaults = self.config.defaults_for(&user_calendar, false);
        let trail = AuditTrail::detached(&self.ledger);
        apply::reinstruct(&self.store, &trail, &user_calendar, uid, text, &defaults, Utc::now()).await
    }

    pub async fn calendar_roles(&self) -> ReconcileResult<CalendarRoles> {
        let calendars = self.store.list_calendars().await.map_err(ReconcileError::Discovery)?;
        Ok(classify(&calendars, &self.config.calendar_rules))
    }

    pub async fn list_models(&self) -> ReconcileResult<Vec<String>> {
        if !self.inference.is_configured() {
            return Err(ReconcileError::Config("inference is not configured".into()));
        }
        Ok(self.inference.list_models().await?)
    }
}

fn managed(roles: &CalendarRoles, kind: ManagedKind) -> ReconcileResult<String> {
    roles
        .managed(kind)
        .map(|c| c.id.clone())
        .ok_or_else(|| ReconcileError::MissingCalendar(kind.as_str().to_string()))
}
