//! Reconciliation engine for stagecal.
//!
//! Keeps a user-editable calendar, a machine-maintained stage calendar and an
//! intake inbox consistent with a set of source calendars, and lets a planner
//! move only the events the user delegated to it.
//!
//! - [`engine::Reconciler`] sequences a run and exposes the operator actions
//! - [`store::CalendarStore`] and [`inference::InferenceService`] are the collaborator seams
//! - [`ledger::Ledger`] records every side effect of every run

pub mod apply;
pub mod config;
pub mod drift;
pub mod engine;
pub mod error;
pub mod event;
pub mod inference;
pub mod intake;
pub mod layers;
pub mod ledger;
pub mod mirror;
pub mod redact;
pub mod roles;
pub mod sanitize;
pub mod seed;
pub mod store;
pub mod task_block;
pub mod uid;
pub mod window;

pub use config::Config;
pub use engine::{Reconciler, RunSummary};
pub use error::{InferenceError, LedgerError, ReconcileError, ReconcileResult, StoreError};
pub use event::{CalendarInfo, Event, EventRef, EventTime};
pub use ledger::{AuditAction, AuditEvent, Ledger, RunCounts, RunStatus, SyncRun};
pub use window::{Trigger, TriggerKind, Window};
