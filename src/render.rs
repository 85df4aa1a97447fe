//! Terminal rendering for stagecal-core types.
//!
//! Extension traits that add colored output with owo_colors.

use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use stagecal_core::ledger::{AuditEvent, RunStatus, SyncRun};
use stagecal_core::roles::{CalendarRole, ClassifiedCalendar};
use stagecal_core::{RunCounts, RunSummary, Window};

pub trait Render {
    fn render(&self) -> String;
}

impl Render for RunStatus {
    fn render(&self) -> String {
        let label = self.as_str();
        match self {
            RunStatus::Success => label.green().to_string(),
            RunStatus::Partial => label.yellow().to_string(),
            RunStatus::Failed => label.red().to_string(),
            RunStatus::Open => label.cyan().to_string(),
        }
    }
}

impl Render for Window {
    fn render(&self) -> String {
        format!("{} → {}", timestamp(self.start), timestamp(self.end))
    }
}

impl Render for RunCounts {
    fn render(&self) -> String {
        let failures = if self.failures > 0 {
            format!("{} failed", self.failures).red().to_string()
        } else {
            "0 failed".to_string()
        };
        format!(
            "{} applied, {} skipped, {} conflicts, {}",
            self.changes_applied, self.skipped, self.conflicts, failures
        )
    }
}

impl Render for RunSummary {
    fn render(&self) -> String {
        let mut lines = vec![
            format!("{} {} {}", self.status.render(), self.trigger, self.run_id.dimmed()),
            format!("   window   {}", self.window.render()),
            format!("   counts   {}", self.counts.render()),
        ];
        if self.moved > 0 {
            lines.push(format!("   intake   {} imported", self.moved));
        }
        lines.push(format!("   {}", self.message.dimmed()));
        lines.join("\n")
    }
}

impl Render for SyncRun {
    fn render(&self) -> String {
        format!(
            "{}  {:<8} {:<13} {}  {}",
            timestamp(self.started_at).dimmed(),
            self.status.render(),
            self.trigger,
            self.counts.render(),
            self.run_id.dimmed()
        )
    }
}

impl Render for AuditEvent {
    fn render(&self) -> String {
        let action = match self.action() {
            Some(action) if action.is_failure() => self.action.red().to_string(),
            Some(action) if action.is_skip() => self.action.yellow().to_string(),
            Some(_) => self.action.green().to_string(),
            None => self.action.clone(),
        };
        let subject = if self.uid.is_empty() {
            self.calendar_id.clone()
        } else {
            format!("{} {}", self.calendar_id, self.uid)
        };
        format!(
            "{:>6} {} {} {}",
            self.id.to_string().dimmed(),
            timestamp(self.created_at).dimmed(),
            action,
            subject
        )
    }
}

impl Render for ClassifiedCalendar {
    fn render(&self) -> String {
        let role = self.role.as_str();
        let role = match self.role {
            CalendarRole::SourceImmutable => role.red().to_string(),
            CalendarRole::SourceEditable => role.green().to_string(),
            CalendarRole::ManagedDuplicate(_) => role.yellow().to_string(),
            _ => role.cyan().to_string(),
        };
        format!("{:<20} {} {}", role, self.calendar.name, self.calendar.id.dimmed())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
