//! Planning window selection.

use std::fmt;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::event::Event;

/// Half-open time range `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ReconcileResult<Self> {
        if end <= start {
            return Err(ReconcileError::InvalidWindow(format!(
                "end {} is not after start {}",
                end.to_rfc3339_opts(SecondsFormat::Secs, true),
                start.to_rfc3339_opts(SecondsFormat::Secs, true)
            )));
        }
        Ok(Window { start, end })
    }

    /// Parse explicit bounds. Each bound is RFC3339 or YYYY-MM-DD; dates are
    /// local midnight in `tz`, and a date `to` includes that whole day.
    pub fn from_args(from: &str, to: &str, tz: Tz) -> ReconcileResult<Self> {
        let start = parse_bound(from, tz, false)?;
        let end = parse_bound(to, tz, true)?;
        Window::new(start, end)
    }

    /// The event overlaps this window.
    pub fn overlaps(&self, event: &Event) -> bool {
        event.end.to_utc() > self.start && event.start.to_utc() < self.end
    }

    /// Stable key for per-window state.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn parse_bound(s: &str, tz: Tz, is_end: bool) -> ReconcileResult<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        ReconcileError::InvalidWindow(format!(
            "Invalid date '{}'. Expected YYYY-MM-DD or RFC3339",
            s
        ))
    })?;
    let date = if is_end {
        date.checked_add_days(Days::new(1))
            .ok_or_else(|| ReconcileError::InvalidWindow(format!("Date out of range: {}", s)))?
    } else {
        date
    };
    Ok(local_midnight(date, tz))
}

/// Midnight of `date` in `tz`. Falls back to treating the wall time as UTC
/// when midnight does not exist locally.
fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
        .with_timezone(&Utc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    ManualWindow,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
            TriggerKind::ManualWindow => "manual_window",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerKind::Scheduled),
            "manual" => Some(TriggerKind::Manual),
            "manual_window" => Some(TriggerKind::ManualWindow),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run. A manual window is validated when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
    ManualWindow(Window),
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Scheduled => TriggerKind::Scheduled,
            Trigger::Manual => TriggerKind::Manual,
            Trigger::ManualWindow(_) => TriggerKind::ManualWindow,
        }
    }

    /// Manual triggers always re-plan; scheduled ones only on drift.
    pub fn forces_replan(&self) -> bool {
        !matches!(self, Trigger::Scheduled)
    }
}

/// `[local today 00:00, local today + window_days 00:00)` unless the trigger
/// carries its own window.
pub fn select_window(now: DateTime<Utc>, sync: &SyncConfig, tz: Tz, trigger: &Trigger) -> Window {
    if let Trigger::ManualWindow(window) = trigger {
        return *window;
    }

    let today = now.with_timezone(&tz).date_naive();
    let last = today
        .checked_add_days(Days::new(u64::from(sync.window_days())))
        .unwrap_or(NaiveDate::MAX);
    Window {
        start: local_midnight(today, tz),
        end: local_midnight(last, tz),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;

    fn sync(days: u32) -> SyncConfig {
        SyncConfig {
            window_days: days,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn default_window_starts_at_local_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        let tz: Tz = "Asia/Tokyo".parse().unwrap();

        let window = select_window(now, &sync(7), tz, &Trigger::Scheduled);
        // 08:30 on the 3rd in Tokyo
        assert_eq!(window.start, Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2026, 3, 9, 15, 0, 0).unwrap());
    }

    #[test]
    fn selection_is_reproducible() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 2, 17, 45, 0).unwrap();
        let a = select_window(now, &sync(3), Tz::UTC, &Trigger::Manual);
        let b = select_window(later, &sync(3), Tz::UTC, &Trigger::Manual);
        assert_eq!(a, b);
        assert_eq!(a.key(), "2026-03-02T00:00:00Z/2026-03-05T00:00:00Z");
    }

    #[test]
    fn manual_window_overrides_config() {
        let window = Window::from_args("2026-04-01", "2026-04-02", Tz::UTC).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let selected = select_window(now, &sync(7), Tz::UTC, &Trigger::ManualWindow(window));
        assert_eq!(selected.start, Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(selected.end, Utc.with_ymd_and_hms(2026, 4, 3, 0, 0, 0).unwrap());
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = Window::from_args("2026-04-02T10:00:00Z", "2026-04-02T09:00:00Z", Tz::UTC);
        assert!(matches!(err, Err(ReconcileError::InvalidWindow(_))));
        assert!(Window::from_args("tomorrow", "2026-04-02", Tz::UTC).is_err());
    }

    #[test]
    fn overlap_is_half_open() {
        let window = Window::from_args("2026-03-02T10:00:00Z", "2026-03-02T12:00:00Z", Tz::UTC).unwrap();
        // fixture runs 09:00-10:00
        assert!(!window.overlaps(&event("a", "Early")));

        let mut late = event("b", "Late");
        late.start = crate::event::fixtures::at(11);
        late.end = crate::event::fixtures::at(13);
        assert!(window.overlaps(&late));
    }
}
