//! In-memory calendar store with operation tracing and failure injection.
//!
//! Mimics the quirks stagecal has to survive: several resources sharing one
//! UID, conflicts on ambiguous writes, and per-operation failures.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::CalendarStore;
use crate::error::{StoreError, StoreResult};
use crate::event::{CalendarInfo, Event, EventRef};
use crate::window::Window;

/// Record of a mutating store operation, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    CreateCalendar { name: String },
    Upsert { calendar_id: String, uid: String },
    Delete { calendar_id: String, uid: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    ListCalendars,
    ListEvents,
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    kind: OpKind,
    calendar_id: Option<String>,
    uid: Option<String>,
    error: StoreError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct State {
    calendars: Vec<CalendarInfo>,
    events: HashMap<String, Vec<Event>>,
    operations: Vec<StoreOp>,
    failures: Vec<InjectedFailure>,
    next_token: u64,
}

impl State {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn take_failure(&mut self, kind: OpKind, calendar_id: Option<&str>, uid: Option<&str>) -> StoreResult<()> {
        let hit = self.failures.iter_mut().find(|f| {
            f.kind == kind
                && f.remaining > 0
                && f.calendar_id.as_deref().is_none_or(|c| Some(c) == calendar_id)
                && f.uid.as_deref().is_none_or(|u| Some(u) == uid)
        });
        match hit {
            Some(failure) => {
                failure.remaining -= 1;
                Err(failure.error.clone())
            }
            None => Ok(()),
        }
    }

    fn stamp(&mut self, calendar_id: &str, mut event: Event) -> Event {
        let token = self.token();
        event.etag = Some(format!("etag-{token}"));
        if event.href.is_none() {
            event.href = Some(format!("{}/{}-{}.ics", calendar_id.trim_end_matches('/'), event.uid, token));
        }
        event
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    async fn maybe_delay(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn add_calendar(&self, id: &str, name: &str) {
        let mut state = self.state();
        state.calendars.push(CalendarInfo {
            id: id.to_string(),
            name: name.to_string(),
            created: None,
        });
        state.events.entry(id.to_string()).or_default();
    }

    /// Store `event` as a new resource without any uniqueness check.
    /// Returns the stored copy.
    pub fn insert(&self, calendar_id: &str, event: Event) -> Event {
        let mut state = self.state();
        let mut event = event;
        event.href = None;
        let stored = state.stamp(calendar_id, event);
        state
            .events
            .entry(calendar_id.to_string())
            .or_default()
            .push(stored.clone());
        stored
    }

    /// Change an event behind stagecal's back (a user edit). Bumps the etag.
    pub fn edit(&self, calendar_id: &str, uid: &str, edit: impl FnOnce(&mut Event)) {
        let mut state = self.state();
        let token = state.token();
        if let Some(event) = state
            .events
            .get_mut(calendar_id)
            .and_then(|events| events.iter_mut().find(|e| e.uid == uid))
        {
            edit(event);
            event.etag = Some(format!("etag-{token}"));
        }
    }

    /// All resources of a calendar, in insertion order.
    pub fn events(&self, calendar_id: &str) -> Vec<Event> {
        self.state().events.get(calendar_id).cloned().unwrap_or_default()
    }

    pub fn find(&self, calendar_id: &str, uid: &str) -> Vec<Event> {
        self.events(calendar_id)
            .into_iter()
            .filter(|e| e.uid == uid)
            .collect()
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        self.state().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state().operations.clear();
    }

    /// Mutating operations that touched `calendar_id`.
    pub fn writes_to(&self, calendar_id: &str) -> usize {
        self.state()
            .operations
            .iter()
            .filter(|op| match op {
                StoreOp::Upsert { calendar_id: c, .. } | StoreOp::Delete { calendar_id: c, .. } => {
                    c == calendar_id
                }
                StoreOp::CreateCalendar { .. } => false,
            })
            .count()
    }

    fn inject(&self, kind: OpKind, calendar_id: Option<&str>, uid: Option<&str>, error: StoreError, times: usize) {
        self.state().failures.push(InjectedFailure {
            kind,
            calendar_id: calendar_id.map(str::to_string),
            uid: uid.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub fn fail_list_calendars(&self, error: StoreError) {
        self.inject(OpKind::ListCalendars, None, None, error, usize::MAX);
    }

    pub fn fail_list_events(&self, calendar_id: &str, error: StoreError) {
        self.inject(OpKind::ListEvents, Some(calendar_id), None, error, usize::MAX);
    }

    /// Fail the next `times` upserts of `uid` into `calendar_id`.
    pub fn fail_upsert(&self, calendar_id: &str, uid: &str, error: StoreError, times: usize) {
        self.inject(OpKind::Upsert, Some(calendar_id), Some(uid), error, times);
    }

    pub fn fail_delete(&self, calendar_id: &str, uid: &str, error: StoreError, times: usize) {
        self.inject(OpKind::Delete, Some(calendar_id), Some(uid), error, times);
    }
}

#[async_trait]
impl CalendarStore for MemoryStore {
    async fn list_calendars(&self) -> StoreResult<Vec<CalendarInfo>> {
        self.maybe_delay().await;
        let mut state = self.state();
        state.take_failure(OpKind::ListCalendars, None, None)?;
        Ok(state.calendars.clone())
    }

    async fn create_calendar(&self, name: &str) -> StoreResult<CalendarInfo> {
        self.maybe_delay().await;
        let mut state = self.state();
        let token = state.token();
        let info = CalendarInfo {
            id: format!("/calendars/created-{token}/"),
            name: name.to_string(),
            created: None,
        };
        state.calendars.push(info.clone());
        state.events.insert(info.id.clone(), Vec::new());
        state.operations.push(StoreOp::CreateCalendar {
            name: name.to_string(),
        });
        Ok(info)
    }

    async fn list_events(&self, calendar_id: &str, window: &Window) -> StoreResult<Vec<Event>> {
        self.maybe_delay().await;
        let mut state = self.state();
        state.take_failure(OpKind::ListEvents, Some(calendar_id), None)?;
        let events = state
            .events
            .get(calendar_id)
            .ok_or_else(|| StoreError::NotFound(format!("calendar {calendar_id}")))?;
        Ok(events.iter().filter(|e| window.overlaps(e)).cloned().collect())
    }

    async fn get_event(&self, calendar_id: &str, uid: &str) -> StoreResult<Option<Event>> {
        self.maybe_delay().await;
        let state = self.state();
        let events = state
            .events
            .get(calendar_id)
            .ok_or_else(|| StoreError::NotFound(format!("calendar {calendar_id}")))?;
        Ok(events.iter().find(|e| e.uid == uid).cloned())
    }

    async fn upsert_event(&self, calendar_id: &str, event: &Event) -> StoreResult<Event> {
        self.maybe_delay().await;
        let mut state = self.state();
        state.operations.push(StoreOp::Upsert {
            calendar_id: calendar_id.to_string(),
            uid: event.uid.clone(),
        });
        state.take_failure(OpKind::Upsert, Some(calendar_id), Some(&event.uid))?;

        let copies = state
            .events
            .get(calendar_id)
            .ok_or_else(|| StoreError::NotFound(format!("calendar {calendar_id}")))?
            .iter()
            .filter(|e| e.uid == event.uid)
            .count();
        if copies > 1 {
            return Err(StoreError::Conflict(format!(
                "{} resources share UID {}",
                copies, event.uid
            )));
        }

        let existing_href = state
            .events
            .get(calendar_id)
            .and_then(|events| events.iter().find(|e| e.uid == event.uid))
            .and_then(|e| e.href.clone());
        let mut incoming = event.clone();
        incoming.href = existing_href;
        let stored = state.stamp(calendar_id, incoming);

        let events = state.events.entry(calendar_id.to_string()).or_default();
        match events.iter_mut().find(|e| e.uid == stored.uid) {
            Some(slot) => *slot = stored.clone(),
            None => events.push(stored.clone()),
        }
        Ok(stored)
    }

    async fn delete_event(&self, calendar_id: &str, target: &EventRef) -> StoreResult<()> {
        self.maybe_delay().await;
        let mut state = self.state();
        state.operations.push(StoreOp::Delete {
            calendar_id: calendar_id.to_string(),
            uid: target.uid.clone(),
        });
        state.take_failure(OpKind::Delete, Some(calendar_id), Some(&target.uid))?;

        let events = state
            .events
            .get_mut(calendar_id)
            .ok_or_else(|| StoreError::NotFound(format!("calendar {calendar_id}")))?;
        let position = match &target.href {
            Some(href) => events.iter().position(|e| e.href.as_deref() == Some(href.as_str())),
            None => events.iter().position(|e| e.uid == target.uid),
        };
        match position {
            Some(index) => {
                events.remove(index);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("event {}", target.uid))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;
    use chrono::{TimeZone, Utc};

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_replaces_in_place_and_bumps_etag() {
        let store = MemoryStore::new();
        store.add_calendar("cal", "Home");

        let first = store.upsert_event("cal", &event("a", "Gym")).await.unwrap();
        let second = store.upsert_event("cal", &event("a", "Gym at 7")).await.unwrap();

        assert_eq!(first.href, second.href);
        assert_ne!(first.etag, second.etag);
        assert_eq!(store.find("cal", "a").len(), 1);
        assert_eq!(store.events("cal")[0].summary, "Gym at 7");
    }

    #[tokio::test]
    async fn duplicate_uids_conflict_until_one_is_deleted() {
        let store = MemoryStore::new();
        store.add_calendar("cal", "Home");
        let a = store.insert("cal", event("x", "One"));
        store.insert("cal", event("x", "Two"));

        let err = store.upsert_event("cal", &event("x", "Three")).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        store.delete_event("cal", &a.reference()).await.unwrap();
        store.upsert_event("cal", &event("x", "Three")).await.unwrap();
        assert_eq!(store.find("cal", "x")[0].summary, "Three");
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = MemoryStore::new();
        store.add_calendar("cal", "Home");
        store.fail_upsert("cal", "a", StoreError::Transport("reset".into()), 1);

        assert!(store.upsert_event("cal", &event("a", "Gym")).await.is_err());
        assert!(store.upsert_event("cal", &event("a", "Gym")).await.is_ok());
        assert_eq!(store.writes_to("cal"), 2);
    }

    #[tokio::test]
    async fn list_events_filters_by_window() {
        let store = MemoryStore::new();
        store.add_calendar("cal", "Home");
        store.insert("cal", event("in", "Inside"));
        let mut outside = event("out", "Outside");
        outside.start = crate::event::EventTime::DateTime(Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap());
        outside.end = crate::event::EventTime::DateTime(Utc.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap());
        store.insert("cal", outside);

        let listed = store.list_events("cal", &window()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].uid, "in");
    }
}
