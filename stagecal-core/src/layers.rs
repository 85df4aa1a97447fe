//! Per-run views of the calendar layers.
//!
//! Nothing here is persisted. Each run lists the calendars, builds these
//! views and throws them away, so a copy deleted externally simply disappears
//! from the next run's mapping.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::{ReconcileResult, StoreResult};
use crate::event::{CalendarInfo, Event};
use crate::store::CalendarStore;
use crate::task_block;
use crate::uid::{self, Namespace};

/// A managed calendar with at most one event per UID.
#[derive(Debug, Clone)]
pub struct Layer {
    pub calendar_id: String,
    pub events: BTreeMap<String, Event>,
}

impl Layer {
    pub fn new(calendar_id: &str, events: impl IntoIterator<Item = Event>) -> Self {
        Layer {
            calendar_id: calendar_id.to_string(),
            events: events.into_iter().map(|e| (e.uid.clone(), e)).collect(),
        }
    }

    pub fn get(&self, uid: &str) -> Option<&Event> {
        self.events.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.events.contains_key(uid)
    }

    /// Whether the calendar holds `uid` anywhere, not only inside the window.
    pub async fn holds(&self, store: &dyn CalendarStore, uid: &str) -> StoreResult<bool> {
        if self.contains(uid) {
            return Ok(true);
        }
        Ok(store.get_event(&self.calendar_id, uid).await?.is_some())
    }

    /// Replace (or add) the copy of `event.uid` with the stored `event`.
    pub fn put(&mut self, event: Event) {
        self.events.insert(event.uid.clone(), event);
    }

    pub fn remove(&mut self, uid: &str) -> Option<Event> {
        self.events.remove(uid)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }
}

/// Events of one source calendar.
#[derive(Debug, Clone)]
pub struct SourceLayer {
    pub calendar: CalendarInfo,
    pub immutable: bool,
    pub events: Vec<Event>,
}

impl SourceLayer {
    pub fn namespace(&self) -> Namespace {
        Namespace::for_calendar(&self.calendar.id)
    }

    /// UID of `event` once placed in the user-layer or stage.
    pub fn canonical_uid(&self, event: &Event) -> String {
        uid::canonicalize(&event.uid, &self.namespace())
    }
}

/// Read-only stage image of an immutable source event.
///
/// The task block is computed in memory from the calendar's defaults and is
/// stamped with the event's own timestamp, so the projection is stable from
/// run to run.
pub fn project_immutable(config: &Config, source: &SourceLayer, event: &Event) -> ReconcileResult<Event> {
    let defaults = config.defaults_for(&source.calendar.id, true);
    let stamp = event.updated.unwrap_or_else(|| event.start.to_utc());
    let ensured = task_block::ensure(event.description_text(), &defaults, stamp)?;
    let mut projected = event.rehomed(&source.canonical_uid(event));
    projected.description = Some(ensured.description);
    projected.updated = None;
    Ok(projected)
}

/// The physical copies of one logical event.
#[derive(Debug, Clone, Default)]
pub struct Copies<'a> {
    pub source: Option<(&'a SourceLayer, &'a Event)>,
    pub user: Option<&'a Event>,
    pub stage: Option<&'a Event>,
}

impl Copies<'_> {
    pub fn is_immutable_source(&self) -> bool {
        self.source.is_some_and(|(layer, _)| layer.immutable)
    }
}

/// Canonical UID to its copies, rebuilt every run.
#[derive(Debug, Default)]
pub struct CopyMap<'a> {
    entries: BTreeMap<String, Copies<'a>>,
}

impl<'a> CopyMap<'a> {
    /// Nested source UIDs are left out; they are cleaned up, not mirrored.
    pub fn build(sources: &'a [SourceLayer], user: &'a Layer, stage: &'a Layer) -> Self {
        let mut entries: BTreeMap<String, Copies<'a>> = BTreeMap::new();
        for layer in sources {
            for event in layer.events.iter().filter(|e| !uid::is_nested(&e.uid)) {
                entries.entry(layer.canonical_uid(event)).or_default().source = Some((layer, event));
            }
        }
        for event in user.iter() {
            entries.entry(event.uid.clone()).or_default().user = Some(event);
        }
        for event in stage.iter() {
            entries.entry(event.uid.clone()).or_default().stage = Some(event);
        }
        CopyMap { entries }
    }

    pub fn get(&self, canonical_uid: &str) -> Option<&Copies<'a>> {
        self.entries.get(canonical_uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Copies<'a>)> {
        self.entries.iter()
    }

    /// What stage should hold: every user-layer event as is, plus the
    /// read-only image of every immutable source event.
    pub fn projection(&self, config: &Config) -> ReconcileResult<Vec<Event>> {
        let mut projected = Vec::new();
        for copies in self.entries.values() {
            if let Some(user) = copies.user {
                projected.push(user.clone());
            } else if let Some((layer, event)) = copies.source.filter(|(layer, _)| layer.immutable) {
                projected.push(project_immutable(config, layer, event)?);
            }
        }
        Ok(projected)
    }
}
