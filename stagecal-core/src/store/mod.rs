//! The calendar store seam.
//!
//! The engine only talks to calendars through [`CalendarStore`]. Concrete
//! stores are a provider subprocess ([`ProviderStore`]) and an in-memory
//! store used by tests ([`MemoryStore`]).

pub mod memory;
pub mod protocol;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{StoreError, StoreResult};
use crate::event::{CalendarInfo, Event, EventRef};
use crate::window::Window;

pub use memory::{MemoryStore, StoreOp};
pub use provider::ProviderStore;

#[async_trait]
pub trait CalendarStore: Send + Sync {
    async fn list_calendars(&self) -> StoreResult<Vec<CalendarInfo>>;

    async fn create_calendar(&self, name: &str) -> StoreResult<CalendarInfo>;

    /// Events overlapping `window`. May contain several resources with the same UID.
    async fn list_events(&self, calendar_id: &str, window: &Window) -> StoreResult<Vec<Event>>;

    async fn get_event(&self, calendar_id: &str, uid: &str) -> StoreResult<Option<Event>>;

    /// Create or replace the event with `event.uid`. Returns the stored copy
    /// with its new change token. Fails with `Conflict` when the UID cannot be
    /// written uniquely.
    async fn upsert_event(&self, calendar_id: &str, event: &Event) -> StoreResult<Event>;

    async fn delete_event(&self, calendar_id: &str, target: &EventRef) -> StoreResult<()>;
}

#[async_trait]
impl<S: CalendarStore + ?Sized> CalendarStore for Arc<S> {
    async fn list_calendars(&self) -> StoreResult<Vec<CalendarInfo>> {
        (**self).list_calendars().await
    }

    async fn create_calendar(&self, name: &str) -> StoreResult<CalendarInfo> {
        (**self).create_calendar(name).await
    }

    async fn list_events(&self, calendar_id: &str, window: &Window) -> StoreResult<Vec<Event>> {
        (**self).list_events(calendar_id, window).await
    }

    async fn get_event(&self, calendar_id: &str, uid: &str) -> StoreResult<Option<Event>> {
        (**self).get_event(calendar_id, uid).await
    }

    async fn upsert_event(&self, calendar_id: &str, event: &Event) -> StoreResult<Event> {
        (**self).upsert_event(calendar_id, event).await
    }

    async fn delete_event(&self, calendar_id: &str, target: &EventRef) -> StoreResult<()> {
        (**self).delete_event(calendar_id, target).await
    }
}

/// Applies a per-call timeout to every operation of the wrapped store.
/// Expiry surfaces as [`StoreError::Timeout`].
pub struct Timed<S> {
    inner: S,
    limit: Duration,
}

impl<S: CalendarStore> Timed<S> {
    pub fn new(inner: S, limit: Duration) -> Self {
        Timed { inner, limit }
    }

    async fn guard<T>(&self, call: impl Future<Output = StoreResult<T>> + Send) -> StoreResult<T> {
        timeout(self.limit, call)
            .await
            .map_err(|_| StoreError::Timeout(self.limit.as_secs()))?
    }
}

#[async_trait]
impl<S: CalendarStore> CalendarStore for Timed<S> {
    async fn list_calendars(&self) -> StoreResult<Vec<CalendarInfo>> {
        self.guard(self.inner.list_calendars()).await
    }

    async fn create_calendar(&self, name: &str) -> StoreResult<CalendarInfo> {
        self.guard(self.inner.create_calendar(name)).await
    }

    async fn list_events(&self, calendar_id: &str, window: &Window) -> StoreResult<Vec<Event>> {
        self.guard(self.inner.list_events(calendar_id, window)).await
    }

    async fn get_event(&self, calendar_id: &str, uid: &str) -> StoreResult<Option<Event>> {
        self.guard(self.inner.get_event(calendar_id, uid)).await
    }

    async fn upsert_event(&self, calendar_id: &str, event: &Event) -> StoreResult<Event> {
        self.guard(self.inner.upsert_event(calendar_id, event)).await
    }

    async fn delete_event(&self, calendar_id: &str, target: &EventRef) -> StoreResult<()> {
        self.guard(self.inner.delete_event(calendar_id, target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let store = Arc::new(MemoryStore::new());
        store.add_calendar("cal", "Home");
        store.set_latency(Duration::from_secs(30));

        let timed = Timed::new(store.clone(), Duration::from_secs(5));
        let err = timed.upsert_event("cal", &event("a", "Gym")).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(5));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let store = Arc::new(MemoryStore::new());
        store.add_calendar("cal", "Home");
        let timed = Timed::new(store.clone(), Duration::from_secs(5));

        let saved = timed.upsert_event("cal", &event("a", "Gym")).await.unwrap();
        assert!(saved.etag.is_some());
        assert_eq!(timed.list_calendars().await.unwrap().len(), 1);
    }
}
