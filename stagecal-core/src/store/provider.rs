//! Provider subprocess store.
//!
//! Talks to an external `stagecal-provider-<name>` binary using JSON over
//! stdin/stdout. Any executable that speaks the protocol in
//! [`super::protocol`] can back a store. Providers own their credentials;
//! stagecal only forwards the `[store]` parameters.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;

use super::CalendarStore;
use super::protocol::{
    Command, CreateCalendar, DeleteEvent, GetEvent, ListCalendars, ListEvents, Params,
    ProviderCommand, Request, Response, UpsertEvent, store_error,
};
use crate::error::{ReconcileError, ReconcileResult, StoreError, StoreResult};
use crate::event::{CalendarInfo, Event, EventRef};
use crate::window::Window;

#[derive(Clone)]
pub struct ProviderStore {
    name: String,
    binary_path: PathBuf,
    params: Params,
}

impl std::fmt::Debug for ProviderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderStore")
            .field("name", &self.name)
            .field("binary_path", &self.binary_path)
            .finish_non_exhaustive()
    }
}

impl ProviderStore {
    /// Resolve the provider binary on `PATH`.
    pub fn new(name: &str, params: Params) -> ReconcileResult<Self> {
        let binary_name = format!("stagecal-provider-{}", name);
        let binary_path = which::which(&binary_name)
            .map_err(|_| ReconcileError::ProviderNotInstalled(binary_name.clone()))?;
        Ok(ProviderStore {
            name: name.to_string(),
            binary_path,
            params,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call a typed provider command and return the result.
    async fn call<C>(&self, cmd: C) -> StoreResult<C::Response>
    where
        C: ProviderCommand + Send,
        C::Response: Send,
    {
        self.call_raw(C::command(), cmd).await
    }

    async fn call_raw<P, R>(&self, command: Command, params: P) -> StoreResult<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| StoreError::Transport(format!("Failed to encode request: {e}")))?;
        let request = Request { command, params };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| StoreError::Transport(format!("Failed to encode request: {e}")))?;

        let mut child = TokioCommand::new(&self.binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StoreError::Transport(format!(
                    "Failed to spawn {}: {}",
                    self.binary_path.display(),
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StoreError::Transport("Provider stdin unavailable".into()))?;
        stdin
            .write_all(format!("{request_json}\n").as_bytes())
            .await
            .map_err(|e| StoreError::Transport(format!("Failed to write request: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StoreError::Transport(format!("Provider did not finish: {e}")))?;

        if !output.status.success() {
            return Err(StoreError::Transport(format!(
                "Provider exited with status: {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let response_str = String::from_utf8_lossy(&output.stdout);
        if response_str.trim().is_empty() {
            return Err(StoreError::Transport("Provider returned no response".into()));
        }

        let response: Response<R> = serde_json::from_str(&response_str)
            .map_err(|e| StoreError::Transport(format!("Failed to parse response: {}", e)))?;

        match response {
            Response::Success { data } => Ok(data),
            Response::Error { error, kind } => Err(store_error(kind.as_deref(), error)),
        }
    }
}

#[async_trait]
impl CalendarStore for ProviderStore {
    async fn list_calendars(&self) -> StoreResult<Vec<CalendarInfo>> {
        self.call(ListCalendars {
            params: self.params.clone(),
        })
        .await
    }

    async fn create_calendar(&self, name: &str) -> StoreResult<CalendarInfo> {
        self.call(CreateCalendar {
            params: self.params.clone(),
            name: name.to_string(),
        })
        .await
    }

    async fn list_events(&self, calendar_id: &str, window: &Window) -> StoreResult<Vec<Event>> {
        self.call(ListEvents {
            params: self.params.clone(),
            calendar_id: calendar_id.to_string(),
            from: window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            to: window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        })
        .await
    }

    async fn get_event(&self, calendar_id: &str, uid: &str) -> StoreResult<Option<Event>> {
        self.call(GetEvent {
            params: self.params.clone(),
            calendar_id: calendar_id.to_string(),
            uid: uid.to_string(),
        })
        .await
    }

    async fn upsert_event(&self, calendar_id: &str, event: &Event) -> StoreResult<Event> {
        self.call(UpsertEvent {
            params: self.params.clone(),
            calendar_id: calendar_id.to_string(),
            event: event.clone(),
        })
        .await
    }

    async fn delete_event(&self, calendar_id: &str, target: &EventRef) -> StoreResult<()> {
        self.call(DeleteEvent {
            params: self.params.clone(),
            calendar_id: calendar_id.to_string(),
            target: target.clone(),
        })
        .await
    }
}
