//! Provider protocol types.
//!
//! Defines the JSON protocol spoken between stagecal and provider binaries
//! over stdin/stdout. One request per process invocation.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::StoreError;
use crate::event::{CalendarInfo, Event, EventRef};

pub trait ProviderCommand: Serialize {
    type Response: DeserializeOwned;
    fn command() -> Command;
}

/// Commands that providers must implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    ListCalendars,
    CreateCalendar,
    ListEvents,
    GetEvent,
    UpsertEvent,
    DeleteEvent,
}

/// Request sent from stagecal to a provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response sent from a provider to stagecal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success {
        data: T,
    },
    Error {
        error: String,
        /// `not_found` or `conflict`; anything else is a transport failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

pub fn store_error(kind: Option<&str>, message: String) -> StoreError {
    match kind {
        Some("not_found") => StoreError::NotFound(message),
        Some("conflict") => StoreError::Conflict(message),
        _ => StoreError::Transport(message),
    }
}

/// Every command carries the provider parameters from `[store]`.
pub type Params = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ListCalendars {
    #[serde(flatten)]
    pub params: Params,
}

impl ProviderCommand for ListCalendars {
    type Response = Vec<CalendarInfo>;
    fn command() -> Command {
        Command::ListCalendars
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCalendar {
    #[serde(flatten)]
    pub params: Params,
    pub name: String,
}

impl ProviderCommand for CreateCalendar {
    type Response = CalendarInfo;
    fn command() -> Command {
        Command::CreateCalendar
    }
}

/// List events overlapping `[from, to)`, both RFC3339.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListEvents {
    #[serde(flatten)]
    pub params: Params,
    pub calendar_id: String,
    pub from: String,
    pub to: String,
}

impl ProviderCommand for ListEvents {
    type Response = Vec<Event>;
    fn command() -> Command {
        Command::ListEvents
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetEvent {
    #[serde(flatten)]
    pub params: Params,
    pub calendar_id: String,
    pub uid: String,
}

impl ProviderCommand for GetEvent {
    type Response = Option<Event>;
    fn command() -> Command {
        Command::GetEvent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertEvent {
    #[serde(flatten)]
    pub params: Params,
    pub calendar_id: String,
    pub event: Event,
}

impl ProviderCommand for UpsertEvent {
    type Response = Event;
    fn command() -> Command {
        Command::UpsertEvent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteEvent {
    #[serde(flatten)]
    pub params: Params,
    pub calendar_id: String,
    #[serde(flatten)]
    pub target: EventRef,
}

impl ProviderCommand for DeleteEvent {
    type Response = ();
    fn command() -> Command {
        Command::DeleteEvent
    }
}
