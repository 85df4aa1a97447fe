//! Provider-neutral event types.
//!
//! Stores convert their wire format into these types, and the reconciliation
//! engine works exclusively with them for identity, mirroring and planning.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A calendar event (provider-neutral)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uid: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: EventTime,
    pub end: EventTime,

    // Sync Infrastructure
    /// Last modification timestamp (LAST-MODIFIED)
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    /// Store-assigned change token (ETag)
    #[serde(default)]
    pub etag: Option<String>,
    /// Store-specific resource location, used for deletes
    #[serde(default)]
    pub href: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl EventTime {
    /// Instant used for ordering and window checks. All-day dates start at midnight UTC.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(dt) => *dt,
            EventTime::Date(d) => d.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    pub fn to_rfc3339(&self) -> String {
        match self {
            EventTime::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
            EventTime::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }
}

impl Event {
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    pub fn location_text(&self) -> &str {
        self.location.as_deref().unwrap_or("")
    }

    /// Compare only user-visible content, ignoring store metadata (etag, href, updated).
    pub fn same_content(&self, other: &Event) -> bool {
        self.summary == other.summary
            && self.description_text() == other.description_text()
            && self.location_text() == other.location_text()
            && self.start == other.start
            && self.end == other.end
    }

    /// Reference used to address this event for deletion.
    pub fn reference(&self) -> EventRef {
        EventRef {
            uid: self.uid.clone(),
            href: self.href.clone(),
        }
    }

    /// Copy of this event with a different UID and no store metadata.
    pub fn rehomed(&self, uid: &str) -> Event {
        Event {
            uid: uid.to_string(),
            href: None,
            etag: None,
            ..self.clone()
        }
    }
}

/// Address of a stored event: UID, optionally disambiguated by href when the
/// store holds more than one resource with the same UID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl EventRef {
    pub fn uid(uid: &str) -> Self {
        EventRef {
            uid: uid.to_string(),
            href: None,
        }
    }
}

/// A calendar as discovered from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub id: String,
    pub name: String,
    /// Creation time when the store reports it; used only to break ties.
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn at(hour: u32) -> EventTime {
        EventTime::DateTime(Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap())
    }

    pub fn event(uid: &str, summary: &str) -> Event {
        Event {
            uid: uid.to_string(),
            summary: summary.to_string(),
            description: None,
            location: None,
            start: at(9),
            end: at(10),
            updated: None,
            etag: None,
            href: None,
        }
    }
}
