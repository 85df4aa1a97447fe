//! Drift between the stage mirror and what it should hold.
//!
//! [`diff_stage`] compares the projection (user-layer events plus immutable
//! source images) with stage. [`detect`] turns that into a re-plan decision
//! using a fingerprint of the comparison set, persisted per window.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LedgerResult;
use crate::event::Event;
use crate::ledger::Ledger;
use crate::window::{Trigger, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffKind::Create => write!(f, "+"),
            DiffKind::Update => write!(f, "~"),
            DiffKind::Delete => write!(f, "-"),
        }
    }
}

/// One stage event that is missing, different or stale.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDiff {
    pub kind: DiffKind,
    /// Current stage copy.
    pub old: Option<Event>,
    /// Projected copy.
    pub new: Option<Event>,
}

impl fmt::Display for StageDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.uid())
    }
}

impl StageDiff {
    /// `None` when both sides are absent or carry the same content.
    pub fn get_diff(old: Option<&Event>, new: Option<&Event>) -> Option<StageDiff> {
        let kind = match (old, new) {
            (None, Some(_)) => DiffKind::Create,
            (Some(_), None) => DiffKind::Delete,
            (Some(o), Some(n)) if !o.same_content(n) => DiffKind::Update,
            _ => return None,
        };
        Some(StageDiff {
            kind,
            old: old.cloned(),
            new: new.cloned(),
        })
    }

    pub fn uid(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|e| e.uid.as_str())
            .unwrap_or_default()
    }
}

/// Differences between `projection` and `stage`, ordered by UID.
pub fn diff_stage(projection: &[Event], stage: &[Event]) -> Vec<StageDiff> {
    let mut pairs: BTreeMap<&str, (Option<&Event>, Option<&Event>)> = BTreeMap::new();
    for event in stage {
        pairs.entry(event.uid.as_str()).or_default().0 = Some(event);
    }
    for event in projection {
        pairs.entry(event.uid.as_str()).or_default().1 = Some(event);
    }
    pairs
        .into_values()
        .filter_map(|(old, new)| StageDiff::get_diff(old, new))
        .collect()
}

#[derive(Serialize)]
struct FingerprintEntry<'a> {
    uid: &'a str,
    summary: &'a str,
    description: &'a str,
    location: &'a str,
    start: String,
    end: String,
}

/// SHA-256 over the canonical JSON of the comparison set, sorted by UID, and the window.
pub fn fingerprint(projection: &[Event], window: &Window) -> String {
    let mut entries: Vec<FingerprintEntry<'_>> = projection
        .iter()
        .map(|e| FingerprintEntry {
            uid: &e.uid,
            summary: &e.summary,
            description: e.description_text(),
            location: e.location_text(),
            start: e.start.to_rfc3339(),
            end: e.end.to_rfc3339(),
        })
        .collect();
    entries.sort_by(|a, b| a.uid.cmp(b.uid));

    let canonical = serde_json::json!({
        "window": window.key(),
        "events": entries,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{:x}", digest)
}

fn meta_key(window: &Window) -> String {
    format!("fingerprint:{}", window.key())
}

pub fn stored_fingerprint(ledger: &Ledger, window: &Window) -> LedgerResult<Option<String>> {
    ledger.get_meta(&meta_key(window))
}

/// Persist the fingerprint for `window`. Only done once inference succeeded.
pub fn commit(ledger: &Ledger, window: &Window, fingerprint: &str) -> LedgerResult<()> {
    ledger.set_meta(&meta_key(window), fingerprint)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Replan,
    /// Scheduled run over an unchanged payload.
    NoReplan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub changed_uids: Vec<String>,
    pub fingerprint: String,
    pub decision: Decision,
}

/// Compare the projection with stage and decide whether to re-plan.
/// Manual triggers always re-plan.
pub fn detect(
    projection: &[Event],
    stage: &[Event],
    window: &Window,
    trigger: &Trigger,
    previous: Option<&str>,
) -> Drift {
    let changed_uids = diff_stage(projection, stage)
        .iter()
        .map(|d| d.uid().to_string())
        .collect();
    let fingerprint = fingerprint(projection, window);
    let decision = if !trigger.forces_replan() && previous == Some(fingerprint.as_str()) {
        Decision::NoReplan
    } else {
        Decision::Replan
    };
    Drift {
        changed_uids,
        fingerprint,
        decision,
    }
}
