//! Canonical UID namespacing.
//!
//! A namespaced UID is `prefix:raw` where `prefix` is either a layer tag
//! (`user`, `stage`, `intake`) or the 10-hex-digit digest of the calendar the
//! event was seeded from. Depth is the number of leading namespace segments.
//! After normalization a UID never has depth greater than 1.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::event::Event;

const DIGEST_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerTag {
    User,
    Stage,
    Intake,
}

impl LayerTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerTag::User => "user",
            LayerTag::Stage => "stage",
            LayerTag::Intake => "intake",
        }
    }

    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "user" => Some(LayerTag::User),
            "stage" => Some(LayerTag::Stage),
            "intake" => Some(LayerTag::Intake),
            _ => None,
        }
    }
}

/// The namespace a raw UID is placed into on its first layer transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Layer(LayerTag),
    Calendar(String),
}

impl Namespace {
    pub fn user() -> Self {
        Namespace::Layer(LayerTag::User)
    }

    pub fn for_calendar(calendar_id: &str) -> Self {
        Namespace::Calendar(calendar_digest(calendar_id))
    }

    pub fn prefix(&self) -> &str {
        match self {
            Namespace::Layer(tag) => tag.as_str(),
            Namespace::Calendar(digest) => digest,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Normalize a calendar id for comparison: trimmed, without trailing slashes.
pub fn normalize_calendar_id(calendar_id: &str) -> &str {
    calendar_id.trim().trim_end_matches('/')
}

/// First 10 hex digits of the SHA-256 of the normalized calendar id.
///
/// A digest always carries at least one hex letter: when the 10 digits are
/// all decimal, the first one is mapped onto `a..=f`. Raw UIDs that merely
/// start with a number (`2026030112:x`) are therefore never read as prefixed.
pub fn calendar_digest(calendar_id: &str) -> String {
    let digest = Sha256::digest(normalize_calendar_id(calendar_id).as_bytes());
    let hex = format!("{:x}", digest);
    let prefix = &hex[..DIGEST_LEN];
    if prefix.bytes().any(|b| b.is_ascii_lowercase()) {
        return prefix.to_string();
    }
    let first = prefix.as_bytes()[0];
    let letter = char::from(b'a' + (first - b'0') % 6);
    format!("{letter}{}", &prefix[1..])
}

fn is_digest(segment: &str) -> bool {
    segment.len() == DIGEST_LEN
        && segment.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && segment.bytes().any(|b| b.is_ascii_lowercase())
}

fn is_namespace_segment(segment: &str) -> bool {
    LayerTag::parse(segment).is_some() || is_digest(segment)
}

/// Number of namespace prefixes applied to `uid`.
pub fn depth(uid: &str) -> usize {
    let segments: Vec<&str> = uid.split(':').collect();
    segments[..segments.len() - 1]
        .iter()
        .take_while(|segment| is_namespace_segment(segment))
        .count()
}

/// The raw UID with every namespace prefix removed.
pub fn strip(uid: &str) -> String {
    let d = depth(uid);
    uid.split(':').skip(d).collect::<Vec<_>>().join(":")
}

/// Collapse a nested UID to depth 1, keeping the right-most prefix.
/// UIDs with depth 0 or 1 are returned unchanged.
pub fn collapse(uid: &str) -> String {
    let d = depth(uid);
    if d <= 1 {
        return uid.to_string();
    }
    uid.split(':').skip(d - 1).collect::<Vec<_>>().join(":")
}

/// Place `uid` into `namespace`. A UID that already carries a prefix is never
/// prefixed again; nested UIDs are collapsed instead.
pub fn canonicalize(uid: &str, namespace: &Namespace) -> String {
    match depth(uid) {
        0 => format!("{}:{}", namespace.prefix(), uid),
        _ => collapse(uid),
    }
}

/// A UID with depth >= 2 is a corruption artifact and must be cleaned on sight.
pub fn is_nested(uid: &str) -> bool {
    depth(uid) >= 2
}

/// What to do with an event observed at a nested UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedResolution {
    /// No depth-1 copy exists: write the nested content at the collapsed UID.
    Reseed,
    /// A depth-1 copy exists and wins: drop the nested copy.
    KeepExisting,
    /// A depth-1 copy exists but the nested copy is newer: overwrite it.
    ReplaceExisting,
}

/// Decide between a nested copy and the existing depth-1 copy.
/// Equal content keeps the existing copy; otherwise the later `updated` wins,
/// and a missing timestamp loses.
pub fn resolve_nested(nested: &Event, existing: Option<&Event>) -> NestedResolution {
    let Some(existing) = existing else {
        return NestedResolution::Reseed;
    };
    if nested.same_content(existing) {
        return NestedResolution::KeepExisting;
    }
    match (nested.updated, existing.updated) {
        (Some(n), Some(e)) if n > e => NestedResolution::ReplaceExisting,
        (Some(_), None) => NestedResolution::ReplaceExisting,
        _ => NestedResolution::KeepExisting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;
    use chrono::{TimeZone, Utc};

    #[test]
    fn raw_uids_have_depth_zero() {
        assert_eq!(depth("raw-42"), 0);
        assert_eq!(depth("urn:uuid:1234"), 0);
        assert_eq!(depth(""), 0);
    }

    #[test]
    fn numeric_leading_segment_is_not_a_namespace() {
        assert_eq!(depth("2026030112:x"), 0);
        assert_eq!(canonicalize("2026030112:x", &Namespace::user()), "user:2026030112:x");
        assert_eq!(depth("user:2026030112:x"), 1);
    }

    #[test]
    fn every_calendar_digest_is_recognized_as_a_namespace() {
        for id in (0..200).map(|n| format!("/cal/{n}/")) {
            let digest = calendar_digest(&id);
            assert!(is_digest(&digest), "{id} produced {digest}");
            assert_eq!(depth(&format!("{digest}:raw")), 1);
        }
    }

    #[test]
    fn intake_import_prefixes_once() {
        let uid = canonicalize("raw-42", &Namespace::user());
        assert_eq!(uid, "user:raw-42");
        assert_eq!(depth(&uid), 1);
        assert_eq!(strip(&uid), "raw-42");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let ns = Namespace::for_calendar("https://dav.example.com/cal/work/");
        for raw in ["raw-1", "urn:uuid:abc", "user:raw-2", "stage:user:raw-3"] {
            let once = canonicalize(raw, &ns);
            let twice = canonicalize(&once, &ns);
            assert_eq!(once, twice, "re-prefixed {raw}");
            assert!(depth(&twice) <= 1, "depth drift for {raw}");
        }
    }

    #[test]
    fn already_namespaced_uid_keeps_its_prefix() {
        let other = Namespace::for_calendar("cal-b");
        assert_eq!(canonicalize("user:raw-42", &other), "user:raw-42");
    }

    #[test]
    fn collapse_keeps_right_most_prefix() {
        let digest = calendar_digest("cal-a");
        let nested = format!("{digest}:user:raw-7");
        assert_eq!(depth(&nested), 2);
        assert!(is_nested(&nested));
        assert_eq!(collapse(&nested), "user:raw-7");
        assert_eq!(strip(&nested), "raw-7");
    }

    #[test]
    fn calendar_digest_ignores_trailing_slash() {
        assert_eq!(calendar_digest("/cal/home/"), calendar_digest("/cal/home"));
        assert_eq!(calendar_digest("cal-a").len(), 10);
    }

    #[test]
    fn nested_copy_reseeds_when_no_existing_copy() {
        let nested = event("stage:user:raw-1", "Gym");
        assert_eq!(resolve_nested(&nested, None), NestedResolution::Reseed);
    }

    #[test]
    fn equal_content_keeps_existing_copy() {
        let nested = event("stage:user:raw-1", "Gym");
        let existing = event("user:raw-1", "Gym");
        assert_eq!(
            resolve_nested(&nested, Some(&existing)),
            NestedResolution::KeepExisting
        );
    }

    #[test]
    fn latest_updated_wins_when_content_differs() {
        let mut nested = event("stage:user:raw-1", "Gym (moved)");
        let mut existing = event("user:raw-1", "Gym");
        nested.updated = Some(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        existing.updated = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(
            resolve_nested(&nested, Some(&existing)),
            NestedResolution::ReplaceExisting
        );

        nested.updated = None;
        assert_eq!(
            resolve_nested(&nested, Some(&existing)),
            NestedResolution::KeepExisting
        );
    }
}
