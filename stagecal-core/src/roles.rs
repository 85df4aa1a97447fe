//! Calendar role classification.
//!
//! Every discovered calendar gets exactly one [`CalendarRole`]. The result only
//! depends on the set of calendars and the rules, never on discovery order.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::config::{CalendarMode, CalendarRules};
use crate::event::CalendarInfo;
use crate::uid::normalize_calendar_id;

/// The three calendars stagecal owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedKind {
    Stage,
    UserLayer,
    Intake,
}

impl ManagedKind {
    pub const ALL: [ManagedKind; 3] = [ManagedKind::Stage, ManagedKind::UserLayer, ManagedKind::Intake];

    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedKind::Stage => "stage",
            ManagedKind::UserLayer => "user",
            ManagedKind::Intake => "intake",
        }
    }

    fn configured<'a>(&self, rules: &'a CalendarRules) -> (&'a str, &'a str) {
        match self {
            ManagedKind::Stage => (
                rules.staging_calendar_id.as_str(),
                rules.staging_calendar_name.as_str(),
            ),
            ManagedKind::UserLayer => (rules.user_calendar_id.as_str(), rules.user_calendar_name.as_str()),
            ManagedKind::Intake => (
                rules.intake_calendar_id.as_str(),
                rules.intake_calendar_name.as_str(),
            ),
        }
    }

    /// Display name used when the calendar has to be created.
    pub fn configured_name<'a>(&self, rules: &'a CalendarRules) -> &'a str {
        self.configured(rules).1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarRole {
    SourceImmutable,
    SourceEditable,
    Stage,
    UserLayer,
    Intake,
    /// Shares a display name with a managed calendar. Purged, never read.
    ManagedDuplicate(ManagedKind),
}

impl CalendarRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarRole::SourceImmutable => "source-immutable",
            CalendarRole::SourceEditable => "source-editable",
            CalendarRole::Stage => "stage",
            CalendarRole::UserLayer => "user-layer",
            CalendarRole::Intake => "intake",
            CalendarRole::ManagedDuplicate(_) => "managed-duplicate",
        }
    }

    fn managed(kind: ManagedKind) -> Self {
        match kind {
            ManagedKind::Stage => CalendarRole::Stage,
            ManagedKind::UserLayer => CalendarRole::UserLayer,
            ManagedKind::Intake => CalendarRole::Intake,
        }
    }
}

impl fmt::Display for CalendarRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedCalendar {
    #[serde(flatten)]
    pub calendar: CalendarInfo,
    pub role: CalendarRole,
}

/// Classified calendars, sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalendarRoles {
    pub calendars: Vec<ClassifiedCalendar>,
}

impl CalendarRoles {
    pub fn managed(&self, kind: ManagedKind) -> Option<&CalendarInfo> {
        let role = CalendarRole::managed(kind);
        self.calendars
            .iter()
            .find(|c| c.role == role)
            .map(|c| &c.calendar)
    }

    pub fn stage(&self) -> Option<&CalendarInfo> {
        self.managed(ManagedKind::Stage)
    }

    pub fn user_layer(&self) -> Option<&CalendarInfo> {
        self.managed(ManagedKind::UserLayer)
    }

    pub fn intake(&self) -> Option<&CalendarInfo> {
        self.managed(ManagedKind::Intake)
    }

    /// Managed calendars that no discovered calendar resolved to.
    pub fn missing(&self) -> Vec<ManagedKind> {
        ManagedKind::ALL
            .into_iter()
            .filter(|kind| self.managed(*kind).is_none())
            .collect()
    }

    pub fn with_role(&self, role: CalendarRole) -> impl Iterator<Item = &CalendarInfo> {
        self.calendars
            .iter()
            .filter(move |c| c.role == role)
            .map(|c| &c.calendar)
    }

    pub fn duplicates(&self) -> impl Iterator<Item = (&CalendarInfo, ManagedKind)> {
        self.calendars.iter().filter_map(|c| match c.role {
            CalendarRole::ManagedDuplicate(kind) => Some((&c.calendar, kind)),
            _ => None,
        })
    }

    pub fn immutable_ids(&self) -> Vec<String> {
        self.with_role(CalendarRole::SourceImmutable)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn role_of(&self, calendar_id: &str) -> Option<CalendarRole> {
        let wanted = normalize_calendar_id(calendar_id);
        self.calendars
            .iter()
            .find(|c| normalize_calendar_id(&c.calendar.id) == wanted)
            .map(|c| c.role)
    }
}

/// Names compare with collapsed whitespace, case-folded.
pub fn normalize_calendar_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `name` is `managed`, or `managed` followed by a space or `(`.
fn is_managed_name(name: &str, managed: &str) -> bool {
    if managed.is_empty() {
        return false;
    }
    match name.strip_prefix(managed) {
        Some("") => true,
        Some(rest) => rest.starts_with(' ') || rest.starts_with('('),
        None => false,
    }
}

/// Earliest creation time first; calendars without one sort after, by id.
fn tie_break(a: &CalendarInfo, b: &CalendarInfo) -> Ordering {
    match (a.created, b.created) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}

fn resolve_managed<'a>(
    calendars: &'a [CalendarInfo],
    kind: ManagedKind,
    rules: &CalendarRules,
    taken: &[&str],
) -> Option<&'a CalendarInfo> {
    let (configured_id, configured_name) = kind.configured(rules);
    let available = || calendars.iter().filter(|c| !taken.contains(&c.id.as_str()));

    let configured_id = normalize_calendar_id(configured_id);
    if !configured_id.is_empty() {
        if let Some(found) = available().find(|c| normalize_calendar_id(&c.id) == configured_id) {
            return Some(found);
        }
    }

    let name = normalize_calendar_name(configured_name);
    if name.is_empty() {
        return None;
    }
    available()
        .filter(|c| normalize_calendar_name(&c.name) == name)
        .min_by(|a, b| tie_break(a, b))
}

/// Assign a role to each calendar.
///
/// Resolution order: configured id, then configured name for the managed
/// calendars; then per-calendar mode override, explicit immutable ids and
/// keyword match for sources. Anything else is source-editable.
pub fn classify(calendars: &[CalendarInfo], rules: &CalendarRules) -> CalendarRoles {
    let mut resolved: Vec<(ManagedKind, &CalendarInfo)> = Vec::new();
    for kind in ManagedKind::ALL {
        let taken: Vec<&str> = resolved.iter().map(|(_, c)| c.id.as_str()).collect();
        if let Some(calendar) = resolve_managed(calendars, kind, rules, &taken) {
            resolved.push((kind, calendar));
        }
    }

    let managed_names: Vec<(ManagedKind, String)> = ManagedKind::ALL
        .into_iter()
        .map(|kind| (kind, normalize_calendar_name(kind.configured_name(rules))))
        .collect();
    let keywords: Vec<String> = rules
        .immutable_keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    let immutable_ids: Vec<&str> = rules
        .immutable_calendar_ids
        .iter()
        .map(|id| normalize_calendar_id(id))
        .collect();

    let mut classified: Vec<ClassifiedCalendar> = calendars
        .iter()
        .map(|calendar| {
            let role = if let Some((kind, _)) = resolved.iter().find(|(_, c)| c.id == calendar.id) {
                CalendarRole::managed(*kind)
            } else {
                let name = normalize_calendar_name(&calendar.name);
                if let Some((kind, _)) = managed_names
                    .iter()
                    .find(|(_, managed)| is_managed_name(&name, managed))
                {
                    CalendarRole::ManagedDuplicate(*kind)
                } else {
                    source_role(calendar, &name, rules, &immutable_ids, &keywords)
                }
            };
            ClassifiedCalendar {
                calendar: calendar.clone(),
                role,
            }
        })
        .collect();

    classified.sort_by(|a, b| a.calendar.id.cmp(&b.calendar.id));
    CalendarRoles {
        calendars: classified,
    }
}

fn source_role(
    calendar: &CalendarInfo,
    normalized_name: &str,
    rules: &CalendarRules,
    immutable_ids: &[&str],
    keywords: &[String],
) -> CalendarRole {
    let id = normalize_calendar_id(&calendar.id);
    let overridden = rules.override_for(&calendar.id).map(|o| o.mode);

    match overridden {
        Some(CalendarMode::Immutable) => CalendarRole::SourceImmutable,
        Some(CalendarMode::Editable) => CalendarRole::SourceEditable,
        None if immutable_ids.contains(&id) => CalendarRole::SourceImmutable,
        None if keywords.iter().any(|k| normalized_name.contains(k.as_str())) => {
            CalendarRole::SourceImmutable
        }
        None => CalendarRole::SourceEditable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalendarOverride;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn cal(id: &str, name: &str) -> CalendarInfo {
        CalendarInfo {
            id: id.to_string(),
            name: name.to_string(),
            created: None,
        }
    }

    fn roles_by_id(roles: &CalendarRoles) -> Vec<(&str, CalendarRole)> {
        roles
            .calendars
            .iter()
            .map(|c| (c.calendar.id.as_str(), c.role))
            .collect()
    }

    #[test]
    fn classifies_each_calendar_once() {
        let calendars = vec![
            cal("/cal/work/", "Work"),
            cal("/cal/home/", "Home"),
            cal("/cal/plan/", "Stagecal Plan"),
            cal("/cal/stage/", "Stagecal Staging"),
            cal("/cal/inbox/", "stagecal   INBOX"),
        ];
        let roles = classify(&calendars, &CalendarRules::default());

        assert_eq!(
            roles_by_id(&roles),
            vec![
                ("/cal/home/", CalendarRole::SourceEditable),
                ("/cal/inbox/", CalendarRole::Intake),
                ("/cal/plan/", CalendarRole::UserLayer),
                ("/cal/stage/", CalendarRole::Stage),
                ("/cal/work/", CalendarRole::SourceImmutable),
            ]
        );
        assert!(roles.missing().is_empty());
        assert_eq!(roles.immutable_ids(), vec!["/cal/work/".to_string()]);
    }

    #[test]
    fn explicit_id_beats_name_and_marks_namesakes_as_duplicates() {
        let calendars = vec![
            cal("/cal/a/", "Stagecal Plan"),
            cal("/cal/b/", "Stagecal Plan"),
            cal("/cal/c/", "Stagecal Plan (1)"),
        ];
        let rules = CalendarRules {
            user_calendar_id: "/cal/b".into(),
            ..CalendarRules::default()
        };
        let roles = classify(&calendars, &rules);

        assert_eq!(roles.user_layer().map(|c| c.id.as_str()), Some("/cal/b/"));
        assert_eq!(
            roles.role_of("/cal/a/"),
            Some(CalendarRole::ManagedDuplicate(ManagedKind::UserLayer))
        );
        assert_eq!(
            roles.role_of("/cal/c"),
            Some(CalendarRole::ManagedDuplicate(ManagedKind::UserLayer))
        );
        assert_eq!(roles.missing(), vec![ManagedKind::Stage, ManagedKind::Intake]);
    }

    #[test]
    fn name_ties_go_to_earliest_created_then_lowest_id() {
        let mut older = cal("/cal/z/", "Stagecal Staging");
        older.created = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let newer_low_id = cal("/cal/a/", "Stagecal Staging");
        let roles = classify(&[newer_low_id.clone(), older.clone()], &CalendarRules::default());
        assert_eq!(roles.stage().map(|c| c.id.as_str()), Some("/cal/z/"));

        let roles = classify(&[cal("/cal/y/", "Stagecal Staging"), newer_low_id], &CalendarRules::default());
        assert_eq!(roles.stage().map(|c| c.id.as_str()), Some("/cal/a/"));
    }

    #[test]
    fn result_does_not_depend_on_discovery_order() {
        let calendars = vec![
            cal("/cal/2/", "Stagecal Plan"),
            cal("/cal/1/", "Stagecal Plan"),
            cal("/cal/3/", "Fixed shifts"),
        ];
        let mut reversed = calendars.clone();
        reversed.reverse();
        let rules = CalendarRules::default();
        assert_eq!(classify(&calendars, &rules), classify(&reversed, &rules));
    }

    #[test]
    fn editable_override_beats_keyword() {
        let mut rules = CalendarRules::default();
        rules.per_calendar.insert(
            "/cal/work".into(),
            CalendarOverride {
                mode: CalendarMode::Editable,
                ..CalendarOverride::default()
            },
        );
        rules.immutable_calendar_ids.push("/cal/gym/".into());
        let roles = classify(&[cal("/cal/work/", "Work"), cal("/cal/gym/", "Gym")], &rules);
        assert_eq!(roles.role_of("/cal/work/"), Some(CalendarRole::SourceEditable));
        assert_eq!(roles.role_of("/cal/gym/"), Some(CalendarRole::SourceImmutable));
    }

    #[test]
    fn managed_name_prefix_requires_separator() {
        assert!(is_managed_name("stagecal plan", "stagecal plan"));
        assert!(is_managed_name("stagecal plan (2)", "stagecal plan"));
        assert!(is_managed_name("stagecal plan(2)", "stagecal plan"));
        assert!(!is_managed_name("stagecal planning", "stagecal plan"));
    }
}
