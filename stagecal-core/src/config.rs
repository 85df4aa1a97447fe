//! stagecal configuration.
//!
//! Loaded from ~/.config/stagecal/config.toml and overlaid with
//! `STAGECAL__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use config::{Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, ReconcileResult};
use crate::uid::normalize_calendar_id;

static DEFAULT_LEDGER_PATH: &str = "~/.local/share/stagecal/ledger.db";

pub const DEFAULT_EDITABLE_FIELDS: [&str; 5] = ["start", "end", "summary", "location", "description"];

const MIN_INTERVAL_SECS: u64 = 30;

fn default_ledger_path() -> PathBuf {
    PathBuf::from(DEFAULT_LEDGER_PATH)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub inference: InferenceConfig,
    pub sync: SyncConfig,
    pub calendar_rules: CalendarRules,
    pub task_defaults: TaskDefaults,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Provider name; resolved to a `stagecal-provider-<name>` binary.
    pub provider: Option<String>,
    pub timeout_secs: u64,
    /// Provider-specific parameters, passed through verbatim.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            provider: None,
            timeout_secs: 10,
            params: serde_json::Map::new(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: HashMap<&str, &str> = self
            .params
            .keys()
            .map(|k| {
                let shown = if is_secret_key(k) { "***" } else { "<set>" };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("StoreConfig")
            .field("provider", &self.provider)
            .field("timeout_secs", &self.timeout_secs)
            .field("params", &params)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub system_prompt: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            base_url: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 90,
            system_prompt: None,
        }
    }
}

impl InferenceConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.model.trim().is_empty()
    }
}

impl fmt::Debug for InferenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("system_prompt", &self.system_prompt.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub window_days: u32,
    pub interval_secs: u64,
    pub timezone: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            window_days: 7,
            interval_secs: 300,
            timezone: "UTC".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn tz(&self) -> ReconcileResult<Tz> {
        let name = self.timezone.trim();
        let name = if name.is_empty() { "UTC" } else { name };
        name.parse::<Tz>()
            .map_err(|_| ReconcileError::Config(format!("Unknown timezone '{}'", self.timezone)))
    }

    pub fn window_days(&self) -> u32 {
        self.window_days.max(1)
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.max(MIN_INTERVAL_SECS)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarMode {
    #[default]
    Editable,
    Immutable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarOverride {
    pub mode: CalendarMode,
    pub locked: Option<bool>,
    pub mandatory: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarRules {
    pub staging_calendar_id: String,
    pub staging_calendar_name: String,
    pub user_calendar_id: String,
    pub user_calendar_name: String,
    pub intake_calendar_id: String,
    pub intake_calendar_name: String,
    pub immutable_keywords: Vec<String>,
    pub immutable_calendar_ids: Vec<String>,
    pub per_calendar: HashMap<String, CalendarOverride>,
}

impl Default for CalendarRules {
    fn default() -> Self {
        CalendarRules {
            staging_calendar_id: String::new(),
            staging_calendar_name: "Stagecal Staging".to_string(),
            user_calendar_id: String::new(),
            user_calendar_name: "Stagecal Plan".to_string(),
            intake_calendar_id: String::new(),
            intake_calendar_name: "Stagecal Inbox".to_string(),
            immutable_keywords: vec!["work".to_string(), "fixed".to_string()],
            immutable_calendar_ids: Vec::new(),
            per_calendar: HashMap::new(),
        }
    }
}

impl CalendarRules {
    /// Override for `calendar_id`, matching ids without their trailing slash.
    pub fn override_for(&self, calendar_id: &str) -> Option<&CalendarOverride> {
        let wanted = normalize_calendar_id(calendar_id);
        self.per_calendar
            .iter()
            .find(|(key, _)| normalize_calendar_id(key) == wanted)
            .map(|(_, o)| o)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub locked: bool,
    pub mandatory: bool,
    pub editable_fields: Vec<String>,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        TaskDefaults {
            locked: false,
            mandatory: false,
            editable_fields: DEFAULT_EDITABLE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl TaskDefaults {
    /// Trimmed, non-empty editable fields; falls back to the built-in list.
    pub fn editable_fields(&self) -> Vec<String> {
        let cleaned: Vec<String> = self
            .editable_fields
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if cleaned.is_empty() {
            TaskDefaults::default().editable_fields
        } else {
            cleaned
        }
    }

    /// Defaults for events of a given calendar, applying per-calendar overrides.
    /// Immutable calendars default to locked and mandatory.
    pub fn for_calendar(&self, calendar_override: Option<&CalendarOverride>, immutable: bool) -> TaskDefaults {
        let (locked, mandatory) = if immutable {
            (true, true)
        } else {
            (self.locked, self.mandatory)
        };
        TaskDefaults {
            locked: calendar_override.and_then(|o| o.locked).unwrap_or(locked),
            mandatory: calendar_override.and_then(|o| o.mandatory).unwrap_or(mandatory),
            editable_fields: self.editable_fields(),
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["password", "secret", "token", "key"]
        .iter()
        .any(|needle| key.contains(needle))
}

impl Config {
    pub fn config_path() -> ReconcileResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ReconcileError::Config("Could not determine config directory".into()))?
            .join("stagecal");

        Ok(config_dir.join("config.toml"))
    }

    /// Load the config, creating a commented default file on first use.
    pub fn load() -> ReconcileResult<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> ReconcileResult<Self> {
        let config: Config = config::Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(Environment::with_prefix("STAGECAL").separator("__"))
            .build()
            .map_err(|e| ReconcileError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ReconcileError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        self.sync.tz()?;
        Ok(())
    }

    /// Task block defaults for events of `calendar_id`.
    pub fn defaults_for(&self, calendar_id: &str, immutable: bool) -> TaskDefaults {
        self.task_defaults
            .for_calendar(self.calendar_rules.override_for(calendar_id), immutable)
    }

    pub fn ledger_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.ledger_path.to_string_lossy()).into_owned();
        PathBuf::from(expanded)
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> ReconcileResult<()> {
        let contents = format!(
            "\
# stagecal configuration

# ledger_path = \"{}\"

[store]
# provider = \"caldav\"
# timeout_secs = 10

[inference]
# base_url = \"https://api.openai.com/v1\"
# api_key = \"\"
# model = \"gpt-4o-mini\"

[sync]
# window_days = 7
# interval_secs = 300
# timezone = \"UTC\"

[calendar_rules]
# staging_calendar_name = \"Stagecal Staging\"
# user_calendar_name = \"Stagecal Plan\"
# intake_calendar_name = \"Stagecal Inbox\"
# immutable_keywords = [\"work\", \"fixed\"]

[task_defaults]
# editable_fields = [\"start\", \"end\", \"summary\", \"location\", \"description\"]
",
            DEFAULT_LEDGER_PATH
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReconcileError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| ReconcileError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}
