use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

pub const DEFAULT_OPEN_DEBOUNCE_MS: u64 = 350;
pub const DEFAULT_CLOSE_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_MIN_SESSION_MS: i64 = 1_200;
pub const DEFAULT_PRUNE_MAX_AGE_MS: i64 = 90 * 24 * 60 * 60 * 1_000;
pub const DEFAULT_PRUNE_MAX_ENTRIES: usize = 2_000;

/// Tunables for session detection and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// A camera must stay busy this long before a session opens.
    pub open_debounce_ms: u64,

    /// All cameras must stay free this long before a session closes.
    pub close_debounce_ms: u64,

    /// Unforced sessions shorter than this are discarded as noise.
    pub min_session_ms: i64,

    pub prune_max_age_ms: i64,
    pub prune_max_entries: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            open_debounce_ms: DEFAULT_OPEN_DEBOUNCE_MS,
            close_debounce_ms: DEFAULT_CLOSE_DEBOUNCE_MS,
            min_session_ms: DEFAULT_MIN_SESSION_MS,
            prune_max_age_ms: DEFAULT_PRUNE_MAX_AGE_MS,
            prune_max_entries: DEFAULT_PRUNE_MAX_ENTRIES,
        }
    }
}

impl MonitoringConfig {
    /// Reads a JSON config file. A missing file yields the defaults, and so
    /// does an unreadable one (with a warning).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(
                "Ignoring malformed config at {}: {err}; using defaults",
                path.display()
            );
            Self::default()
        });
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.open_debounce_ms == 0 {
            bail!("openDebounceMs must be greater than zero");
        }
        if self.close_debounce_ms == 0 {
            bail!("closeDebounceMs must be greater than zero");
        }
        if self.min_session_ms < 0 {
            bail!("minSessionMs must not be negative");
        }
        if self.prune_max_age_ms <= 0 {
            bail!("pruneMaxAgeMs must be greater than zero");
        }
        if self.prune_max_entries == 0 {
            bail!("pruneMaxEntries must be greater than zero");
        }
        Ok(())
    }
}
