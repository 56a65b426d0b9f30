//! Retention enforcement, run after every finalize or discard.

use anyhow::Result;
use log::info;

use crate::{config::MonitoringConfig, db::Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneReport {
    pub expired: usize,
    pub overflow: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.expired + self.overflow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    pub max_age_ms: i64,
    pub max_entries: usize,
}

impl PrunePolicy {
    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self {
            max_age_ms: config.prune_max_age_ms,
            max_entries: config.prune_max_entries,
        }
    }

    /// Age pass first, then the count ceiling. Neither pass looks at whether
    /// a row is open or closed.
    pub async fn run(&self, db: &Database, now_ms: i64) -> Result<PruneReport> {
        let threshold = now_ms.saturating_sub(self.max_age_ms);
        let expired = db.delete_sessions_older_than(threshold).await?;

        let remaining = db.count_sessions().await?;
        let overflow = if remaining > self.max_entries {
            db.delete_oldest_sessions(remaining - self.max_entries).await?
        } else {
            0
        };

        let report = PruneReport { expired, overflow };
        if report.total() > 0 {
            info!(
                "Pruned {} expired and {} overflow camera sessions",
                report.expired, report.overflow
            );
        }
        Ok(report)
    }
}
