pub mod config;
pub mod db;
pub mod device;
pub mod export;
pub mod monitor;
pub mod pruning;
pub mod sensing;
pub mod utils;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use config::MonitoringConfig;
use db::Database;
use device::DeviceInfo;
use monitor::MonitorController;

const APP_DIR_NAME: &str = "camwatch";

/// Where the monitor keeps its files. Anything left unset falls back to the
/// platform data directory.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub export_dir: PathBuf,
}

impl AppPaths {
    pub fn resolve(
        db_path: Option<PathBuf>,
        config_path: Option<PathBuf>,
        export_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let data_dir = || -> Result<PathBuf> {
            dirs::data_local_dir()
                .or_else(dirs::home_dir)
                .map(|dir| dir.join(APP_DIR_NAME))
                .context("Could not determine a data directory; pass --db explicitly")
        };

        let db_path = match db_path {
            Some(path) => path,
            None => data_dir()?.join("camwatch.sqlite3"),
        };
        let base = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path: config_path.unwrap_or_else(|| base.join("config.json")),
            export_dir: export_dir.unwrap_or_else(|| base.join("exports")),
            db_path,
        })
    }
}

pub(crate) struct AppState {
    pub(crate) db: Database,
    pub(crate) monitor: MonitorController,
    pub(crate) paths: AppPaths,
}

/// Wires storage, configuration and the monitor together.
pub struct App {
    state: AppState,
}

impl App {
    pub fn open(paths: AppPaths) -> Result<Self> {
        if let Some(parent) = paths.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let config = MonitoringConfig::load(&paths.config_path)?;
        config.validate()?;
        let database = Database::new(paths.db_path.clone())?;
        let monitor = MonitorController::new(database.clone(), config, DeviceInfo::current().clone());

        Ok(Self {
            state: AppState {
                db: database,
                monitor,
                paths,
            },
        })
    }

    pub fn database(&self) -> &Database {
        &self.state.db
    }

    pub fn monitor(&self) -> &MonitorController {
        &self.state.monitor
    }

    pub fn paths(&self) -> &AppPaths {
        &self.state.paths
    }

    /// Flushes and exports everything recorded since `start_ms`.
    pub async fn collect_since(&self, start_ms: i64) -> Result<Option<PathBuf>> {
        if self.state.monitor.is_running().await {
            self.state.monitor.flush(false).await?;
        }
        export::collect_since(
            &self.state.db,
            self.state.monitor.events(),
            &self.state.paths.export_dir,
            start_ms,
        )
        .await
    }
}

/// Reads `RUST_LOG`; `CAMWATCH_DEBUG=1` raises the default to debug.
pub fn init_logging() {
    let level = match std::env::var("CAMWATCH_DEBUG").as_deref() {
        Ok("1") | Ok("true") => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn paths_default_next_to_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("sessions.sqlite3");
        let paths = AppPaths::resolve(Some(db_path.clone()), None, None).unwrap();

        assert_eq!(paths.db_path, db_path);
        assert_eq!(paths.config_path, dir.path().join("data").join("config.json"));
        assert_eq!(paths.export_dir, dir.path().join("data").join("exports"));
    }

    #[tokio::test]
    async fn open_creates_storage_and_collects() {
        let dir = TempDir::new().unwrap();
        let paths =
            AppPaths::resolve(Some(dir.path().join("nested").join("db.sqlite3")), None, None)
                .unwrap();
        let app = App::open(paths).unwrap();

        assert!(app.paths().db_path.exists());
        assert!(app.collect_since(0).await.unwrap().is_none());
    }
}
