//! CSV export of recorded sessions.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    db::{CameraSession, Database},
    monitor::MonitorEvent,
};

pub const CSV_HEADER: &str =
    "start_time,end_time,duration_ms,camera_ids,front_rear_hint,torch_overlap,device_model,api_level";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export file name must not be empty")]
    EmptyName,
    #[error("failed to write export {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn format_time(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_row(session: &CameraSession) -> String {
    let camera_ids = session
        .camera_ids
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");

    [
        format_time(session.start_timestamp),
        session.end_timestamp.map(format_time).unwrap_or_default(),
        session
            .duration_ms
            .map(|ms| ms.to_string())
            .unwrap_or_default(),
        camera_ids,
        session.front_rear_hint.as_str().to_ascii_lowercase(),
        session.torch_overlap.to_string(),
        session.device_model.clone(),
        session.api_level.to_string(),
    ]
    .iter()
    .map(|field| escape_field(field))
    .collect::<Vec<_>>()
    .join(",")
}

/// Header row plus one row per session, in the order given.
pub fn render_csv(sessions: &[CameraSession]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + 1 + sessions.len() * 96);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for session in sessions {
        out.push_str(&render_row(session));
        out.push('\n');
    }
    out
}

/// `yyyyMMdd_HHmmss` of the collection start, UTC.
pub fn default_file_name(start_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(start_ms)
        .map(|dt| dt.format(FILE_STAMP_FORMAT).to_string())
        .unwrap_or_else(|| start_ms.to_string())
}

pub fn export_sessions_csv(
    dir: &Path,
    sessions: &[CameraSession],
    name: &str,
) -> Result<PathBuf, ExportError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ExportError::EmptyName);
    }
    let file_name = if name.to_ascii_lowercase().ends_with(".csv") {
        name.to_string()
    } else {
        format!("{name}.csv")
    };
    let path = dir.join(file_name);

    fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::write(&path, render_csv(sessions)).map_err(|source| ExportError::Io {
        path: path.clone(),
        source,
    })?;

    info!("Exported {} session(s) to {}", sessions.len(), path.display());
    Ok(path)
}

/// Previously written exports, newest first.
pub fn list_exports(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !path.is_file() || !is_csv {
            continue;
        }
        let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok();
        files.push((modified, path));
    }
    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Exports every session that started at or after `start_ms` into a file
/// named after the start time. Outcomes are announced on `events`; `None`
/// means there was nothing to export.
pub async fn collect_since(
    db: &Database,
    events: &broadcast::Sender<MonitorEvent>,
    dir: &Path,
    start_ms: i64,
) -> Result<Option<PathBuf>> {
    let notify = |message: String| {
        let _ = events.send(MonitorEvent::Message(message));
    };

    let sessions = match db.sessions_from(start_ms).await {
        Ok(sessions) => sessions,
        Err(err) => {
            notify(format!("Could not read camera history: {err}"));
            return Err(err);
        }
    };
    if sessions.is_empty() {
        notify("No camera sessions were recorded.".to_string());
        return Ok(None);
    }

    match export_sessions_csv(dir, &sessions, &default_file_name(start_ms)) {
        Ok(path) => {
            notify(format!("CSV written to {}", path.display()));
            Ok(Some(path))
        }
        Err(err) => {
            warn!("CSV export failed: {err}");
            notify(format!("CSV export failed: {err}"));
            Err(err.into())
        }
    }
}
