use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

use crate::db::{
    helpers::{decode_camera_ids, encode_camera_ids, parse_hint, parse_source, to_i64, to_usize},
    models::{CameraSession, SessionFinalization},
    Database,
};

const SESSION_COLUMNS: &str = "session_id, start_ts, end_ts, duration_ms, camera_ids, \
     front_rear_hint, source, torch_overlap, device_model, api_level";

fn row_to_session(row: &Row) -> rusqlite::Result<CameraSession> {
    let camera_ids: Option<String> = row.get("camera_ids")?;
    let hint: Option<String> = row.get("front_rear_hint")?;
    let source: Option<String> = row.get("source")?;
    let device_model: Option<String> = row.get("device_model")?;

    Ok(CameraSession {
        session_id: row.get("session_id")?,
        start_timestamp: row.get("start_ts")?,
        end_timestamp: row.get("end_ts")?,
        duration_ms: row.get("duration_ms")?,
        camera_ids: decode_camera_ids(camera_ids.as_deref()),
        front_rear_hint: parse_hint(hint.as_deref()),
        source: parse_source(source.as_deref()),
        torch_overlap: row.get::<_, Option<bool>>("torch_overlap")?.unwrap_or(false),
        device_model: device_model.unwrap_or_else(|| "unknown".into()),
        api_level: row.get::<_, Option<i32>>("api_level")?.unwrap_or(0),
    })
}

fn select_sessions<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<CameraSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM camera_session {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let sessions = stmt
        .query_map(params, row_to_session)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read camera sessions")?;
    Ok(sessions)
}

pub(crate) fn load_all_desc(conn: &Connection) -> Result<Vec<CameraSession>> {
    select_sessions(conn, "ORDER BY start_ts DESC, session_id ASC", [])
}

impl Database {
    /// Insert-or-replace keyed on `session_id`.
    pub async fn upsert_session(&self, session: &CameraSession) -> Result<()> {
        let record = session.clone();
        self.mutate(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO camera_session (session_id, start_ts, end_ts, duration_ms, camera_ids, front_rear_hint, source, torch_overlap, device_model, api_level)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.session_id,
                    record.start_timestamp,
                    record.end_timestamp,
                    record.duration_ms,
                    encode_camera_ids(&record.camera_ids)?,
                    record.front_rear_hint.as_str(),
                    record.source.as_str(),
                    record.torch_overlap,
                    record.device_model,
                    record.api_level,
                ],
            )
            .with_context(|| "failed to upsert camera session")?;
            Ok(())
        })
        .await
    }

    /// Writes the end-of-session columns. Returns `false` when no row matched.
    pub async fn finalize_session(&self, update: &SessionFinalization) -> Result<bool> {
        let update = update.clone();
        self.mutate(move |conn| {
            let rows_affected = conn
                .execute(
                    "UPDATE camera_session
                     SET end_ts = ?1,
                         duration_ms = ?2,
                         torch_overlap = ?3,
                         camera_ids = ?4,
                         front_rear_hint = ?5
                     WHERE session_id = ?6",
                    params![
                        update.end_timestamp,
                        update.duration_ms,
                        update.torch_overlap,
                        encode_camera_ids(&update.camera_ids)?,
                        update.front_rear_hint.as_str(),
                        update.session_id,
                    ],
                )
                .with_context(|| "failed to finalize camera session")?;
            Ok(rows_affected > 0)
        })
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.mutate(move |conn| {
            let rows_affected = conn
                .execute(
                    "DELETE FROM camera_session WHERE session_id = ?1",
                    params![session_id],
                )
                .with_context(|| "failed to delete camera session")?;
            Ok(rows_affected > 0)
        })
        .await
    }

    /// Deletes every session that started strictly before `threshold`.
    pub async fn delete_sessions_older_than(&self, threshold: i64) -> Result<usize> {
        self.mutate(move |conn| {
            conn.execute(
                "DELETE FROM camera_session WHERE start_ts < ?1",
                params![threshold],
            )
            .with_context(|| "failed to delete expired camera sessions")
        })
        .await
    }

    /// Deletes the `count` sessions with the earliest start time.
    pub async fn delete_oldest_sessions(&self, count: usize) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }
        let limit = to_i64(count)?;
        self.mutate(move |conn| {
            conn.execute(
                "DELETE FROM camera_session WHERE session_id IN (
                     SELECT session_id FROM camera_session
                     ORDER BY start_ts ASC, session_id ASC
                     LIMIT ?1
                 )",
                params![limit],
            )
            .with_context(|| "failed to delete oldest camera sessions")
        })
        .await
    }

    pub async fn count_sessions(&self) -> Result<usize> {
        self.execute(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM camera_session", [], |row| row.get(0))?;
            to_usize(count, "count")
        })
        .await
    }

    /// Sessions starting at or after `start_timestamp`, oldest first.
    pub async fn sessions_from(&self, start_timestamp: i64) -> Result<Vec<CameraSession>> {
        self.execute(move |conn| {
            select_sessions(
                conn,
                "WHERE start_ts >= ?1 ORDER BY start_ts ASC, session_id ASC",
                params![start_timestamp],
            )
        })
        .await
    }

    /// Every session, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<CameraSession>> {
        self.execute(|conn| load_all_desc(conn)).await
    }

    pub async fn latest_session(&self) -> Result<Option<CameraSession>> {
        self.execute(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM camera_session ORDER BY start_ts DESC LIMIT 1"
            );
            let session = conn.query_row(&sql, [], row_to_session).optional()?;
            Ok(session)
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<CameraSession>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM camera_session WHERE session_id = ?1");
            let session = conn
                .query_row(&sql, params![session_id], row_to_session)
                .optional()?;
            Ok(session)
        })
        .await
    }

    /// Sessions with no end time, left behind by a crash or kill.
    pub async fn open_sessions(&self) -> Result<Vec<CameraSession>> {
        self.execute(|conn| {
            select_sessions(
                conn,
                "WHERE end_ts IS NULL ORDER BY start_ts ASC, session_id ASC",
                [],
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tempfile::TempDir;

    use super::*;
    use crate::db::models::{FrontRearHint, SessionSource};

    fn open_session(id: &str, start: i64, ids: &[&str]) -> CameraSession {
        CameraSession {
            session_id: id.to_string(),
            start_timestamp: start,
            end_timestamp: None,
            duration_ms: None,
            camera_ids: ids.iter().map(|id| id.to_string()).collect(),
            front_rear_hint: FrontRearHint::Unknown,
            source: SessionSource::Availability,
            torch_overlap: false,
            device_model: "pixel-test".into(),
            api_level: 34,
        }
    }

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("sessions.sqlite3")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_session_id() {
        let (_dir, db) = temp_db();
        let mut session = open_session("a", 1_000, &["0"]);
        db.upsert_session(&session).await.unwrap();
        session.torch_overlap = true;
        db.upsert_session(&session).await.unwrap();

        assert_eq!(db.count_sessions().await.unwrap(), 1);
        let stored = db.get_session("a").await.unwrap().unwrap();
        assert!(stored.torch_overlap);
        assert!(stored.is_open());
    }

    #[tokio::test]
    async fn finalize_leaves_identity_columns_alone() {
        let (_dir, db) = temp_db();
        let session = open_session("a", 1_000, &["0"]);
        db.upsert_session(&session).await.unwrap();

        let update = SessionFinalization {
            session_id: "a".into(),
            end_timestamp: 4_000,
            duration_ms: 3_000,
            torch_overlap: true,
            camera_ids: BTreeSet::from(["0".to_string(), "1".to_string()]),
            front_rear_hint: FrontRearHint::Front,
        };
        assert!(db.finalize_session(&update).await.unwrap());

        let stored = db.get_session("a").await.unwrap().unwrap();
        assert_eq!(stored.start_timestamp, 1_000);
        assert_eq!(stored.end_timestamp, Some(4_000));
        assert_eq!(stored.duration_ms, Some(3_000));
        assert_eq!(stored.front_rear_hint, FrontRearHint::Front);
        assert_eq!(stored.device_model, "pixel-test");
        assert_eq!(stored.api_level, 34);
        assert_eq!(stored.source, SessionSource::Availability);
        assert_eq!(stored.camera_ids.len(), 2);

        let missing = SessionFinalization {
            session_id: "nope".into(),
            ..update
        };
        assert!(!db.finalize_session(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn queries_order_by_start_time() {
        let (_dir, db) = temp_db();
        for (id, start) in [("b", 2_000), ("c", 3_000), ("a", 1_000)] {
            db.upsert_session(&open_session(id, start, &["0"])).await.unwrap();
        }

        let ascending: Vec<_> = db
            .sessions_from(2_000)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ascending, vec!["b", "c"]);

        let descending: Vec<_> = db
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(descending, vec!["c", "b", "a"]);

        assert_eq!(db.latest_session().await.unwrap().unwrap().session_id, "c");
        assert_eq!(db.open_sessions().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn deletes_by_age_and_by_oldest() {
        let (_dir, db) = temp_db();
        for start in 0..10 {
            db.upsert_session(&open_session(&format!("s{start}"), start * 100, &["0"]))
                .await
                .unwrap();
        }

        assert_eq!(db.delete_sessions_older_than(300).await.unwrap(), 3);
        assert_eq!(db.delete_oldest_sessions(2).await.unwrap(), 2);
        assert_eq!(db.delete_oldest_sessions(0).await.unwrap(), 0);
        assert_eq!(db.count_sessions().await.unwrap(), 5);
        assert!(db.get_session("s4").await.unwrap().is_none());
        assert!(db.get_session("s5").await.unwrap().is_some());

        assert!(db.delete_session("s5").await.unwrap());
        assert!(!db.delete_session("s5").await.unwrap());
    }

    #[tokio::test]
    async fn observers_see_every_mutation() {
        let (_dir, db) = temp_db();
        let mut rx = db.observe_all();
        assert!(rx.borrow_and_update().is_empty());

        db.upsert_session(&open_session("a", 1_000, &["0"])).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);

        db.upsert_session(&open_session("b", 2_000, &["1"])).await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot[0].session_id, "b");
        assert_eq!(snapshot[1].session_id, "a");

        db.delete_session("a").await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn garbage_enum_columns_decode_to_defaults() {
        let (_dir, db) = temp_db();
        db.upsert_session(&open_session("a", 1_000, &["0"])).await.unwrap();
        db.execute(|conn| {
            conn.execute(
                "UPDATE camera_session SET front_rear_hint = 'SIDEWAYS', source = 'RADAR', camera_ids = '0,1'",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let stored = db.get_session("a").await.unwrap().unwrap();
        assert_eq!(stored.front_rear_hint, FrontRearHint::Unknown);
        assert_eq!(stored.source, SessionSource::Availability);
        assert_eq!(stored.camera_ids.len(), 2);
    }

    #[tokio::test]
    async fn reopening_the_file_keeps_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.sqlite3");
        {
            let db = Database::new(path.clone()).unwrap();
            db.upsert_session(&open_session("a", 1_000, &["0"])).await.unwrap();
        }
        let db = Database::new(path).unwrap();
        assert_eq!(db.count_sessions().await.unwrap(), 1);
        assert_eq!(db.observe_all().borrow().len(), 1);
    }
}
