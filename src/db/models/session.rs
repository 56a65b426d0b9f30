//! Camera session data models.
//!
//! A `CameraSession` is one inferred interval of camera hardware usage. It is
//! created when the open debounce fires, mutated in memory while open, and
//! written back exactly once when it is finalized.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrontRearHint {
    Front,
    Rear,
    #[default]
    Unknown,
}

impl FrontRearHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrontRearHint::Front => "FRONT",
            FrontRearHint::Rear => "REAR",
            FrontRearHint::Unknown => "UNKNOWN",
        }
    }

    /// Best-effort classification from camera id text.
    ///
    /// FRONT wins over REAR: an id such as `"10"` matches both the `"1"` and
    /// the `"0"` probe and is classified FRONT. Multi-digit or alphanumeric
    /// ids can be misclassified; the probes are kept as-is on purpose.
    pub fn from_camera_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lowered: Vec<String> = ids
            .into_iter()
            .map(|id| id.as_ref().to_lowercase())
            .collect();

        if lowered.is_empty() {
            return FrontRearHint::Unknown;
        }
        if lowered
            .iter()
            .any(|id| id.contains("front") || id.contains('1'))
        {
            return FrontRearHint::Front;
        }
        if lowered.iter().any(|id| id.contains("back") || id.contains('0')) {
            return FrontRearHint::Rear;
        }
        FrontRearHint::Unknown
    }
}

/// Provenance of a detected session. Only `Availability` is produced today;
/// `Heuristic` is reserved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionSource {
    #[default]
    Availability,
    Heuristic,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Availability => "AVAILABILITY",
            SessionSource::Heuristic => "HEURISTIC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CameraSession {
    pub session_id: String,
    /// Epoch milliseconds.
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub duration_ms: Option<i64>,
    pub camera_ids: BTreeSet<String>,
    pub front_rear_hint: FrontRearHint,
    pub source: SessionSource,
    pub torch_overlap: bool,
    pub device_model: String,
    pub api_level: i32,
}

impl CameraSession {
    pub fn is_open(&self) -> bool {
        self.end_timestamp.is_none()
    }

    /// Closes the session at `end_timestamp`, freezing the camera id set and
    /// recomputing the hint from it.
    pub fn close(
        &mut self,
        end_timestamp: i64,
        camera_ids: BTreeSet<String>,
        torch_overlap: bool,
    ) {
        let duration_ms = end_timestamp.saturating_sub(self.start_timestamp).max(0);
        self.end_timestamp = Some(end_timestamp);
        self.duration_ms = Some(duration_ms);
        self.front_rear_hint = FrontRearHint::from_camera_ids(&camera_ids);
        self.camera_ids = camera_ids;
        self.torch_overlap = torch_overlap;
    }

    /// The mutable columns written by the finalize operation, or `None` while
    /// the session is still open.
    pub fn finalization(&self) -> Option<SessionFinalization> {
        let end_timestamp = self.end_timestamp?;
        let duration_ms = self.duration_ms?;
        Some(SessionFinalization {
            session_id: self.session_id.clone(),
            end_timestamp,
            duration_ms,
            torch_overlap: self.torch_overlap,
            camera_ids: self.camera_ids.clone(),
            front_rear_hint: self.front_rear_hint,
        })
    }
}

/// Fields a finalize may touch. Identity, start time, source and device
/// metadata are deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFinalization {
    pub session_id: String,
    pub end_timestamp: i64,
    pub duration_ms: i64,
    pub torch_overlap: bool,
    pub camera_ids: BTreeSet<String>,
    pub front_rear_hint: FrontRearHint,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(ids: &[&str]) -> FrontRearHint {
        FrontRearHint::from_camera_ids(ids.iter())
    }

    #[test]
    fn defaults_are_the_fallback_variants() {
        assert_eq!(FrontRearHint::default(), FrontRearHint::Unknown);
        assert_eq!(SessionSource::default(), SessionSource::Availability);
    }

    #[test]
    fn classifies_camera_ids() {
        assert_eq!(hint(&["0"]), FrontRearHint::Rear);
        assert_eq!(hint(&["1"]), FrontRearHint::Front);
        assert_eq!(hint(&["front_wide"]), FrontRearHint::Front);
        assert_eq!(hint(&["BACK_tele"]), FrontRearHint::Rear);
        assert_eq!(hint(&["cam_x"]), FrontRearHint::Unknown);
        assert_eq!(hint(&[]), FrontRearHint::Unknown);
    }

    #[test]
    fn front_probe_runs_before_rear_probe() {
        assert_eq!(hint(&["10"]), FrontRearHint::Front);
        assert_eq!(hint(&["0", "front"]), FrontRearHint::Front);
        assert_eq!(hint(&["back", "cam_x"]), FrontRearHint::Rear);
    }

    #[test]
    fn close_clamps_negative_duration_and_recomputes_hint() {
        let mut session = CameraSession {
            session_id: "s".into(),
            start_timestamp: 5_000,
            end_timestamp: None,
            duration_ms: None,
            camera_ids: BTreeSet::from(["cam_x".to_string()]),
            front_rear_hint: FrontRearHint::Unknown,
            source: SessionSource::Availability,
            torch_overlap: false,
            device_model: "test".into(),
            api_level: 0,
        };
        assert!(session.finalization().is_none());

        let ids = BTreeSet::from(["cam_x".to_string(), "0".to_string()]);
        session.close(4_000, ids, true);

        assert_eq!(session.end_timestamp, Some(4_000));
        assert_eq!(session.duration_ms, Some(0));
        assert_eq!(session.front_rear_hint, FrontRearHint::Rear);

        let finalization = session.finalization().unwrap();
        assert!(finalization.torch_overlap);
        assert_eq!(finalization.camera_ids.len(), 2);
    }
}
