use anyhow::Result;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{db::CameraSession, sensing::CameraEvent};

use super::state::{MonitorSnapshot, TimerTicket};

/// Everything the monitor worker consumes, funnelled through one queue so
/// hardware events, timer fires and control commands are strictly ordered.
pub(crate) enum MonitorMessage {
    Event(CameraEvent),
    TimerFired(TimerTicket),
    Command(MonitorCommand),
}

pub(crate) enum MonitorCommand {
    Pause {
        reply: oneshot::Sender<Result<FlushOutcome>>,
    },
    Resume {
        reply: oneshot::Sender<MonitorSnapshot>,
    },
    Flush {
        force: bool,
        reply: oneshot::Sender<Result<FlushOutcome>>,
    },
    Stop {
        reply: oneshot::Sender<Result<FlushOutcome>>,
    },
    Snapshot {
        reply: oneshot::Sender<MonitorSnapshot>,
    },
}

/// What a finalize did to the session that was open, if any.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind", content = "session")]
pub enum FlushOutcome {
    NoSession,
    Completed(CameraSession),
    Discarded(CameraSession),
}

impl FlushOutcome {
    pub fn session(&self) -> Option<&CameraSession> {
        match self {
            FlushOutcome::NoSession => None,
            FlushOutcome::Completed(session) | FlushOutcome::Discarded(session) => Some(session),
        }
    }
}

/// Broadcast to any number of observers (UI, CLI, tests).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum MonitorEvent {
    StateChanged(MonitorSnapshot),
    SessionStarted(CameraSession),
    SessionCompleted(CameraSession),
    SessionDiscarded(CameraSession),
    /// Human-readable notice, e.g. a failed write or export.
    Message(String),
}
