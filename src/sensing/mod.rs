//! Hardware event intake.
//!
//! Platform callbacks (camera availability, torch mode) arrive on arbitrary
//! threads. They are turned into `CameraEvent`s and pushed through a
//! `CameraEventSink` into the monitor's queue without blocking the caller.

pub mod controller;
pub mod replay;

pub use controller::SensingController;
pub use replay::{parse_line, ReplayLine, ReplaySource};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::monitor::MonitorMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CameraEvent {
    /// The camera became unavailable, most likely opened by some app.
    Busy { camera_id: String },
    /// The camera became available again.
    Free { camera_id: String },
    TorchChanged { camera_id: String, enabled: bool },
}

/// Callback surface handed to event sources. Cheap to clone and safe to call
/// from any thread; after teardown every delivery is silently dropped.
#[derive(Clone)]
pub struct CameraEventSink {
    tx: mpsc::UnboundedSender<MonitorMessage>,
    teardown: CancellationToken,
}

impl CameraEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MonitorMessage>, teardown: CancellationToken) -> Self {
        Self { tx, teardown }
    }

    pub fn on_camera_busy(&self, camera_id: &str) -> bool {
        self.deliver(CameraEvent::Busy {
            camera_id: camera_id.to_string(),
        })
    }

    pub fn on_camera_free(&self, camera_id: &str) -> bool {
        self.deliver(CameraEvent::Free {
            camera_id: camera_id.to_string(),
        })
    }

    pub fn on_torch_changed(&self, camera_id: &str, enabled: bool) -> bool {
        self.deliver(CameraEvent::TorchChanged {
            camera_id: camera_id.to_string(),
            enabled,
        })
    }

    /// Returns `false` when the monitor is gone and the event was dropped.
    pub fn deliver(&self, event: CameraEvent) -> bool {
        if self.teardown.is_cancelled() {
            return false;
        }
        self.tx.send(MonitorMessage::Event(event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_cancelled() || self.tx.is_closed()
    }
}
