//! Clock-free transition core of the session detector.
//!
//! `SessionTracker` owns the busy-camera set, the open session and the
//! debounce bookkeeping. Every input takes the current time explicitly and
//! returns the side effects the caller must carry out, in order. The tracker
//! never touches storage or timers itself, which keeps it deterministic.

use std::collections::BTreeSet;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::MonitoringConfig,
    db::{CameraSession, FrontRearHint, SessionSource},
    device::DeviceInfo,
};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MonitorPhase {
    #[default]
    Idle,
    PendingOpen,
    Open,
    PendingClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerKind {
    Open,
    Close,
}

/// Identifies one armed timer. A fire whose ticket no longer matches the
/// armed one is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTicket {
    pub kind: TimerKind,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerAction {
    ArmTimer { ticket: TimerTicket, delay_ms: u64 },
    CancelTimer(TimerTicket),
    /// Persist a freshly opened session.
    BeginSession(CameraSession),
    /// Persist the end of a session that met the duration rule (or was forced).
    FinalizeSession(CameraSession),
    /// Delete the stored row of a session too short to keep.
    DiscardSession(CameraSession),
    /// Run retention after a finalize or discard.
    Prune,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub phase: MonitorPhase,
    pub paused: bool,
    pub stopped: bool,
    pub torch_on: bool,
    pub active_camera_ids: Vec<String>,
    pub current_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionTracker {
    open_debounce_ms: u64,
    close_debounce_ms: u64,
    min_session_ms: i64,
    device: DeviceInfo,
    paused: bool,
    stopped: bool,
    torch_on: bool,
    torch_overlap: bool,
    active_ids: BTreeSet<String>,
    session_ids: BTreeSet<String>,
    current: Option<CameraSession>,
    open_timer: Option<TimerTicket>,
    close_timer: Option<TimerTicket>,
    next_timer_id: u64,
}

impl SessionTracker {
    pub fn new(config: &MonitoringConfig, device: DeviceInfo) -> Self {
        Self {
            open_debounce_ms: config.open_debounce_ms,
            close_debounce_ms: config.close_debounce_ms,
            min_session_ms: config.min_session_ms,
            device,
            paused: false,
            stopped: false,
            torch_on: false,
            torch_overlap: false,
            active_ids: BTreeSet::new(),
            session_ids: BTreeSet::new(),
            current: None,
            open_timer: None,
            close_timer: None,
            next_timer_id: 0,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        match (&self.current, self.open_timer, self.close_timer) {
            (Some(_), _, Some(_)) => MonitorPhase::PendingClose,
            (Some(_), _, None) => MonitorPhase::Open,
            (None, Some(_), _) => MonitorPhase::PendingOpen,
            (None, None, _) => MonitorPhase::Idle,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn current_session(&self) -> Option<&CameraSession> {
        self.current.as_ref()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            phase: self.phase(),
            paused: self.paused,
            stopped: self.stopped,
            torch_on: self.torch_on,
            active_camera_ids: self.active_ids.iter().cloned().collect(),
            current_session_id: self.current.as_ref().map(|s| s.session_id.clone()),
        }
    }

    fn accepts_events(&self) -> bool {
        !self.paused && !self.stopped
    }

    pub fn camera_busy(&mut self, camera_id: &str) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if !self.accepts_events() {
            return actions;
        }

        self.active_ids.insert(camera_id.to_string());
        self.session_ids.insert(camera_id.to_string());
        self.cancel_timer(TimerKind::Close, &mut actions);

        if self.current.is_none() && !self.torch_on && self.open_timer.is_none() {
            self.arm_timer(TimerKind::Open, &mut actions);
        }
        actions
    }

    pub fn camera_free(&mut self, camera_id: &str) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if !self.accepts_events() {
            return actions;
        }

        self.active_ids.remove(camera_id);
        if self.active_ids.is_empty() && !self.torch_on {
            self.arm_close_if_idle(&mut actions);
        }
        actions
    }

    pub fn torch_changed(&mut self, enabled: bool) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if !self.accepts_events() {
            return actions;
        }

        self.torch_on = enabled;
        if enabled {
            if self.current.is_some() {
                self.torch_overlap = true;
            }
        } else if self.active_ids.is_empty() {
            self.arm_close_if_idle(&mut actions);
        }
        actions
    }

    pub fn timer_fired(&mut self, ticket: TimerTicket, now_ms: i64) -> Vec<TrackerAction> {
        let slot = match ticket.kind {
            TimerKind::Open => &mut self.open_timer,
            TimerKind::Close => &mut self.close_timer,
        };
        if *slot != Some(ticket) {
            return Vec::new();
        }
        *slot = None;

        if !self.accepts_events() {
            return Vec::new();
        }

        match ticket.kind {
            TimerKind::Open => self.open_if_still_busy(now_ms),
            TimerKind::Close => {
                if self.active_ids.is_empty() && !self.torch_on {
                    self.finalize(now_ms, false)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Idempotent. Finalizes the open session under the normal duration
    /// rule, then ignores hardware events until `resume`.
    pub fn pause(&mut self, now_ms: i64) -> Vec<TrackerAction> {
        if self.paused || self.stopped {
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.cancel_timer(TimerKind::Open, &mut actions);
        self.cancel_timer(TimerKind::Close, &mut actions);
        actions.extend(self.finalize(now_ms, false));
        // busy-set membership goes stale while events are ignored
        self.active_ids.clear();
        self.session_ids.clear();
        self.paused = true;
        actions
    }

    /// Idempotent. Events missed while paused are not replayed.
    pub fn resume(&mut self) {
        if !self.stopped {
            self.paused = false;
        }
    }

    pub fn flush(&mut self, now_ms: i64, force: bool) -> Vec<TrackerAction> {
        if self.stopped {
            return Vec::new();
        }
        self.finalize(now_ms, force)
    }

    /// Unforced flush, then every later input is a no-op.
    pub fn stop(&mut self, now_ms: i64) -> Vec<TrackerAction> {
        if self.stopped {
            return Vec::new();
        }
        let mut actions = self.finalize(now_ms, false);
        self.cancel_timer(TimerKind::Open, &mut actions);
        self.cancel_timer(TimerKind::Close, &mut actions);
        self.stopped = true;
        actions
    }

    /// Forgets the open session after its creation could not be persisted,
    /// so the next burst of activity can open a fresh one.
    pub fn abandon_session(&mut self, session_id: &str) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if self.current.as_ref().map(|s| s.session_id.as_str()) != Some(session_id) {
            return actions;
        }
        self.cancel_timer(TimerKind::Close, &mut actions);
        self.reset_session_state();
        actions
    }

    fn open_if_still_busy(&mut self, now_ms: i64) -> Vec<TrackerAction> {
        if self.active_ids.is_empty() || self.torch_on || self.current.is_some() {
            return Vec::new();
        }

        let camera_ids = self.active_ids.clone();
        let session = CameraSession {
            session_id: Uuid::new_v4().to_string(),
            start_timestamp: now_ms,
            end_timestamp: None,
            duration_ms: None,
            front_rear_hint: FrontRearHint::from_camera_ids(&camera_ids),
            camera_ids: camera_ids.clone(),
            source: SessionSource::Availability,
            torch_overlap: self.torch_on,
            device_model: self.device.model.clone(),
            api_level: self.device.api_level,
        };

        self.session_ids = camera_ids;
        self.torch_overlap = self.torch_on;
        self.current = Some(session.clone());
        vec![TrackerAction::BeginSession(session)]
    }

    /// Ends the open session: keep it when long enough (or forced), otherwise
    /// discard it. Either way retention runs and the accumulators reset.
    fn finalize(&mut self, now_ms: i64, force: bool) -> Vec<TrackerAction> {
        let Some(mut session) = self.current.take() else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        self.cancel_timer(TimerKind::Open, &mut actions);
        self.cancel_timer(TimerKind::Close, &mut actions);

        let duration_ms = now_ms.saturating_sub(session.start_timestamp).max(0);
        if !force && duration_ms < self.min_session_ms {
            actions.push(TrackerAction::DiscardSession(session));
        } else {
            let camera_ids = std::mem::take(&mut self.session_ids);
            session.close(now_ms, camera_ids, self.torch_overlap);
            actions.push(TrackerAction::FinalizeSession(session));
        }
        actions.push(TrackerAction::Prune);

        self.reset_session_state();
        actions
    }

    fn reset_session_state(&mut self) {
        self.current = None;
        self.torch_overlap = false;
        self.session_ids.clear();
        self.active_ids.clear();
    }

    fn arm_close_if_idle(&mut self, actions: &mut Vec<TrackerAction>) {
        if self.close_timer.is_none() {
            self.arm_timer(TimerKind::Close, actions);
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, actions: &mut Vec<TrackerAction>) {
        self.next_timer_id += 1;
        let ticket = TimerTicket {
            kind,
            id: self.next_timer_id,
        };
        let delay_ms = match kind {
            TimerKind::Open => self.open_debounce_ms,
            TimerKind::Close => self.close_debounce_ms,
        };
        match kind {
            TimerKind::Open => self.open_timer = Some(ticket),
            TimerKind::Close => self.close_timer = Some(ticket),
        }
        actions.push(TrackerAction::ArmTimer { ticket, delay_ms });
    }

    fn cancel_timer(&mut self, kind: TimerKind, actions: &mut Vec<TrackerAction>) {
        let slot = match kind {
            TimerKind::Open => &mut self.open_timer,
            TimerKind::Close => &mut self.close_timer,
        };
        if let Some(ticket) = slot.take() {
            actions.push(TrackerAction::CancelTimer(ticket));
        }
    }
}
