//! Session detection: the clock-free transition core and the worker that
//! drives it from real events, timers and commands.

pub mod commands;
pub mod controller;
pub mod state;

pub(crate) use commands::MonitorMessage;
pub use commands::{FlushOutcome, MonitorEvent};
pub use controller::{now_ms, recover_open_sessions, MonitorController};
pub use state::{MonitorPhase, MonitorSnapshot, SessionTracker, TimerKind, TimerTicket, TrackerAction};
