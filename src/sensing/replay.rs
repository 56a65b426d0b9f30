//! Line-protocol event source.
//!
//! Replays recorded or scripted hardware callbacks, one per line:
//!
//! ```text
//! busy 0
//! sleep 2000
//! torch 0 on
//! free 0
//! ```
//!
//! Blank lines and `#` comments are skipped.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use super::{CameraEvent, CameraEventSink};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayLine {
    Event(CameraEvent),
    Sleep(Duration),
}

pub fn parse_line(line: &str) -> Result<Option<ReplayLine>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
    let mut camera_id = || {
        parts
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("'{verb}' needs a camera id"))
    };

    let parsed = match verb.as_str() {
        "busy" | "unavailable" => ReplayLine::Event(CameraEvent::Busy {
            camera_id: camera_id()?,
        }),
        "free" | "available" => ReplayLine::Event(CameraEvent::Free {
            camera_id: camera_id()?,
        }),
        "torch" => {
            let camera_id = camera_id()?;
            let enabled = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                Some("on" | "true" | "1") => true,
                Some("off" | "false" | "0") => false,
                other => bail!("torch state must be on or off, got {other:?}"),
            };
            ReplayLine::Event(CameraEvent::TorchChanged { camera_id, enabled })
        }
        "sleep" | "wait" => {
            let raw = parts
                .next()
                .ok_or_else(|| anyhow!("'sleep' needs a duration in milliseconds"))?;
            let ms: u64 = raw
                .parse()
                .map_err(|err| anyhow!("invalid sleep duration '{raw}': {err}"))?;
            ReplayLine::Sleep(Duration::from_millis(ms))
        }
        other => bail!("unknown replay verb '{other}'"),
    };

    if let Some(extra) = parts.next() {
        bail!("unexpected trailing token '{extra}'");
    }
    Ok(Some(parsed))
}

pub struct ReplaySource<R> {
    name: String,
    reader: R,
}

impl<R> ReplaySource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
        }
    }

    /// Forwards events until the reader is exhausted, the sink closes or the
    /// token is cancelled. Malformed lines are logged and skipped.
    pub async fn run(self, sink: CameraEventSink, cancel: CancellationToken) {
        let mut lines = self.reader.lines();
        let mut line_no = 0usize;
        let mut delivered = 0usize;

        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = cancel.cancelled() => {
                    log_info!("replay '{}' cancelled after {} events", self.name, delivered);
                    return;
                }
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    log_warn!("replay '{}' read failed: {err}", self.name);
                    break;
                }
            };
            line_no += 1;

            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some(ReplayLine::Event(event))) => {
                    log_debug!("replay '{}' line {}: {:?}", self.name, line_no, event);
                    if !sink.deliver(event) {
                        log_info!("replay '{}' stopped: monitor is gone", self.name);
                        return;
                    }
                    delivered += 1;
                }
                Ok(Some(ReplayLine::Sleep(duration))) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => {
                            log_info!("replay '{}' cancelled while sleeping", self.name);
                            return;
                        }
                    }
                }
                Err(err) => {
                    log_warn!("replay '{}' line {} skipped: {err}", self.name, line_no);
                }
            }
        }

        log_info!("replay '{}' finished: {} events", self.name, delivered);
    }
}
