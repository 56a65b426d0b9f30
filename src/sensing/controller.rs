use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};

use anyhow::{bail, Result};
use log::info;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::CameraEventSink;

/// Owns the tasks that feed hardware events into one monitor run. Teardown
/// cancels every source and waits for it to exit, so no callback can reach
/// a monitor that has already stopped.
#[derive(Default)]
pub struct SensingController {
    cancel_token: CancellationToken,
    tasks: TaskTracker,
    names: Mutex<Vec<String>>,
}

impl SensingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach<F, Fut>(&self, name: &str, sink: CameraEventSink, source: F) -> Result<()>
    where
        F: FnOnce(CameraEventSink, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if sink.is_closed() || self.cancel_token.is_cancelled() {
            bail!("cannot attach source '{name}': monitor is not running");
        }

        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if names.iter().any(|existing| existing == name) {
            bail!("source '{name}' already attached");
        }

        self.tasks.spawn(source(sink, self.cancel_token.child_token()));
        info!("Attached camera event source '{name}'");
        names.push(name.to_string());
        Ok(())
    }

    /// Waits for every source to finish on its own (finite replays).
    pub async fn wait_all(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub async fn stop_all(&self) {
        self.cancel_token.cancel();
        self.wait_all().await;
    }
}
