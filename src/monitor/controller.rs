use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::MonitoringConfig,
    db::Database,
    device::DeviceInfo,
    pruning::PrunePolicy,
    sensing::{CameraEvent, CameraEventSink, SensingController},
};

use super::{
    commands::{FlushOutcome, MonitorCommand, MonitorEvent, MonitorMessage},
    state::{MonitorPhase, MonitorSnapshot, SessionTracker, TimerTicket, TrackerAction},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const EVENT_CAPACITY: usize = 64;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct RunningMonitor {
    tx: mpsc::UnboundedSender<MonitorMessage>,
    teardown: CancellationToken,
    worker: JoinHandle<()>,
    sensing: Arc<SensingController>,
}

/// Control surface for the session detector.
///
/// `start_monitoring` spawns a single worker task that owns all detector
/// state; hardware events, timer fires and commands reach it through one
/// queue, so no two transitions ever interleave.
#[derive(Clone)]
pub struct MonitorController {
    db: Database,
    config: MonitoringConfig,
    device: DeviceInfo,
    events: broadcast::Sender<MonitorEvent>,
    running: Arc<Mutex<Option<RunningMonitor>>>,
}

impl MonitorController {
    pub fn new(db: Database, config: MonitoringConfig, device: DeviceInfo) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            config,
            device,
            events,
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<MonitorEvent> {
        &self.events
    }

    /// Idempotent. Recovers sessions left open by a previous run, then spawns
    /// the worker in the running (not paused) state.
    pub async fn start_monitoring(&self) -> Result<MonitorSnapshot> {
        {
            let mut running = self.running.lock().await;
            let alive = running
                .as_ref()
                .map(|monitor| !monitor.worker.is_finished())
                .unwrap_or(false);

            if !alive {
                self.config.validate()?;
                if let Some(dead) = running.take() {
                    log_warn!("Monitor worker exited unexpectedly; detaching its sources");
                    dead.teardown.cancel();
                    dead.sensing.stop_all().await;
                }

                let recovered =
                    recover_open_sessions(&self.db, &self.config, now_ms()).await?;
                if recovered > 0 {
                    log_warn!("Recovered {} session(s) left open by a previous run", recovered);
                }

                let (tx, rx) = mpsc::unbounded_channel();
                let worker = MonitorWorker {
                    tracker: SessionTracker::new(&self.config, self.device.clone()),
                    db: self.db.clone(),
                    prune: PrunePolicy::from_config(&self.config),
                    events: self.events.clone(),
                    self_tx: tx.downgrade(),
                    timers: HashMap::new(),
                    last_published: None,
                };
                let handle = tokio::spawn(worker.run(rx));

                *running = Some(RunningMonitor {
                    tx,
                    teardown: CancellationToken::new(),
                    worker: handle,
                    sensing: Arc::new(SensingController::new()),
                });
                log_info!("Camera monitoring started");
            }
        }

        self.snapshot().await
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|monitor| !monitor.worker.is_finished())
            .unwrap_or(false)
    }

    /// Callback surface for platform event sources.
    pub async fn event_sink(&self) -> Result<CameraEventSink> {
        let running = self.running.lock().await;
        let monitor = running
            .as_ref()
            .ok_or_else(|| anyhow!("monitoring is not running"))?;
        Ok(CameraEventSink::new(
            monitor.tx.clone(),
            monitor.teardown.clone(),
        ))
    }

    /// Spawns an event source bound to the running monitor. It is cancelled
    /// and joined by `stop`.
    pub async fn attach_source<F, Fut>(&self, name: &str, source: F) -> Result<()>
    where
        F: FnOnce(CameraEventSink, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sink, sensing) = {
            let running = self.running.lock().await;
            let monitor = running
                .as_ref()
                .ok_or_else(|| anyhow!("monitoring is not running"))?;
            (
                CameraEventSink::new(monitor.tx.clone(), monitor.teardown.clone()),
                Arc::clone(&monitor.sensing),
            )
        };
        sensing.attach(name, sink, source)
    }

    /// Waits for every attached source to run dry. Returns early once `stop`
    /// has cancelled them.
    pub async fn wait_for_sources(&self) {
        let sensing = match self.running.lock().await.as_ref() {
            Some(monitor) => Arc::clone(&monitor.sensing),
            None => return,
        };
        sensing.wait_all().await;
    }

    /// Idempotent: a second pause reports `NoSession`.
    pub async fn pause(&self) -> Result<FlushOutcome> {
        self.request(|reply| MonitorCommand::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<MonitorSnapshot> {
        self.request(|reply| MonitorCommand::Resume { reply }).await
    }

    /// Finalizes the open session now. Returns once the write and the
    /// retention pass behind it have completed.
    pub async fn flush(&self, force: bool) -> Result<FlushOutcome> {
        self.request(|reply| MonitorCommand::Flush { force, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        if !self.is_running().await {
            return Ok(MonitorSnapshot {
                phase: MonitorPhase::Idle,
                paused: false,
                stopped: true,
                torch_on: false,
                active_camera_ids: Vec::new(),
                current_session_id: None,
            });
        }
        self.request(|reply| MonitorCommand::Snapshot { reply }).await
    }

    /// Unforced flush, then teardown: timers are cancelled, sources are
    /// cancelled and joined, and the worker exits before this returns.
    pub async fn stop(&self) -> Result<FlushOutcome> {
        let Some(monitor) = self.running.lock().await.take() else {
            return Ok(FlushOutcome::NoSession);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = if monitor
            .tx
            .send(MonitorMessage::Command(MonitorCommand::Stop { reply: reply_tx }))
            .is_ok()
        {
            reply_rx
                .await
                .unwrap_or_else(|_| Err(anyhow!("monitor worker exited during stop")))
        } else {
            Ok(FlushOutcome::NoSession)
        };

        monitor.teardown.cancel();
        monitor.sensing.stop_all().await;
        drop(monitor.tx);
        if let Err(err) = monitor.worker.await {
            log_error!("Monitor worker failed to join: {err}");
        }
        log_info!("Camera monitoring stopped");

        outcome
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MonitorCommand,
    ) -> Result<T> {
        let tx = {
            let running = self.running.lock().await;
            match running.as_ref() {
                Some(monitor) => monitor.tx.clone(),
                None => bail!("monitoring is not running"),
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(MonitorMessage::Command(build(reply_tx)))
            .map_err(|_| anyhow!("monitor worker is not accepting commands"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("monitor worker dropped the request"))
    }
}

/// Closes rows a crashed run left open: long enough ones are finalized at
/// `now_ms`, the rest are deleted. Retention runs afterwards.
pub async fn recover_open_sessions(
    db: &Database,
    config: &MonitoringConfig,
    now_ms: i64,
) -> Result<usize> {
    let leftovers = db.open_sessions().await?;
    if leftovers.is_empty() {
        return Ok(0);
    }

    for mut session in leftovers.iter().cloned() {
        let duration_ms = now_ms.saturating_sub(session.start_timestamp);
        if duration_ms < config.min_session_ms {
            db.delete_session(&session.session_id).await?;
            continue;
        }

        let camera_ids = session.camera_ids.clone();
        let torch_overlap = session.torch_overlap;
        session.close(now_ms, camera_ids, torch_overlap);
        if let Some(update) = session.finalization() {
            db.finalize_session(&update).await?;
        }
    }

    PrunePolicy::from_config(config).run(db, now_ms).await?;
    Ok(leftovers.len())
}

struct MonitorWorker {
    tracker: SessionTracker,
    db: Database,
    prune: PrunePolicy,
    events: broadcast::Sender<MonitorEvent>,
    self_tx: mpsc::WeakUnboundedSender<MonitorMessage>,
    timers: HashMap<TimerTicket, JoinHandle<()>>,
    last_published: Option<MonitorSnapshot>,
}

impl MonitorWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MonitorMessage>) {
        self.publish_state();

        while let Some(message) = rx.recv().await {
            let stop = self.handle(message).await;
            self.publish_state();
            if stop {
                break;
            }
        }

        rx.close();
        self.abort_timers();
        log_debug!("monitor worker exited");
    }

    /// Returns `true` once the worker should exit.
    async fn handle(&mut self, message: MonitorMessage) -> bool {
        match message {
            MonitorMessage::Event(event) => {
                log_debug!("camera event {:?}", event);
                let actions = match &event {
                    CameraEvent::Busy { camera_id } => self.tracker.camera_busy(camera_id),
                    CameraEvent::Free { camera_id } => self.tracker.camera_free(camera_id),
                    CameraEvent::TorchChanged { enabled, .. } => {
                        self.tracker.torch_changed(*enabled)
                    }
                };
                let _ = self.apply(actions).await;
            }
            MonitorMessage::TimerFired(ticket) => {
                self.timers.remove(&ticket);
                let actions = self.tracker.timer_fired(ticket, now_ms());
                let _ = self.apply(actions).await;
            }
            MonitorMessage::Command(command) => match command {
                MonitorCommand::Pause { reply } => {
                    let actions = self.tracker.pause(now_ms());
                    let outcome = self.apply(actions).await;
                    let _ = reply.send(outcome);
                }
                MonitorCommand::Resume { reply } => {
                    self.tracker.resume();
                    let _ = reply.send(self.tracker.snapshot());
                }
                MonitorCommand::Flush { force, reply } => {
                    let actions = self.tracker.flush(now_ms(), force);
                    let outcome = self.apply(actions).await;
                    let _ = reply.send(outcome);
                }
                MonitorCommand::Stop { reply } => {
                    let actions = self.tracker.stop(now_ms());
                    let outcome = self.apply(actions).await;
                    self.abort_timers();
                    let _ = reply.send(outcome);
                    return true;
                }
                MonitorCommand::Snapshot { reply } => {
                    let _ = reply.send(self.tracker.snapshot());
                }
            },
        }
        false
    }

    /// Carries out tracker actions strictly in order. Storage failures are
    /// reported but never stop the remaining actions.
    async fn apply(&mut self, actions: Vec<TrackerAction>) -> Result<FlushOutcome> {
        let mut queue: VecDeque<TrackerAction> = actions.into();
        let mut outcome = FlushOutcome::NoSession;
        let mut failure: Option<anyhow::Error> = None;

        while let Some(action) = queue.pop_front() {
            match action {
                TrackerAction::ArmTimer { ticket, delay_ms } => self.arm_timer(ticket, delay_ms),
                TrackerAction::CancelTimer(ticket) => {
                    if let Some(handle) = self.timers.remove(&ticket) {
                        handle.abort();
                    }
                }
                TrackerAction::BeginSession(session) => {
                    match self.db.upsert_session(&session).await {
                        Ok(()) => {
                            log_info!(
                                "Camera session {} opened ({:?})",
                                session.session_id,
                                session.camera_ids
                            );
                            self.emit(MonitorEvent::SessionStarted(session));
                        }
                        Err(err) => {
                            log_error!(
                                "Failed to persist new session {}: {err:?}",
                                session.session_id
                            );
                            self.emit(MonitorEvent::Message(format!(
                                "Could not record camera session: {err}"
                            )));
                            queue.extend(self.tracker.abandon_session(&session.session_id));
                            failure.get_or_insert(err);
                        }
                    }
                }
                TrackerAction::FinalizeSession(session) => {
                    let Some(update) = session.finalization() else {
                        log_warn!("Finalize requested for open session {}", session.session_id);
                        continue;
                    };
                    match self.db.finalize_session(&update).await {
                        Ok(found) => {
                            if !found {
                                log_warn!(
                                    "Session {} vanished before it could be finalized",
                                    session.session_id
                                );
                            }
                            log_info!(
                                "Camera session {} finalized after {} ms",
                                session.session_id,
                                update.duration_ms
                            );
                            self.emit(MonitorEvent::SessionCompleted(session.clone()));
                            outcome = FlushOutcome::Completed(session);
                        }
                        Err(err) => {
                            log_error!(
                                "Failed to finalize session {}: {err:?}",
                                session.session_id
                            );
                            self.emit(MonitorEvent::Message(format!(
                                "Could not save camera session: {err}"
                            )));
                            failure.get_or_insert(err);
                        }
                    }
                }
                TrackerAction::DiscardSession(session) => {
                    match self.db.delete_session(&session.session_id).await {
                        Ok(_) => {
                            log_info!("Camera session {} discarded as noise", session.session_id);
                            self.emit(MonitorEvent::SessionDiscarded(session.clone()));
                            outcome = FlushOutcome::Discarded(session);
                        }
                        Err(err) => {
                            log_error!(
                                "Failed to discard session {}: {err:?}",
                                session.session_id
                            );
                            self.emit(MonitorEvent::Message(format!(
                                "Could not remove short camera session: {err}"
                            )));
                            failure.get_or_insert(err);
                        }
                    }
                }
                TrackerAction::Prune => {
                    if let Err(err) = self.prune.run(&self.db, now_ms()).await {
                        log_error!("Retention pass failed: {err:?}");
                        self.emit(MonitorEvent::Message(format!(
                            "Could not trim camera history: {err}"
                        )));
                        failure.get_or_insert(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    fn arm_timer(&mut self, ticket: TimerTicket, delay_ms: u64) {
        let weak_tx = self.self_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(MonitorMessage::TimerFired(ticket));
            }
        });
        if let Some(previous) = self.timers.insert(ticket, handle) {
            previous.abort();
        }
    }

    fn abort_timers(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    fn emit(&self, event: MonitorEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn publish_state(&mut self) {
        let snapshot = self.tracker.snapshot();
        if self.last_published.as_ref() == Some(&snapshot) {
            return;
        }
        self.last_published = Some(snapshot.clone());
        self.emit(MonitorEvent::StateChanged(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::time::timeout;

    use super::*;
    use crate::db::{CameraSession, FrontRearHint, SessionSource};

    fn fast_config(min_session_ms: i64) -> MonitoringConfig {
        MonitoringConfig {
            open_debounce_ms: 20,
            close_debounce_ms: 40,
            min_session_ms,
            ..MonitoringConfig::default()
        }
    }

    async fn started(min_session_ms: i64) -> MonitorController {
        let db = Database::open_in_memory().unwrap();
        let controller =
            MonitorController::new(db, fast_config(min_session_ms), DeviceInfo::new("test", 1));
        controller.start_monitoring().await.unwrap();
        controller
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<MonitorEvent>,
        mut matches: impl FnMut(&MonitorEvent) -> bool,
    ) -> MonitorEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for monitor event")
    }

    #[tokio::test]
    async fn held_camera_produces_one_finalized_session() {
        let controller = started(50).await;
        let mut events = controller.subscribe();
        let sink = controller.event_sink().await.unwrap();

        assert!(sink.on_camera_busy("0"));
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        sink.on_camera_free("0");

        let completed =
            wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionCompleted(_))).await;
        let MonitorEvent::SessionCompleted(session) = completed else {
            unreachable!()
        };
        assert_eq!(session.camera_ids, BTreeSet::from(["0".to_string()]));
        assert_eq!(session.front_rear_hint, FrontRearHint::Rear);

        let stored = controller.database().list_sessions().await.unwrap();
        assert_eq!(stored.len(), 1);
        let row = &stored[0];
        assert_eq!(
            row.duration_ms,
            Some(row.end_timestamp.unwrap() - row.start_timestamp)
        );
        assert!(row.duration_ms.unwrap() >= 50);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn blip_leaves_no_rows() {
        let controller = started(60_000).await;
        let mut events = controller.subscribe();
        let sink = controller.event_sink().await.unwrap();

        sink.on_camera_busy("0");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;
        sink.on_camera_free("0");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionDiscarded(_))).await;

        assert_eq!(controller.database().count_sessions().await.unwrap(), 0);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn forced_flush_keeps_short_session() {
        let controller = started(60_000).await;
        let mut events = controller.subscribe();
        let sink = controller.event_sink().await.unwrap();

        sink.on_camera_busy("front");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;

        let outcome = controller.flush(true).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Completed(_)));
        let stored = controller.database().list_sessions().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].end_timestamp.is_some());
        assert_eq!(stored[0].front_rear_hint, FrontRearHint::Front);

        assert_eq!(controller.flush(true).await.unwrap(), FlushOutcome::NoSession);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_is_idempotent_and_mutes_events() {
        let controller = started(0).await;
        let mut events = controller.subscribe();
        let sink = controller.event_sink().await.unwrap();

        sink.on_camera_busy("0");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;

        let first = controller.pause().await.unwrap();
        assert!(first.session().is_some());
        assert_eq!(controller.pause().await.unwrap(), FlushOutcome::NoSession);

        sink.on_camera_busy("1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = controller.snapshot().await.unwrap();
        assert!(snapshot.paused);
        assert_eq!(snapshot.phase, MonitorPhase::Idle);
        assert!(snapshot.active_camera_ids.is_empty());
        assert_eq!(controller.database().count_sessions().await.unwrap(), 1);

        let resumed = controller.resume().await.unwrap();
        assert!(!resumed.paused);
        sink.on_camera_busy("1");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;

        controller.stop().await.unwrap();
        assert_eq!(controller.database().count_sessions().await.unwrap(), 2);
        assert!(controller.database().open_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_tears_everything_down() {
        let controller = started(0).await;
        let mut events = controller.subscribe();
        let sink = controller.event_sink().await.unwrap();

        sink.on_camera_busy("0");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;

        let outcome = controller.stop().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Completed(_)));
        assert!(!sink.on_camera_busy("0"));
        assert!(!controller.is_running().await);
        assert!(controller.snapshot().await.unwrap().stopped);
        assert_eq!(controller.stop().await.unwrap(), FlushOutcome::NoSession);
        assert!(controller.pause().await.is_err());
        assert!(controller.event_sink().await.is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_restartable() {
        let controller = started(0).await;
        controller.start_monitoring().await.unwrap();
        assert!(controller.is_running().await);
        controller.stop().await.unwrap();

        let snapshot = controller.start_monitoring().await.unwrap();
        assert!(!snapshot.stopped);
        assert!(!snapshot.paused);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn attached_source_is_joined_on_stop() {
        let controller = started(0).await;
        let mut events = controller.subscribe();

        controller
            .attach_source("forever", |sink, cancel| async move {
                sink.on_camera_busy("0");
                cancel.cancelled().await;
            })
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;

        timeout(Duration::from_secs(5), controller.stop())
            .await
            .expect("stop must not hang on a live source")
            .unwrap();
    }

    #[tokio::test]
    async fn stop_completes_while_someone_waits_for_sources() {
        let controller = started(0).await;
        controller
            .attach_source("live", |_, cancel| async move { cancel.cancelled().await })
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.wait_for_sources().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(3), controller.stop())
            .await
            .expect("stop must not wait behind wait_for_sources")
            .unwrap();
        timeout(Duration::from_secs(3), waiter)
            .await
            .expect("waiter must return after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn restart_after_worker_death_detaches_old_sources() {
        let controller = started(0).await;
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        controller
            .attach_source("replay", |_, cancel| async move {
                cancel.cancelled().await;
                let _ = cancelled_tx.send(());
            })
            .await
            .unwrap();

        controller
            .running
            .lock()
            .await
            .as_ref()
            .unwrap()
            .worker
            .abort();
        timeout(Duration::from_secs(3), async {
            while controller.is_running().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        controller.start_monitoring().await.unwrap();
        timeout(Duration::from_secs(3), cancelled_rx)
            .await
            .expect("old source must be cancelled on restart")
            .unwrap();
        controller
            .attach_source("replay", |_, _| async {})
            .await
            .unwrap();

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn storage_failures_during_discard_are_broadcast() {
        let controller = started(60_000).await;
        let mut events = controller.subscribe();
        let sink = controller.event_sink().await.unwrap();

        sink.on_camera_busy("0");
        wait_for(&mut events, |e| matches!(e, MonitorEvent::SessionStarted(_))).await;
        controller
            .database()
            .execute(|conn| {
                conn.execute_batch("DROP TABLE camera_session")?;
                Ok(())
            })
            .await
            .unwrap();

        let outcome = controller.flush(false).await;
        assert!(outcome.is_err());
        wait_for(&mut events, |e| {
            matches!(e, MonitorEvent::Message(text) if text.contains("remove"))
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, MonitorEvent::Message(text) if text.contains("trim"))
        })
        .await;

        let snapshot = controller.snapshot().await.unwrap();
        assert_eq!(snapshot.current_session_id, None);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_callbacks_never_leave_two_open_sessions() {
        let controller = started(0).await;
        let sink = controller.event_sink().await.unwrap();

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let camera = format!("{}", (t + i) % 3);
                        if i % 2 == 0 {
                            sink.on_camera_busy(&camera);
                        } else {
                            sink.on_camera_free(&camera);
                        }
                        if i % 25 == 0 {
                            std::thread::sleep(Duration::from_millis(30));
                        }
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let open_while_running = controller.database().open_sessions().await.unwrap();
        assert!(open_while_running.len() <= 1);

        controller.stop().await.unwrap();
        let db = controller.database();
        assert!(db.open_sessions().await.unwrap().is_empty());
        for session in db.list_sessions().await.unwrap() {
            assert!(!session.camera_ids.is_empty());
            assert!(session.duration_ms.unwrap() >= 0);
        }
    }

    #[tokio::test]
    async fn startup_recovers_crash_leftovers() {
        let db = Database::open_in_memory().unwrap();
        let now = now_ms();
        let leftover = |id: &str, start: i64| CameraSession {
            session_id: id.into(),
            start_timestamp: start,
            end_timestamp: None,
            duration_ms: None,
            camera_ids: BTreeSet::from(["0".to_string()]),
            front_rear_hint: FrontRearHint::Rear,
            source: SessionSource::Availability,
            torch_overlap: true,
            device_model: "test".into(),
            api_level: 1,
        };
        db.upsert_session(&leftover("long", now - 60_000)).await.unwrap();
        db.upsert_session(&leftover("blip", now + 60_000)).await.unwrap();

        let controller =
            MonitorController::new(db.clone(), MonitoringConfig::default(), DeviceInfo::new("t", 1));
        controller.start_monitoring().await.unwrap();

        assert!(db.open_sessions().await.unwrap().is_empty());
        let long = db.get_session("long").await.unwrap().unwrap();
        assert!(long.end_timestamp.is_some());
        assert!(long.torch_overlap);
        assert!(db.get_session("blip").await.unwrap().is_none());

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_refuses_to_start() {
        let db = Database::open_in_memory().unwrap();
        let config = MonitoringConfig {
            open_debounce_ms: 0,
            ..MonitoringConfig::default()
        };
        let controller = MonitorController::new(db, config, DeviceInfo::new("t", 1));
        assert!(controller.start_monitoring().await.is_err());
        assert!(!controller.is_running().await);
    }
}
