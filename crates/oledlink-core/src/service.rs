use crate::bridge::{
    BridgeEvent, BridgeLoop, BridgeSettings, BridgeState, ChannelId, ConfigError, RunOutcome,
};
use crate::serial_channel::ChannelOpener;
use crate::source::{TelemetrySource, TimedSource};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start telemetry thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Identifies one run started by [`BridgeService::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle {
    id: u64,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct ActiveRun {
    handle: RunHandle,
    tx_cancel: Sender<()>,
    worker: JoinHandle<RunOutcome>,
}

/// Caller-facing control surface. Runs the bridge on a background thread, one
/// run at a time, and hands back events through [`events`](Self::events).
pub struct BridgeService {
    opener: Arc<dyn ChannelOpener>,
    source: Arc<Mutex<TimedSource>>,
    settings: Arc<BridgeSettings>,
    tx_evt: Sender<BridgeEvent>,
    rx_evt: Receiver<BridgeEvent>,
    active: Option<ActiveRun>,
    next_run_id: u64,
}

impl BridgeService {
    /// Every poll of `source` goes through a [`TimedSource`] bounded by
    /// `settings.poll_timeout`.
    pub fn new<O, S>(opener: O, source: S, settings: BridgeSettings) -> Result<Self, ServiceError>
    where
        O: ChannelOpener + 'static,
        S: TelemetrySource + 'static,
    {
        settings.validate()?;
        let source = TimedSource::spawn(source, settings.poll_timeout)?;
        let (tx_evt, rx_evt) = unbounded::<BridgeEvent>();

        Ok(Self {
            opener: Arc::new(opener),
            source: Arc::new(Mutex::new(source)),
            settings: Arc::new(settings),
            tx_evt,
            rx_evt,
            active: None,
            next_run_id: 1,
        })
    }

    /// Starts a run on `channel`. A run already in progress is stopped and
    /// joined first. Nothing is opened when `channel` is missing or blank.
    pub fn start(&mut self, channel: Option<&str>) -> Result<RunHandle, ConfigError> {
        let channel_id = ChannelId::from_option(channel)?;
        self.shutdown_active();

        let handle = RunHandle { id: self.next_run_id };
        self.next_run_id += 1;

        let (tx_cancel, rx_cancel) = bounded::<()>(1);
        let opener = Arc::clone(&self.opener);
        let source = Arc::clone(&self.source);
        let settings = Arc::clone(&self.settings);
        let tx_evt = self.tx_evt.clone();

        log::info!("starting run #{} on {channel_id}", handle.id);
        let worker = std::thread::spawn(move || {
            let mut source = source.lock();
            BridgeLoop::new(
                channel_id,
                opener.as_ref(),
                &mut *source,
                &settings,
                &rx_cancel,
                &tx_evt,
            )
            .run()
        });

        self.active = Some(ActiveRun { handle, tx_cancel, worker });
        Ok(handle)
    }

    /// Asks `handle`'s run to stop. Returns immediately; the run honours the
    /// request before its next poll. Stale handles are ignored.
    pub fn stop(&self, handle: RunHandle) {
        match &self.active {
            Some(run) if run.handle == handle => {
                let _ = run.tx_cancel.try_send(());
            }
            _ => log::debug!("stop for inactive run #{}", handle.id),
        }
    }

    /// Blocks until the active run ends and returns how it ended.
    pub fn wait(&mut self) -> Option<RunOutcome> {
        let run = self.active.take()?;
        Some(self.join(run))
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().map_or(false, |run| !run.worker.is_finished())
    }

    pub fn active_run(&self) -> Option<RunHandle> {
        self.active.as_ref().map(|run| run.handle)
    }

    pub fn events(&self) -> &Receiver<BridgeEvent> {
        &self.rx_evt
    }

    /// Keeps the cancel sender alive until the worker is gone, so a plain
    /// `wait` is not mistaken for a stop request.
    fn join(&self, run: ActiveRun) -> RunOutcome {
        let ActiveRun { handle, tx_cancel, worker } = run;
        let outcome = worker.join().unwrap_or_else(|_| {
            log::error!("run #{} panicked", handle.id);
            let _ = self.tx_evt.send(BridgeEvent::StateChanged(BridgeState::Faulted));
            let _ = self.tx_evt.send(BridgeEvent::Finished(RunOutcome::Aborted));
            RunOutcome::Aborted
        });
        drop(tx_cancel);
        outcome
    }

    fn shutdown_active(&mut self) {
        if let Some(run) = self.active.take() {
            let _ = run.tx_cancel.try_send(());
            let outcome = self.join(run);
            log::debug!("previous run ended: {outcome}");
        }
    }
}

impl Drop for BridgeService {
    fn drop(&mut self) {
        self.shutdown_active();
    }
}

