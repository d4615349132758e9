//! The poll → encode → write loop and the vocabulary it reports in.

use crate::serial_channel::{ChannelError, ChannelOpener, SerialChannel, SerialConfig};
use crate::source::{RawSnapshot, TelemetrySource};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use oledlink_codec::{decode, encode, WireLine};
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no serial port selected")]
    NoChannelSelected,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Name of the serial endpoint a run writes to. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::NoChannelSelected);
        }
        Ok(Self(name))
    }

    pub fn from_option(name: Option<&str>) -> Result<Self, ConfigError> {
        name.map_or(Err(ConfigError::NoChannelSelected), Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeState {
    #[default]
    Idle,
    Connecting,
    Running,
    Stopping,
    /// Ended by a stop request.
    Stopped,
    /// Ended by a failure.
    Faulted,
}

impl BridgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Faulted => write!(f, "FAULTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Informational,
    Recoverable,
    Critical,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Cancelled,
    OpenFailed(String),
    SourceUnavailable,
    WriteFailed(String),
    DecodeFailed(String),
    /// The worker thread panicked.
    Aborted,
}

impl RunOutcome {
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    pub fn final_state(&self) -> BridgeState {
        if self.is_fault() {
            BridgeState::Faulted
        } else {
            BridgeState::Stopped
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "stopped on request"),
            Self::OpenFailed(e) => write!(f, "could not open serial port: {e}"),
            Self::SourceUnavailable => write!(f, "telemetry source unavailable"),
            Self::WriteFailed(e) => write!(f, "serial write failed: {e}"),
            Self::DecodeFailed(e) => write!(f, "malformed telemetry: {e}"),
            Self::Aborted => write!(f, "bridge worker aborted"),
        }
    }
}

/// Everything a run reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged(BridgeState),
    Status { severity: Severity, message: String },
    LineSent(WireLine),
    /// Always the last event of a run.
    Finished(RunOutcome),
}

/// What to do with a snapshot that does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// Send the fallback line, report, keep going.
    #[default]
    Recover,
    /// Write nothing and end the run.
    Stop,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub serial: SerialConfig,
    pub interval: Duration,
    pub poll_timeout: Duration,
    pub decode_policy: DecodePolicy,
}

impl BridgeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be greater than zero".to_string()));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll timeout must be greater than zero".to_string()));
        }
        if self.poll_timeout >= self.interval {
            return Err(ConfigError::Invalid(format!(
                "poll timeout ({:?}) must be shorter than the poll interval ({:?})",
                self.poll_timeout, self.interval
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud rate must be greater than zero".to_string()));
        }
        Ok(())
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            interval: DEFAULT_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            decode_policy: DecodePolicy::Recover,
        }
    }
}

enum Step {
    Continue,
    Finish(RunOutcome),
}

/// One bridge run. Owns the channel for as long as it is open.
pub(crate) struct BridgeLoop<'a> {
    channel_id: ChannelId,
    opener: &'a dyn ChannelOpener,
    source: &'a mut dyn TelemetrySource,
    settings: &'a BridgeSettings,
    cancel: &'a Receiver<()>,
    events: &'a Sender<BridgeEvent>,
    channel: Option<Box<dyn SerialChannel>>,
    state: BridgeState,
}

impl<'a> BridgeLoop<'a> {
    pub(crate) fn new(
        channel_id: ChannelId,
        opener: &'a dyn ChannelOpener,
        source: &'a mut dyn TelemetrySource,
        settings: &'a BridgeSettings,
        cancel: &'a Receiver<()>,
        events: &'a Sender<BridgeEvent>,
    ) -> Self {
        Self {
            channel_id,
            opener,
            source,
            settings,
            cancel,
            events,
            channel: None,
            state: BridgeState::Idle,
        }
    }

    pub(crate) fn run(mut self) -> RunOutcome {
        self.transition(BridgeState::Connecting);

        match self.opener.open(self.channel_id.as_str(), &self.settings.serial) {
            Ok(channel) => self.channel = Some(channel),
            Err(e) => {
                log::error!("{}: {e}", self.channel_id);
                self.report(Severity::Critical, format!("Couldn't connect to serial port: {e}"));
                let outcome = match e {
                    ChannelError::OpenFailed(detail) | ChannelError::WriteFailed(detail) => {
                        RunOutcome::OpenFailed(detail)
                    }
                };
                return self.finish(outcome);
            }
        }

        self.transition(BridgeState::Running);
        self.report(Severity::Informational, format!("Connected to {}", self.channel_id));
        log::info!(
            "bridging telemetry to {} every {:?}",
            self.channel_id,
            self.settings.interval
        );

        let mut snapshot = RawSnapshot::new();
        let mut next_tick = Instant::now();

        let outcome = loop {
            if self.stop_requested() {
                break RunOutcome::Cancelled;
            }

            if let Step::Finish(outcome) = self.cycle(&mut snapshot) {
                break outcome;
            }

            let now = Instant::now();
            while next_tick <= now {
                next_tick += self.settings.interval;
            }
            if self.sleep_until(next_tick) {
                break RunOutcome::Cancelled;
            }
        };

        self.transition(BridgeState::Stopping);
        self.finish(outcome)
    }

    fn cycle(&mut self, snapshot: &mut RawSnapshot) -> Step {
        let len = snapshot.fill_from(&mut *self.source);

        if len <= 0 {
            // the display gets one "no data" frame before the run ends
            if let Err(e) = self.write(&encode(None)) {
                return self.write_failed(e);
            }
            log::error!("telemetry source returned {len}, stopping");
            self.report(
                Severity::Critical,
                "Error getting telemetry data. Is the monitoring source installed and running?".to_string(),
            );
            return Step::Finish(RunOutcome::SourceUnavailable);
        }

        let line = match decode(snapshot.buffer(), len) {
            Ok(frame) => encode(Some(&frame)),
            Err(e) => match self.settings.decode_policy {
                DecodePolicy::Recover => {
                    log::warn!("{e}, sending fallback line");
                    self.report(Severity::Recoverable, format!("Bad telemetry data: {e}"));
                    encode(None)
                }
                DecodePolicy::Stop => {
                    log::error!("{e}, stopping");
                    self.report(Severity::Critical, format!("Bad telemetry data: {e}"));
                    return Step::Finish(RunOutcome::DecodeFailed(e.to_string()));
                }
            },
        };

        match self.write(&line) {
            Ok(()) => Step::Continue,
            Err(e) => self.write_failed(e),
        }
    }

    fn write(&mut self, line: &WireLine) -> Result<(), ChannelError> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ChannelError::WriteFailed(format!("{} is closed", self.channel_id)))?;
        channel.write_line(line.as_str())?;
        log::debug!("{} <- {line}", self.channel_id);
        let _ = self.events.send(BridgeEvent::LineSent(line.clone()));
        Ok(())
    }

    fn write_failed(&mut self, e: ChannelError) -> Step {
        log::error!("{}: {e}", self.channel_id);
        self.report(Severity::Critical, format!("Something went wrong: {e}"));
        self.release();
        let detail = match e {
            ChannelError::OpenFailed(detail) | ChannelError::WriteFailed(detail) => detail,
        };
        Step::Finish(RunOutcome::WriteFailed(detail))
    }

    fn stop_requested(&self) -> bool {
        match self.cancel.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Returns `true` when a stop arrived before `deadline`.
    fn sleep_until(&self, deadline: Instant) -> bool {
        match self.cancel.recv_deadline(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> RunOutcome {
        self.release();
        let state = outcome.final_state();
        self.transition(state);
        match &outcome {
            RunOutcome::Cancelled => {
                log::info!("{}: stopped", self.channel_id);
                self.report(Severity::Informational, "Stopped".to_string());
            }
            other => log::warn!("{}: run ended: {other}", self.channel_id),
        }
        let _ = self.events.send(BridgeEvent::Finished(outcome.clone()));
        outcome
    }

    fn transition(&mut self, next: BridgeState) {
        log::debug!("{}: {} -> {}", self.channel_id, self.state, next);
        self.state = next;
        let _ = self.events.send(BridgeEvent::StateChanged(next));
    }

    fn report(&self, severity: Severity, message: String) {
        let _ = self.events.send(BridgeEvent::Status { severity, message });
    }
}
