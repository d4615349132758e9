//! Core functionalities: serial channel, telemetry sources, the bridge loop.

pub mod serial_channel;
pub mod source;
pub mod bridge;
pub mod service;

pub use serial_channel::{
    list_ports, ChannelError, ChannelOpener, LineEnding, PortInfo, SerialChannel, SerialConfig,
    SerialPortChannel, SystemPorts,
};
pub use source::{RawSnapshot, SimulatedSource, TelemetrySource, TimedSource};
#[cfg(feature = "afterburner")]
pub use source::AfterburnerSource;
pub use bridge::{
    BridgeEvent, BridgeSettings, BridgeState, ChannelId, ConfigError, DecodePolicy, RunOutcome,
    Severity, DEFAULT_INTERVAL, DEFAULT_POLL_TIMEOUT,
};
pub use service::{BridgeService, RunHandle, ServiceError};
