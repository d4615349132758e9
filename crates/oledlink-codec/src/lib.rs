//! Telemetry snapshot parsing and the display's wire line format.

pub mod frame;
pub mod wire;

pub use frame::{decode, DecodeError, TelemetryFrame, SNAPSHOT_CAPACITY};
pub use wire::{encode, WireLine, FALLBACK_LINE, LINE_SENTINEL};
