//! Telemetry sources and the timeout wrapper the bridge polls through.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use oledlink_codec::SNAPSHOT_CAPACITY;
use std::fmt::Write as _;
use std::time::Duration;

/// Something that fills a buffer with `a;b;c;` ASCII telemetry.
///
/// `poll` returns the number of bytes written. Zero or a negative value means
/// no data is available right now.
pub trait TelemetrySource: Send {
    fn poll(&mut self, buffer: &mut [u8]) -> i32;
}

impl<S: TelemetrySource + ?Sized> TelemetrySource for Box<S> {
    fn poll(&mut self, buffer: &mut [u8]) -> i32 {
        (**self).poll(buffer)
    }
}

/// Fixed-capacity buffer handed to a source once per cycle.
#[derive(Clone)]
pub struct RawSnapshot {
    buf: [u8; SNAPSHOT_CAPACITY],
    len: i32,
}

impl RawSnapshot {
    pub fn new() -> Self {
        Self { buf: [0; SNAPSHOT_CAPACITY], len: 0 }
    }

    /// Clears the buffer and polls `source` into it.
    pub fn fill_from(&mut self, source: &mut dyn TelemetrySource) -> i32 {
        self.buf.fill(0);
        self.len = source.poll(&mut self.buf);
        self.len
    }

    /// Length as reported by the source, possibly zero or negative.
    pub fn len(&self) -> i32 {
        self.len
    }

    pub fn has_data(&self) -> bool {
        self.len > 0
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// The reported bytes, clamped to the buffer; empty when there is no data.
    pub fn payload(&self) -> &[u8] {
        if self.len <= 0 {
            return &[];
        }
        &self.buf[..(self.len as usize).min(SNAPSHOT_CAPACITY)]
    }
}

impl Default for RawSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RawSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSnapshot")
            .field("len", &self.len)
            .field("payload", &String::from_utf8_lossy(self.payload()))
            .finish()
    }
}

/// Runs a source on its own thread and bounds every poll by `timeout`.
///
/// An expired wait reads as zero bytes. The answer that eventually arrives is
/// dropped, and until it does every poll returns zero without calling the
/// inner source again.
pub struct TimedSource {
    timeout: Duration,
    tx_req: Sender<u64>,
    rx_resp: Receiver<(u64, RawSnapshot)>,
    next_seq: u64,
    in_flight: Option<u64>,
}

impl TimedSource {
    pub fn spawn<S>(mut source: S, timeout: Duration) -> std::io::Result<Self>
    where
        S: TelemetrySource + 'static,
    {
        let (tx_req, rx_req) = unbounded::<u64>();
        let (tx_resp, rx_resp) = unbounded::<(u64, RawSnapshot)>();

        std::thread::Builder::new()
            .name("telemetry-poll".to_string())
            .spawn(move || {
                for seq in rx_req.iter() {
                    let mut snapshot = RawSnapshot::new();
                    snapshot.fill_from(&mut source);
                    if tx_resp.send((seq, snapshot)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self { timeout, tx_req, rx_resp, next_seq: 0, in_flight: None })
    }
}

impl TelemetrySource for TimedSource {
    fn poll(&mut self, buffer: &mut [u8]) -> i32 {
        while let Ok((seq, _late)) = self.rx_resp.try_recv() {
            log::debug!("discarding late telemetry answer #{seq}");
            if self.in_flight == Some(seq) {
                self.in_flight = None;
            }
        }
        if let Some(seq) = self.in_flight {
            log::debug!("telemetry poll #{seq} still outstanding");
            return 0;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if self.tx_req.send(seq).is_err() {
            log::error!("telemetry poll thread is gone");
            return 0;
        }
        self.in_flight = Some(seq);

        match self.rx_resp.recv_timeout(self.timeout) {
            Ok((_, snapshot)) => {
                self.in_flight = None;
                let payload = snapshot.payload();
                let n = payload.len().min(buffer.len());
                buffer[..n].copy_from_slice(&payload[..n]);
                if snapshot.len() <= 0 {
                    snapshot.len()
                } else {
                    n as i32
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("telemetry poll timed out after {:?}", self.timeout);
                0
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("telemetry poll thread exited");
                self.in_flight = None;
                0
            }
        }
    }
}

/// Deterministic readings in the native accessor's `%.2f;%.2f;%.2f;` layout.
#[derive(Debug, Default, Clone)]
pub struct SimulatedSource {
    tick: u64,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetrySource for SimulatedSource {
    fn poll(&mut self, buffer: &mut [u8]) -> i32 {
        let t = self.tick as f64;
        self.tick += 1;

        let cpu = 48.0 + 9.0 * (t / 11.0).sin();
        let gpu = 57.0 + 14.0 * (t / 7.0).sin();
        let fps = 90.0 + 30.0 * (t / 5.0).cos();

        let mut packet = String::with_capacity(32);
        let _ = write!(packet, "{cpu:.2};{gpu:.2};{fps:.2};");

        buffer.fill(0);
        let n = packet.len().min(buffer.len());
        buffer[..n].copy_from_slice(&packet.as_bytes()[..n]);
        n as i32
    }
}

#[cfg(feature = "afterburner")]
pub use afterburner::AfterburnerSource;

#[cfg(feature = "afterburner")]
mod afterburner {
    use super::TelemetrySource;
    use std::os::raw::{c_char, c_int};

    #[link(name = "OLEDThing")]
    extern "C" {
        fn GetAfterburnerData(buf: *mut c_char, max_len: c_int) -> c_int;
    }

    /// CPU temperature, GPU temperature and framerate from MSI Afterburner's
    /// shared memory, through the `OLEDThing` accessor library.
    #[derive(Debug, Default)]
    pub struct AfterburnerSource;

    impl TelemetrySource for AfterburnerSource {
        fn poll(&mut self, buffer: &mut [u8]) -> i32 {
            let max_len = buffer.len().min(c_int::MAX as usize) as c_int;
            // SAFETY: the accessor zeroes and writes at most `max_len` bytes of `buffer`.
            unsafe { GetAfterburnerData(buffer.as_mut_ptr().cast::<c_char>(), max_len) }
        }
    }
}
