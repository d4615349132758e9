#![allow(dead_code)]

use oledlink_core::{ChannelError, ChannelOpener, SerialChannel, SerialConfig, TelemetrySource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Call counts shared between a test and the fakes it hands to the service.
#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub writes: AtomicUsize,
    pub closes: AtomicUsize,
    pub polls: AtomicUsize,
    pub lines: Mutex<Vec<String>>,
    pub opened_ports: Mutex<Vec<String>>,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

pub struct FakePorts {
    pub counters: Arc<Counters>,
    pub fail_open: bool,
    /// Number of writes that succeed before every further write fails.
    pub fail_write_after: Option<usize>,
}

impl FakePorts {
    pub fn new(counters: &Arc<Counters>) -> Self {
        Self { counters: Arc::clone(counters), fail_open: false, fail_write_after: None }
    }
}

impl ChannelOpener for FakePorts {
    fn open(&self, port_name: &str, _cfg: &SerialConfig) -> Result<Box<dyn SerialChannel>, ChannelError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.counters.opened_ports.lock().push(port_name.to_string());
        if self.fail_open {
            return Err(ChannelError::OpenFailed(format!("{port_name}: access denied")));
        }
        Ok(Box::new(FakeChannel {
            counters: Arc::clone(&self.counters),
            fail_write_after: self.fail_write_after,
            written: 0,
        }))
    }
}

struct FakeChannel {
    counters: Arc<Counters>,
    fail_write_after: Option<usize>,
    written: usize,
}

impl SerialChannel for FakeChannel {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_write_after.map_or(false, |n| self.written >= n) {
            return Err(ChannelError::WriteFailed("device unplugged".to_string()));
        }
        self.written += 1;
        self.counters.lines.lock().push(line.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Data(&'static str),
    NoData,
}

/// Replies from a script, then repeats `then` forever.
pub struct ScriptedSource {
    counters: Arc<Counters>,
    script: VecDeque<Reply>,
    then: Reply,
}

impl ScriptedSource {
    pub fn new(counters: &Arc<Counters>, script: &[Reply], then: Reply) -> Self {
        Self {
            counters: Arc::clone(counters),
            script: script.iter().copied().collect(),
            then,
        }
    }
}

impl TelemetrySource for ScriptedSource {
    fn poll(&mut self, buffer: &mut [u8]) -> i32 {
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front().unwrap_or(self.then) {
            Reply::Data(text) => {
                buffer[..text.len()].copy_from_slice(text.as_bytes());
                text.len() as i32
            }
            Reply::NoData => 0,
        }
    }
}
