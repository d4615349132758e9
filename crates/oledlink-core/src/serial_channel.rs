use serialport::{SerialPort, SerialPortInfo};
use std::io::Write;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("open failed: {0}")]
    OpenFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// A serial endpoint as `oledlink list` shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port_name: String,
    pub kind: &'static str,
    /// USB vendor and product id.
    pub usb_ids: Option<(u16, u16)>,
    /// Manufacturer and product strings reported by a USB adapter.
    pub description: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        use serialport::SerialPortType::*;

        let mut port = Self { port_name: info.port_name, kind: "Unknown", usb_ids: None, description: None };
        match info.port_type {
            UsbPort(usb) => {
                port.kind = "USB";
                port.usb_ids = Some((usb.vid, usb.pid));
                let text: Vec<String> = [usb.manufacturer, usb.product].into_iter().flatten().collect();
                if !text.is_empty() {
                    port.description = Some(text.join(" "));
                }
            }
            PciPort => port.kind = "PCI",
            BluetoothPort => port.kind = "Bluetooth",
            Unknown => {}
        }
        port
    }
}

impl PortInfo {
    /// `NAME (VID:PID)` for USB adapters, the bare name otherwise.
    pub fn display_name(&self) -> String {
        match self.usb_ids {
            Some((vid, pid)) => format!("{} ({vid:04X}:{pid:04X})", self.port_name),
            None => self.port_name.clone(),
        }
    }
}

/// Enumerates serial endpoints. An enumeration failure reads as "no ports".
pub fn list_ports() -> Vec<PortInfo> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(PortInfo::from).collect(),
        Err(e) => {
            log::warn!("serial port enumeration failed: {e}");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    LF,
    CR,
    CRLF,
}

impl LineEnding {
    /// Bytes written after each wire line.
    pub fn terminator(self) -> &'static [u8] {
        match self {
            Self::LF => b"\n",
            Self::CR => b"\r",
            Self::CRLF => b"\r\n",
        }
    }
}

impl std::str::FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lf" => Ok(Self::LF),
            "cr" => Ok(Self::CR),
            "crlf" => Ok(Self::CRLF),
            other => Err(format!("unknown line ending: {other}")),
        }
    }
}

/// Link parameters. The device name travels separately as a `ChannelId`.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: serialport::DataBits,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
    pub flow_control: serialport::FlowControl,
    pub assert_dtr: bool,
    pub line_ending: LineEnding,
    pub write_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: serialport::DataBits::Eight,
            parity: serialport::Parity::None,
            stop_bits: serialport::StopBits::One,
            flow_control: serialport::FlowControl::Software,
            assert_dtr: true,
            line_ending: LineEnding::LF,
            write_timeout: Duration::from_millis(1000),
        }
    }
}

/// An open, exclusively owned serial connection.
pub trait SerialChannel: Send {
    /// Writes `line` and the configured terminator, then flushes.
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError>;

    /// Releases the device. Safe to call more than once.
    fn close(&mut self);
}

/// Opens channels by name. The seam between the bridge and real hardware.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, port_name: &str, cfg: &SerialConfig) -> Result<Box<dyn SerialChannel>, ChannelError>;
}

/// Opens physical ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl ChannelOpener for SystemPorts {
    fn open(&self, port_name: &str, cfg: &SerialConfig) -> Result<Box<dyn SerialChannel>, ChannelError> {
        let channel = SerialPortChannel::open(port_name, cfg)?;
        Ok(Box::new(channel))
    }
}

pub struct SerialPortChannel {
    port_name: String,
    line_ending: LineEnding,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortChannel {
    pub fn open(port_name: &str, cfg: &SerialConfig) -> Result<Self, ChannelError> {
        let mut port = serialport::new(port_name, cfg.baud_rate)
            .data_bits(cfg.data_bits)
            .parity(cfg.parity)
            .stop_bits(cfg.stop_bits)
            .flow_control(cfg.flow_control)
            .timeout(cfg.write_timeout)
            .open()
            .map_err(|e| ChannelError::OpenFailed(format!("{port_name}: {e}")))?;

        if cfg.assert_dtr {
            port.write_data_terminal_ready(true)
                .map_err(|e| ChannelError::OpenFailed(format!("{port_name}: asserting DTR: {e}")))?;
        }

        log::info!("opened {port_name} at {} baud", cfg.baud_rate);
        Ok(Self {
            port_name: port_name.to_string(),
            line_ending: cfg.line_ending,
            port: Some(port),
        })
    }

}

impl SerialChannel for SerialPortChannel {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ChannelError::WriteFailed(format!("{} is closed", self.port_name)))?;

        port.write_all(line.as_bytes())
            .and_then(|_| port.write_all(self.line_ending.terminator()))
            .and_then(|_| port.flush())
            .map_err(|e| ChannelError::WriteFailed(format!("{}: {e}", self.port_name)))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("closed {}", self.port_name);
        }
    }
}

impl Drop for SerialPortChannel {
    fn drop(&mut self) {
        self.close();
    }
}
