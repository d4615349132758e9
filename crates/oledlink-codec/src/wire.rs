use crate::frame::TelemetryFrame;
use std::fmt;

/// Marks the end of a record for the display firmware.
pub const LINE_SENTINEL: char = '$';

/// Sent whenever there is no valid frame to forward.
pub const FALLBACK_LINE: &str = "0C;0C;0.00;$";

/// One encoded record, without the serial line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLine(String);

impl WireLine {
    pub fn fallback() -> Self {
        Self(FALLBACK_LINE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_LINE
    }
}

impl fmt::Display for WireLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formats `frame` as `<tA>C;<tB>C;<load>;$`, or the fallback line for `None`.
///
/// Temperatures are rounded to whole degrees and load to two decimals, both
/// half away from zero on the shortest decimal form of the reading, so `1.005`
/// becomes `1.01` even though its binary value sits just below the tie.
pub fn encode(frame: Option<&TelemetryFrame>) -> WireLine {
    let Some(frame) = frame else {
        return WireLine::fallback();
    };
    WireLine(format!(
        "{}C;{}C;{};{}",
        format_rounded(frame.temperature_a, 0),
        format_rounded(frame.temperature_b, 0),
        format_rounded(frame.load, 2),
        LINE_SENTINEL,
    ))
}

fn format_rounded(value: f64, decimals: usize) -> String {
    let shortest = value.abs().to_string();
    let (int, frac) = shortest.split_once('.').unwrap_or((shortest.as_str(), ""));

    let mut digits: Vec<u8> = int
        .bytes()
        .chain(frac.bytes().chain(std::iter::repeat(b'0')).take(decimals))
        .collect();

    if frac.as_bytes().get(decimals).map_or(false, |&d| d >= b'5') {
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, b'1');
                break;
            }
            i -= 1;
            if digits[i] == b'9' {
                digits[i] = b'0';
            } else {
                digits[i] += 1;
                break;
            }
        }
    }

    let split = digits.len() - decimals;
    let mut out = String::with_capacity(digits.len() + 2);
    // "-0" and "-0.00" are printed unsigned
    if value.is_sign_negative() && digits.iter().any(|&d| d != b'0') {
        out.push('-');
    }
    out.extend(digits[..split].iter().map(|&d| d as char));
    if decimals > 0 {
        out.push('.');
        out.extend(digits[split..].iter().map(|&d| d as char));
    }
    out
}
