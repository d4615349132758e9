use serde::{Deserialize, Serialize};

/// Size of the buffer handed to the telemetry accessor.
pub const SNAPSHOT_CAPACITY: usize = 300;

const FIELD_SEPARATOR: char = ';';

/// One decoded reading: two temperatures and a load value, in accessor order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub temperature_a: f64,
    pub temperature_b: f64,
    pub load: f64,
}

impl TelemetryFrame {
    pub fn new(temperature_a: f64, temperature_b: f64, load: f64) -> Self {
        Self { temperature_a, temperature_b, load }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed telemetry payload: {0}")]
    Malformed(String),
}

/// Parses the first `length` bytes of `raw` as `a;b;c[;...]`.
///
/// `length` is clamped to the buffer. Fields past the third are ignored, so the
/// accessor's trailing separator is accepted. Each field must be a finite
/// base-10 number.
pub fn decode(raw: &[u8], length: i32) -> Result<TelemetryFrame, DecodeError> {
    if length <= 0 {
        return Err(DecodeError::Malformed(format!("no payload (length {length})")));
    }
    let len = (length as usize).min(raw.len());
    let payload = &raw[..len];

    if !payload.is_ascii() {
        return Err(DecodeError::Malformed("payload is not ASCII".to_string()));
    }
    // ASCII is valid UTF-8, this cannot fail after the check above
    let text = std::str::from_utf8(payload)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?
        .trim_end_matches('\0');

    let mut fields = text.split(FIELD_SEPARATOR);
    let temperature_a = parse_field(fields.next(), 0)?;
    let temperature_b = parse_field(fields.next(), 1)?;
    let load = parse_field(fields.next(), 2)?;

    Ok(TelemetryFrame { temperature_a, temperature_b, load })
}

fn parse_field(field: Option<&str>, index: usize) -> Result<f64, DecodeError> {
    let field = field
        .map(str::trim)
        .ok_or_else(|| DecodeError::Malformed(format!("expected 3 fields, found {index}")))?;

    if field.is_empty() {
        return Err(DecodeError::Malformed(format!("field {index} is empty")));
    }
    // f64::from_str also accepts "inf" and "NaN"; only plain decimals are valid here
    if !field
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
    {
        return Err(DecodeError::Malformed(format!("field {index} is not a number: {field:?}")));
    }

    match field.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(_) => Err(DecodeError::Malformed(format!("field {index} is out of range: {field:?}"))),
        Err(e) => Err(DecodeError::Malformed(format!("field {index} ({field:?}): {e}"))),
    }
}
