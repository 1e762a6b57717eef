/// Notification payload decoding
///
/// The sensor firmware notifies ASCII text such as `Analog:512,Avg:812.40`,
/// which reaches us base64-encoded. Parsing is deliberately tolerant:
/// unknown labels are skipped and a missing `Analog` or `Avg` field reads
/// as `0` instead of rejecting the notification.
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;

use crate::error::DecodeError;
use crate::models::Reading;

const ANALOG_LABEL: &str = "Analog";
const AVERAGE_LABEL: &str = "Avg";

/// Decode a base64 notification payload into a reading
pub fn decode(payload: &str) -> Result<Reading, DecodeError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::Encoding(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| DecodeError::Encoding(e.to_string()))?;
    parse_fields(&text)
}

/// Encode a raw characteristic value into the base64 wire form
pub fn encode(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// Parse the decoded `label:value` list
///
/// Later occurrences of a label overwrite earlier ones.
pub fn parse_fields(text: &str) -> Result<Reading, DecodeError> {
    let mut reading = Reading {
        analog: 0,
        average_time_ms: 0.0,
    };

    // Firmware strings are sometimes NUL padded
    let text = text.trim_end_matches('\0');

    for field in text.split(',') {
        let mut parts = field.split(':');
        let label = parts.next().unwrap_or_default();
        let value = parts.next();

        match label {
            ANALOG_LABEL => {
                let raw = value.unwrap_or_default();
                reading.analog = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| malformed(label, raw))?;
            }
            AVERAGE_LABEL => {
                let raw = value.unwrap_or_default();
                let average = raw
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| malformed(label, raw))?;
                if !average.is_finite() {
                    return Err(malformed(label, raw));
                }
                reading.average_time_ms = average;
            }
            other => {
                if !other.is_empty() {
                    debug!("Ignoring unknown payload label '{}'", other);
                }
            }
        }
    }

    Ok(reading)
}

fn malformed(label: &str, value: &str) -> DecodeError {
    DecodeError::Malformed {
        label: label.to_string(),
        value: value.to_string(),
    }
}
