use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{SensorRecord, STATUS_UNKNOWN};

pub const TEMPERATURE_MARKER: char = '℃';
pub const DEFAULT_DEVICE_NAME: &str = "Unknown";
pub const UNSET_LOCATION: &str = "未設定";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("init() payload not found in page")]
    InitCallNotFound,
    #[error("init() payload is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("regDevList.list missing from payload")]
    MissingDeviceList,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    pub keep_undecodable: bool,
}

pub fn extract(html: &str) -> Vec<SensorRecord> {
    extract_with(html, ExtractOptions::default())
}

pub fn extract_with(html: &str, options: ExtractOptions) -> Vec<SensorRecord> {
    match try_extract(html, options) {
        Ok(records) => records,
        Err(err) => {
            warn!(error = %err, "no sensor data in settings page");
            Vec::new()
        }
    }
}

pub fn try_extract(html: &str, options: ExtractOptions) -> Result<Vec<SensorRecord>, PayloadError> {
    let payload = init_payload(html).ok_or(PayloadError::InitCallNotFound)?;
    let data: Value = serde_json::from_str(payload)?;

    let devices = data
        .get("regDevList")
        .and_then(|list| list.get("list"))
        .and_then(Value::as_array)
        .ok_or(PayloadError::MissingDeviceList)?;

    let mut records = Vec::new();
    for device in devices {
        let Some(record) = decode_device(device) else {
            continue;
        };

        if !record.has_reading() && !options.keep_undecodable {
            debug!(
                device_id = %record.device_id,
                label = %record.raw_label,
                "dropping sensor with undecodable label"
            );
            continue;
        }

        debug!(
            device_id = %record.device_id,
            name = %record.name,
            temperature = ?record.temperature,
            humidity = ?record.humidity,
            "decoded sensor"
        );
        records.push(record);
    }

    Ok(records)
}

fn init_payload(html: &str) -> Option<&str> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?s)init\((\{.*?\})\);</script>").expect("init payload pattern")
    });

    pattern
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|payload| payload.as_str())
}

fn decode_device(device: &Value) -> Option<SensorRecord> {
    let state = device.get("state")?;
    let label = state
        .get("label")
        .and_then(Value::as_str)
        .filter(|label| label.contains(TEMPERATURE_MARKER))?;

    Some(SensorRecord {
        device_id: node_id(device.get("nodeId")),
        name: string_or(device.get("deviceName"), DEFAULT_DEVICE_NAME),
        location: string_or(device.get("location"), UNSET_LOCATION),
        temperature: parse_temperature(label),
        humidity: parse_humidity(label),
        status: string_or(state.get("connection"), STATUS_UNKNOWN),
        raw_label: label.to_string(),
    })
}

fn node_id(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

// Digits from other scripts stay as they are and fail to parse.
fn ascii_digits(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            _ => c,
        })
        .collect()
}

fn string_or(value: Option<&Value>, fallback: &str) -> String {
    value
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

// `\d` is Unicode-aware, so full-width digits (`２.６℃`) match too.
pub fn parse_temperature(label: &str) -> Option<f64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"(-?\d+(?:\.\d+)?)℃").expect("temperature pattern"));

    let raw = ascii_digits(pattern.captures(label)?.get(1)?.as_str());
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn parse_humidity(label: &str) -> Option<u8> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"(\d+)[％%]").expect("humidity pattern"));

    let raw = ascii_digits(pattern.captures(label)?.get(1)?.as_str());
    match raw.parse::<u8>() {
        Ok(value) if value <= 100 => Some(value),
        _ => {
            debug!(label, "humidity out of range");
            None
        }
    }
}
