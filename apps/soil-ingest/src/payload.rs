use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use simd_json::prelude::ValueAsScalar;
use serde_json::Number;
use simd_json::BorrowedValue;

pub const UPTIME_TAG: &str = "#SYS_UPTIME";

const EXCLUDED_TAG_PATTERNS: [&str; 4] =
    ["#SYS_", "Calibration", "Coefficient", "Device_Address"];
const RAW_TAG_PATTERNS: [&str; 2] = ["Calibration", "Coefficient"];
const OFFSET_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M%#z",
    "%Y-%m-%d %H:%M%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
];
const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// How a raw protocol integer maps to an engineering value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    /// One implied decimal digit: `250` means `25.0`.
    Tenths,
    Raw,
}

impl Scaling {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Scaling::Tenths => raw / 10.0,
            Scaling::Raw => raw,
        }
    }
}

#[derive(Debug)]
pub struct SensorType {
    pub name: &'static str,
    pub unit: &'static str,
    pub scaling: Scaling,
}

const SENSOR_TYPES: &[SensorType] = &[
    SensorType { name: "temperature", unit: "°C", scaling: Scaling::Tenths },
    SensorType { name: "moisture", unit: "%", scaling: Scaling::Tenths },
    SensorType { name: "humidity", unit: "%", scaling: Scaling::Tenths },
    SensorType { name: "ph", unit: "pH", scaling: Scaling::Tenths },
    SensorType { name: "conductivity", unit: "μS/cm", scaling: Scaling::Raw },
    SensorType { name: "tds", unit: "ppm", scaling: Scaling::Tenths },
    SensorType { name: "salinity", unit: "ppt", scaling: Scaling::Tenths },
    SensorType { name: "nitrogen", unit: "mg/kg", scaling: Scaling::Raw },
    SensorType { name: "phosphorus", unit: "mg/kg", scaling: Scaling::Raw },
    SensorType { name: "potassium", unit: "mg/kg", scaling: Scaling::Raw },
    SensorType { name: "device_address", unit: "", scaling: Scaling::Raw },
    SensorType { name: "device_baud_rate", unit: "bps", scaling: Scaling::Raw },
];

pub fn lookup_sensor_type(name: &str) -> Option<&'static SensorType> {
    SENSOR_TYPES.iter().find(|known| known.name == name)
}

/// Known types use their table entry; anything else is read as tenths unless
/// the tag marks it as a calibration constant.
pub fn scaling_for(sensor_type: &str, tag: &str) -> Scaling {
    if let Some(known) = lookup_sensor_type(sensor_type) {
        return known.scaling;
    }
    if RAW_TAG_PATTERNS.iter().any(|pattern| tag.contains(pattern)) {
        Scaling::Raw
    } else {
        Scaling::Tenths
    }
}

pub fn is_excluded_tag(tag: &str) -> bool {
    EXCLUDED_TAG_PATTERNS
        .iter()
        .any(|pattern| tag.contains(pattern))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub gateway_uid: String,
    pub sensor_uid: String,
    pub sensor_type: &'static str,
    pub value: f64,
    /// The device's number as sent, integral values staying integral.
    pub raw_value: Number,
    pub unit: &'static str,
    pub timestamp: DateTime<Utc>,
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    pub readings: Vec<Reading>,
    pub uptime_seconds: Option<i64>,
}

/// Normalizes a decoded device document of the shape
/// `{"d": [{"tag": "...", "value": ...}], "ts": "..."}`.
///
/// Never fails: a document that does not have that shape yields an empty
/// result and a warning.
pub fn parse_payload(
    gateway_uid: &str,
    sensor_uid: &str,
    document: &BorrowedValue<'_>,
    now: DateTime<Utc>,
) -> ParsedPayload {
    let BorrowedValue::Object(root) = document else {
        tracing::warn!(
            gateway = %gateway_uid,
            sensor = %sensor_uid,
            "payload is not a JSON object"
        );
        return ParsedPayload::default();
    };

    let entries = match root.get("d") {
        Some(BorrowedValue::Array(entries)) if !entries.is_empty() => entries,
        Some(BorrowedValue::Array(_)) | None => {
            tracing::warn!(
                gateway = %gateway_uid,
                sensor = %sensor_uid,
                "payload carries no data entries"
            );
            return ParsedPayload::default();
        }
        Some(_) => {
            tracing::warn!(
                gateway = %gateway_uid,
                sensor = %sensor_uid,
                "payload field `d` is not an array"
            );
            return ParsedPayload::default();
        }
    };

    let timestamp = root
        .get("ts")
        .and_then(|value| value.as_str())
        .and_then(parse_timestamp)
        .unwrap_or(now);

    let uptime_seconds = extract_uptime(entries);
    if let Some(uptime) = uptime_seconds {
        tracing::debug!(gateway = %gateway_uid, uptime, "extracted device uptime");
    }

    let readings = entries
        .iter()
        .filter_map(|entry| parse_entry(gateway_uid, sensor_uid, entry, timestamp))
        .collect();

    ParsedPayload {
        readings,
        uptime_seconds,
    }
}

fn extract_uptime(entries: &[BorrowedValue<'_>]) -> Option<i64> {
    entries.iter().find_map(|entry| {
        let BorrowedValue::Object(item) = entry else {
            return None;
        };
        if item.get("tag").and_then(|value| value.as_str()) != Some(UPTIME_TAG) {
            return None;
        }
        let raw = item.get("value").and_then(numeric)?;
        raw.as_i64().or_else(|| raw.as_f64().map(|value| value as i64))
    })
}

fn parse_entry(
    gateway_uid: &str,
    sensor_uid: &str,
    entry: &BorrowedValue<'_>,
    timestamp: DateTime<Utc>,
) -> Option<Reading> {
    let BorrowedValue::Object(item) = entry else {
        return None;
    };
    let tag = item
        .get("tag")
        .and_then(|value| value.as_str())
        .filter(|tag| !tag.is_empty())?;
    let raw_value = item.get("value").and_then(numeric)?;
    if is_excluded_tag(tag) {
        return None;
    }

    let (_, name) = tag.split_once(':')?;
    let sensor_type = lookup_sensor_type(&name.trim().to_ascii_lowercase())?;
    let value = scaling_for(sensor_type.name, tag).apply(raw_value.as_f64()?);

    Some(Reading {
        gateway_uid: gateway_uid.to_string(),
        sensor_uid: sensor_uid.to_string(),
        sensor_type: sensor_type.name,
        value,
        raw_value,
        unit: sensor_type.unit,
        timestamp,
        tag: tag.to_string(),
    })
}

/// Non-finite floats yield `None`.
fn numeric(value: &BorrowedValue<'_>) -> Option<Number> {
    value
        .as_i64()
        .map(Number::from)
        .or_else(|| value.as_u64().map(Number::from))
        .or_else(|| value.as_f64().and_then(Number::from_f64))
}

/// ISO-8601 with `Z` or an explicit offset, normalized to UTC. Seconds may
/// be omitted. Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    let with_offset = match trimmed.strip_suffix(['Z', 'z']) {
        Some(head) => format!("{head}+00:00"),
        None => trimmed.to_string(),
    };
    if let Some(parsed) = OFFSET_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(&with_offset, format).ok())
    {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
