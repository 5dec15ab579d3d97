//! Soil reading records and the defensive frame-to-record mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// One reading as transmitted by the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilReading {
    pub temperature: f64,
    pub moisture: f64,
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
    pub ph: f64,
    pub conductivity: f64,
    /// Device-supplied identifier of the reading; the dedup key.
    pub timestamp: String,
    pub location: Location,
}

impl SoilReading {
    pub fn channels(&self) -> [f64; 7] {
        [
            self.temperature,
            self.moisture,
            self.nitrogen,
            self.phosphorus,
            self.potassium,
            self.ph,
            self.conductivity,
        ]
    }

    /// A reading carries signal if at least one channel is positive.
    pub fn has_signal(&self) -> bool {
        self.channels().iter().any(|&v| v > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhStatus {
    Acidic,
    Neutral,
    Alkaline,
}

impl PhStatus {
    pub fn classify(ph: f64) -> Self {
        if ph < 6.0 {
            Self::Acidic
        } else if ph > 7.5 {
            Self::Alkaline
        } else {
            Self::Neutral
        }
    }
}

/// A reading as persisted by the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSoilRecord {
    pub id: String,
    pub data: SoilReading,
    /// RFC 3339 time the record was written, not the device timestamp.
    pub date_saved: String,
    pub ph_status: PhStatus,
}

// ---------------------------------------------------------------------------
// Drop classification
// ---------------------------------------------------------------------------

/// Why a chunk or frame did not produce a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Notification payload failed to decode.
    UndecodableChunk,
    /// A frame marker arrived with no `{ ... }` span before it.
    NoJsonSpan,
    MalformedJson(String),
    MissingField(&'static str),
    /// Every channel was zero, absent, or non-numeric.
    NoSignal,
}

impl DropReason {
    /// Stable short name used as a counter key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UndecodableChunk => "undecodable_chunk",
            Self::NoJsonSpan => "no_json_span",
            Self::MalformedJson(_) => "malformed_json",
            Self::MissingField(_) => "missing_field",
            Self::NoSignal => "no_signal",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndecodableChunk => write!(f, "undecodable notification payload"),
            Self::NoJsonSpan => write!(f, "no JSON object before frame marker"),
            Self::MalformedJson(e) => write!(f, "malformed JSON: {e}"),
            Self::MissingField(name) => write!(f, "missing field '{name}'"),
            Self::NoSignal => write!(f, "no positive channel value"),
        }
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Coerce a loosely typed JSON value to a number.
///
/// Absent, null, and blank values become 0; strings are parsed; anything
/// that ends up non-finite becomes 0.
pub fn coerce_number(v: Option<&Value>) -> f64 {
    let n = match v {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse::<f64>().unwrap_or(0.0)
            }
        }
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Parse a candidate JSON span into a validated reading.
pub fn parse_frame(span: &str) -> Result<SoilReading, DropReason> {
    let value: Value =
        serde_json::from_str(span).map_err(|e| DropReason::MalformedJson(e.to_string()))?;
    map_frame(&value)
}

/// Map a parsed frame object into a reading.
///
/// Frames without a `parameters` object, a `location` object, or a
/// `timestamp` are rejected whole; readings without signal are rejected.
pub fn map_frame(value: &Value) -> Result<SoilReading, DropReason> {
    let params = value
        .get("parameters")
        .and_then(Value::as_object)
        .ok_or(DropReason::MissingField("parameters"))?;
    let location = value
        .get("location")
        .and_then(Value::as_object)
        .ok_or(DropReason::MissingField("location"))?;
    let timestamp = match value.get("timestamp") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(DropReason::MissingField("timestamp")),
    };

    let reading = SoilReading {
        temperature: coerce_number(params.get("temperature")),
        moisture: coerce_number(params.get("moisture")),
        nitrogen: coerce_number(params.get("nitrogen")),
        phosphorus: coerce_number(params.get("phosphorus")),
        potassium: coerce_number(params.get("potassium")),
        ph: coerce_number(params.get("ph_value")),
        conductivity: coerce_number(params.get("conductivity")),
        timestamp,
        location: Location {
            latitude: coerce_number(location.get("latitude")),
            longitude: coerce_number(location.get("longitude")),
        },
    };

    if !reading.has_signal() {
        return Err(DropReason::NoSignal);
    }
    Ok(reading)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(params: Value) -> Value {
        json!({
            "parameters": params,
            "timestamp": "T1",
            "location": { "latitude": 20.3, "longitude": 85.8 },
        })
    }

    // -- coerce_number ------------------------------------------------------

    #[test]
    fn coerce_absent_null_blank_to_zero() {
        assert_eq!(coerce_number(None), 0.0);
        assert_eq!(coerce_number(Some(&Value::Null)), 0.0);
        assert_eq!(coerce_number(Some(&json!(""))), 0.0);
        assert_eq!(coerce_number(Some(&json!("   "))), 0.0);
    }

    #[test]
    fn coerce_numeric_strings() {
        assert_eq!(coerce_number(Some(&json!("6.8"))), 6.8);
        assert_eq!(coerce_number(Some(&json!(" 42 "))), 42.0);
    }

    #[test]
    fn coerce_garbage_to_zero() {
        assert_eq!(coerce_number(Some(&json!("abc"))), 0.0);
        assert_eq!(coerce_number(Some(&json!("NaN"))), 0.0);
        assert_eq!(coerce_number(Some(&json!("inf"))), 0.0);
        assert_eq!(coerce_number(Some(&json!([1, 2]))), 0.0);
        assert_eq!(coerce_number(Some(&json!({"v": 1}))), 0.0);
    }

    #[test]
    fn coerce_bools() {
        assert_eq!(coerce_number(Some(&json!(true))), 1.0);
        assert_eq!(coerce_number(Some(&json!(false))), 0.0);
    }

    // -- map_frame ----------------------------------------------------------

    #[test]
    fn map_full_frame() {
        let v = frame(json!({
            "temperature": 24.5,
            "moisture": 38,
            "nitrogen": 140,
            "phosphorus": 45,
            "potassium": 180,
            "ph_value": 6.8,
            "conductivity": 620,
        }));
        let r = map_frame(&v).unwrap();
        assert_eq!(r.temperature, 24.5);
        assert_eq!(r.ph, 6.8);
        assert_eq!(r.conductivity, 620.0);
        assert_eq!(r.timestamp, "T1");
        assert_eq!(r.location, Location { latitude: 20.3, longitude: 85.8 });
    }

    #[test]
    fn map_defaults_missing_channels() {
        let r = map_frame(&frame(json!({ "ph_value": 6.8 }))).unwrap();
        assert_eq!(r.ph, 6.8);
        assert_eq!(r.nitrogen, 0.0);
        assert_eq!(r.moisture, 0.0);
    }

    #[test]
    fn map_rejects_all_zero() {
        let v = frame(json!({
            "temperature": 0, "moisture": "", "nitrogen": null, "ph_value": "abc"
        }));
        assert_eq!(map_frame(&v), Err(DropReason::NoSignal));
        assert_eq!(map_frame(&frame(json!({}))), Err(DropReason::NoSignal));
    }

    #[test]
    fn map_negative_only_has_no_signal() {
        let v = frame(json!({ "temperature": -3.5 }));
        assert_eq!(map_frame(&v), Err(DropReason::NoSignal));
    }

    #[test]
    fn map_requires_parameters_object() {
        let v = json!({ "timestamp": "T1", "location": {} });
        assert_eq!(map_frame(&v), Err(DropReason::MissingField("parameters")));
        let v = json!({ "parameters": 5, "timestamp": "T1", "location": {} });
        assert_eq!(map_frame(&v), Err(DropReason::MissingField("parameters")));
    }

    #[test]
    fn map_requires_location_object() {
        let v = json!({ "parameters": { "ph_value": 7 }, "timestamp": "T1" });
        assert_eq!(map_frame(&v), Err(DropReason::MissingField("location")));
    }

    #[test]
    fn map_requires_timestamp() {
        let v = json!({ "parameters": { "ph_value": 7 }, "location": {} });
        assert_eq!(map_frame(&v), Err(DropReason::MissingField("timestamp")));
        let v = json!({ "parameters": { "ph_value": 7 }, "location": {}, "timestamp": "" });
        assert_eq!(map_frame(&v), Err(DropReason::MissingField("timestamp")));
    }

    #[test]
    fn map_numeric_timestamp_is_stringified() {
        let v = json!({ "parameters": { "ph_value": 7 }, "location": {}, "timestamp": 1700000000 });
        assert_eq!(map_frame(&v).unwrap().timestamp, "1700000000");
    }

    #[test]
    fn map_malformed_location_defaults_to_origin() {
        let v = json!({
            "parameters": { "moisture": 30 },
            "timestamp": "T1",
            "location": { "latitude": "north", "longitude": null },
        });
        assert_eq!(map_frame(&v).unwrap().location, Location::default());
    }

    #[test]
    fn parse_frame_reports_malformed_json() {
        let err = parse_frame(r#"{"parameters":{"ph_value":6"#).unwrap_err();
        assert_eq!(err.kind(), "malformed_json");
    }

    // -- PhStatus -----------------------------------------------------------

    #[test]
    fn ph_classification_boundaries() {
        assert_eq!(PhStatus::classify(5.99), PhStatus::Acidic);
        assert_eq!(PhStatus::classify(6.0), PhStatus::Neutral);
        assert_eq!(PhStatus::classify(7.5), PhStatus::Neutral);
        assert_eq!(PhStatus::classify(7.51), PhStatus::Alkaline);
    }

    #[test]
    fn stored_record_serializes_camel_case() {
        let rec = StoredSoilRecord {
            id: "abc".into(),
            data: map_frame(&frame(json!({ "ph_value": 6.8 }))).unwrap(),
            date_saved: "2025-03-14T06:00:00Z".into(),
            ph_status: PhStatus::Neutral,
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["dateSaved"], "2025-03-14T06:00:00Z");
        assert_eq!(json["phStatus"], "neutral");
        assert_eq!(json["data"]["ph"], 6.8);
    }
}
