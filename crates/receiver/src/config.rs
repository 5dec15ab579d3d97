//! TOML config file loading and validation for the device link, the
//! transfer protocol, and the transport backend.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub protocol: ProtocolConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Exact advertised name of the probe.
    pub name: String,
    pub service_uuid: String,
    pub transfer_uuid: String,
    pub mtu: u16,
    pub scan_timeout_sec: u64,
    pub connect_timeout_sec: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "AGNI-SOIL-SENSOR".into(),
            service_uuid: "12345678-1234-1234-1234-123456789abc".into(),
            transfer_uuid: "abcdef12-3456-7890-1234-567890abcdef".into(),
            mtu: 512,
            scan_timeout_sec: 30,
            connect_timeout_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Base64,
    Raw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub payload_encoding: PayloadEncoding,
    pub frame_end_marker: String,
    pub completion_markers: Vec<String>,
    /// Completion markers the device sends per session.
    pub expected_passes: u32,
    /// Max characters of trailing metadata dropped after a frame marker
    /// when no newline or `{` ends it sooner.
    pub metadata_trim_limit: usize,
    pub close_delay_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            payload_encoding: PayloadEncoding::Base64,
            frame_end_marker: "FILE_END".into(),
            completion_markers: vec!["ALL FILES TRANSFERED".into(), "TRANSFER_COMPLETE".into()],
            expected_passes: 2,
            metadata_trim_limit: 20,
            close_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Sim,
    Ble,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub replay_path: Option<String>,
    pub sim_scenario: String,
    pub sim_readings: usize,
    pub sim_chunk_delay_ms: u64,
    pub sim_seed: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Sim,
            replay_path: None,
            sim_scenario: "field".into(),
            sim_readings: 24,
            sim_chunk_delay_ms: 5,
            sim_seed: 1,
        }
    }
}

/// MTU bounds accepted by the ATT layer.
const MTU_MIN: u16 = 23;
const MTU_MAX: u16 = 517;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_protocol(&mut errors);
        self.validate_transport(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;

        if d.name.trim().is_empty() {
            errors.push("device: name is empty".into());
        }
        for (field, value) in [("service_uuid", &d.service_uuid), ("transfer_uuid", &d.transfer_uuid)] {
            if uuid::Uuid::parse_str(value).is_err() {
                errors.push(format!("device: {field} '{value}' is not a valid UUID"));
            }
        }
        if !(MTU_MIN..=MTU_MAX).contains(&d.mtu) {
            errors.push(format!(
                "device: mtu {} out of range [{MTU_MIN}, {MTU_MAX}]",
                d.mtu
            ));
        }
        if d.scan_timeout_sec == 0 {
            errors.push("device: scan_timeout_sec must be positive".into());
        }
        if d.connect_timeout_sec == 0 {
            errors.push("device: connect_timeout_sec must be positive".into());
        }
    }

    fn validate_protocol(&self, errors: &mut Vec<String>) {
        let p = &self.protocol;

        if p.frame_end_marker.is_empty() {
            errors.push("protocol: frame_end_marker is empty".into());
        }
        if p.completion_markers.is_empty() {
            errors.push("protocol: completion_markers is empty".into());
        }
        for m in &p.completion_markers {
            if m.is_empty() {
                errors.push("protocol: completion marker is empty".into());
            } else if !p.frame_end_marker.is_empty()
                && (m.contains(&p.frame_end_marker) || p.frame_end_marker.contains(m.as_str()))
            {
                errors.push(format!(
                    "protocol: completion marker '{m}' overlaps frame_end_marker '{}'",
                    p.frame_end_marker
                ));
            }
        }
        if p.expected_passes == 0 {
            errors.push("protocol: expected_passes must be positive".into());
        }
    }

    fn validate_transport(&self, errors: &mut Vec<String>) {
        let t = &self.transport;

        match t.kind {
            TransportKind::Replay => {
                if t.replay_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                    errors.push("transport: kind 'replay' requires replay_path".into());
                }
                // Captures are line-delimited, so raw payloads would lose their newlines.
                if self.protocol.payload_encoding != PayloadEncoding::Base64 {
                    errors.push("transport: kind 'replay' requires payload_encoding = \"base64\"".into());
                }
            }
            TransportKind::Ble => {
                if !cfg!(feature = "ble") {
                    errors.push(
                        "transport: kind 'ble' requires a build with the 'ble' feature".into(),
                    );
                }
            }
            TransportKind::Sim => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Load `path` if it exists; fall back to defaults only when the path was
/// not set explicitly.
pub fn load_or_default(path: &str, explicit: bool) -> Result<Config> {
    if !explicit && !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        let config = Config::default();
        config.validate().context("invalid default config")?;
        return Ok(config);
    }
    load(path)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[device]
name = "AGNI-FIELD-2"
mtu = 247

[protocol]
payload_encoding = "raw"
expected_passes = 3
completion_markers = ["DONE"]

[transport]
kind = "sim"
sim_scenario = "flaky"
sim_readings = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.name, "AGNI-FIELD-2");
        assert_eq!(config.device.mtu, 247);
        assert_eq!(config.device.scan_timeout_sec, 30);
        assert_eq!(config.protocol.payload_encoding, PayloadEncoding::Raw);
        assert_eq!(config.protocol.expected_passes, 3);
        assert_eq!(config.protocol.completion_markers, vec!["DONE"]);
        assert_eq!(config.protocol.frame_end_marker, "FILE_END");
        assert_eq!(config.transport.kind, TransportKind::Sim);
        assert_eq!(config.transport.sim_scenario, "flaky");
        assert_eq!(config.transport.sim_readings, 10);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.device.name, "AGNI-SOIL-SENSOR");
        assert_eq!(config.protocol.expected_passes, 2);
        assert_eq!(config.protocol.metadata_trim_limit, 20);
        assert_eq!(config.transport.kind, TransportKind::Sim);
    }

    #[test]
    fn unknown_encoding_rejected_at_parse() {
        let res: Result<Config, _> = toml::from_str("[protocol]\npayload_encoding = \"hex\"\n");
        assert!(res.is_err());
    }

    #[test]
    fn defaults_pass() {
        Config::default().validate().unwrap();
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_name_rejected() {
        let mut cfg = Config::default();
        cfg.device.name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn bad_uuid_rejected() {
        let mut cfg = Config::default();
        cfg.device.transfer_uuid = "not-a-uuid".into();
        assert_validation_err(&cfg, "transfer_uuid 'not-a-uuid' is not a valid UUID");
    }

    #[test]
    fn mtu_bounds() {
        let mut cfg = Config::default();
        cfg.device.mtu = 22;
        assert_validation_err(&cfg, "mtu 22 out of range");
        cfg.device.mtu = 518;
        assert_validation_err(&cfg, "mtu 518 out of range");
        cfg.device.mtu = 23;
        cfg.validate().unwrap();
        cfg.device.mtu = 517;
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_timeouts_rejected() {
        let mut cfg = Config::default();
        cfg.device.scan_timeout_sec = 0;
        assert_validation_err(&cfg, "scan_timeout_sec must be positive");
        cfg.device.scan_timeout_sec = 5;
        cfg.device.connect_timeout_sec = 0;
        assert_validation_err(&cfg, "connect_timeout_sec must be positive");
    }

    #[test]
    fn empty_markers_rejected() {
        let mut cfg = Config::default();
        cfg.protocol.frame_end_marker.clear();
        assert_validation_err(&cfg, "frame_end_marker is empty");

        let mut cfg = Config::default();
        cfg.protocol.completion_markers.clear();
        assert_validation_err(&cfg, "completion_markers is empty");
    }

    #[test]
    fn overlapping_markers_rejected() {
        let mut cfg = Config::default();
        cfg.protocol.completion_markers = vec!["FILE_END_ALL".into()];
        assert_validation_err(&cfg, "overlaps frame_end_marker");
    }

    #[test]
    fn zero_passes_rejected() {
        let mut cfg = Config::default();
        cfg.protocol.expected_passes = 0;
        assert_validation_err(&cfg, "expected_passes must be positive");
    }

    #[test]
    fn replay_requires_path() {
        let mut cfg = Config::default();
        cfg.transport.kind = TransportKind::Replay;
        assert_validation_err(&cfg, "requires replay_path");
    }

    #[test]
    fn replay_rejects_raw_payloads() {
        let mut cfg = Config::default();
        cfg.transport.kind = TransportKind::Replay;
        cfg.transport.replay_path = Some("capture.txt".into());
        cfg.validate().unwrap();

        cfg.protocol.payload_encoding = PayloadEncoding::Raw;
        assert_validation_err(&cfg, "requires payload_encoding");
    }

    #[cfg(not(feature = "ble"))]
    #[test]
    fn ble_requires_feature() {
        let mut cfg = Config::default();
        cfg.transport.kind = TransportKind::Ble;
        assert_validation_err(&cfg, "'ble' feature");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.device.name.clear();
        cfg.device.mtu = 0;
        cfg.protocol.expected_passes = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("name is empty"), "got: {msg}");
        assert!(msg.contains("mtu 0"), "got: {msg}");
        assert!(msg.contains("expected_passes"), "got: {msg}");
    }

    // -- Loading ----------------------------------------------------------

    #[test]
    fn missing_default_path_falls_back() {
        let cfg = load_or_default("/nonexistent/agni/config.toml", false).unwrap();
        assert_eq!(cfg.device.name, "AGNI-SOIL-SENSOR");
    }

    #[test]
    fn missing_explicit_path_is_error() {
        let err = load_or_default("/nonexistent/agni/config.toml", true).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
