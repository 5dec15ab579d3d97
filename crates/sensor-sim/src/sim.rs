//! Stateful AGNI soil probe simulator.
//!
//! Models the seven probe channels the way a real NPK/pH/EC probe behaves
//! between samples:
//! - Temporal coherence via random walk with mean reversion
//! - Per-reading electronic noise
//! - Occasional spikes (probe flakiness)
//! - Per-unit calibration offsets
//!
//! Every simulator owns a seeded `fastrand::Rng`, so a given
//! `(scenario, seed)` pair always renders the same transcript.

use std::fmt;

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Clean field session.  Every frame is well formed.
    Field,
    /// Lossy link: truncated JSON, zero-filled keep-alive frames and
    /// filenames without a trailing newline.
    Flaky,
    /// Firmware that leaves channels blank, null, or string-typed.
    Sparse,
    /// Probe not inserted in soil: every channel reads zero.
    Dead,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "flaky" => Self::Flaky,
            "sparse" => Self::Sparse,
            "dead" => Self::Dead,
            _ => Self::Field, // default
        }
    }

    /// Probability that a frame is cut short on a given pass.
    pub(crate) fn truncate_prob(self) -> f32 {
        match self {
            Self::Flaky => 0.15,
            _ => 0.0,
        }
    }

    /// Probability that a keep-alive frame is interleaved before a reading.
    pub(crate) fn keepalive_prob(self) -> f32 {
        match self {
            Self::Flaky => 0.10,
            _ => 0.0,
        }
    }

    /// Probability that the filename after `FILE_END` has no newline.
    pub(crate) fn missing_newline_prob(self) -> f32 {
        match self {
            Self::Flaky => 0.30,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field => write!(f, "field"),
            Self::Flaky => write!(f, "flaky"),
            Self::Sparse => write!(f, "sparse"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// Static description of one probe channel.
struct ChannelSpec {
    /// Key inside the `parameters` object.
    key: &'static str,
    center: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    min: f64,
    max: f64,
    decimals: i32,
}

const CHANNELS: [ChannelSpec; 7] = [
    ChannelSpec { key: "temperature", center: 24.0, walk_sigma: 0.3, noise_sigma: 0.1, min: -10.0, max: 60.0, decimals: 1 },
    ChannelSpec { key: "moisture", center: 38.0, walk_sigma: 1.0, noise_sigma: 0.4, min: 0.0, max: 100.0, decimals: 1 },
    ChannelSpec { key: "nitrogen", center: 140.0, walk_sigma: 3.0, noise_sigma: 1.5, min: 0.0, max: 1999.0, decimals: 0 },
    ChannelSpec { key: "phosphorus", center: 45.0, walk_sigma: 1.5, noise_sigma: 0.8, min: 0.0, max: 1999.0, decimals: 0 },
    ChannelSpec { key: "potassium", center: 180.0, walk_sigma: 4.0, noise_sigma: 2.0, min: 0.0, max: 1999.0, decimals: 0 },
    ChannelSpec { key: "ph_value", center: 6.8, walk_sigma: 0.05, noise_sigma: 0.02, min: 3.0, max: 9.0, decimals: 2 },
    ChannelSpec { key: "conductivity", center: 620.0, walk_sigma: 10.0, noise_sigma: 4.0, min: 0.0, max: 20000.0, decimals: 0 },
];

/// Mean reversion strength shared by all channels.
const MEAN_REVERSION: f64 = 0.05;

/// Base coordinates of the simulated plot.
const BASE_LATITUDE: f64 = 20.2961;
const BASE_LONGITUDE: f64 = 85.8245;

/// Minutes between two stored samples on the probe.
const SAMPLE_INTERVAL_MIN: usize = 5;

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing the JSON frames an AGNI probe stores.
pub struct SoilSim {
    scenario: Scenario,
    rng: fastrand::Rng,
    /// Current "true" value of each channel.  Evolves each sample.
    base: [f64; 7],
    /// Permanent per-unit calibration offset for each channel.
    offset: [f64; 7],
    spike_prob: f32,
    latitude: f64,
    longitude: f64,
    index: usize,
}

impl SoilSim {
    pub fn new(scenario: Scenario, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);

        let mut base = [0.0; 7];
        let mut offset = [0.0; 7];
        for (i, ch) in CHANNELS.iter().enumerate() {
            let range = ch.max - ch.min;
            base[i] = (ch.center + gaussian(&mut rng, 0.0, ch.walk_sigma * 3.0)).clamp(ch.min, ch.max);
            offset[i] = gaussian(&mut rng, 0.0, range * 0.001);
        }

        let spike_prob = match scenario {
            Scenario::Flaky => 0.08,
            _ => 0.01,
        };

        Self {
            scenario,
            latitude: BASE_LATITUDE + rng.f64() * 0.01,
            longitude: BASE_LONGITUDE + rng.f64() * 0.01,
            rng,
            base,
            offset,
            spike_prob,
            index: 0,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Roll a biased coin using the simulator's seeded RNG.
    pub fn roll(&mut self, prob: f32) -> bool {
        prob > 0.0 && self.rng.f32() < prob
    }

    /// Number of readings produced so far.
    pub fn produced(&self) -> usize {
        self.index
    }

    /// Produce the next stored reading as the probe's JSON frame object.
    pub fn next_frame(&mut self) -> Value {
        let timestamp = device_timestamp(self.index);
        self.index += 1;

        let mut parameters = serde_json::Map::new();
        for i in 0..CHANNELS.len() {
            let value = self.sample_channel(i);
            parameters.insert(CHANNELS[i].key.to_string(), self.render_value(value));
        }

        json!({
            "parameters": Value::Object(parameters),
            "timestamp": timestamp,
            "location": {
                "latitude": round_to(self.latitude, 6),
                "longitude": round_to(self.longitude, 6),
            },
        })
    }

    /// Zero-filled frame the probe emits while idle.
    pub fn keepalive_frame(&self) -> Value {
        let mut parameters = serde_json::Map::new();
        for ch in &CHANNELS {
            parameters.insert(ch.key.to_string(), json!(0));
        }
        json!({
            "parameters": Value::Object(parameters),
            "timestamp": "0000-00-00 00:00:00",
            "location": { "latitude": 0, "longitude": 0 },
        })
    }

    fn sample_channel(&mut self, i: usize) -> f64 {
        if self.scenario == Scenario::Dead {
            return 0.0;
        }
        let ch = &CHANNELS[i];

        // -- Evolve the base value ----------------------------------------
        let pull = MEAN_REVERSION * (ch.center - self.base[i]);
        let walk = gaussian(&mut self.rng, 0.0, ch.walk_sigma);
        self.base[i] = (self.base[i] + pull + walk).clamp(ch.min, ch.max);

        // -- Build the instantaneous reading ------------------------------
        let noise = gaussian(&mut self.rng, 0.0, ch.noise_sigma);
        let spike = if self.rng.f32() < self.spike_prob {
            gaussian(&mut self.rng, 0.0, ch.walk_sigma * 20.0)
        } else {
            0.0
        };

        let reading = self.base[i] + self.offset[i] + noise + spike;
        round_to(reading.clamp(ch.min, ch.max), ch.decimals)
    }

    /// Sparse firmware drops or stringifies some channels.
    fn render_value(&mut self, value: f64) -> Value {
        if self.scenario != Scenario::Sparse {
            return json!(value);
        }
        match self.rng.u8(0..10) {
            0 => json!(""),
            1 => Value::Null,
            2 | 3 => json!(value.to_string()),
            _ => json!(value),
        }
    }
}

/// Device clock string for the `index`-th stored sample.
fn device_timestamp(index: usize) -> String {
    let minutes = 6 * 60 + index * SAMPLE_INTERVAL_MIN;
    let day = 14 + minutes / (24 * 60);
    let hour = (minutes / 60) % 24;
    let minute = minutes % 60;
    format!("2025-03-{day:02} {hour:02}:{minute:02}:00")
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let p = 10f64.powi(decimals);
    (v * p).round() / p
}

// ===========================================================================
// Tests
// ===========================================================================
