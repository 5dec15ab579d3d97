//! Simulator for the AGNI soil probe's bulk transfer.
//!
//! [`DeviceSim`] renders what the probe sends over its transfer
//! characteristic during one session: every stored reading as a framed
//! JSON file, repeated for each redundant pass, cut into notification
//! payloads.

pub mod sim;
pub mod wire;

pub use sim::{Scenario, SoilSim};
pub use wire::Encoding;

/// One simulated probe with a fixed set of stored readings.
#[derive(Debug, Clone)]
pub struct DeviceSim {
    pub scenario: Scenario,
    pub readings: usize,
    pub passes: usize,
    pub seed: u64,
}

impl DeviceSim {
    pub fn new(scenario: Scenario, readings: usize, seed: u64) -> Self {
        Self {
            scenario,
            readings,
            passes: wire::DEFAULT_PASSES,
            seed,
        }
    }

    /// Full session text as the probe writes it.
    pub fn transcript(&self) -> String {
        let mut sim = SoilSim::new(self.scenario, self.seed);
        wire::render_transcript(&mut sim, self.readings, self.passes)
    }

    /// Session text cut into notification payloads.
    pub fn notifications(&self, mtu: usize, encoding: Encoding) -> Vec<Vec<u8>> {
        wire::notifications(&self.transcript(), mtu, encoding)
    }
}
