//! Capture tool: renders one simulated probe session and writes every
//! notification payload as a line of base64 on stdout.  The output can be
//! fed to the receiver's `replay` transport.

use std::env;
use std::io::{self, BufWriter, Write};

use agni_sensor_sim::{DeviceSim, Encoding, Scenario};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let readings: usize = env::var("SIM_READINGS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(24);
    let mtu: usize = env::var("SIM_MTU")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(185);
    let seed: u64 = env::var("SIM_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    let device = DeviceSim::new(scenario, readings, seed);
    let notifications = device.notifications(mtu, Encoding::Base64);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for n in &notifications {
        out.write_all(n)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    tracing::info!(
        %scenario,
        readings,
        mtu,
        seed,
        notifications = notifications.len(),
        "capture written"
    );
    Ok(())
}
