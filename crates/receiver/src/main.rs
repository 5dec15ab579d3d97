mod config;
mod controller;
mod db;
mod frame;
mod persist;
mod record;
mod session;
mod state;
mod transport;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use config::{Config, TransportKind};
use controller::{ControllerOptions, SessionController};
use db::Db;
use state::SystemState;
use transport::replay::ReplayTransport;
use transport::sim::SimTransport;
use transport::Transport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:agni.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let auto_start = env::var("AUTO_START")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // ── Config file ─────────────────────────────────────────────────
    let explicit_config = env::var("CONFIG_PATH").ok();
    let config_path = explicit_config.clone().unwrap_or_else(|| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path, explicit_config.is_some())?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let existing = db.load_records().await?.len();
    tracing::info!(%db_url, records = existing, "db ready");

    // ── Transport ───────────────────────────────────────────────────
    let transport = build_transport(&cfg).await?;
    tracing::info!(
        kind = ?cfg.transport.kind,
        device = %cfg.device.name,
        passes = cfg.protocol.expected_passes,
        "transport ready"
    );

    // ── Controller + shared state ───────────────────────────────────
    let controller = SessionController::new(
        transport,
        Arc::new(db.clone()),
        ControllerOptions::from_config(&cfg),
    );
    let shared = SystemState::shared();
    wire_listeners(&controller, &shared);
    if let Ok(mut st) = shared.write() {
        st.record_status("receiver started");
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        state: Arc::clone(&shared),
        db: db.clone(),
        controller: controller.clone(),
    };
    let web = tokio::spawn(web::serve(app, web_port));

    if auto_start {
        if let Err(e) = controller.start_session().await {
            tracing::warn!("auto-start failed: {e}");
        }
    }

    tokio::select! {
        res = web => {
            res.context("web task panicked")??;
        }
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            controller.stop_session().await;
        }
    }
    Ok(())
}

async fn build_transport(cfg: &Config) -> Result<Arc<dyn Transport>> {
    let t = &cfg.transport;
    let transport: Arc<dyn Transport> = match t.kind {
        TransportKind::Sim => Arc::new(SimTransport::from_config(cfg)),
        TransportKind::Replay => {
            let path = t
                .replay_path
                .clone()
                .context("transport.replay_path is required for kind 'replay'")?;
            Arc::new(ReplayTransport::new(
                path,
                &cfg.device.name,
                Duration::from_millis(t.sim_chunk_delay_ms),
            ))
        }
        #[cfg(feature = "ble")]
        TransportKind::Ble => {
            let service = uuid::Uuid::parse_str(&cfg.device.service_uuid)
                .context("invalid device.service_uuid")?;
            let transfer = uuid::Uuid::parse_str(&cfg.device.transfer_uuid)
                .context("invalid device.transfer_uuid")?;
            Arc::new(transport::ble::BleTransport::new(service, transfer).await?)
        }
        #[cfg(not(feature = "ble"))]
        TransportKind::Ble => anyhow::bail!("transport kind 'ble' requires the 'ble' feature"),
    };
    Ok(transport)
}

/// Feed the controller's listener slots into the status ring.
fn wire_listeners(controller: &SessionController, shared: &state::SharedState) {
    let st = Arc::clone(shared);
    controller.on_log(move |msg| {
        if let Ok(mut st) = st.write() {
            st.record_status(msg);
        }
    });

    let st = Arc::clone(shared);
    controller.on_data_refresh(move |_| {
        if let Ok(mut st) = st.write() {
            st.record_refresh();
        }
    });

    let st = Arc::clone(shared);
    controller.on_session_end(move |outcome| {
        if let Ok(mut st) = st.write() {
            st.record_session_end(outcome);
        }
    });
}
