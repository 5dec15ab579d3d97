//! Session lifecycle controller.
//!
//! Owns the single global session slot.  A session runs as one spawned
//! task that walks `Idle -> Scanning -> Connecting -> Receiving{pass} ->
//! Closing -> Idle`.  Every session that leaves `Idle` ends through
//! [`Shared::finish`], which fires the session-end listener exactly once
//! before the phase returns to `Idle`.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::config::{Config, ProtocolConfig};
use crate::persist::{self, FlushReport, RecordStore};
use crate::session::{SessionEvent, SessionStats, TransferSession};
use crate::transport::{ChunkStream, Link, Transport, TransportError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Scanning,
    Connecting,
    /// Subscribed and receiving the given 1-based pass.
    Receiving { pass: u32 },
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// Every expected pass arrived and the readings were flushed.
    Completed,
    /// Stopped on request; unflushed readings were discarded.
    Stopped,
    /// The notification stream ended or failed before the last pass.
    Interrupted,
    /// Scan, connect, or subscribe failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub reason: SessionEndReason,
    pub passes: u32,
    pub stats: SessionStats,
    pub flush: Option<FlushReport>,
    pub discarded: usize,
    pub error: Option<String>,
}

impl SessionOutcome {
    fn before_subscribe(err: &SessionError) -> Self {
        Self {
            reason: match err {
                SessionError::Cancelled => SessionEndReason::Stopped,
                _ => SessionEndReason::Failed,
            },
            passes: 0,
            stats: SessionStats::default(),
            flush: None,
            discarded: 0,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,
    #[error("session cancelled by stop request")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session task ended unexpectedly")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub device_name: String,
    pub mtu: u16,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Pause between the flush and the disconnect.
    pub close_delay: Duration,
    pub protocol: ProtocolConfig,
}

impl ControllerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_name: config.device.name.clone(),
            mtu: config.device.mtu,
            scan_timeout: Duration::from_secs(config.device.scan_timeout_sec),
            connect_timeout: Duration::from_secs(config.device.connect_timeout_sec),
            close_delay: Duration::from_millis(config.protocol.close_delay_ms),
            protocol: config.protocol.clone(),
        }
    }
}

pub type LogListener = Arc<dyn Fn(&str) + Send + Sync>;
pub type SessionEndListener = Arc<dyn Fn(&SessionOutcome) + Send + Sync>;
pub type DataRefreshListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Single-subscriber slots; setting one replaces the previous listener.
#[derive(Default)]
struct Listeners {
    log: Option<LogListener>,
    session_end: Option<SessionEndListener>,
    data_refresh: Option<DataRefreshListener>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    store: Arc<dyn RecordStore>,
    options: ControllerOptions,
    phase: watch::Sender<SessionPhase>,
    /// Cancel handle of the running session.  Held while claiming the slot
    /// so a concurrent stop always sees the session it races with.
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    listeners: RwLock<Listeners>,
}

#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

impl SessionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
        options: ControllerOptions,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                store,
                options,
                phase,
                cancel: Mutex::new(None),
                listeners: RwLock::new(Listeners::default()),
            }),
        }
    }

    pub fn on_log(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut l) = self.shared.listeners.write() {
            l.log = Some(Arc::new(f));
        }
    }

    pub fn on_session_end(&self, f: impl Fn(&SessionOutcome) + Send + Sync + 'static) {
        if let Ok(mut l) = self.shared.listeners.write() {
            l.session_end = Some(Arc::new(f));
        }
    }

    pub fn on_data_refresh(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        if let Ok(mut l) = self.shared.listeners.write() {
            l.data_refresh = Some(Arc::new(f));
        }
    }

    #[cfg(test)]
    pub fn clear_listeners(&self) {
        if let Ok(mut l) = self.shared.listeners.write() {
            *l = Listeners::default();
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.borrow()
    }

    #[cfg(test)]
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase.subscribe()
    }

    /// Start a session.  Resolves once the transfer characteristic is
    /// subscribed; the transfer itself continues in the background.
    ///
    /// Fails with [`SessionError::AlreadyActive`] unless the controller is
    /// idle, and with the transport error if scanning, connecting, or
    /// subscribing fails (the controller is back to idle by then).
    pub async fn start_session(&self) -> Result<(), SessionError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let Ok(mut slot) = self.shared.cancel.lock() else {
                return Err(SessionError::Aborted);
            };
            let claimed = self.shared.phase.send_if_modified(|p| {
                if *p == SessionPhase::Idle {
                    *p = SessionPhase::Scanning;
                    true
                } else {
                    false
                }
            });
            if !claimed {
                return Err(SessionError::AlreadyActive);
            }
            *slot = Some(cancel_tx);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.run(cancel_rx, ready_tx).await });

        ready_rx.await.unwrap_or(Err(SessionError::Aborted))
    }

    /// Stop the active session, if any, and wait until the controller is
    /// idle.  Unflushed readings are discarded.
    pub async fn stop_session(&self) {
        let cancel = self.shared.cancel.lock().ok().and_then(|mut c| c.take());
        if let Some(tx) = cancel {
            tracing::info!("stop requested");
            let _ = tx.send(());
        }
        self.wait_until_idle().await;
    }

    pub async fn wait_until_idle(&self) {
        let mut rx = self.shared.phase.subscribe();
        // The sender lives in `shared`, so this only fails if it is gone.
        let _ = rx.wait_for(|p| *p == SessionPhase::Idle).await;
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

enum Ending {
    Completed,
    Stopped,
    Interrupted(String),
}

impl Shared {
    async fn run(
        self: Arc<Self>,
        mut cancel: oneshot::Receiver<()>,
        ready: oneshot::Sender<Result<(), SessionError>>,
    ) {
        let (link, stream) = match self.establish(&mut cancel).await {
            Ok(established) => established,
            Err(err) => {
                self.finish(SessionOutcome::before_subscribe(&err));
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let outcome = self.receive(link, stream, &mut cancel).await;
        self.finish(outcome);
    }

    /// Scan, connect, negotiate, and subscribe.
    async fn establish(
        &self,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<(Box<dyn Link>, ChunkStream), SessionError> {
        let opts = &self.options;
        let name = opts.device_name.as_str();

        self.log(&format!("scanning for {name}"));
        let scan = async {
            tokio::time::timeout(opts.scan_timeout, self.transport.scan(name))
                .await
                .unwrap_or_else(|_| Err(TransportError::DeviceNotFound(name.to_string())))
        };
        let device = cancellable(cancel, scan).await?;

        self.set_phase(SessionPhase::Connecting);
        self.log(&format!("found {} ({}), connecting", device.name, device.id));
        let connect = async {
            tokio::time::timeout(opts.connect_timeout, self.transport.connect(&device))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Connect(format!(
                        "timed out after {}s",
                        opts.connect_timeout.as_secs()
                    )))
                })
        };
        // Connect runs to completion (bounded by its timeout) so a stop
        // that lands mid-connect still tears the connection down.
        let mut link = connect.await?;
        if stop_requested(cancel) {
            disconnect(link.as_mut()).await;
            return Err(SessionError::Cancelled);
        }

        match link.request_mtu(opts.mtu).await {
            Ok(mtu) => self.log(&format!("connected, MTU {mtu}")),
            Err(e) => self.log(&format!("connected, MTU negotiation failed ({e}), using default")),
        }

        let stream = match cancellable(cancel, link.subscribe()).await {
            Ok(stream) => stream,
            Err(err) => {
                disconnect(link.as_mut()).await;
                return Err(err);
            }
        };

        self.set_phase(SessionPhase::Receiving { pass: 1 });
        self.log(&format!(
            "subscribed, receiving pass 1 of {}",
            opts.protocol.expected_passes
        ));
        Ok((link, stream))
    }

    async fn receive(
        &self,
        mut link: Box<dyn Link>,
        mut stream: ChunkStream,
        cancel: &mut oneshot::Receiver<()>,
    ) -> SessionOutcome {
        let mut session = TransferSession::new(&self.options.protocol);

        let ending = loop {
            tokio::select! {
                biased;
                _ = &mut *cancel => break Ending::Stopped,
                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        for event in session.ingest(&chunk) {
                            self.handle_event(event);
                        }
                        if session.is_closing() {
                            break Ending::Completed;
                        }
                    }
                    Some(Err(e)) => break Ending::Interrupted(e.to_string()),
                    None => break Ending::Interrupted("notification stream ended".into()),
                },
            }
        };
        drop(stream);
        self.set_phase(SessionPhase::Closing);

        let mut outcome = SessionOutcome {
            reason: SessionEndReason::Completed,
            passes: session.passes(),
            stats: session.stats().clone(),
            flush: None,
            discarded: 0,
            error: None,
        };

        match ending {
            Ending::Completed => {
                let readings = session.take_unique();
                let report = persist::flush(self.store.as_ref(), &readings).await;
                self.refresh(true);
                self.log(&format!(
                    "transfer complete, saved {} unique readings ({} failed)",
                    report.saved, report.failed
                ));
                outcome.flush = Some(report);

                tokio::select! {
                    _ = tokio::time::sleep(self.options.close_delay) => {}
                    _ = &mut *cancel => {}
                }
            }
            Ending::Stopped => {
                outcome.reason = SessionEndReason::Stopped;
                outcome.discarded = session.discard();
                self.log(&format!(
                    "session stopped, discarded {} unsaved readings",
                    outcome.discarded
                ));
            }
            Ending::Interrupted(cause) => {
                outcome.reason = SessionEndReason::Interrupted;
                outcome.discarded = session.discard();
                tracing::warn!(%cause, passes = outcome.passes, "session died unexpectedly");
                self.log(&format!("session died unexpectedly: {cause}"));
                outcome.error = Some(cause);
            }
        }

        disconnect(link.as_mut()).await;
        outcome
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Accepted(reading) => {
                tracing::debug!(timestamp = %reading.timestamp, ph = reading.ph, "frame accepted");
                self.refresh(true);
            }
            SessionEvent::Dropped(reason) => {
                tracing::debug!(kind = reason.kind(), "frame dropped: {reason}");
            }
            SessionEvent::PassComplete { pass } => {
                let expected = self.options.protocol.expected_passes;
                self.log(&format!("pass {pass} of {expected} complete"));
                if pass < expected {
                    self.set_phase(SessionPhase::Receiving { pass: pass + 1 });
                }
            }
            SessionEvent::TransferComplete => {
                self.set_phase(SessionPhase::Closing);
            }
        }
    }

    fn finish(&self, outcome: SessionOutcome) {
        if let Ok(mut c) = self.cancel.lock() {
            c.take();
        }
        tracing::info!(
            reason = ?outcome.reason,
            passes = outcome.passes,
            accepted = outcome.stats.accepted,
            dropped = outcome.stats.total_dropped(),
            "session ended"
        );
        let listener = self.listeners.read().ok().and_then(|l| l.session_end.clone());
        if let Some(f) = listener {
            f(&outcome);
        }
        self.set_phase(SessionPhase::Idle);
    }

    fn set_phase(&self, phase: SessionPhase) {
        tracing::debug!(?phase, "phase");
        self.phase.send_replace(phase);
    }

    fn log(&self, message: &str) {
        tracing::info!("{message}");
        let listener = self.listeners.read().ok().and_then(|l| l.log.clone());
        if let Some(f) = listener {
            f(message);
        }
    }

    fn refresh(&self, flag: bool) {
        let listener = self.listeners.read().ok().and_then(|l| l.data_refresh.clone());
        if let Some(f) = listener {
            f(flag);
        }
    }
}

/// Race `fut` against the stop request.
async fn cancellable<T>(
    cancel: &mut oneshot::Receiver<()>,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, SessionError> {
    tokio::select! {
        biased;
        _ = cancel => Err(SessionError::Cancelled),
        res = fut => res.map_err(SessionError::from),
    }
}

fn stop_requested(cancel: &mut oneshot::Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Ok(()))
}

async fn disconnect(link: &mut dyn Link) {
    if let Err(e) = link.disconnect().await {
        tracing::warn!("disconnect failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
