//! Scripted in-memory transport for controller tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};

use super::{ChunkStream, DeviceInfo, Link, Transport, TransportError};

#[derive(Default)]
pub struct Counters {
    pub scans: AtomicUsize,
    pub connects: AtomicUsize,
    pub subscriptions: AtomicUsize,
    /// Subscriptions whose stream has not been dropped yet.
    pub active: AtomicUsize,
    pub disconnects: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub chunks: Vec<Vec<u8>>,
    /// Keep the stream open after the scripted chunks.
    pub hold_open: bool,
    /// Never resolve scans.
    pub pending_scan: bool,
    pub connect_error: Option<TransportError>,
    pub connect_delay: Duration,
    pub mtu_error: bool,
    /// Fail the stream after the scripted chunks.
    pub stream_error: Option<TransportError>,
    pub counters: Arc<Counters>,
}

impl ScriptedTransport {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(vec![text.as_bytes().to_vec()])
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn scan(&self, name: &str) -> Result<DeviceInfo, TransportError> {
        self.counters.scans.fetch_add(1, Ordering::SeqCst);
        if self.pending_scan {
            futures::future::pending::<()>().await;
        }
        Ok(DeviceInfo {
            name: name.to_string(),
            id: "scripted".into(),
        })
    }

    async fn connect(&self, _device: &DeviceInfo) -> Result<Box<dyn Link>, TransportError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(e) = &self.connect_error {
            return Err(e.clone());
        }
        Ok(Box::new(ScriptedLink {
            script: self.clone(),
        }))
    }
}

struct ScriptedLink {
    script: ScriptedTransport,
}

/// Decrements the active-subscription counter when the stream is dropped.
struct ActiveGuard(Arc<Counters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Link for ScriptedLink {
    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, TransportError> {
        if self.script.mtu_error {
            return Err(TransportError::Unsupported("MTU negotiation"));
        }
        Ok(mtu)
    }

    async fn subscribe(&mut self) -> Result<ChunkStream, TransportError> {
        let counters = self.script.counters.clone();
        counters.subscriptions.fetch_add(1, Ordering::SeqCst);
        counters.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(counters);

        let chunks = stream::iter(self.script.chunks.clone().into_iter().map(Ok));
        let tail: ChunkStream = match (&self.script.stream_error, self.script.hold_open) {
            (Some(e), _) => Box::pin(stream::iter([Err(e.clone())])),
            (None, true) => Box::pin(stream::pending()),
            (None, false) => Box::pin(stream::empty()),
        };
        let stream = chunks.chain(tail).map(move |item| {
            let _held = &guard;
            item
        });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.script.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
