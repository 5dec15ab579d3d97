//! Replays a capture file: one notification payload per line, as written
//! by the `agni-sensor-sim` capture binary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;

use super::{ChunkStream, DeviceInfo, Link, Transport, TransportError};

pub struct ReplayTransport {
    path: PathBuf,
    advertised_name: String,
    chunk_delay: Duration,
}

impl ReplayTransport {
    pub fn new(path: impl Into<PathBuf>, advertised_name: &str, chunk_delay: Duration) -> Self {
        Self {
            path: path.into(),
            advertised_name: advertised_name.to_string(),
            chunk_delay,
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn scan(&self, name: &str) -> Result<DeviceInfo, TransportError> {
        if name != self.advertised_name {
            return Err(TransportError::DeviceNotFound(name.to_string()));
        }
        tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| TransportError::Scan(format!("{}: {e}", self.path.display())))?;
        Ok(DeviceInfo {
            name: self.advertised_name.clone(),
            id: format!("replay:{}", self.path.display()),
        })
    }

    async fn connect(&self, _device: &DeviceInfo) -> Result<Box<dyn Link>, TransportError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {e}", self.path.display())))?;
        Ok(Box::new(ReplayLink {
            file: Some(file),
            chunk_delay: self.chunk_delay,
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct ReplayLink {
    /// Taken by the first subscription.
    file: Option<tokio::fs::File>,
    chunk_delay: Duration,
    /// Cleared on disconnect; the stream ends at the next line.
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Link for ReplayLink {
    async fn request_mtu(&mut self, _mtu: u16) -> Result<u16, TransportError> {
        Err(TransportError::Unsupported("MTU negotiation"))
    }

    async fn subscribe(&mut self) -> Result<ChunkStream, TransportError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| TransportError::Subscribe("capture already consumed".into()))?;
        let delay = self.chunk_delay;
        let connected = self.connected.clone();

        let lines = LinesStream::new(tokio::io::BufReader::new(file).lines());
        let stream = lines
            .take_while(move |_| futures::future::ready(connected.load(Ordering::SeqCst)))
            .filter(|line| futures::future::ready(!matches!(line, Ok(l) if l.trim().is_empty())))
            .then(move |line| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                line.map(|l| l.trim().as_bytes().to_vec())
                    .map_err(|e| TransportError::Stream(e.to_string()))
            });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.file = None;
        Ok(())
    }
}
