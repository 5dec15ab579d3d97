//! Simulated probe backed by `agni-sensor-sim`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agni_sensor_sim::{DeviceSim, Encoding, Scenario};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};

use super::{ChunkStream, DeviceInfo, Link, Transport, TransportError};
use crate::config::{Config, PayloadEncoding};

/// Default ATT MTU before negotiation.
const DEFAULT_MTU: u16 = 23;
const MAX_MTU: u16 = 517;

pub struct SimTransport {
    advertised_name: String,
    device: DeviceSim,
    encoding: Encoding,
    chunk_delay: Duration,
}

impl SimTransport {
    pub fn new(advertised_name: &str, device: DeviceSim, encoding: PayloadEncoding) -> Self {
        Self {
            advertised_name: advertised_name.to_string(),
            device,
            encoding: match encoding {
                PayloadEncoding::Base64 => Encoding::Base64,
                PayloadEncoding::Raw => Encoding::Raw,
            },
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let t = &config.transport;
        let device = DeviceSim::new(
            Scenario::from_str_lossy(&t.sim_scenario),
            t.sim_readings,
            t.sim_seed,
        );
        Self::new(&config.device.name, device, config.protocol.payload_encoding)
            .with_chunk_delay(Duration::from_millis(t.sim_chunk_delay_ms))
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn scan(&self, name: &str) -> Result<DeviceInfo, TransportError> {
        if name != self.advertised_name {
            return Err(TransportError::DeviceNotFound(name.to_string()));
        }
        Ok(DeviceInfo {
            name: self.advertised_name.clone(),
            id: format!("sim:{}:{}", self.device.scenario, self.device.seed),
        })
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<Box<dyn Link>, TransportError> {
        tracing::debug!(id = %device.id, "sim connected");
        Ok(Box::new(SimLink {
            device: self.device.clone(),
            encoding: self.encoding,
            chunk_delay: self.chunk_delay,
            mtu: DEFAULT_MTU,
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct SimLink {
    device: DeviceSim,
    encoding: Encoding,
    chunk_delay: Duration,
    mtu: u16,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Link for SimLink {
    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, TransportError> {
        self.mtu = mtu.clamp(DEFAULT_MTU, MAX_MTU);
        Ok(self.mtu)
    }

    async fn subscribe(&mut self) -> Result<ChunkStream, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe("not connected".into()));
        }
        let chunks = self.device.notifications(self.mtu as usize, self.encoding);
        let delay = self.chunk_delay;
        let connected = self.connected.clone();

        let stream = stream::iter(chunks)
            .take_while(move |_| future::ready(connected.load(Ordering::SeqCst)))
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, TransportError>(chunk)
            });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::session::TransferSession;

    fn transport() -> SimTransport {
        SimTransport::new(
            "AGNI-SOIL-SENSOR",
            DeviceSim::new(Scenario::Field, 4, 5),
            PayloadEncoding::Base64,
        )
    }

    #[tokio::test]
    async fn scan_matches_exact_name() {
        let t = transport();
        assert!(t.scan("AGNI-SOIL-SENSOR").await.is_ok());
        assert_eq!(
            t.scan("AGNI").await.unwrap_err(),
            TransportError::DeviceNotFound("AGNI".into())
        );
    }

    #[tokio::test]
    async fn full_transfer_through_session() {
        let t = transport();
        let dev = t.scan("AGNI-SOIL-SENSOR").await.unwrap();
        let mut link = t.connect(&dev).await.unwrap();
        assert_eq!(link.request_mtu(185).await.unwrap(), 185);

        let mut stream = link.subscribe().await.unwrap();
        let mut session = TransferSession::new(&ProtocolConfig::default());
        while let Some(chunk) = stream.next().await {
            session.ingest(&chunk.unwrap());
        }
        assert!(session.is_closing());
        assert_eq!(session.take_unique().len(), 4);
    }

    #[tokio::test]
    async fn disconnect_ends_stream_and_is_idempotent() {
        let t = transport();
        let dev = t.scan("AGNI-SOIL-SENSOR").await.unwrap();
        let mut link = t.connect(&dev).await.unwrap();
        let mut stream = link.subscribe().await.unwrap();
        assert!(stream.next().await.is_some());

        link.disconnect().await.unwrap();
        link.disconnect().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(link.subscribe().await.is_err());
    }
}
