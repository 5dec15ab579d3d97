//! Transport layer: discovery, connection, and the notification byte
//! stream of the probe's transfer characteristic.
//!
//! Backends:
//! - [`sim::SimTransport`] renders transfers with `agni-sensor-sim`.
//! - [`replay::ReplayTransport`] streams a capture file.
//! - `ble::BleTransport` drives a real adapter through `btleplug`
//!   (cargo feature `ble`).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

#[cfg(feature = "ble")]
pub mod ble;
#[cfg(test)]
pub mod mock;
pub mod replay;
pub mod sim;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Raised by the `ble` backend only.
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("no device named '{0}' found")]
    DeviceNotFound(String),
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    /// Raised by the `ble` backend only.
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    #[error("service discovery failed: {0}")]
    Discovery(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("notification stream failed: {0}")]
    Stream(String),
    /// Raised by the `ble` backend only.
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

/// A discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    /// Backend-specific identifier used to connect.
    pub id: String,
}

/// Notification payloads in arrival order.  The stream ends when the
/// device stops notifying (usually on disconnect).
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve the first device whose advertised name equals `name`.
    /// Scanning stops on match and when the returned future is dropped.
    async fn scan(&self, name: &str) -> Result<DeviceInfo, TransportError>;

    /// Connect and discover the transfer characteristic.
    async fn connect(&self, device: &DeviceInfo) -> Result<Box<dyn Link>, TransportError>;
}

/// A connected device.
#[async_trait]
pub trait Link: Send {
    /// Best-effort transfer unit negotiation; returns the MTU in effect.
    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, TransportError>;

    async fn subscribe(&mut self) -> Result<ChunkStream, TransportError>;

    /// Idempotent.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
