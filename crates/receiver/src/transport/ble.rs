//! Bluetooth LE backend on top of `btleplug`.
//!
//! The adapter's scanner is a shared resource: only one scan may run at a
//! time, and it is stopped on match, on error, and when the scan future is
//! dropped (timeout or cancellation).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use uuid::Uuid;

use super::{ChunkStream, DeviceInfo, Link, Transport, TransportError};

pub struct BleTransport {
    adapter: Adapter,
    service_uuid: Uuid,
    transfer_uuid: Uuid,
    scanning: Arc<AtomicBool>,
    /// Peripheral resolved by the last successful scan.
    found: Mutex<Option<(String, Peripheral)>>,
}

impl BleTransport {
    /// Use the first adapter reported by the platform.
    pub async fn new(service_uuid: Uuid, transfer_uuid: Uuid) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no Bluetooth adapter found"))?;
        tracing::info!(
            adapter = %adapter.adapter_info().await.unwrap_or_default(),
            "BLE adapter ready"
        );
        Ok(Self {
            adapter,
            service_uuid,
            transfer_uuid,
            scanning: Arc::new(AtomicBool::new(false)),
            found: Mutex::new(None),
        })
    }

    async fn name_of(&self, peripheral: &Peripheral) -> Option<String> {
        peripheral.properties().await.ok().flatten()?.local_name
    }
}

/// Releases the scan slot and stops the adapter's scan when dropped.
struct ScanGuard {
    adapter: Adapter,
    scanning: Arc<AtomicBool>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let adapter = self.adapter.clone();
        let scanning = self.scanning.clone();
        // stop_scan is async; finish it off the dropping task.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        tracing::debug!("stop_scan: {e}");
                    }
                    scanning.store(false, Ordering::SeqCst);
                });
            }
            Err(_) => scanning.store(false, Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, name: &str) -> Result<DeviceInfo, TransportError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::ScanInProgress);
        }
        let _guard = ScanGuard {
            adapter: self.adapter.clone(),
            scanning: self.scanning.clone(),
        };

        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.service_uuid],
            })
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;

        // Devices cached from an earlier scan do not re-announce.
        for p in self.adapter.peripherals().await.unwrap_or_default() {
            if self.name_of(&p).await.as_deref() == Some(name) {
                return Ok(self.remember(name, p));
            }
        }

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let Ok(p) = self.adapter.peripheral(&id).await else {
                continue;
            };
            if self.name_of(&p).await.as_deref() == Some(name) {
                return Ok(self.remember(name, p));
            }
        }
        Err(TransportError::DeviceNotFound(name.to_string()))
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<Box<dyn Link>, TransportError> {
        let peripheral = self
            .found
            .lock()
            .ok()
            .and_then(|f| f.as_ref().filter(|(id, _)| *id == device.id).map(|(_, p)| p.clone()))
            .ok_or_else(|| TransportError::Connect(format!("unknown device {}", device.id)))?;

        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.transfer_uuid && c.service_uuid == self.service_uuid)
            .ok_or_else(|| {
                TransportError::Discovery(format!("characteristic {} not found", self.transfer_uuid))
            })?;

        Ok(Box::new(BleLink {
            peripheral,
            characteristic,
            subscribed: false,
        }))
    }
}

impl BleTransport {
    fn remember(&self, name: &str, peripheral: Peripheral) -> DeviceInfo {
        let info = DeviceInfo {
            name: name.to_string(),
            id: format!("{:?}", peripheral.id()),
        };
        if let Ok(mut found) = self.found.lock() {
            *found = Some((info.id.clone(), peripheral));
        }
        tracing::info!(id = %info.id, "device found");
        info
    }
}

struct BleLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
    subscribed: bool,
}

#[async_trait]
impl Link for BleLink {
    async fn request_mtu(&mut self, _mtu: u16) -> Result<u16, TransportError> {
        // btleplug leaves MTU exchange to the platform stack.
        Err(TransportError::Unsupported("MTU negotiation"))
    }

    async fn subscribe(&mut self) -> Result<ChunkStream, TransportError> {
        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        self.subscribed = true;

        let uuid = self.characteristic.uuid;
        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| Ok::<_, TransportError>(n.value));
        Ok(Box::pin(stream))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.subscribed {
            self.subscribed = false;
            if let Err(e) = self.peripheral.unsubscribe(&self.characteristic).await {
                tracing::debug!("unsubscribe: {e}");
            }
        }
        match self.peripheral.is_connected().await {
            Ok(false) => Ok(()),
            _ => self
                .peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::Disconnect(e.to_string())),
        }
    }
}
