//! [`Transport`] over the host's Bluetooth adapter, using `bluest`.
//!
//! The station is found by advertising scan, filtered on the protocol's GATT
//! service, and matched against the configured target by advertised name or
//! by address. The OS stack picks the address type itself, so the
//! [`AddressMode::Random`] fallback is implemented as a fresh scan that
//! ignores any previously cached device.

use super::{channel_notifications, AddressMode, Endpoints, GattProfile, Notifications, Transport};
use anyhow::anyhow;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

pub struct BleTransport {
    adapter: Adapter,
    /// Device found by the last successful lookup, with the target it matched
    device: Mutex<Option<(String, Device)>>,
    scan_timeout: Duration,
}

impl BleTransport {
    const DEFAULT_SCAN_TIMEOUT_S: u64 = 5;

    /// Open the default adapter and wait for it to be powered on
    pub async fn new() -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        Ok(Self {
            adapter,
            device: Mutex::new(None),
            scan_timeout: Duration::from_secs(Self::DEFAULT_SCAN_TIMEOUT_S),
        })
    }

    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    fn cached_device(&self, target: &str) -> Option<Device> {
        let cache = self.device.lock().ok()?;
        match cache.as_ref() {
            Some((cached_target, device)) if cached_target == target => Some(device.clone()),
            _ => None,
        }
    }

    fn current_device(&self) -> Option<Device> {
        self.device
            .lock()
            .ok()
            .and_then(|cache| cache.as_ref().map(|(_, device)| device.clone()))
    }

    fn remember(&self, target: &str, device: &Device) {
        if let Ok(mut cache) = self.device.lock() {
            *cache = Some((target.to_string(), device.clone()));
        }
    }

    async fn discover_device(&self, target: &str) -> anyhow::Result<Device> {
        let required_services = [GattProfile::POWER_STATION.service];
        let mut adapter_events = self.adapter.scan(&required_services).await?;
        while let Some(found) = timeout(self.scan_timeout, adapter_events.next())
            .await
            .map_err(|_| anyhow!("Device not found"))?
        {
            if Self::matches(&found.device, target).await {
                return Ok(found.device);
            }
        }

        Err(anyhow!("Device not found"))
    }

    /// Match on advertised name, or on the platform device id
    async fn matches(device: &Device, target: &str) -> bool {
        if target.is_empty() {
            return false;
        }
        if let Ok(name) = device.name_async().await {
            if name == target {
                return true;
            }
        }
        id_matches(&device.id().to_string(), target)
    }

    async fn first_characteristic(
        service: &bluest::Service,
        uuid: bluest::Uuid,
        role: &str,
    ) -> anyhow::Result<Characteristic> {
        service
            .discover_characteristics_with_uuid(uuid)
            .await?
            .first()
            .cloned()
            .ok_or(anyhow!("The device does not support the {role} characteristic {uuid}"))
    }
}

impl Transport for BleTransport {
    type Handle = Characteristic;

    async fn connect(&self, target: &str, mode: AddressMode) -> anyhow::Result<()> {
        let device = match (mode, self.cached_device(target)) {
            (AddressMode::Public, Some(device)) => device,
            _ => self.discover_device(target).await?,
        };

        if !device.is_connected().await {
            self.adapter.connect_device(&device).await?;
        }
        info!(device = %target, mode = %mode, "Connected");
        self.remember(target, &device);
        Ok(())
    }

    async fn resolve(&self, profile: &GattProfile) -> anyhow::Result<Endpoints<Characteristic>> {
        let device = self.current_device().ok_or(anyhow!("Not connected"))?;

        let service = device
            .discover_services_with_uuid(profile.service)
            .await?
            .first()
            .cloned()
            .ok_or(anyhow!("The device does not support the service {}", profile.service))?;
        let outbound = Self::first_characteristic(&service, profile.write, "write").await?;
        let inbound = Self::first_characteristic(&service, profile.notify, "notify").await?;

        Ok(Endpoints { outbound, inbound })
    }

    async fn subscribe(&self, inbound: &Characteristic) -> anyhow::Result<Notifications> {
        let characteristic = inbound.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        // The notify stream borrows the characteristic, so it lives on its own task
        tokio::spawn(async move {
            let mut reader = match characteristic.notify().await {
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            while let Some(item) = reader.next().await {
                match item {
                    Ok(data) => {
                        if tx.send(data).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "Notification error");
                        return;
                    }
                }
            }

            debug!("End of notification stream");
        });

        ready_rx
            .await
            .map_err(|_| anyhow!("Notification task exited before subscribing"))??;
        Ok(channel_notifications(rx))
    }

    async fn write(&self, outbound: &Characteristic, frame: &[u8]) -> anyhow::Result<()> {
        outbound.write(frame).await?;
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(device) = self.current_device() {
            self.adapter.disconnect_device(&device).await?;
        }
        Ok(())
    }
}

/// Parse a MAC address written as six hex pairs separated by `:` or `-`
fn parse_address(text: &str) -> Option<[u8; 6]> {
    let mut address = [0u8; 6];
    let mut parts = text.split([':', '-']);
    for byte in address.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(address)
}

/// The id is the MAC address on Linux, ends with it on Windows, and is an
/// opaque UUID on macOS that can only be given verbatim
fn id_matches(id: &str, target: &str) -> bool {
    if id.eq_ignore_ascii_case(target) {
        return true;
    }
    let Some(wanted) = parse_address(target) else {
        return false;
    };
    let Some(start) = id.len().checked_sub(17) else {
        return false;
    };
    id.get(start..).and_then(parse_address) == Some(wanted)
}

#[test]
fn test_parse_address() {
    assert_eq!(
        parse_address("C8:FD:19:3d:8b:fa"),
        Some([0xc8, 0xfd, 0x19, 0x3d, 0x8b, 0xfa])
    );
    assert_eq!(
        parse_address("c8-fd-19-3d-8b-fa"),
        Some([0xc8, 0xfd, 0x19, 0x3d, 0x8b, 0xfa])
    );
    assert_eq!(parse_address("c8:fd:19:3d:8b"), None);
    assert_eq!(parse_address("c8:fd:19:3d:8b:fa:00"), None);
    assert_eq!(parse_address("c8:fd:19:3d:8b:+f"), None);
    assert_eq!(parse_address(""), None);
}

#[test]
fn test_id_matches_whole_address_only() {
    let linux = "C8:FD:19:3D:8B:FA";
    assert!(id_matches(linux, "c8:fd:19:3d:8b:fa"));
    assert!(id_matches(linux, "C8-FD-19-3D-8B-FA"));
    assert!(!id_matches(linux, "8B:FA"));
    assert!(!id_matches(linux, "c8"));
    assert!(!id_matches(linux, "C8:FD:19:3D:8B:FB"));

    let windows = "BluetoothLE#BluetoothLE00:1a:7d:da:71:13-c8:fd:19:3d:8b:fa";
    assert!(id_matches(windows, "C8:FD:19:3D:8B:FA"));
    assert!(!id_matches(windows, "00:1a:7d:da:71:13"));
    assert!(!id_matches(windows, "BluetoothLE"));

    let macos = "5F0E6A3C-2B1D-4C8E-9A7F-1E2D3C4B5A69";
    assert!(id_matches(macos, "5f0e6a3c-2b1d-4c8e-9a7f-1e2d3c4b5a69"));
    assert!(!id_matches(macos, "5F0E6A3C"));
}
