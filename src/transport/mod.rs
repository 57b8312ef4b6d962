//! The radio link the protocol client runs over.
//!
//! The station tunnels its register protocol through one GATT service with a
//! write characteristic for requests and a notify characteristic for
//! responses. [`Transport`] is the capability the client needs from a BLE
//! stack; [`ble::BleTransport`] provides it on top of `bluest`.

pub mod ble;
#[cfg(test)]
pub(crate) mod mock;

use bluest::Uuid;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

/// Notifications received on the inbound characteristic, ending on link loss
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// Turn the receiving half of a channel into a notification stream
pub(crate) fn channel_notifications(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Notifications {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|data| (data, rx)) }).boxed()
}

/// How the peer address is interpreted when connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Public,
    Random,
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressMode::Public => f.write_str("public"),
            AddressMode::Random => f.write_str("random"),
        }
    }
}

/// The GATT service and characteristics the protocol runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl GattProfile {
    /// Service `a002` with write characteristic `c304` and notify characteristic `c305`
    pub const POWER_STATION: GattProfile = GattProfile {
        service: Uuid::from_u128(0x0000a002_0000_1000_8000_00805f9b34fb),
        write: Uuid::from_u128(0x0000c304_0000_1000_8000_00805f9b34fb),
        notify: Uuid::from_u128(0x0000c305_0000_1000_8000_00805f9b34fb),
    };
}

impl Default for GattProfile {
    fn default() -> Self {
        Self::POWER_STATION
    }
}

/// Resolved characteristic handles
#[derive(Debug, Clone)]
pub struct Endpoints<H> {
    pub outbound: H,
    pub inbound: H,
}

/// What the protocol client needs from a BLE stack.
///
/// Every operation either succeeds or fails; timeouts are applied by the
/// caller.
pub trait Transport: Send + Sync {
    /// Handle to a resolved characteristic
    type Handle: Clone + Send + Sync + 'static;

    /// Establish a link to the device identified by `target`
    fn connect(
        &self,
        target: &str,
        mode: AddressMode,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Look up the service and both characteristics on the connected device
    fn resolve(
        &self,
        profile: &GattProfile,
    ) -> impl Future<Output = anyhow::Result<Endpoints<Self::Handle>>> + Send;

    /// Start receiving notifications from the inbound characteristic
    fn subscribe(
        &self,
        inbound: &Self::Handle,
    ) -> impl Future<Output = anyhow::Result<Notifications>> + Send;

    fn write(
        &self,
        outbound: &Self::Handle,
        frame: &[u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}
