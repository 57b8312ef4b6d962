//! Monitor and control portable power stations over Bluetooth Low Energy
//!
//! Tested with Fossibot-style stations (F2400 and relatives). The station exposes a single GATT service
//! with one characteristic for requests and one for notifications. On top of that sits a Modbus-RTU-like
//! register protocol: 8 byte requests protected by a CRC-16/MODBUS, answered by notifications that carry a
//! whole register bank.
//!
//! Currently the following data can be accessed:
//!
//! - State of charge (%)
//! - Battery voltage (v)
//! - AC, DC and total input power (W)
//! - Output power (W)
//! - Which of the USB, DC and AC outputs are switched on
//! - Estimated time to full and to empty
//! - Device settings (charge limits, standby timers, light, buzzer, ...)
//!
//! And the following can be changed:
//!
//! - USB, DC and AC outputs on or off
//! - All of the settings above
//! - Power off
//!
//! The client never blocks on the device. Drive it by calling [`PowerStationClient::tick`] from your own loop;
//! it reconnects with exponential backoff when the link drops.
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! # use powerstation_ble::{BleTransport, ClientOptions, PowerStationClient};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let transport = BleTransport::new().await?;
//!     let mut client = PowerStationClient::new(transport, ClientOptions::default());
//!     client.connect("FOSSIBOT-F2400").await?;
//!     loop {
//!         client.tick().await;
//!         if client.has_significant_change() {
//!             println!("{:?}", client.snapshot());
//!             client.mark_published();
//!         }
//!         tokio::time::sleep(Duration::from_secs(1)).await;
//!     }
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod poller;
pub mod registers;
pub mod snapshot;
pub mod transport;

pub use client::{ClientOptions, PowerStationClient};
pub use config::{load_config, Config};
pub use connection::{ConnectionState, LinkStatus, RetryPolicy};
pub use error::{Error, Result};
pub use registers::Output;
pub use snapshot::{format_minutes, DeviceSettings, DeviceSnapshot, LightMode, OutputFlags};
pub use transport::ble::BleTransport;
pub use transport::Transport;
