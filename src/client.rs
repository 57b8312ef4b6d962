//! The surface a UI or CLI talks to.
//!
//! [`PowerStationClient`] is driven by calling [`PowerStationClient::tick`]
//! from the caller's loop. Each tick drains the notification queue into the
//! snapshot, runs the reconnect policy and sends whatever polls are due.
//! Nothing in a tick waits on the device; replies are picked up by a later
//! tick.

use crate::codec::{build_write_request, read_request, MessageKind};
use crate::connection::{ConnectionManager, ConnectionOptions, LinkEvent, LinkStatus};
use crate::dispatcher::dispatch;
use crate::error::Result;
use crate::gate::{ChangeGate, GateConfig};
use crate::poller::{PollSchedule, Poller};
use crate::registers::{settings, Output, Register};
use crate::snapshot::{DeviceSnapshot, LightMode};
use crate::transport::Transport;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub connection: ConnectionOptions,
    pub polling: PollSchedule,
    pub gate: GateConfig,
}

pub struct PowerStationClient<T: Transport> {
    link: ConnectionManager<T>,
    poller: Poller,
    gate: ChangeGate,
    snapshot: DeviceSnapshot,
}

impl<T: Transport> PowerStationClient<T> {
    pub fn new(transport: T, options: ClientOptions) -> Self {
        Self {
            link: ConnectionManager::new(transport, options.connection),
            poller: Poller::new(options.polling),
            gate: ChangeGate::new(options.gate),
            snapshot: DeviceSnapshot::new(),
        }
    }

    /// Connect to the station and keep reconnecting per the retry policy
    pub async fn connect(&mut self, device_id: &str) -> Result<()> {
        if self.link.is_ready() && self.link.target() == Some(device_id) {
            return Ok(());
        }

        let now = Instant::now();
        let result = self.link.connect(device_id, now).await;
        self.sync_link_state();
        if result.is_ok() {
            self.enter_ready();
            self.send_due_polls(now).await;
        }
        result
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        let result = self.link.disconnect().await;
        self.snapshot.mark_disconnected();
        result
    }

    /// Clear a give-up and retry on the next tick
    pub fn rearm(&mut self) {
        self.link.rearm(Instant::now());
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_ready()
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status(Instant::now())
    }

    pub fn snapshot(&self) -> &DeviceSnapshot {
        &self.snapshot
    }

    /// Whether the snapshot has changed enough to be worth showing again
    pub fn has_significant_change(&self) -> bool {
        self.gate.should_publish(&self.snapshot, Instant::now())
    }

    /// Record the current snapshot as shown
    pub fn mark_published(&mut self) {
        self.gate.mark_published(&self.snapshot, Instant::now());
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    /// One pass of the client loop
    pub async fn tick(&mut self) {
        let now = Instant::now();
        self.drain_events(now);

        if let Some(result) = self.link.poll(now).await {
            self.sync_link_state();
            if result.is_ok() {
                self.enter_ready();
            }
        }

        self.send_due_polls(now).await;
    }

    fn drain_events(&mut self, now: Instant) {
        while let Some(event) = self.link.next_event() {
            match event {
                LinkEvent::Notification(data) => {
                    dispatch(&data, &mut self.snapshot, now);
                }
                LinkEvent::Closed => {
                    self.link.link_lost(now);
                    self.snapshot.mark_disconnected();
                }
            }
        }
    }

    fn sync_link_state(&mut self) {
        if !self.link.is_ready() {
            self.snapshot.mark_disconnected();
        }
    }

    fn enter_ready(&mut self) {
        self.snapshot.connected = true;
        self.poller.reset();
    }

    async fn send_due_polls(&mut self, now: Instant) {
        if !self.link.is_ready() {
            return;
        }
        for kind in self.poller.due(now) {
            self.request(kind).await;
        }
    }

    async fn request(&mut self, kind: MessageKind) {
        match self.link.send(&read_request(kind)).await {
            Ok(()) => debug!(kind = %kind, "Requested data"),
            Err(err) => warn!(kind = %kind, error = %err, "Poll request failed"),
        }
    }

    /// Switch an output. The snapshot flag is flipped right away for UI
    /// feedback and corrected by the next telemetry poll.
    pub async fn set_output(&mut self, output: Output, on: bool) -> Result<()> {
        self.write(output.control_register(), on as u16).await?;
        self.snapshot.outputs.set(output, on);
        Ok(())
    }

    /// Flip an output relative to the last reported state; returns the requested state
    pub async fn toggle_output(&mut self, output: Output) -> Result<bool> {
        let on = !self.snapshot.outputs.get(output);
        self.set_output(output, on).await?;
        Ok(on)
    }

    pub async fn set_light_mode(&mut self, mode: LightMode) -> Result<()> {
        self.write(settings::LIGHT_MODE, mode.as_raw()).await
    }

    pub async fn set_buzzer_enabled(&mut self, enabled: bool) -> Result<()> {
        self.write(settings::KEY_SOUND, enabled as u16).await
    }

    pub async fn set_silent_charging(&mut self, enabled: bool) -> Result<()> {
        self.write(settings::SILENT_CHARGING, enabled as u16).await
    }

    /// Lower state-of-charge limit, clamped to 0-30 %
    pub async fn set_discharge_limit(&mut self, percent: u16) -> Result<()> {
        self.write(settings::DISCHARGE_LIMIT, percent.saturating_mul(10))
            .await
    }

    /// Upper state-of-charge limit, clamped to 60-100 %
    pub async fn set_charge_limit(&mut self, percent: u16) -> Result<()> {
        self.write(settings::CHARGE_LIMIT, percent.saturating_mul(10))
            .await
    }

    pub async fn set_screen_timeout(&mut self, minutes: u16) -> Result<()> {
        self.write(settings::SCREEN_TIMEOUT, minutes).await
    }

    pub async fn set_system_standby(&mut self, minutes: u16) -> Result<()> {
        self.write(settings::SYSTEM_STANDBY, minutes).await
    }

    pub async fn set_ac_standby(&mut self, minutes: u16) -> Result<()> {
        self.write(settings::AC_STANDBY, minutes).await
    }

    pub async fn set_dc_standby(&mut self, minutes: u16) -> Result<()> {
        self.write(settings::DC_STANDBY, minutes).await
    }

    pub async fn set_usb_standby(&mut self, seconds: u16) -> Result<()> {
        self.write(settings::USB_STANDBY, seconds).await
    }

    /// Start charging `minutes` from now
    pub async fn set_schedule_charge(&mut self, minutes: u16) -> Result<()> {
        self.write(settings::SCHEDULE_CHARGE, minutes).await
    }

    pub async fn power_off(&mut self) -> Result<()> {
        info!("Sending power off");
        self.write(settings::POWER_OFF, 1).await
    }

    async fn write(&mut self, register: Register, raw: u16) -> Result<()> {
        let value = register.clamp(raw);
        if value != raw {
            debug!(register = %register, requested = raw, value, "Clamped write");
        }

        let frame = build_write_request(register.index, value);
        match self.link.send(&frame).await {
            Ok(()) => {
                info!(register = %register, value, checksum = frame.checksum, "Sent command");
                Ok(())
            }
            Err(err) => {
                warn!(register = %register, value, error = %err, "Failed to send command");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
use crate::codec::encode_response;
#[cfg(test)]
use crate::error::Error;
#[cfg(test)]
use crate::registers::telemetry;
#[cfg(test)]
use crate::snapshot::OutputFlags;
#[cfg(test)]
use crate::transport::mock::MockTransport;
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use tokio::time::advance;

#[cfg(test)]
const TARGET: &str = "FOSSIBOT";

#[cfg(test)]
fn client(transport: &MockTransport) -> PowerStationClient<MockTransport> {
    let options = ClientOptions {
        polling: PollSchedule {
            telemetry_interval: Duration::from_secs(10),
            settings_interval: Duration::from_secs(60),
        },
        ..ClientOptions::default()
    };
    PowerStationClient::new(transport.clone(), options)
}

#[cfg(test)]
fn telemetry_frame(soc_tenths: u16, input: u16, output: u16, outputs: u16) -> Vec<u8> {
    let mut values = vec![0u16; 80];
    values[telemetry::STATE_OF_CHARGE.index as usize] = soc_tenths;
    values[telemetry::TOTAL_INPUT_WATTS.index as usize] = input;
    values[telemetry::OUTPUT_WATTS.index as usize] = output;
    values[telemetry::ACTIVE_OUTPUTS.index as usize] = outputs;
    encode_response(MessageKind::Telemetry, &values)
}

#[cfg(test)]
fn frame_hex(register: Register, value: u16) -> Vec<u8> {
    build_write_request(register.index, value).to_bytes().to_vec()
}

/// Let the forwarder task move notifications into the queue
#[cfg(test)]
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_publish_sequence() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    assert!(!client.is_connected());
    assert!(!client.has_significant_change());

    client.connect(TARGET).await.unwrap();
    assert!(client.is_connected());
    assert_eq!(
        transport.take_writes(),
        vec![
            hex::decode("110400000050a6f2").unwrap(),
            hex::decode("1103000000506647").unwrap(),
        ]
    );

    // First telemetry: SOC 56.0 %, 650 W in, 128 W out, USB and DC on
    let frame = telemetry_frame(560, 650, 128, 512 | 1024);
    transport.notify(&frame);
    settle().await;
    client.tick().await;

    let snapshot = client.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.battery_percent, 56.0);
    assert_eq!(snapshot.input_watts, 650);
    assert_eq!(snapshot.output_watts, 128);
    assert_eq!(snapshot.outputs, OutputFlags { usb: true, dc: true, ac: false });
    assert!(client.has_significant_change());
    client.mark_published();
    assert!(!client.has_significant_change());

    // Ten seconds later, identical values
    advance(Duration::from_secs(10)).await;
    client.tick().await;
    assert_eq!(transport.take_writes(), vec![hex::decode("110400000050a6f2").unwrap()]);
    transport.notify(&frame);
    settle().await;
    client.tick().await;
    assert!(!client.has_significant_change());

    // Thirty-five seconds after that, still identical: stale, publish anyway
    advance(Duration::from_secs(35)).await;
    transport.notify(&frame);
    settle().await;
    client.tick().await;
    assert!(client.has_significant_change());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_connect_sends_no_extra_reads() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    client.connect(TARGET).await.unwrap();
    assert_eq!(transport.take_writes().len(), 2);

    client.connect(TARGET).await.unwrap();
    assert!(client.is_connected());
    assert!(transport.take_writes().is_empty());
    assert_eq!(transport.connect_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_notification_leaves_snapshot() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    client.connect(TARGET).await.unwrap();
    transport.notify(&telemetry_frame(800, 0, 40, 0));
    settle().await;
    client.tick().await;
    let before = client.snapshot().clone();

    transport.notify(&[0x11, 0x04, 0x00]);
    transport.notify(&hex::decode("deadbeef000000010002").unwrap());
    settle().await;
    client.tick().await;

    assert_eq!(client.snapshot(), &before);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_keeps_values_and_reconnects() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    client.connect(TARGET).await.unwrap();
    transport.notify(&telemetry_frame(560, 650, 128, 0));
    settle().await;
    client.tick().await;

    transport.drop_link();
    settle().await;
    transport.refuse_connect(true);
    client.tick().await;

    assert!(!client.is_connected());
    assert!(!client.snapshot().connected);
    assert_eq!(client.snapshot().battery_percent, 56.0);
    assert!(matches!(
        client.status(),
        LinkStatus::Retrying { failures: 1, .. }
    ));

    transport.refuse_connect(false);
    advance(Duration::from_secs(60)).await;
    transport.take_writes();
    client.tick().await;
    assert!(client.is_connected());
    assert!(client.snapshot().connected);
    assert_eq!(transport.take_writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_gave_up_surfaces_in_status() {
    let transport = MockTransport::new();
    transport.refuse_connect(true);
    let mut client = client(&transport);
    assert!(client.connect(TARGET).await.is_err());

    for _ in 0..4 {
        advance(Duration::from_secs(240)).await;
        client.tick().await;
    }
    assert_eq!(client.status(), LinkStatus::GaveUp { failures: 5 });

    transport.refuse_connect(false);
    client.rearm();
    client.tick().await;
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_setters_clamp_and_encode() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    client.connect(TARGET).await.unwrap();
    transport.take_writes();

    client.set_charge_limit(120).await.unwrap();
    client.set_charge_limit(80).await.unwrap();
    client.set_discharge_limit(45).await.unwrap();
    client.set_light_mode(LightMode::Sos).await.unwrap();
    client.set_buzzer_enabled(false).await.unwrap();
    client.set_silent_charging(true).await.unwrap();
    client.set_screen_timeout(10).await.unwrap();
    client.set_system_standby(0).await.unwrap();
    client.set_ac_standby(120).await.unwrap();
    client.set_dc_standby(30).await.unwrap();
    client.set_usb_standby(300).await.unwrap();
    client.set_schedule_charge(90).await.unwrap();
    client.power_off().await.unwrap();

    assert_eq!(
        transport.take_writes(),
        vec![
            frame_hex(settings::CHARGE_LIMIT, 1000),
            frame_hex(settings::CHARGE_LIMIT, 800),
            frame_hex(settings::DISCHARGE_LIMIT, 300),
            frame_hex(settings::LIGHT_MODE, 3),
            frame_hex(settings::KEY_SOUND, 0),
            frame_hex(settings::SILENT_CHARGING, 1),
            frame_hex(settings::SCREEN_TIMEOUT, 10),
            frame_hex(settings::SYSTEM_STANDBY, 0),
            frame_hex(settings::AC_STANDBY, 120),
            frame_hex(settings::DC_STANDBY, 30),
            frame_hex(settings::USB_STANDBY, 300),
            frame_hex(settings::SCHEDULE_CHARGE, 90),
            frame_hex(settings::POWER_OFF, 1),
        ]
    );
    // Settings writes are only confirmed by the next poll
    assert!(!client.snapshot().settings.received);
    assert_eq!(client.snapshot().settings.charge_limit_pct, 100);
}

#[tokio::test(start_paused = true)]
async fn test_output_toggle_is_optimistic_until_next_poll() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    client.connect(TARGET).await.unwrap();
    transport.notify(&telemetry_frame(500, 0, 0, 0));
    settle().await;
    client.tick().await;
    client.mark_published();
    transport.take_writes();

    assert!(client.toggle_output(Output::Ac).await.unwrap());
    assert_eq!(transport.take_writes(), vec![frame_hex(settings::AC_OUTPUT, 1)]);
    assert!(client.snapshot().outputs.ac);
    assert!(client.has_significant_change());

    // The station did not switch: the next poll wins
    transport.notify(&telemetry_frame(500, 0, 0, 0));
    settle().await;
    client.tick().await;
    assert!(!client.snapshot().outputs.ac);
}

#[tokio::test(start_paused = true)]
async fn test_writes_need_a_link() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    assert_eq!(client.set_output(Output::Usb, true).await, Err(Error::NotConnected));
    assert!(!client.snapshot().outputs.usb);

    client.connect(TARGET).await.unwrap();
    transport.refuse_writes(true);
    assert!(matches!(
        client.set_buzzer_enabled(true).await,
        Err(Error::Transport(_))
    ));
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_marks_stale() {
    let transport = MockTransport::new();
    let mut client = client(&transport);
    client.connect(TARGET).await.unwrap();
    client.disconnect().await.unwrap();

    assert!(!client.snapshot().connected);
    assert_eq!(client.status(), LinkStatus::Idle);
    assert_eq!(transport.disconnects(), 1);
}
