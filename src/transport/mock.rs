//! Scriptable in-memory [`Transport`] for tests.

use super::{channel_notifications, AddressMode, Endpoints, GattProfile, Notifications, Transport};
use anyhow::anyhow;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    refuse_connect: bool,
    /// Modes that fail even when connecting is otherwise allowed
    refuse_modes: Vec<AddressMode>,
    hang_connect: bool,
    missing_service: bool,
    refuse_subscribe: bool,
    refuse_writes: bool,
    connect_calls: Vec<(String, AddressMode)>,
    writes: Vec<Vec<u8>>,
    disconnects: usize,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Cheap to clone; clones share state so a test can keep a handle while the
/// client owns the transport
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    pub fn refuse_mode(&self, mode: AddressMode) {
        self.state().refuse_modes.push(mode);
    }

    pub fn hang_connect(&self, hang: bool) {
        self.state().hang_connect = hang;
    }

    pub fn missing_service(&self, missing: bool) {
        self.state().missing_service = missing;
    }

    pub fn refuse_subscribe(&self, refuse: bool) {
        self.state().refuse_subscribe = refuse;
    }

    pub fn refuse_writes(&self, refuse: bool) {
        self.state().refuse_writes = refuse;
    }

    pub fn connect_calls(&self) -> Vec<(String, AddressMode)> {
        self.state().connect_calls.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn take_writes(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().writes)
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Deliver a notification as the station would; false when nothing is subscribed
    pub fn notify(&self, data: &[u8]) -> bool {
        match &self.state().notify_tx {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulate the radio link dropping
    pub fn drop_link(&self) {
        self.state().notify_tx = None;
    }
}

impl Transport for MockTransport {
    type Handle = &'static str;

    async fn connect(&self, target: &str, mode: AddressMode) -> anyhow::Result<()> {
        let (refused, hang) = {
            let mut state = self.state();
            state.connect_calls.push((target.to_string(), mode));
            (
                state.refuse_connect || state.refuse_modes.contains(&mode),
                state.hang_connect,
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if refused {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    async fn resolve(&self, _profile: &GattProfile) -> anyhow::Result<Endpoints<&'static str>> {
        if self.state().missing_service {
            return Err(anyhow!("service not found"));
        }
        Ok(Endpoints {
            outbound: "c304",
            inbound: "c305",
        })
    }

    async fn subscribe(&self, _inbound: &&'static str) -> anyhow::Result<Notifications> {
        let mut state = self.state();
        if state.refuse_subscribe {
            return Err(anyhow!("subscribe failed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.notify_tx = Some(tx);
        Ok(channel_notifications(rx))
    }

    async fn write(&self, _outbound: &&'static str, frame: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state();
        if state.refuse_writes {
            return Err(anyhow!("write failed"));
        }
        state.writes.push(frame.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let mut state = self.state();
        state.disconnects += 1;
        state.notify_tx = None;
        Ok(())
    }
}
