//! Link lifecycle: connect, resolve, subscribe, and reconnect with backoff.
//!
//! ```text
//! Disconnected -> Connecting -> ResolvingCapabilities -> Ready
//!      ^               |                  |                 |
//!      +---------------+------------------+-----------------+
//! ```
//!
//! Retries are evaluated on every [`ConnectionManager::poll`] against a
//! monotonic clock, never by sleeping. After `max_failures` consecutive
//! failed attempts the manager stops trying until [`ConnectionManager::rearm`]
//! or a fresh [`ConnectionManager::connect`].

use crate::codec::RequestFrame;
use crate::error::{Error, Result};
use crate::transport::{AddressMode, Endpoints, GattProfile, Notifications, Transport};
use futures_util::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ResolvingCapabilities,
    /// Subscribed to notifications, requests may be sent
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ResolvingCapabilities => "resolving capabilities",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Link state as shown to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No target, or explicitly disconnected
    Idle,
    Connecting,
    Connected,
    Retrying {
        failures: u32,
        next_attempt_in: Duration,
    },
    /// Reconnects suspended until re-armed
    GaveUp { failures: u32 },
}

/// Exponential backoff with an optional give-up point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// How many times the delay may double
    pub max_doublings: u32,
    /// Consecutive failures after which retrying stops, `None` to retry forever
    pub max_failures: Option<u32>,
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of consecutive failures so far
    pub fn delay_after(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(self.max_doublings).min(31);
        self.base.saturating_mul(1u32 << doublings)
    }

    pub fn gives_up_after(&self, failures: u32) -> bool {
        self.max_failures.is_some_and(|max| failures >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max_doublings: 2,
            max_failures: Some(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub profile: GattProfile,
    /// Bound on each individual connect call
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Notifications buffered between the transport and the client loop
    pub queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            profile: GattProfile::POWER_STATION,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            queue_capacity: 32,
        }
    }
}

/// Something that happened on the link since the last drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification(Vec<u8>),
    /// The notification stream ended, the link is gone
    Closed,
}

/// Events are tagged with the session that produced them so that stragglers
/// from a previous link are not mistaken for current ones
#[derive(Debug)]
struct Envelope {
    session: u64,
    event: LinkEvent,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    options: ConnectionOptions,
    state: ConnectionState,
    target: Option<String>,
    /// False after an explicit disconnect
    armed: bool,
    failures: u32,
    gave_up: bool,
    next_attempt: Option<Instant>,
    endpoints: Option<Endpoints<T::Handle>>,
    session: u64,
    events_tx: mpsc::Sender<Envelope>,
    events_rx: mpsc::Receiver<Envelope>,
    forwarder: Option<JoinHandle<()>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, options: ConnectionOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.queue_capacity.max(1));
        Self {
            transport,
            options,
            state: ConnectionState::Disconnected,
            target: None,
            armed: false,
            failures: 0,
            gave_up: false,
            next_attempt: None,
            endpoints: None,
            session: 0,
            events_tx,
            events_rx,
            forwarder: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Consecutive failed attempts since the last success or re-arm
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn status(&self, now: Instant) -> LinkStatus {
        match self.state {
            ConnectionState::Ready => LinkStatus::Connected,
            ConnectionState::Connecting | ConnectionState::ResolvingCapabilities => {
                LinkStatus::Connecting
            }
            ConnectionState::Disconnected if self.gave_up => LinkStatus::GaveUp {
                failures: self.failures,
            },
            ConnectionState::Disconnected if !self.armed => LinkStatus::Idle,
            ConnectionState::Disconnected => match self.next_attempt {
                Some(at) => LinkStatus::Retrying {
                    failures: self.failures,
                    next_attempt_in: at.saturating_duration_since(now),
                },
                None => LinkStatus::Idle,
            },
        }
    }

    /// Arm the manager for `target` and make one attempt right away
    pub async fn connect(&mut self, target: &str, now: Instant) -> Result<()> {
        if self.is_ready() && self.target.as_deref() == Some(target) {
            return Ok(());
        }
        if self.state != ConnectionState::Disconnected || self.endpoints.is_some() {
            self.disconnect().await?;
        }

        self.target = Some(target.to_string());
        self.armed = true;
        self.failures = 0;
        self.gave_up = false;
        self.attempt(now).await
    }

    /// Run the retry policy. Returns the outcome when an attempt was due.
    pub async fn poll(&mut self, now: Instant) -> Option<Result<()>> {
        if self.state != ConnectionState::Disconnected || !self.armed || self.gave_up {
            return None;
        }
        match self.next_attempt {
            Some(at) if now >= at => {
                info!(
                    attempt = self.failures + 1,
                    max = ?self.options.retry.max_failures,
                    "Retrying connection"
                );
                Some(self.attempt(now).await)
            }
            _ => None,
        }
    }

    /// Clear the give-up state and retry on the next poll
    pub fn rearm(&mut self, now: Instant) {
        self.failures = 0;
        self.gave_up = false;
        self.armed = self.target.is_some();
        self.next_attempt = Some(now);
        info!("Connection re-armed");
    }

    /// Drop the link and stop reconnecting
    pub async fn disconnect(&mut self) -> Result<()> {
        self.armed = false;
        self.next_attempt = None;
        self.release();
        self.transport.disconnect().await?;
        info!("Disconnected");
        Ok(())
    }

    /// The link went away underneath us; reconnect on the next poll
    pub fn link_lost(&mut self, now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        warn!(device = ?self.target, "Link lost");
        self.release();
        self.next_attempt = Some(now);
    }

    /// Take the next pending event, if any, without waiting
    pub fn next_event(&mut self) -> Option<LinkEvent> {
        while let Ok(envelope) = self.events_rx.try_recv() {
            if envelope.session == self.session {
                return Some(envelope.event);
            }
            trace!(session = envelope.session, "Dropping event from a previous link");
        }
        None
    }

    pub async fn send(&mut self, frame: &RequestFrame) -> Result<()> {
        let endpoints = match (&self.state, &self.endpoints) {
            (ConnectionState::Ready, Some(endpoints)) => endpoints,
            _ => return Err(Error::NotConnected),
        };

        let bytes = frame.to_bytes();
        debug!(frame = %hex::encode(bytes), "TX");
        self.transport
            .write(&endpoints.outbound, &bytes)
            .await
            .map_err(Error::from)
    }

    async fn attempt(&mut self, now: Instant) -> Result<()> {
        let Some(target) = self.target.clone() else {
            return Err(Error::NotConnected);
        };

        self.state = ConnectionState::Connecting;
        if let Err(err) = self.open(&target).await {
            return self.fail(err, now);
        }

        self.state = ConnectionState::ResolvingCapabilities;
        let endpoints = match self.transport.resolve(&self.options.profile).await {
            Ok(endpoints) => endpoints,
            Err(err) => return self.abandon(err.into(), now).await,
        };
        let notifications = match self.transport.subscribe(&endpoints.inbound).await {
            Ok(notifications) => notifications,
            Err(err) => return self.abandon(err.into(), now).await,
        };

        self.session += 1;
        self.forwarder = Some(spawn_forwarder(
            notifications,
            self.session,
            self.events_tx.clone(),
        ));
        self.endpoints = Some(endpoints);
        self.state = ConnectionState::Ready;
        self.failures = 0;
        self.next_attempt = None;
        info!(device = %target, "Subscribed to notifications");
        Ok(())
    }

    /// Connect with the public address, falling back once to the random one
    async fn open(&self, target: &str) -> Result<()> {
        match self.open_with(target, AddressMode::Public).await {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(error = %err, "Public address failed, trying random address");
                self.open_with(target, AddressMode::Random).await
            }
        }
    }

    async fn open_with(&self, target: &str, mode: AddressMode) -> Result<()> {
        info!(device = %target, mode = %mode, "Connecting");
        match timeout(
            self.options.connect_timeout,
            self.transport.connect(target, mode),
        )
        .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Connected but unusable: hang up before counting the failure
    async fn abandon(&mut self, err: Error, now: Instant) -> Result<()> {
        if let Err(disconnect_err) = self.transport.disconnect().await {
            debug!(error = %disconnect_err, "Disconnect after failed setup also failed");
        }
        self.fail(err, now)
    }

    fn fail(&mut self, err: Error, now: Instant) -> Result<()> {
        self.release();
        self.failures += 1;

        if self.options.retry.gives_up_after(self.failures) {
            self.gave_up = true;
            self.next_attempt = None;
            warn!(
                error = %err,
                failures = self.failures,
                "Connection failed, giving up until re-armed"
            );
            return Err(Error::GaveUp {
                failures: self.failures,
            });
        }

        let delay = self.options.retry.delay_after(self.failures);
        self.next_attempt = Some(now + delay);
        warn!(
            error = %err,
            failures = self.failures,
            retry_in_s = delay.as_secs(),
            "Connection failed"
        );
        Err(err)
    }

    /// Forget everything tied to the current link
    fn release(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.endpoints = None;
        self.state = ConnectionState::Disconnected;
        self.session += 1;
    }
}

/// Move notifications from the transport's context into the bounded queue
fn spawn_forwarder(
    mut notifications: Notifications,
    session: u64,
    events: mpsc::Sender<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = notifications.next().await {
            trace!(len = data.len(), data = %hex::encode(&data), "RX notification");
            let envelope = Envelope {
                session,
                event: LinkEvent::Notification(data),
            };
            match events.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("Notification queue full, dropping frame"),
                Err(TrySendError::Closed(_)) => return,
            }
        }

        debug!("End of notification stream");
        let _ = events
            .send(Envelope {
                session,
                event: LinkEvent::Closed,
            })
            .await;
    })
}

#[cfg(test)]
use crate::codec::{read_request, MessageKind};
#[cfg(test)]
use crate::transport::mock::MockTransport;

#[cfg(test)]
fn manager(transport: &MockTransport) -> ConnectionManager<MockTransport> {
    ConnectionManager::new(transport.clone(), ConnectionOptions::default())
}

#[cfg(test)]
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[test]
fn test_backoff_doubles_then_caps() {
    let policy = RetryPolicy::default();
    let delays: Vec<u64> = (1..=5).map(|n| policy.delay_after(n).as_secs()).collect();
    assert_eq!(delays, vec![60, 120, 240, 240, 240]);
    assert!(!policy.gives_up_after(4));
    assert!(policy.gives_up_after(5));
}

#[test]
fn test_policy_without_cap_never_gives_up() {
    let policy = RetryPolicy {
        max_failures: None,
        ..RetryPolicy::default()
    };
    assert!(!policy.gives_up_after(u32::MAX));
}

#[tokio::test(start_paused = true)]
async fn test_connect_success() {
    let transport = MockTransport::new();
    let mut link = manager(&transport);
    assert_eq!(link.status(Instant::now()), LinkStatus::Idle);

    link.connect("FOSSIBOT", Instant::now()).await.unwrap();

    assert_eq!(link.state(), ConnectionState::Ready);
    assert_eq!(link.status(Instant::now()), LinkStatus::Connected);
    assert_eq!(
        transport.connect_calls(),
        vec![("FOSSIBOT".to_string(), AddressMode::Public)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_random_address() {
    let transport = MockTransport::new();
    transport.refuse_mode(AddressMode::Public);
    let mut link = manager(&transport);

    link.connect("FOSSIBOT", Instant::now()).await.unwrap();

    let modes: Vec<AddressMode> = transport.connect_calls().into_iter().map(|(_, m)| m).collect();
    assert_eq!(modes, vec![AddressMode::Public, AddressMode::Random]);
    assert!(link.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let transport = MockTransport::new();
    transport.hang_connect(true);
    let mut link = manager(&transport);

    let result = link.connect("FOSSIBOT", Instant::now()).await;

    assert_eq!(result, Err(Error::Timeout));
    assert_eq!(link.failures(), 1);
    assert_eq!(transport.connect_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_resolve_and_subscribe_failures_count() {
    let transport = MockTransport::new();
    transport.missing_service(true);
    let mut link = manager(&transport);

    assert!(link.connect("FOSSIBOT", Instant::now()).await.is_err());
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.failures(), 1);
    assert_eq!(transport.disconnects(), 1);

    transport.missing_service(false);
    transport.refuse_subscribe(true);
    let later = Instant::now() + Duration::from_secs(60);
    assert!(matches!(link.poll(later).await, Some(Err(_))));
    assert_eq!(link.failures(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_and_give_up() {
    let transport = MockTransport::new();
    transport.refuse_connect(true);
    let mut link = manager(&transport);
    let t0 = Instant::now();

    assert!(link.connect("FOSSIBOT", t0).await.is_err());
    let mut now = t0;
    let mut delays = Vec::new();
    while let Some(at) = link.next_attempt() {
        delays.push(at.duration_since(now).as_secs());
        // One second early: nothing happens
        assert!(link.poll(at - Duration::from_secs(1)).await.is_none());
        now = at;
        link.poll(now).await;
    }

    assert_eq!(delays, vec![60, 120, 240, 240]);
    assert!(link.gave_up());
    assert_eq!(link.status(now), LinkStatus::GaveUp { failures: 5 });

    let calls = transport.connect_calls().len();
    assert!(link.poll(now + Duration::from_secs(3600)).await.is_none());
    assert_eq!(transport.connect_calls().len(), calls);

    transport.refuse_connect(false);
    link.rearm(now);
    assert_eq!(link.poll(now).await, Some(Ok(())));
    assert!(link.is_ready());
    assert_eq!(link.failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_give_up_is_configurable() {
    let transport = MockTransport::new();
    transport.refuse_connect(true);
    let options = ConnectionOptions {
        retry: RetryPolicy {
            base: Duration::from_secs(1),
            max_doublings: 0,
            max_failures: None,
        },
        ..ConnectionOptions::default()
    };
    let mut link = ConnectionManager::new(transport.clone(), options);
    let mut now = Instant::now();
    let _ = link.connect("FOSSIBOT", now).await;
    for _ in 0..20 {
        now += Duration::from_secs(1);
        assert!(link.poll(now).await.is_some());
    }
    assert!(!link.gave_up());
    assert_eq!(link.failures(), 21);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_is_reported_and_retried() {
    let transport = MockTransport::new();
    let mut link = manager(&transport);
    let now = Instant::now();
    link.connect("FOSSIBOT", now).await.unwrap();

    assert!(transport.notify(&[1, 2, 3]));
    transport.drop_link();
    settle().await;

    assert_eq!(link.next_event(), Some(LinkEvent::Notification(vec![1, 2, 3])));
    assert_eq!(link.next_event(), Some(LinkEvent::Closed));
    link.link_lost(now);
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.send(&read_request(MessageKind::Telemetry)).await, Err(Error::NotConnected));

    assert_eq!(link.poll(now).await, Some(Ok(())));
    assert!(link.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_newest_and_still_reports_closed() {
    let transport = MockTransport::new();
    let options = ConnectionOptions {
        queue_capacity: 2,
        ..ConnectionOptions::default()
    };
    let mut link = ConnectionManager::new(transport.clone(), options);
    link.connect("FOSSIBOT", Instant::now()).await.unwrap();

    for n in 0..5u8 {
        assert!(transport.notify(&[n]));
    }
    transport.drop_link();
    settle().await;

    let mut drained = Vec::new();
    while let Some(event) = link.next_event() {
        drained.push(event);
    }
    assert_eq!(
        drained,
        vec![
            LinkEvent::Notification(vec![0]),
            LinkEvent::Notification(vec![1]),
        ]
    );

    settle().await;
    assert_eq!(link.next_event(), Some(LinkEvent::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_send_writes_frame() {
    let transport = MockTransport::new();
    let mut link = manager(&transport);
    link.connect("FOSSIBOT", Instant::now()).await.unwrap();

    link.send(&read_request(MessageKind::Telemetry)).await.unwrap();
    assert_eq!(transport.writes(), vec![hex::decode("110400000050a6f2").unwrap()]);

    transport.refuse_writes(true);
    let result = link.send(&read_request(MessageKind::Settings)).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(link.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_stops_retries() {
    let transport = MockTransport::new();
    let mut link = manager(&transport);
    let now = Instant::now();
    link.connect("FOSSIBOT", now).await.unwrap();
    transport.notify(&[9, 9]);
    settle().await;

    link.disconnect().await.unwrap();

    assert_eq!(link.status(now), LinkStatus::Idle);
    assert_eq!(link.next_event(), None);
    assert!(link.poll(now + Duration::from_secs(3600)).await.is_none());
}
