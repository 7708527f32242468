use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mqtt::session::{BrokerSession, DisconnectReason};

/// Extra delay on top of the retry interval. A retry is due only once strictly
/// more than the interval has passed, so waking exactly at the interval would
/// find nothing to do.
const RETRY_SLACK: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Fixed-interval retry timing
#[derive(Clone, Copy, Debug)]
pub struct RetrySchedule {
    last_attempt: Option<Instant>,
    retry_interval: Duration,
}

impl RetrySchedule {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            last_attempt: None,
            retry_interval,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// True once strictly more than `retry_interval` has passed since the last
    /// recorded attempt
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last) => now.saturating_duration_since(last) > self.retry_interval,
            None => true,
        }
    }

    /// Earliest instant at which [`RetrySchedule::is_due`] holds
    pub fn due_at(&self) -> Option<Instant> {
        self.last_attempt
            .map(|last| last + self.retry_interval + RETRY_SLACK)
    }
}

/// Decides when the broker connection is (re)attempted.
///
/// Only this type changes the connection state or the retry schedule. All
/// methods return immediately; connection results arrive later through
/// [`ReconnectSupervisor::on_broker_connected`] and
/// [`ReconnectSupervisor::on_broker_disconnected`].
#[derive(Debug)]
pub struct ReconnectSupervisor {
    state: ConnectionState,
    schedule: RetrySchedule,
    // Set after a failed attempt or a disconnect while the link is up
    retry_pending: bool,
    link_up: bool,
    // Attempts since the last successful connect, for logging only
    attempts: u64,
}

impl ReconnectSupervisor {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            schedule: RetrySchedule::new(retry_interval),
            retry_pending: false,
            link_up: false,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// The link came up: connect right away unless a connection is already
    /// established or in progress.
    pub fn on_network_available(&mut self, session: &mut dyn BrokerSession, now: Instant) -> bool {
        self.link_up = true;

        if self.state != ConnectionState::Disconnected {
            debug!(
                "Network available while {:?}, no new connect attempt",
                self.state
            );
            return false;
        }

        self.attempt_connect(session, now)
    }

    /// The link went down: retries stay suspended until it comes back.
    pub fn on_network_lost(&mut self) {
        self.link_up = false;

        if self.retry_pending {
            info!("Network lost, suspending reconnect attempts");
        }
        self.retry_pending = false;
    }

    /// Asks the session to start connecting.
    ///
    /// Returns `true` if a connect request was issued, whether or not the
    /// session could start it. Refused while connecting or connected so that
    /// at most one attempt is ever in flight.
    pub fn attempt_connect(&mut self, session: &mut dyn BrokerSession, now: Instant) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!("Connect attempt skipped, state is {:?}", self.state);
            return false;
        }

        self.attempts += 1;
        info!("Starting MQTT connection (attempt {})", self.attempts);

        match session.connect() {
            Ok(()) => {
                self.state = ConnectionState::Connecting;
                self.retry_pending = false;
            }
            Err(e) => {
                warn!(
                    "MQTT connection failed: {}, retrying in {:?}",
                    e,
                    self.schedule.retry_interval()
                );
                self.state = ConnectionState::Disconnected;
                self.schedule.record(now);
                self.retry_pending = true;
            }
        }
        true
    }

    /// The broker accepted the connection. Returns `true` when the
    /// post-connect actions (announce and subscribe) are due.
    pub fn on_broker_connected(&mut self) -> bool {
        if self.state == ConnectionState::Connected {
            warn!("Received a second ConnAck for an established connection");
        }

        info!(
            "Connected to MQTT broker after {} attempt(s)",
            self.attempts.max(1)
        );
        self.state = ConnectionState::Connected;
        self.retry_pending = false;
        self.attempts = 0;
        true
    }

    pub fn on_broker_disconnected(&mut self, reason: DisconnectReason, now: Instant) {
        warn!("MQTT disconnected: {}", reason);
        self.state = ConnectionState::Disconnected;

        if self.link_up {
            self.retry_pending = true;
            self.schedule.record(now);
            info!(
                "Reconnecting in {:?}",
                self.schedule.retry_interval()
            );
        } else {
            info!("Network is down, waiting for link before reconnecting");
        }
    }

    /// Issues a connect attempt if a retry is pending and due.
    pub fn tick(&mut self, session: &mut dyn BrokerSession, now: Instant) -> bool {
        if !self.retry_pending || !self.link_up || !self.schedule.is_due(now) {
            return false;
        }

        debug!("Retry interval elapsed, reconnecting");
        self.attempt_connect(session, now)
    }

    /// When the next retry becomes due, if one is pending
    pub fn next_retry_at(&self) -> Option<Instant> {
        if self.retry_pending && self.link_up {
            self.schedule.due_at()
        } else {
            None
        }
    }
}
