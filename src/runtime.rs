//! Service runtime with statum lifecycle
//!
//! All inputs of the service end up in one place: link transitions from the
//! link monitor, broker events from the MQTT poll task, the retry timer and
//! the shutdown token. The running service takes them one at a time, so the
//! supervisor and the device controller are never touched concurrently.
//!
//! ```text
//! LinkMonitor ──┐
//!               ├──► mpsc<ServiceEvent> ──► SwitchService<Running>::dispatch
//! MQTT poll  ───┘                                 │            │
//!                        retry timer ─────────────┤     ReconnectSupervisor
//!                                                 │     DeviceController
//!                                       shutdown token
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──► Running ──► Stopped
//! ```

use statum::{machine, state};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::actuator::{Actuator, ActuatorError, ActuatorState};
use crate::controller::device_controller::{DeviceController, DeviceSettings};
use crate::mqtt::session::{BrokerEvent, BrokerSession};
use crate::network::LinkEvent;
use crate::supervisor::{ConnectionState, ReconnectSupervisor};

/// How long a planned disconnect may take before the session is closed
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Everything the running service reacts to
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceEvent {
    Link(LinkEvent),
    Broker(BrokerEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),
}

#[state]
#[derive(Debug, Clone)]
pub enum ServiceState {
    Initializing, // Output claimed and driven off
    Running,      // Dispatching events
    Stopped,      // Broker session closed
}

#[machine]
pub struct SwitchService<S: ServiceState> {
    supervisor: ReconnectSupervisor,
    controller: DeviceController<Box<dyn Actuator>>,
    session: Box<dyn BrokerSession + Send>,
    events: mpsc::Receiver<ServiceEvent>,
}

impl<S: ServiceState> SwitchService<S> {
    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn actuator_state(&self) -> ActuatorState {
        self.controller.state()
    }
}

impl SwitchService<Initializing> {
    pub fn create(
        settings: DeviceSettings,
        retry_interval: Duration,
        session: Box<dyn BrokerSession + Send>,
        actuator: Box<dyn Actuator>,
        events: mpsc::Receiver<ServiceEvent>,
    ) -> Result<Self, RuntimeError> {
        info!(
            "Initializing service for {} (retry interval {:?})",
            settings.client_id, retry_interval
        );
        let controller = DeviceController::new(settings, actuator)?;

        Ok(Self::new(
            ReconnectSupervisor::new(retry_interval),
            controller,
            session,
            events,
        ))
    }

    pub fn start(self) -> SwitchService<Running> {
        info!("Service running, waiting for network");
        self.transition()
    }
}

enum Wake {
    Event(Option<ServiceEvent>),
    Retry,
    Cancelled,
}

impl SwitchService<Running> {
    /// Routes one event to the component that owns the affected state
    pub fn dispatch(&mut self, event: ServiceEvent, now: Instant) {
        match event {
            ServiceEvent::Link(LinkEvent::LinkUp) => {
                self.supervisor
                    .on_network_available(self.session.as_mut(), now);
            }
            ServiceEvent::Link(LinkEvent::LinkDown) => {
                self.supervisor.on_network_lost();
            }
            ServiceEvent::Broker(BrokerEvent::Connected { session_present }) => {
                if self.supervisor.on_broker_connected() {
                    self.controller
                        .on_connected(self.session.as_mut(), session_present);
                }
            }
            ServiceEvent::Broker(BrokerEvent::Disconnected(reason)) => {
                self.supervisor.on_broker_disconnected(reason, now);
            }
            ServiceEvent::Broker(BrokerEvent::SubscribeAck { pkid, outcomes }) => {
                self.controller
                    .on_subscribe_result(self.session.as_mut(), pkid, &outcomes);
            }
            ServiceEvent::Broker(BrokerEvent::UnsubscribeAck { pkid }) => {
                self.controller.on_unsubscribe_result(pkid);
            }
            ServiceEvent::Broker(BrokerEvent::PublishAck { pkid }) => {
                self.controller.on_publish_result(pkid);
            }
            ServiceEvent::Broker(BrokerEvent::Message(message)) => {
                self.controller.on_message(&message);
            }
        }
    }

    /// Called when the retry deadline passes
    pub fn on_retry_timer(&mut self, now: Instant) {
        self.supervisor.tick(self.session.as_mut(), now);
    }

    /// Processes events until `shutdown` is cancelled or every event sender is
    /// gone.
    ///
    /// Instead of polling the supervisor on every pass, the loop sleeps until
    /// the next retry deadline, if there is one.
    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) -> SwitchService<Stopped> {
        loop {
            let retry_at = self.supervisor.next_retry_at();

            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Cancelled,
                event = self.events.recv() => Wake::Event(event),
                _ = retry_timer(retry_at) => Wake::Retry,
            };

            match wake {
                Wake::Event(Some(event)) => {
                    debug!("Dispatching {:?}", event);
                    self.dispatch(event, Instant::now());
                }
                Wake::Event(None) => {
                    warn!("All event sources closed, stopping service");
                    break;
                }
                Wake::Retry => self.on_retry_timer(Instant::now()),
                Wake::Cancelled => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> SwitchService<Stopped> {
        if self.supervisor.state() == ConnectionState::Connected {
            self.controller.release(self.session.as_mut());

            match self.session.disconnect() {
                Ok(()) => {
                    let events = &mut self.events;
                    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                        while let Some(event) = events.recv().await {
                            if let ServiceEvent::Broker(BrokerEvent::Disconnected(_)) = event {
                                break;
                            }
                        }
                    })
                    .await;

                    if drained.is_err() {
                        warn!("Broker did not close the connection within {:?}", SHUTDOWN_GRACE);
                    }
                }
                Err(e) => warn!("Could not disconnect cleanly: {}", e),
            }
        }

        self.session.close();
        info!("Service stopped with output {}", self.controller.state());
        self.transition()
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
