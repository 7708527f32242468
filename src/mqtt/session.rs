//! Broker session on top of rumqttc.
//!
//! rumqttc reconnects on its own whenever its event loop is polled again after
//! an error. Here the reconnect decision belongs to the supervisor, so every
//! connect attempt gets a fresh `AsyncClient`/`EventLoop` pair and the poll
//! task ends at the first connection error after reporting it as
//! [`BrokerEvent::Disconnected`].
//!
//! ```text
//! connect() ──► spawn poll task ──► ConnAck ──► BrokerEvent::Connected
//!                     │
//!                     ├──► Publish/SubAck/... ──► BrokerEvent::*
//!                     │
//!                     └──► ConnectionError ──► BrokerEvent::Disconnected ──► task ends
//! ```

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::message_manager::ControlMessage;
use crate::runtime::ServiceEvent;

/// Request queue size between the client handle and its event loop
const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A connection is already active")]
    AlreadyActive,

    #[error("Could not initiate connection: {0}")]
    Initiate(String),

    #[error("No broker connection has been started")]
    NotConnected,

    #[error("Request could not be queued: {0}")]
    Request(String),
}

/// Why a broker connection ended (or never completed)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    TcpDisconnected,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    MalformedCredentials,
    NotAuthorized,
    ProtocolError,
    UserRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::TcpDisconnected => "TCP connection lost",
            DisconnectReason::UnacceptableProtocolVersion => "unacceptable protocol version",
            DisconnectReason::IdentifierRejected => "client identifier rejected",
            DisconnectReason::ServerUnavailable => "server unavailable",
            DisconnectReason::MalformedCredentials => "malformed credentials",
            DisconnectReason::NotAuthorized => "not authorized",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::UserRequested => "disconnect requested",
        };
        write!(f, "{}", text)
    }
}

impl From<ConnectReturnCode> for DisconnectReason {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::RefusedProtocolVersion => {
                DisconnectReason::UnacceptableProtocolVersion
            }
            ConnectReturnCode::BadClientId => DisconnectReason::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => DisconnectReason::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => DisconnectReason::MalformedCredentials,
            ConnectReturnCode::NotAuthorized => DisconnectReason::NotAuthorized,
            // A successful ConnAck never ends a session
            ConnectReturnCode::Success => DisconnectReason::ProtocolError,
        }
    }
}

impl From<&ConnectionError> for DisconnectReason {
    fn from(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionRefused(code) => DisconnectReason::from(*code),
            ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => {
                DisconnectReason::ProtocolError
            }
            ConnectionError::RequestsDone => DisconnectReason::UserRequested,
            _ => DisconnectReason::TcpDisconnected,
        }
    }
}

/// Per-topic result carried by a SUBACK
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Granted(QoS),
    Failure,
}

impl From<&SubscribeReasonCode> for SubscribeOutcome {
    fn from(code: &SubscribeReasonCode) -> Self {
        match code {
            SubscribeReasonCode::Success(qos) => SubscribeOutcome::Granted(*qos),
            SubscribeReasonCode::Failure => SubscribeOutcome::Failure,
        }
    }
}

/// Everything the broker session reports back to the service
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEvent {
    Connected { session_present: bool },
    Disconnected(DisconnectReason),
    SubscribeAck { pkid: u16, outcomes: Vec<SubscribeOutcome> },
    UnsubscribeAck { pkid: u16 },
    /// Completion of a QoS 1 (PUBACK) or QoS 2 (PUBCOMP) publish
    PublishAck { pkid: u16 },
    Message(ControlMessage),
}

/// Maps a rumqttc event onto the events the service cares about.
///
/// Outgoing packets and keep-alive traffic are dropped.
pub fn translate_event(event: &Event) -> Option<BrokerEvent> {
    let packet = match event {
        Event::Incoming(packet) => packet,
        Event::Outgoing(outgoing) => {
            trace!("Outgoing: {:?}", outgoing);
            return None;
        }
    };

    match packet {
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
            Some(BrokerEvent::Connected {
                session_present: ack.session_present,
            })
        }
        Packet::ConnAck(ack) => Some(BrokerEvent::Disconnected(DisconnectReason::from(ack.code))),
        Packet::Publish(publish) => Some(BrokerEvent::Message(ControlMessage::from_publish(
            publish,
        ))),
        Packet::SubAck(ack) => Some(BrokerEvent::SubscribeAck {
            pkid: ack.pkid,
            outcomes: ack.return_codes.iter().map(SubscribeOutcome::from).collect(),
        }),
        Packet::UnsubAck(ack) => Some(BrokerEvent::UnsubscribeAck { pkid: ack.pkid }),
        Packet::PubAck(ack) => Some(BrokerEvent::PublishAck { pkid: ack.pkid }),
        Packet::PubComp(comp) => Some(BrokerEvent::PublishAck { pkid: comp.pkid }),
        other => {
            trace!("Ignoring incoming packet: {:?}", other);
            None
        }
    }
}

/// Contract the supervisor and device controller use to talk to the broker.
///
/// None of these calls wait for the broker: they either queue a request or
/// fail immediately. Results arrive later as [`BrokerEvent`]s.
pub trait BrokerSession {
    /// Starts a connection attempt. `Err` means the attempt could not even be
    /// started.
    fn connect(&mut self) -> Result<(), SessionError>;

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), SessionError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError>;

    /// Queues a DISCONNECT for the current connection
    fn disconnect(&mut self) -> Result<(), SessionError>;

    /// Stops any background work immediately
    fn close(&mut self) {}
}

pub struct RumqttSession {
    options: MqttOptions,
    events: mpsc::Sender<ServiceEvent>,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RumqttSession {
    pub fn new(
        options: MqttOptions,
        events: mpsc::Sender<ServiceEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            events,
            client: None,
            poller: None,
            cancel,
        }
    }

    fn poll_active(&self) -> bool {
        self.poller
            .as_ref()
            .map(|poller| !poller.is_finished())
            .unwrap_or(false)
    }

    fn client(&self) -> Result<&AsyncClient, SessionError> {
        self.client.as_ref().ok_or(SessionError::NotConnected)
    }
}

impl BrokerSession for RumqttSession {
    fn connect(&mut self) -> Result<(), SessionError> {
        if self.poll_active() {
            return Err(SessionError::AlreadyActive);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Initiate(e.to_string()))?;

        let (broker_host, broker_port) = self.options.broker_address();
        info!("Connecting to MQTT broker {}:{}", broker_host, broker_port);

        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let poller = runtime.spawn(poll_event_loop(
            event_loop,
            self.events.clone(),
            self.cancel.child_token(),
        ));

        self.client = Some(client);
        self.poller = Some(poller);
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        self.client()?
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        self.client()?
            .try_subscribe(topic, qos)
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.client()?
            .try_unsubscribe(topic)
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.client()?
            .try_disconnect()
            .map_err(|e| SessionError::Request(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.client = None;
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn poll_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<ServiceEvent>,
    cancel: CancellationToken,
) {
    debug!("MQTT event loop started");

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("MQTT event loop cancelled");
                break;
            }
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(event) => {
                if let Some(broker_event) = translate_event(&event) {
                    if events.send(ServiceEvent::Broker(broker_event)).await.is_err() {
                        debug!("Service stopped listening, ending MQTT event loop");
                        break;
                    }
                }
            }
            Err(e) => {
                let reason = DisconnectReason::from(&e);
                warn!("MQTT connection ended: {} ({})", reason, e);
                let _ = events
                    .send(ServiceEvent::Broker(BrokerEvent::Disconnected(reason)))
                    .await;
                break;
            }
        }
    }

    debug!("MQTT event loop stopped");
}
