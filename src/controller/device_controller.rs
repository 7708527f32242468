//! Device Controller - control topic to output line
//!
//! Announces the device on every broker connection and turns `"0"` / `"1"`
//! messages on the control topic into output changes. Anything else on the
//! control topic is logged and left alone; messages on other topics are
//! ignored entirely.

use rumqttc::QoS;
use tracing::{debug, error, info, warn};

use super::actuator::{Actuator, ActuatorError, ActuatorState};
use crate::config::ConfigError;
use crate::mqtt::config::MqttConfig;
use crate::mqtt::message_manager::{ControlMessage, SwitchCommand};
use crate::mqtt::session::{BrokerSession, SubscribeOutcome};

/// Topics and identity the controller works with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSettings {
    pub client_id: String,
    pub status_topic: String,
    pub control_topic: String,
    pub qos: QoS,
    pub resubscribe_attempts: u8,
}

impl DeviceSettings {
    pub fn from_config(config: &MqttConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: config.client_id.clone(),
            status_topic: config.status_topic.clone(),
            control_topic: config.control_topic.clone(),
            qos: config.qos()?,
            resubscribe_attempts: config.resubscribe_attempts,
        })
    }

    /// Payload published to the status topic after connecting
    pub fn announcement(&self) -> String {
        format!("{} connected", self.client_id)
    }
}

pub struct DeviceController<A: Actuator> {
    settings: DeviceSettings,
    actuator: A,
    state: ActuatorState,
    // Re-subscribes still allowed in the current session
    resubscribes_left: u8,
}

impl<A: Actuator> DeviceController<A> {
    /// Takes over the actuator and drives it to `Off`.
    pub fn new(settings: DeviceSettings, mut actuator: A) -> Result<Self, ActuatorError> {
        actuator.apply(ActuatorState::Off)?;
        info!(
            "Device controller ready: {} on topic '{}'",
            actuator.describe(),
            settings.control_topic
        );

        Ok(Self {
            resubscribes_left: settings.resubscribe_attempts,
            settings,
            actuator,
            state: ActuatorState::Off,
        })
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Announces the device and subscribes to the control topic
    pub fn on_connected(&mut self, session: &mut dyn BrokerSession, session_present: bool) {
        info!(
            "{} connected to MQTT (previous session present: {})",
            self.settings.client_id, session_present
        );
        self.resubscribes_left = self.settings.resubscribe_attempts;

        let announcement = self.settings.announcement();
        match session.publish(
            &self.settings.status_topic,
            self.settings.qos,
            false,
            announcement.as_bytes(),
        ) {
            Ok(()) => debug!(
                "Queued announcement '{}' on {}",
                announcement, self.settings.status_topic
            ),
            Err(e) => error!("Publishing to {} failed: {}", self.settings.status_topic, e),
        }

        self.subscribe_control(session);
    }

    fn subscribe_control(&mut self, session: &mut dyn BrokerSession) {
        match session.subscribe(&self.settings.control_topic, self.settings.qos) {
            Ok(()) => debug!("Subscribing to {}", self.settings.control_topic),
            Err(e) => error!(
                "Subscription to {} failed: {}",
                self.settings.control_topic, e
            ),
        }
    }

    /// Applies a control message. Returns the new state when the output was
    /// driven.
    pub fn on_message(&mut self, message: &ControlMessage) -> Option<ActuatorState> {
        info!("Message received {}", message);

        if message.topic != self.settings.control_topic {
            debug!("Ignoring message on {}", message.topic);
            return None;
        }

        if message.is_fragmented() {
            warn!(
                "Dropping fragmented message (chunk {} of {}) on {}",
                message.chunk_index + 1,
                message.chunk_total,
                message.topic
            );
            return None;
        }

        let text = message.text();
        match SwitchCommand::parse(&text) {
            Some(command) => self.set_state(command.into()),
            None => {
                warn!("Ignoring unknown control payload '{}'", text);
                None
            }
        }
    }

    fn set_state(&mut self, target: ActuatorState) -> Option<ActuatorState> {
        match self.actuator.apply(target) {
            Ok(()) => {
                self.state = target;
                info!("Output {}", target);
                Some(target)
            }
            Err(e) => {
                error!("Failed to switch {} {}: {}", self.actuator.describe(), target, e);
                None
            }
        }
    }

    /// Logs the SUBACK and, if enabled, re-sends a rejected subscription
    pub fn on_subscribe_result(
        &mut self,
        session: &mut dyn BrokerSession,
        pkid: u16,
        outcomes: &[SubscribeOutcome],
    ) {
        let mut rejected = false;
        for outcome in outcomes {
            match outcome {
                SubscribeOutcome::Granted(qos) => {
                    info!("Subscription {} acknowledged, QoS: {}", pkid, *qos as u8)
                }
                SubscribeOutcome::Failure => {
                    error!("Subscription {} rejected by broker", pkid);
                    rejected = true;
                }
            }
        }

        if rejected && self.resubscribes_left > 0 {
            self.resubscribes_left -= 1;
            warn!(
                "Re-subscribing to {} ({} attempt(s) left)",
                self.settings.control_topic, self.resubscribes_left
            );
            self.subscribe_control(session);
        }
    }

    pub fn on_publish_result(&self, pkid: u16) {
        info!("Publish {} acknowledged", pkid);
    }

    pub fn on_unsubscribe_result(&self, pkid: u16) {
        info!("Unsubscribe {} acknowledged", pkid);
    }

    /// Drops the control subscription before a planned disconnect
    pub fn release(&mut self, session: &mut dyn BrokerSession) {
        match session.unsubscribe(&self.settings.control_topic) {
            Ok(()) => debug!("Unsubscribing from {}", self.settings.control_topic),
            Err(e) => warn!(
                "Unsubscribe from {} failed: {}",
                self.settings.control_topic, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingActuator, RecordingSession, SessionCall};

    fn settings() -> DeviceSettings {
        DeviceSettings {
            client_id: "ESP32testing1".to_string(),
            status_topic: "ESP/status".to_string(),
            control_topic: "ESP/control".to_string(),
            qos: QoS::AtLeastOnce,
            resubscribe_attempts: 0,
        }
    }

    fn controller() -> (DeviceController<RecordingActuator>, RecordingActuator) {
        let actuator = RecordingActuator::default();
        let controller = DeviceController::new(settings(), actuator.clone()).unwrap();
        (controller, actuator)
    }

    fn control(payload: &'static str) -> ControlMessage {
        ControlMessage::new("ESP/control", payload, QoS::AtLeastOnce)
    }

    #[test]
    fn starts_with_output_off() {
        let (controller, actuator) = controller();
        assert_eq!(controller.state(), ActuatorState::Off);
        assert_eq!(actuator.applied(), vec![ActuatorState::Off]);
    }

    #[test]
    fn connect_publishes_then_subscribes() {
        let (mut controller, _) = controller();
        let mut session = RecordingSession::default();

        controller.on_connected(&mut session, false);

        assert_eq!(
            session.calls(),
            vec![
                SessionCall::Publish {
                    topic: "ESP/status".to_string(),
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    payload: "ESP32testing1 connected".to_string(),
                },
                SessionCall::Subscribe {
                    topic: "ESP/control".to_string(),
                    qos: QoS::AtLeastOnce,
                },
            ]
        );
    }

    #[test]
    fn failed_publish_still_subscribes() {
        let (mut controller, _) = controller();
        let mut session = RecordingSession::failing_requests();

        controller.on_connected(&mut session, true);

        let calls = session.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[1], SessionCall::Subscribe { .. }));
    }

    #[test]
    fn one_and_zero_switch_output() {
        let (mut controller, actuator) = controller();

        assert_eq!(controller.on_message(&control("1")), Some(ActuatorState::On));
        assert_eq!(controller.state(), ActuatorState::On);

        assert_eq!(controller.on_message(&control("0")), Some(ActuatorState::Off));
        assert_eq!(controller.state(), ActuatorState::Off);

        assert_eq!(
            actuator.applied(),
            vec![ActuatorState::Off, ActuatorState::On, ActuatorState::Off]
        );
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let (mut controller, _) = controller();
        assert_eq!(controller.on_message(&control(" 1 \n")), Some(ActuatorState::On));
        assert_eq!(controller.on_message(&control("\t0\r\n")), Some(ActuatorState::Off));
    }

    #[test]
    fn unknown_payloads_leave_state_unchanged() {
        let (mut controller, actuator) = controller();
        controller.on_message(&control("1"));

        for payload in ["2", "", "  ", "on", "10", "true"] {
            assert_eq!(controller.on_message(&control(payload)), None);
            assert_eq!(controller.state(), ActuatorState::On);
        }
        assert_eq!(
            actuator.applied(),
            vec![ActuatorState::Off, ActuatorState::On]
        );
    }

    #[test]
    fn other_topics_never_switch() {
        let (mut controller, actuator) = controller();

        for topic in ["ESP/status", "ESP/control/extra", "esp/control", "other"] {
            let msg = ControlMessage::new(topic, "1", QoS::AtMostOnce);
            assert_eq!(controller.on_message(&msg), None);
        }
        assert_eq!(controller.state(), ActuatorState::Off);
        assert_eq!(actuator.applied(), vec![ActuatorState::Off]);
    }

    #[test]
    fn fragmented_messages_are_rejected() {
        let (mut controller, _) = controller();

        assert_eq!(controller.on_message(&control("1").with_chunk(0, 2)), None);
        assert_eq!(controller.on_message(&control("1").with_chunk(1, 2)), None);
        assert_eq!(controller.state(), ActuatorState::Off);
    }

    #[test]
    fn actuator_failure_keeps_previous_state() {
        let (mut controller, actuator) = controller();
        actuator.set_failing(true);

        assert_eq!(controller.on_message(&control("1")), None);
        assert_eq!(controller.state(), ActuatorState::Off);
    }

    #[test]
    fn rejected_subscription_is_only_logged_by_default() {
        let (mut controller, _) = controller();
        let mut session = RecordingSession::default();

        controller.on_subscribe_result(&mut session, 1, &[SubscribeOutcome::Failure]);
        assert!(session.calls().is_empty());
    }

    #[test]
    fn rejected_subscription_is_retried_when_enabled() {
        let mut config = settings();
        config.resubscribe_attempts = 2;
        let mut controller = DeviceController::new(config, RecordingActuator::default()).unwrap();
        let mut session = RecordingSession::default();

        controller.on_connected(&mut session, false);
        for pkid in 1..=3 {
            controller.on_subscribe_result(&mut session, pkid, &[SubscribeOutcome::Failure]);
        }

        let subscribes = session
            .calls()
            .iter()
            .filter(|call| matches!(call, SessionCall::Subscribe { .. }))
            .count();
        assert_eq!(subscribes, 3);

        // Attempts reset with the next connection
        controller.on_connected(&mut session, false);
        controller.on_subscribe_result(&mut session, 4, &[SubscribeOutcome::Failure]);
        let subscribes = session
            .calls()
            .iter()
            .filter(|call| matches!(call, SessionCall::Subscribe { .. }))
            .count();
        assert_eq!(subscribes, 5);
    }

    #[test]
    fn granted_subscription_needs_no_action() {
        let (mut controller, _) = controller();
        let mut session = RecordingSession::default();

        controller.on_subscribe_result(
            &mut session,
            1,
            &[SubscribeOutcome::Granted(QoS::AtLeastOnce)],
        );
        assert!(session.calls().is_empty());
    }

    #[test]
    fn release_unsubscribes_from_control_topic() {
        let (mut controller, _) = controller();
        let mut session = RecordingSession::default();

        controller.release(&mut session);
        assert_eq!(
            session.calls(),
            vec![SessionCall::Unsubscribe {
                topic: "ESP/control".to_string()
            }]
        );
    }
}
