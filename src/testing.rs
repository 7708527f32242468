//! In-process fakes for the broker session and the output line.
//!
//! Both record what they were asked to do behind an `Arc`, so a clone kept by
//! the test still sees calls made after the first handle was moved into the code
//! under test.

use rumqttc::QoS;
use std::sync::{Arc, Mutex};

use crate::controller::actuator::{Actuator, ActuatorError, ActuatorState};
use crate::mqtt::session::{BrokerSession, SessionError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCall {
    Connect,
    Publish {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: String,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect,
    Close,
}

#[derive(Clone, Default)]
pub struct RecordingSession {
    calls: Arc<Mutex<Vec<SessionCall>>>,
    fail_connect: Arc<Mutex<bool>>,
    fail_requests: bool,
}

impl RecordingSession {
    pub fn failing_connect() -> Self {
        let session = Self::default();
        session.set_fail_connect(true);
        session
    }

    pub fn failing_requests() -> Self {
        Self {
            fail_requests: true,
            ..Self::default()
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        *self.fail_connect.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn request_result(&self) -> Result<(), SessionError> {
        if self.fail_requests {
            Err(SessionError::Request("request queue full".to_string()))
        } else {
            Ok(())
        }
    }
}

impl BrokerSession for RecordingSession {
    fn connect(&mut self) -> Result<(), SessionError> {
        self.record(SessionCall::Connect);
        if *self.fail_connect.lock().unwrap() {
            Err(SessionError::Initiate("broker unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        self.record(SessionCall::Publish {
            topic: topic.to_string(),
            qos,
            retain,
            payload: String::from_utf8_lossy(payload).to_string(),
        });
        self.request_result()
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        self.record(SessionCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        self.request_result()
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.record(SessionCall::Unsubscribe {
            topic: topic.to_string(),
        });
        self.request_result()
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.record(SessionCall::Disconnect);
        self.request_result()
    }

    fn close(&mut self) {
        self.record(SessionCall::Close);
    }
}

#[derive(Clone, Default)]
pub struct RecordingActuator {
    applied: Arc<Mutex<Vec<ActuatorState>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingActuator {
    pub fn applied(&self) -> Vec<ActuatorState> {
        self.applied.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl Actuator for RecordingActuator {
    fn apply(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        if *self.failing.lock().unwrap() {
            return Err(ActuatorError::Unavailable("pin busy".to_string()));
        }
        self.applied.lock().unwrap().push(state);
        Ok(())
    }

    fn describe(&self) -> String {
        "recording actuator".to_string()
    }
}
