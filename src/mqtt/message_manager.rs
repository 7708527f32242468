use bytes::Bytes;
use chrono::{DateTime, Local};
use rumqttc::QoS;
use std::fmt;

/// Inbound message as handed to the device controller.
///
/// Lives only for the duration of one dispatch; nothing keeps a reference to
/// it afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Position of this chunk in a fragmented delivery, 0 for whole messages
    pub chunk_index: usize,
    /// Number of chunks the message was split into, 1 for whole messages
    pub chunk_total: usize,
    pub received_at: DateTime<Local>,
}

impl ControlMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            chunk_index: 0,
            chunk_total: 1,
            received_at: Local::now(),
        }
    }

    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        Self::new(publish.topic.clone(), publish.payload.clone(), publish.qos)
    }

    pub fn with_chunk(mut self, chunk_index: usize, chunk_total: usize) -> Self {
        self.chunk_index = chunk_index;
        self.chunk_total = chunk_total;
        self
    }

    pub fn is_fragmented(&self) -> bool {
        self.chunk_index != 0 || self.chunk_total != 1
    }

    /// Payload as text with surrounding whitespace removed. Invalid UTF-8 is
    /// replaced rather than rejected, so it simply fails to match a command.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] (QoS:{}): {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.qos as u8,
            self.text()
        )
    }
}

/// The two commands understood on the control topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchCommand {
    Off,
    On,
}

impl SwitchCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "0" => Some(SwitchCommand::Off),
            "1" => Some(SwitchCommand::On),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_trimmed() {
        let msg = ControlMessage::new("ESP/control", " 1 \n", QoS::AtLeastOnce);
        assert_eq!(msg.text(), "1");
        assert_eq!(SwitchCommand::parse(&msg.text()), Some(SwitchCommand::On));
    }

    #[test]
    fn only_zero_and_one_are_commands() {
        assert_eq!(SwitchCommand::parse("0"), Some(SwitchCommand::Off));
        assert_eq!(SwitchCommand::parse("1"), Some(SwitchCommand::On));
        assert_eq!(SwitchCommand::parse("2"), None);
        assert_eq!(SwitchCommand::parse(""), None);
        assert_eq!(SwitchCommand::parse("on"), None);
        assert_eq!(SwitchCommand::parse("01"), None);
    }

    #[test]
    fn invalid_utf8_does_not_panic() {
        let msg = ControlMessage::new("ESP/control", vec![0xff, 0x31], QoS::AtMostOnce);
        assert_eq!(SwitchCommand::parse(&msg.text()), None);
    }

    #[test]
    fn whole_messages_are_not_fragmented() {
        let msg = ControlMessage::new("ESP/control", "1", QoS::AtMostOnce);
        assert!(!msg.is_fragmented());
        assert!(msg.clone().with_chunk(0, 2).is_fragmented());
        assert!(msg.with_chunk(1, 2).is_fragmented());
    }
}
