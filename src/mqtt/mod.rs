//! # MQTT Integration Module
//!
//! Everything that touches the broker lives here, split into three parts:
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker, topic and QoS settings, rumqttc options
//! ├── message_manager.rs  - Inbound control messages and the 0/1 command set
//! └── session.rs          - BrokerSession contract and the rumqttc adapter
//! ```
//!
//! rumqttc does the protocol work (framing, keep-alive, packet ids, QoS
//! handshakes). This module only decides which requests go out and how the
//! results are reported back to the service.

pub mod config;
pub mod message_manager;
pub mod session;
