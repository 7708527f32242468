//! Reconnect supervision for the broker connection.
//!
//! The supervisor owns the connection state and the retry schedule and
//! decides when a connect attempt is issued. It never waits: attempts are
//! started through [`crate::mqtt::session::BrokerSession::connect`] and their
//! outcome comes back later as broker events.
//!
//! ```text
//!                 attempt ok            ConnAck
//! Disconnected ───────────────► Connecting ─────► Connected
//!      ▲  ▲                         │                 │
//!      │  └─── attempt failed ──────┘                 │
//!      │       (retry armed)        │                 │
//!      └────────────── broker disconnected ◄──────────┘
//!                      (retry armed while link is up)
//! ```

pub mod reconnect;

pub use reconnect::{ConnectionState, ReconnectSupervisor, RetrySchedule};
