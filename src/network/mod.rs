//! Network link observation.
//!
//! The service never manages the network itself; it only needs to know when
//! the link comes up (start connecting) and when it goes down (stop retrying).
//! [`link_monitor::LinkMonitor`] turns the kernel's view of one interface into
//! a stream of [`LinkEvent`]s, one per transition.

pub mod link_monitor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    LinkUp,
    LinkDown,
}
