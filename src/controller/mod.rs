//! Device control: the output line and the logic that drives it
//!
//! 1. [`actuator`] - GPIO output (or a simulated stand-in)
//! 2. [`device_controller`] - announce on connect, apply control messages
//!
//! ```text
//! ControlMessage ──► DeviceController ──► Actuator ──► GPIO pin
//! ```

pub mod actuator;
pub mod device_controller;
