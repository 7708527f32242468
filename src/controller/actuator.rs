//! Binary output line driven by the device controller.
//!
//! On a Raspberry Pi the line is a GPIO pin accessed through rppal. Hosts
//! without GPIO can run the service with the simulated actuator, which only
//! logs the requested level.

use rppal::gpio::{Gpio, OutputPin};
use std::fmt;
use tracing::{debug, info};

use crate::config::{ActuatorConfig, ActuatorKind};
use crate::mqtt::message_manager::SwitchCommand;

const MAX_BCM_PIN: u8 = 27;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActuatorState {
    #[default]
    Off,
    On,
}

impl From<SwitchCommand> for ActuatorState {
    fn from(command: SwitchCommand) -> Self {
        match command {
            SwitchCommand::Off => ActuatorState::Off,
            SwitchCommand::On => ActuatorState::On,
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorState::Off => write!(f, "OFF"),
            ActuatorState::On => write!(f, "ON"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Output unavailable: {0}")]
    Unavailable(String),
}

pub trait Actuator: Send {
    /// Drives the output to `state`
    fn apply(&mut self, state: ActuatorState) -> Result<(), ActuatorError>;

    fn describe(&self) -> String;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn apply(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        (**self).apply(state)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Opens the output configured in `[actuator]`
pub fn open_actuator(config: &ActuatorConfig) -> Result<Box<dyn Actuator>, ActuatorError> {
    match config.kind {
        ActuatorKind::Gpio => Ok(Box::new(GpioActuator::open(config)?)),
        ActuatorKind::Simulated => Ok(Box::new(SimulatedActuator::new(config.pin))),
    }
}

pub struct GpioActuator {
    pin: OutputPin,
    active_low: bool,
}

impl GpioActuator {
    /// Claims the pin as an output, already at the `Off` level
    pub fn open(config: &ActuatorConfig) -> Result<Self, ActuatorError> {
        if config.pin > MAX_BCM_PIN {
            return Err(ActuatorError::Unavailable(format!(
                "BCM pin {} does not exist on the header",
                config.pin
            )));
        }

        let gpio = Gpio::new()?;
        let pin = gpio.get(config.pin)?;

        let mut pin = if config.active_low {
            pin.into_output_high()
        } else {
            pin.into_output_low()
        };
        pin.set_reset_on_drop(config.reset_on_exit);

        info!(
            "GPIO{} configured as output (active {})",
            config.pin,
            if config.active_low { "low" } else { "high" }
        );
        Ok(Self {
            pin,
            active_low: config.active_low,
        })
    }
}

impl Actuator for GpioActuator {
    fn apply(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        let high = (state == ActuatorState::On) != self.active_low;
        if high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        debug!("GPIO{} set {}", self.pin.pin(), if high { "high" } else { "low" });
        Ok(())
    }

    fn describe(&self) -> String {
        format!("GPIO{}", self.pin.pin())
    }
}

/// Stand-in output for hosts without GPIO access
#[derive(Debug)]
pub struct SimulatedActuator {
    pin: u8,
    level: Option<ActuatorState>,
}

impl SimulatedActuator {
    pub fn new(pin: u8) -> Self {
        info!("Using simulated output for pin {}", pin);
        Self { pin, level: None }
    }

    pub fn level(&self) -> Option<ActuatorState> {
        self.level
    }
}

impl Actuator for SimulatedActuator {
    fn apply(&mut self, state: ActuatorState) -> Result<(), ActuatorError> {
        info!("[simulated] pin {} -> {}", self.pin, state);
        self.level = Some(state);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated pin {}", self.pin)
    }
}
