//! The plain-text device command protocol.
//!
//! Commands are single CR-terminated lines. The firmware answers command
//! lines with a single response line when it has something to say; the
//! transport layer decides whether to wait for one.

use std::fmt;

/// SC channel selecting the pen-up servo position.
pub const SERVO_CHANNEL_PEN_UP: u8 = 4;
/// SC channel selecting the pen-down servo position.
pub const SERVO_CHANNEL_PEN_DOWN: u8 = 5;
/// SC channel selecting the servo raise rate.
pub const SERVO_CHANNEL_RAISE_RATE: u8 = 11;
/// SC channel selecting the servo lower rate.
pub const SERVO_CHANNEL_LOWER_RATE: u8 = 12;

/// One firmware command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `EM,<axis1>,<axis2>` — enable (microstep mode) or disable each motor.
    EnableMotors {
        /// Pen-carriage motor mode; 0 disables.
        axis1: u8,
        /// Egg-rotation motor mode; 0 disables.
        axis2: u8,
    },
    /// `SM,<ms>,<axis1>,<axis2>` — timed relative move.
    Move {
        /// Duration of the move in milliseconds.
        duration_ms: u64,
        /// Pen-carriage steps, signed.
        axis1_steps: i32,
        /// Egg-rotation steps, signed.
        axis2_steps: i32,
    },
    /// `SP,<0|1>` — pen servo state.
    SetPen {
        /// Raw servo state value; the invert-pen flag is applied by the
        /// caller before constructing the command.
        value: u8,
    },
    /// `SC,<channel>,<value>` — servo configuration.
    ServoConfig {
        /// Configuration channel, see the `SERVO_CHANNEL_*` constants.
        channel: u8,
        /// Raw firmware value.
        value: u16,
    },
    /// `v` — firmware version query.
    Version,
}

impl DeviceCommand {
    /// Disables both motors.
    pub fn disable_motors() -> Self {
        DeviceCommand::EnableMotors { axis1: 0, axis2: 0 }
    }

    /// Renders the command as a CR-terminated wire line.
    pub fn to_line(&self) -> String {
        format!("{}\r", self)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::EnableMotors { axis1, axis2 } => {
                write!(f, "EM,{},{}", axis1, axis2)
            }
            DeviceCommand::Move {
                duration_ms,
                axis1_steps,
                axis2_steps,
            } => write!(f, "SM,{},{},{}", duration_ms, axis1_steps, axis2_steps),
            DeviceCommand::SetPen { value } => write!(f, "SP,{}", value),
            DeviceCommand::ServoConfig { channel, value } => {
                write!(f, "SC,{},{}", channel, value)
            }
            DeviceCommand::Version => write!(f, "v"),
        }
    }
}
