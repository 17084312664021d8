//! Error taxonomy shared by the core and the transport crates.
//!
//! Guard rejections ("already connected", "already drawing") are ordinary
//! variants here, not panics: callers are expected to hit them in normal
//! operation. An aborted draw run is *not* an error at all; it is a terminal
//! outcome reported by the controller.

use std::fmt;

/// The sub-step at which a staged connection attempt failed.
///
/// BLE reports all five of its stages so a caller can distinguish "user
/// cancelled the chooser" from "device does not expose the expected
/// service"; serial and WiFi use `Request`, `Open` and `Socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// Device/port discovery or selection.
    Request,
    /// Opening the local channel (serial port).
    Open,
    /// Establishing the socket (WiFi).
    Socket,
    /// GATT server connection.
    Gatt,
    /// Service discovery.
    Service,
    /// Characteristic lookup.
    Characteristics,
    /// Notification subscription.
    Notify,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectStage::Request => "request",
            ConnectStage::Open => "open",
            ConnectStage::Socket => "socket",
            ConnectStage::Gatt => "gatt",
            ConnectStage::Service => "service",
            ConnectStage::Characteristics => "chars",
            ConnectStage::Notify => "notify",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by a transport.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The transport API is not available in the current environment.
    Unsupported {
        /// Which capability is missing.
        message: String,
    },

    /// `connect` was called while a channel is already open.
    AlreadyConnected,

    /// An operation that needs an open channel was called without one.
    NotConnected,

    /// A staged connection attempt failed.
    Connect {
        /// The sub-step that failed.
        stage: ConnectStage,
        /// Error detail from the failing layer.
        message: String,
    },

    /// No response line arrived within the allowed window.
    ///
    /// Distinct from rejection: the device stayed silent.
    Timeout {
        /// How long the caller waited, in ms.
        waited_ms: u64,
    },

    /// The channel closed (or errored) while a response was pending.
    Closed,

    /// A raw I/O failure on an established channel.
    Io {
        /// Error detail from the I/O layer.
        message: String,
    },
}

impl TransportError {
    /// Shorthand for a staged connect failure.
    pub fn connect(stage: ConnectStage, message: impl Into<String>) -> Self {
        TransportError::Connect {
            stage,
            message: message.into(),
        }
    }

    /// Shorthand for an I/O failure.
    pub fn io(message: impl fmt::Display) -> Self {
        TransportError::Io {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unsupported { message } => {
                write!(f, "Transport not supported here: {}", message)
            }
            TransportError::AlreadyConnected => {
                write!(f, "Already connected")
            }
            TransportError::NotConnected => {
                write!(f, "Not connected")
            }
            TransportError::Connect { stage, message } => {
                write!(f, "Connection failed at stage '{}': {}", stage, message)
            }
            TransportError::Timeout { waited_ms } => {
                write!(f, "No response from device within {} ms", waited_ms)
            }
            TransportError::Closed => {
                write!(f, "Transport closed while waiting for a response")
            }
            TransportError::Io { message } => {
                write!(f, "I/O error: {}", message)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors surfaced by the draw controller.
#[derive(Debug, Clone)]
pub enum DrawError {
    /// The transport does not report an open connection.
    NotConnected,

    /// A draw run is already active on this controller.
    AlreadyDrawing,

    /// The geometry or draw configuration failed validation.
    InvalidConfig(String),

    /// A transport operation failed mid-run.
    Transport(TransportError),
}

impl fmt::Display for DrawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawError::NotConnected => write!(f, "Not connected"),
            DrawError::AlreadyDrawing => write!(f, "Already drawing"),
            DrawError::InvalidConfig(message) => {
                write!(f, "Invalid draw configuration: {}", message)
            }
            DrawError::Transport(err) => write!(f, "Transport error: {}", err),
        }
    }
}

impl std::error::Error for DrawError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DrawError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for DrawError {
    fn from(err: TransportError) -> Self {
        DrawError::Transport(err)
    }
}
