#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]

/*!
Shared vocabulary for the ovoplot workspace: the stroke/step data model, the
plain-text device command protocol and the error taxonomy used by the core
crate and every transport crate.

Geometry lives in a normalized UV space: `u` runs around the egg (wrapping at
the seam), `v` runs pole to pole. The core crate turns these into absolute
stepper coordinates; everything in this crate is plain data.
*/

pub mod commands;
pub mod config;
pub mod error;

pub use commands::DeviceCommand;
pub use config::{CoordinateMode, DrawConfig, GeometryConfig};
pub use error::{ConnectStage, DrawError, TransportError};

use serde::{Deserialize, Serialize};

/// A point in normalized surface coordinates.
///
/// `u` ∈ [0,1) wraps around the cylindrical seam, `v` ∈ [0,1] is clamped
/// pole-to-pole. Produced by the pattern/import collaborators upstream of
/// this workspace.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Point2D {
    /// Around-the-surface coordinate, wrapping at the seam.
    pub u: f64,
    /// Pole-to-pole coordinate.
    pub v: f64,
}

impl Point2D {
    /// Convenience constructor.
    pub fn new(u: f64, v: f64) -> Self {
        Self { u, v }
    }
}

/// An ordered sequence of at least two points, optionally closed.
///
/// Strokes are immutable inputs to path preparation; they are copied into a
/// draw run and discarded with it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Stroke {
    /// The points of the stroke, in drawing order.
    pub points: Vec<Point2D>,
    /// Whether the stroke closes back onto its first point.
    pub closed: bool,
}

impl Stroke {
    /// An open stroke over the given points.
    pub fn open(points: Vec<Point2D>) -> Self {
        Self {
            points,
            closed: false,
        }
    }

    /// A closed stroke over the given points.
    pub fn closed(points: Vec<Point2D>) -> Self {
        Self {
            points,
            closed: true,
        }
    }
}

/// An absolute stepper-motor coordinate after the geometry transform.
///
/// `x` is egg rotation (may run through multiple revolutions once seam
/// unwrapping and wrap alignment are applied), `y` is pen carriage travel
/// clamped to half the configured pen range either side of center.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StepPoint {
    /// Egg-rotation axis, in steps.
    pub x: i32,
    /// Pen-carriage axis, in steps.
    pub y: i32,
}

impl StepPoint {
    /// Convenience constructor.
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A stroke after preparation: at least two step coordinates, owned by
/// exactly one draw run.
pub type PreparedStroke = Vec<StepPoint>;

/// Durable identity of a previously authorized USB serial port.
///
/// Used only by the serial transport to silently reselect a port without
/// prompting; BLE and WiFi require an explicit selection every time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistedPortHint {
    /// USB vendor id of the authorized port.
    pub usb_vendor_id: u16,
    /// USB product id of the authorized port.
    pub usb_product_id: u16,
}

/// Storage key under which [`PersistedPortHint`] is kept.
pub const PORT_HINT_KEY: &str = "ovoplot.serial.port-hint";
