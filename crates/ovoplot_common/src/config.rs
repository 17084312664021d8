//! Geometry and draw-run configuration records.
//!
//! Both records are created per draw request, validated or clamped at the
//! controller boundary and never partially applied.

use serde::{Deserialize, Serialize};

use crate::error::DrawError;

/// How incoming stroke coordinates are interpreted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CoordinateMode {
    /// `u`/`v` are normalized surface coordinates; `u` wraps at the seam.
    #[default]
    NormalizedUv,
    /// Coordinates map into a document rectangle centered on the origin,
    /// as produced by the SVG import path.
    DocumentPxCentered,
}

/// Geometry of the machine and of the coordinate transform.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeometryConfig {
    /// U-axis steps for one full revolution of the egg.
    pub steps_per_turn: i32,
    /// Total V-axis travel range of the pen carriage, in steps.
    pub pen_range_steps: i32,
    /// Whether strokes may be shifted by whole revolutions to minimize
    /// travel.
    pub wrap_around: bool,
    /// Interpretation of incoming coordinates.
    pub coordinate_mode: CoordinateMode,
    /// Document width in px, used in [`CoordinateMode::DocumentPxCentered`].
    pub document_width_px: f64,
    /// Document height in px, used in [`CoordinateMode::DocumentPxCentered`].
    pub document_height_px: f64,
    /// Divider from document px to steps, used in
    /// [`CoordinateMode::DocumentPxCentered`].
    pub step_scaling_factor: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            steps_per_turn: 3200,
            pen_range_steps: 1500,
            wrap_around: true,
            coordinate_mode: CoordinateMode::NormalizedUv,
            document_width_px: 0.0,
            document_height_px: 0.0,
            step_scaling_factor: 1.0,
        }
    }
}

impl GeometryConfig {
    /// Checks the structural invariants of the record.
    ///
    /// Step counts must be positive and at least 100; document-centered mode
    /// additionally needs a usable document rectangle and scaling factor.
    pub fn validate(&self) -> Result<(), DrawError> {
        if self.steps_per_turn < 100 {
            return Err(DrawError::InvalidConfig(format!(
                "steps_per_turn must be >= 100, got {}",
                self.steps_per_turn
            )));
        }
        if self.pen_range_steps < 100 {
            return Err(DrawError::InvalidConfig(format!(
                "pen_range_steps must be >= 100, got {}",
                self.pen_range_steps
            )));
        }
        if self.coordinate_mode == CoordinateMode::DocumentPxCentered {
            if !(self.document_width_px > 0.0) || !(self.document_height_px > 0.0) {
                return Err(DrawError::InvalidConfig(
                    "document-centered mode needs a positive document size".into(),
                ));
            }
            if !(self.step_scaling_factor > 0.0) {
                return Err(DrawError::InvalidConfig(
                    "step_scaling_factor must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Full device tuning record for one draw run.
///
/// Servo values are raw firmware units (channel values of the `SC` command);
/// speeds are steps per second. The controller applies a [`clamped`] copy so
/// the record is never partially applied.
///
/// [`clamped`]: DrawConfig::clamped
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DrawConfig {
    /// Servo position for pen up (SC channel 4).
    pub servo_up: u16,
    /// Servo position for pen down (SC channel 5).
    pub servo_down: u16,
    /// Servo raise rate (SC channel 11); 0 leaves the firmware default.
    pub pen_raise_rate: u16,
    /// Servo lower rate (SC channel 12); 0 leaves the firmware default.
    pub pen_lower_rate: u16,
    /// Settle delay after raising the pen, in ms.
    pub pen_up_delay_ms: u64,
    /// Settle delay after lowering the pen, in ms.
    pub pen_down_delay_ms: u64,
    /// Reverse the pen-carriage motor direction.
    pub reverse_pen_motor: bool,
    /// Reverse the egg-rotation motor direction.
    pub reverse_rotation_motor: bool,
    /// Swap the logical up/down servo value.
    pub invert_pen: bool,
    /// Rotate back to a whole revolution after the run.
    pub return_home: bool,
    /// Travel speed with the pen raised, steps/sec.
    pub pen_up_speed: f64,
    /// Travel speed with the pen lowered, steps/sec.
    pub pen_down_speed: f64,
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            servo_up: 16000,
            servo_down: 20000,
            pen_raise_rate: 0,
            pen_lower_rate: 0,
            pen_up_delay_ms: 200,
            pen_down_delay_ms: 200,
            reverse_pen_motor: false,
            reverse_rotation_motor: false,
            invert_pen: false,
            return_home: true,
            pen_up_speed: 2000.0,
            pen_down_speed: 800.0,
        }
    }
}

impl DrawConfig {
    /// Speeds below this are treated as misconfiguration and raised.
    pub const MIN_SPEED: f64 = 1.0;
    /// Firmware ceiling for travel speed, steps/sec.
    pub const MAX_SPEED: f64 = 25_000.0;

    /// Returns a copy with every field forced into its usable range.
    pub fn clamped(&self) -> Self {
        let mut out = self.clone();
        if !out.pen_up_speed.is_finite() {
            out.pen_up_speed = Self::MIN_SPEED;
        }
        if !out.pen_down_speed.is_finite() {
            out.pen_down_speed = Self::MIN_SPEED;
        }
        out.pen_up_speed = out.pen_up_speed.clamp(Self::MIN_SPEED, Self::MAX_SPEED);
        out.pen_down_speed = out.pen_down_speed.clamp(Self::MIN_SPEED, Self::MAX_SPEED);
        out.pen_up_delay_ms = out.pen_up_delay_ms.min(10_000);
        out.pen_down_delay_ms = out.pen_down_delay_ms.min(10_000);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_small_step_counts() {
        let mut config = GeometryConfig::default();
        config.steps_per_turn = 99;
        assert!(config.validate().is_err());

        let mut config = GeometryConfig::default();
        config.pen_range_steps = 0;
        assert!(config.validate().is_err());

        assert!(GeometryConfig::default().validate().is_ok());
    }

    #[test]
    fn document_mode_needs_document_size() {
        let config = GeometryConfig {
            coordinate_mode: CoordinateMode::DocumentPxCentered,
            ..GeometryConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GeometryConfig {
            coordinate_mode: CoordinateMode::DocumentPxCentered,
            document_width_px: 1209.448,
            document_height_px: 377.952,
            step_scaling_factor: 2.0,
            ..GeometryConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn clamp_repairs_speeds_and_delays() {
        let config = DrawConfig {
            pen_up_speed: f64::NAN,
            pen_down_speed: 1e9,
            pen_up_delay_ms: 1_000_000,
            ..DrawConfig::default()
        };
        let clamped = config.clamped();
        assert_eq!(clamped.pen_up_speed, DrawConfig::MIN_SPEED);
        assert_eq!(clamped.pen_down_speed, DrawConfig::MAX_SPEED);
        assert_eq!(clamped.pen_up_delay_ms, 10_000);
    }
}
