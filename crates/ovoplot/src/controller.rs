//! The draw state machine.
//!
//! `Idle → Preparing → Configuring → (per stroke: MoveToStart → PenDown →
//! Tracing → PenUp)* → [ReturnHome] → Finished | Aborted`.
//!
//! The controller owns the transport exclusively for the duration of a run
//! and issues commands strictly in program order: every move chunk is paced
//! by a sleep slightly longer than the commanded duration so the firmware
//! command buffer never overruns. Cancellation is cooperative and observed
//! between chunks, points and strokes; cleanup (pen-up, motor-disable) is
//! attempted on every exit path that configured the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ovoplot_common::commands::{
    SERVO_CHANNEL_LOWER_RATE, SERVO_CHANNEL_PEN_DOWN, SERVO_CHANNEL_PEN_UP,
    SERVO_CHANNEL_RAISE_RATE,
};
use ovoplot_common::{
    DeviceCommand, DrawConfig, DrawError, GeometryConfig, PreparedStroke, StepPoint, Stroke,
};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::offload::{PreparationOffloader, PreparePayload};
use crate::runtime::{Clock, SystemClock};
use crate::transport::{SendOptions, Transport};

/// Firmware bound on the magnitude of a single timed move, per axis.
pub const MAX_CHUNK_STEPS: i32 = 1200;
/// Shortest commanded move duration, ms.
const MIN_MOVE_DURATION_MS: u64 = 8;
/// Pacing margin added on top of each commanded duration, ms.
const PACING_SLACK_MS: u64 = 6;

/// Terminal state of a draw run. An abort is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawOutcome {
    /// Every stroke was traced.
    Completed,
    /// Cancellation was observed at a checkpoint before the run finished.
    Aborted,
}

/// Receives human-readable phase strings and per-stroke progress.
pub trait DrawSink: Send {
    /// A new phase of the run has begun.
    fn status(&mut self, phase: &str) {
        let _ = phase;
    }

    /// `completed` of `total` strokes are done.
    fn progress(&mut self, completed: usize, total: usize) {
        let _ = (completed, total);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl DrawSink for NullSink {}

/// A status/progress event, for consumers that prefer a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrawEvent {
    /// A new phase of the run has begun.
    Status(String),
    /// Stroke completion count changed.
    Progress {
        /// Strokes finished so far.
        completed: usize,
        /// Total strokes in the run.
        total: usize,
    },
}

/// Forwards sink calls onto an `async-channel`, best effort.
///
/// Uses `try_send` so a slow or gone consumer can never stall the draw
/// loop.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    events: async_channel::Sender<DrawEvent>,
}

impl ChannelSink {
    /// Wraps the sending half of an event channel.
    pub fn new(events: async_channel::Sender<DrawEvent>) -> Self {
        Self { events }
    }
}

impl DrawSink for ChannelSink {
    fn status(&mut self, phase: &str) {
        let _ = self.events.try_send(DrawEvent::Status(phase.to_owned()));
    }

    fn progress(&mut self, completed: usize, total: usize) {
        let _ = self.events.try_send(DrawEvent::Progress { completed, total });
    }
}

/// Orchestrates an end-to-end draw run over one [`Transport`].
pub struct DrawController<T: Transport> {
    transport: T,
    clock: Arc<dyn Clock>,
    offloader: Arc<PreparationOffloader>,
    cancel: CancelToken,
    drawing: AtomicBool,
    configured: AtomicBool,
    position: Mutex<StepPoint>,
}

impl<T: Transport> DrawController<T> {
    /// A controller over `transport` with the production clock and a fresh
    /// offloader.
    pub fn new(transport: T) -> Self {
        Self::with_parts(
            transport,
            Arc::new(SystemClock),
            Arc::new(PreparationOffloader::new()),
        )
    }

    /// Full constructor for injected capabilities.
    pub fn with_parts(
        transport: T,
        clock: Arc<dyn Clock>,
        offloader: Arc<PreparationOffloader>,
    ) -> Self {
        let cancel = transport.cancel_token();
        Self {
            transport,
            clock,
            offloader,
            cancel,
            drawing: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            position: Mutex::new(StepPoint::new(0, 0)),
        }
    }

    /// The transport this controller drives.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable transport access, for connect/disconnect between runs.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Releases the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Whether a draw run is currently active.
    pub fn is_drawing(&self) -> bool {
        self.drawing.load(Ordering::SeqCst)
    }

    /// The token an observer can use to cancel the active run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Requests cancellation of the active run.
    ///
    /// Observed at the next checkpoint; a move already issued to the
    /// firmware still completes.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// The carriage position the controller believes the device is at.
    pub fn position(&self) -> StepPoint {
        *self.position.lock().expect("position poisoned")
    }

    /// Draws `strokes` through the connected transport.
    ///
    /// Fails fast with [`DrawError::AlreadyDrawing`] while a run is active
    /// and with [`DrawError::NotConnected`] when the transport has no open
    /// channel; neither guard issues any device command. Once any
    /// configuring command has been issued, pen-up and motor-disable are
    /// attempted on every exit path — completion, abort or error — and
    /// their own failures never mask the run's outcome. The drawing flag is
    /// released even when the caller drops the returned future mid-run.
    pub async fn draw_strokes(
        &self,
        strokes: &[Stroke],
        geometry: &GeometryConfig,
        config: &DrawConfig,
        sink: &mut dyn DrawSink,
    ) -> Result<DrawOutcome, DrawError> {
        if self
            .drawing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DrawError::AlreadyDrawing);
        }
        let _guard = DrawingGuard {
            drawing: &self.drawing,
        };
        self.guarded_run(strokes, geometry, config, sink).await
    }

    async fn guarded_run(
        &self,
        strokes: &[Stroke],
        geometry: &GeometryConfig,
        config: &DrawConfig,
        sink: &mut dyn DrawSink,
    ) -> Result<DrawOutcome, DrawError> {
        if !self.transport.is_connected() {
            return Err(DrawError::NotConnected);
        }
        geometry.validate()?;
        let config = config.clamped();
        self.cancel.reset();
        self.configured.store(false, Ordering::SeqCst);

        let result = self.run(strokes, geometry, &config, sink).await;

        if self.configured.load(Ordering::SeqCst) {
            self.cleanup(&config).await;
        }

        match result {
            Ok(()) => {
                if self.cancel.is_cancelled() {
                    info!("draw run aborted");
                    sink.status("aborted");
                    Ok(DrawOutcome::Aborted)
                } else {
                    info!("draw run finished");
                    sink.status("finished");
                    Ok(DrawOutcome::Completed)
                }
            }
            Err(err) => {
                warn!("draw run failed: {}", err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        strokes: &[Stroke],
        geometry: &GeometryConfig,
        config: &DrawConfig,
        sink: &mut dyn DrawSink,
    ) -> Result<(), DrawError> {
        sink.status("preparing paths");
        let payload = PreparePayload {
            strokes: strokes.to_vec(),
            config: geometry.clone(),
            start_x: self.position().x,
        };
        let prepared = self.offloader.prepare(payload).await;
        let total = prepared.len();
        info!(strokes = total, "paths prepared");

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        sink.status("configuring plotter");
        self.configure(config).await?;

        for (index, stroke) in prepared.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            sink.status(&format!("drawing stroke {}/{}", index + 1, total));
            self.trace_stroke(stroke, config).await?;
            sink.progress(index + 1, total);
        }

        if config.return_home && !self.cancel.is_cancelled() {
            sink.status("returning home");
            let period = f64::from(geometry.steps_per_turn);
            let turns = (f64::from(self.position().x) / period).round() as i32;
            let home = StepPoint::new(turns * geometry.steps_per_turn, 0);
            self.move_to(home, config.pen_up_speed, config).await?;
        }
        Ok(())
    }

    /// Servo ranges and lift rates go out before the motors are enabled.
    async fn configure(&self, config: &DrawConfig) -> Result<(), DrawError> {
        self.configured.store(true, Ordering::SeqCst);
        self.send(DeviceCommand::ServoConfig {
            channel: SERVO_CHANNEL_PEN_UP,
            value: config.servo_up,
        })
        .await?;
        self.send(DeviceCommand::ServoConfig {
            channel: SERVO_CHANNEL_PEN_DOWN,
            value: config.servo_down,
        })
        .await?;
        // Rate slots are missing from older firmware; ignore rejections.
        if config.pen_raise_rate > 0 {
            if let Err(err) = self
                .send(DeviceCommand::ServoConfig {
                    channel: SERVO_CHANNEL_RAISE_RATE,
                    value: config.pen_raise_rate,
                })
                .await
            {
                debug!("raise-rate slot unsupported: {}", err);
            }
        }
        if config.pen_lower_rate > 0 {
            if let Err(err) = self
                .send(DeviceCommand::ServoConfig {
                    channel: SERVO_CHANNEL_LOWER_RATE,
                    value: config.pen_lower_rate,
                })
                .await
            {
                debug!("lower-rate slot unsupported: {}", err);
            }
        }
        self.send(DeviceCommand::EnableMotors { axis1: 1, axis2: 1 })
            .await?;
        self.set_pen(true, config).await?;
        Ok(())
    }

    async fn trace_stroke(
        &self,
        stroke: &PreparedStroke,
        config: &DrawConfig,
    ) -> Result<(), DrawError> {
        let Some((&first, rest)) = stroke.split_first() else {
            return Ok(());
        };
        self.move_to(first, config.pen_up_speed, config).await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.set_pen(false, config).await?;
        for &point in rest {
            if self.cancel.is_cancelled() {
                break;
            }
            self.move_to(point, config.pen_down_speed, config).await?;
        }
        self.set_pen(true, config).await?;
        Ok(())
    }

    /// Chunked, paced move to an absolute step position.
    ///
    /// The remaining vector is consumed in per-axis chunks no larger than
    /// [`MAX_CHUNK_STEPS`]; each chunk's duration follows from the longest
    /// axis at the configured speed, and execution sleeps slightly past the
    /// commanded duration before the next chunk goes out.
    async fn move_to(
        &self,
        target: StepPoint,
        speed: f64,
        config: &DrawConfig,
    ) -> Result<(), DrawError> {
        let position = self.position();
        let mut dx = target.x - position.x;
        let mut dy = target.y - position.y;
        while dx != 0 || dy != 0 {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let chunk_x = dx.clamp(-MAX_CHUNK_STEPS, MAX_CHUNK_STEPS);
            let chunk_y = dy.clamp(-MAX_CHUNK_STEPS, MAX_CHUNK_STEPS);
            let longest = chunk_x.abs().max(chunk_y.abs());
            let duration_ms =
                ((f64::from(longest) / speed * 1000.0).round() as u64).max(MIN_MOVE_DURATION_MS);
            let (axis1_steps, axis2_steps) = remap_axes(chunk_x, chunk_y, config);
            self.send(DeviceCommand::Move {
                duration_ms,
                axis1_steps,
                axis2_steps,
            })
            .await?;
            dx -= chunk_x;
            dy -= chunk_y;
            {
                let mut position = self.position.lock().expect("position poisoned");
                position.x += chunk_x;
                position.y += chunk_y;
            }
            self.clock
                .sleep(Duration::from_millis(duration_ms + PACING_SLACK_MS))
                .await;
        }
        Ok(())
    }

    /// Pen state change plus the configured settle delay.
    async fn set_pen(&self, up: bool, config: &DrawConfig) -> Result<(), DrawError> {
        self.send(DeviceCommand::SetPen {
            value: pen_value(up, config),
        })
        .await?;
        let delay = if up {
            config.pen_up_delay_ms
        } else {
            config.pen_down_delay_ms
        };
        self.clock.sleep(Duration::from_millis(delay)).await;
        Ok(())
    }

    /// Best-effort shutdown: pen up, then motors off. Failures are logged
    /// and swallowed so they never mask the run's outcome.
    async fn cleanup(&self, config: &DrawConfig) {
        let pen_up = DeviceCommand::SetPen {
            value: pen_value(true, config),
        };
        if let Err(err) = self
            .transport
            .send_command(&pen_up.to_string(), SendOptions::fire_and_forget())
            .await
        {
            debug!("cleanup pen-up failed: {}", err);
        }
        self.clock
            .sleep(Duration::from_millis(config.pen_up_delay_ms))
            .await;
        if let Err(err) = self
            .transport
            .send_command(
                &DeviceCommand::disable_motors().to_string(),
                SendOptions::fire_and_forget(),
            )
            .await
        {
            debug!("cleanup motor-disable failed: {}", err);
        }
        self.configured.store(false, Ordering::SeqCst);
    }

    async fn send(&self, command: DeviceCommand) -> Result<(), DrawError> {
        self.transport
            .send_command(&command.to_string(), SendOptions::fire_and_forget())
            .await?;
        Ok(())
    }
}

/// Clears the drawing flag on every exit from `draw_strokes`, including a
/// caller dropping the run future mid-await.
struct DrawingGuard<'a> {
    drawing: &'a AtomicBool,
}

impl Drop for DrawingGuard<'_> {
    fn drop(&mut self) {
        self.drawing.store(false, Ordering::SeqCst);
    }
}

fn pen_value(up: bool, config: &DrawConfig) -> u8 {
    if up != config.invert_pen { 1 } else { 0 }
}

/// Logical X is the egg-rotation motor (axis 2) and logical Y the
/// pen-carriage motor (axis 1); reversal flags flip each motor's direction.
fn remap_axes(chunk_x: i32, chunk_y: i32, config: &DrawConfig) -> (i32, i32) {
    let axis1 = if config.reverse_pen_motor {
        -chunk_y
    } else {
        chunk_y
    };
    let axis2 = if config.reverse_rotation_motor {
        -chunk_x
    } else {
        chunk_x
    };
    (axis1, axis2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pen_value_honors_invert_flag() {
        let normal = DrawConfig::default();
        assert_eq!(pen_value(true, &normal), 1);
        assert_eq!(pen_value(false, &normal), 0);

        let inverted = DrawConfig {
            invert_pen: true,
            ..DrawConfig::default()
        };
        assert_eq!(pen_value(true, &inverted), 0);
        assert_eq!(pen_value(false, &inverted), 1);
    }

    #[test]
    fn axis_remap_applies_reversal_flags() {
        let normal = DrawConfig::default();
        assert_eq!(remap_axes(320, -40, &normal), (-40, 320));

        let reversed = DrawConfig {
            reverse_pen_motor: true,
            reverse_rotation_motor: true,
            ..DrawConfig::default()
        };
        assert_eq!(remap_axes(320, -40, &reversed), (40, -320));
    }

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, rx) = async_channel::unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.status("configuring plotter");
        sink.progress(1, 3);
        assert_eq!(
            rx.try_recv().ok(),
            Some(DrawEvent::Status("configuring plotter".into()))
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(DrawEvent::Progress {
                completed: 1,
                total: 3
            })
        );
    }
}
