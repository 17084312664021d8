//! Runs path preparation off the caller's task.
//!
//! A single worker thread serves request/reply envelopes over channels;
//! inputs and outputs are owned copies, never shared references. Any
//! failure — spawn error, closed channel, worker panic — permanently
//! disables offloading for the rest of the session and falls back to
//! preparing synchronously on the calling task. The degrade is one-way and
//! logged once; it is never an error to the caller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use async_channel::{Receiver, Sender};
use ovoplot_common::{GeometryConfig, PreparedStroke, Stroke};
use tracing::{debug, warn};

use crate::geometry;

/// Owned inputs for one preparation request.
#[derive(Clone, Debug)]
pub struct PreparePayload {
    /// The strokes to prepare.
    pub strokes: Vec<Stroke>,
    /// Geometry of the transform.
    pub config: GeometryConfig,
    /// Carriage X at the start of the run.
    pub start_x: i32,
}

struct PrepareRequest {
    request_id: u64,
    payload: PreparePayload,
    reply: Sender<PrepareReply>,
}

struct PrepareReply {
    request_id: u64,
    strokes: Vec<PreparedStroke>,
}

enum OffloadState {
    /// No worker yet; the first request (or a warm-up) spawns one.
    Idle,
    /// Worker alive and accepting envelopes.
    Running { requests: Sender<PrepareRequest> },
    /// Permanently degraded to synchronous preparation.
    Disabled,
}

/// Wraps [`geometry::prepare_strokes`] in a background worker with a
/// synchronous fallback.
pub struct PreparationOffloader {
    state: Mutex<OffloadState>,
    next_request_id: AtomicU64,
}

impl Default for PreparationOffloader {
    fn default() -> Self {
        Self::new()
    }
}

impl PreparationOffloader {
    /// A fresh offloader; the worker spawns lazily.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OffloadState::Idle),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Optional hint to pre-spin the worker before a real request arrives.
    pub fn warm_up(&self) {
        let _ = self.worker_sender();
    }

    /// Explicit one-way switch to synchronous preparation.
    pub fn disable(&self) {
        *self.state.lock().expect("offloader state poisoned") = OffloadState::Disabled;
    }

    /// Whether requests currently go to (or would spawn) a worker.
    pub fn is_offloading(&self) -> bool {
        !matches!(
            *self.state.lock().expect("offloader state poisoned"),
            OffloadState::Disabled
        )
    }

    /// Prepares the payload, off-thread when possible.
    ///
    /// Never fails: every degraded path computes the result in place.
    pub async fn prepare(&self, payload: PreparePayload) -> Vec<PreparedStroke> {
        let Some(requests) = self.worker_sender() else {
            return Self::prepare_inline(&payload);
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        let fallback = payload.clone();
        let request = PrepareRequest {
            request_id,
            payload,
            reply: reply_tx,
        };

        if requests.send(request).await.is_err() {
            return self.degrade(&fallback, "worker request channel closed");
        }
        match reply_rx.recv().await {
            Ok(reply) if reply.request_id == request_id => {
                debug!(request_id, strokes = reply.strokes.len(), "prepared off-thread");
                reply.strokes
            }
            Ok(_) => self.degrade(&fallback, "mismatched reply id"),
            Err(_) => self.degrade(&fallback, "worker dropped the request"),
        }
    }

    fn worker_sender(&self) -> Option<Sender<PrepareRequest>> {
        let mut state = self.state.lock().expect("offloader state poisoned");
        match &*state {
            OffloadState::Disabled => None,
            OffloadState::Running { requests } => Some(requests.clone()),
            OffloadState::Idle => {
                let (tx, rx) = async_channel::unbounded();
                match thread::Builder::new()
                    .name("ovoplot-prepare".into())
                    .spawn(move || worker_loop(rx))
                {
                    Ok(_) => {
                        debug!("preparation worker spawned");
                        *state = OffloadState::Running {
                            requests: tx.clone(),
                        };
                        Some(tx)
                    }
                    Err(err) => {
                        warn!(
                            "Could not spawn preparation worker, preparing synchronously from now on: {}",
                            err
                        );
                        *state = OffloadState::Disabled;
                        None
                    }
                }
            }
        }
    }

    fn degrade(&self, payload: &PreparePayload, reason: &str) -> Vec<PreparedStroke> {
        warn!(
            "Disabling path preparation offload for this session: {}",
            reason
        );
        self.disable();
        Self::prepare_inline(payload)
    }

    fn prepare_inline(payload: &PreparePayload) -> Vec<PreparedStroke> {
        geometry::prepare_strokes(&payload.strokes, &payload.config, payload.start_x)
    }
}

fn worker_loop(requests: Receiver<PrepareRequest>) {
    while let Ok(request) = requests.recv_blocking() {
        let computed = catch_unwind(AssertUnwindSafe(|| {
            PreparationOffloader::prepare_inline(&request.payload)
        }));
        match computed {
            Ok(strokes) => {
                // Receiver gone means the caller timed out or degraded.
                let _ = request.reply.try_send(PrepareReply {
                    request_id: request.request_id,
                    strokes,
                });
            }
            Err(_) => {
                // Dropping the reply sender makes the caller degrade; the
                // worker retires after a panic rather than serve a loop in
                // an unknown state.
                warn!("Preparation worker panicked; retiring");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovoplot_common::Point2D;

    fn payload() -> PreparePayload {
        PreparePayload {
            strokes: vec![Stroke::open(vec![
                Point2D::new(0.0, 0.5),
                Point2D::new(0.1, 0.5),
            ])],
            config: GeometryConfig::default(),
            start_x: 0,
        }
    }

    #[tokio::test]
    async fn offloaded_result_matches_inline() {
        let offloader = PreparationOffloader::new();
        offloader.warm_up();
        let off = offloader.prepare(payload()).await;
        let inline = geometry::prepare_strokes(
            &payload().strokes,
            &payload().config,
            payload().start_x,
        );
        assert_eq!(off, inline);
        assert!(offloader.is_offloading());
    }

    #[tokio::test]
    async fn disabled_offloader_still_prepares() {
        let offloader = PreparationOffloader::new();
        offloader.disable();
        assert!(!offloader.is_offloading());
        let result = offloader.prepare(payload()).await;
        assert_eq!(result.len(), 1);
        // and the degrade is one-way
        offloader.warm_up();
        assert!(!offloader.is_offloading());
    }

    #[tokio::test]
    async fn consecutive_requests_reuse_one_worker() {
        let offloader = PreparationOffloader::new();
        let first = offloader.prepare(payload()).await;
        let second = offloader.prepare(payload()).await;
        assert_eq!(first, second);
        assert!(offloader.is_offloading());
    }
}
