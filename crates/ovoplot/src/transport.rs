//! The polymorphic channel to the device.
//!
//! One trait, three independent implementations (serial, BLE, WiFi) that
//! share the [`LineProtocol`](crate::line::LineProtocol) framing layer by
//! composition. Connect options are transport-specific and live in each
//! implementation's settings struct, taken at construction.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use ovoplot_common::{DeviceCommand, TransportError};
use tracing::warn;

use crate::cancel::CancelToken;

/// Default window to wait for a response line.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1200);

/// Per-command send options.
#[derive(Clone, Copy, Debug)]
pub struct SendOptions {
    /// Whether to await exactly one response line.
    pub expect_response: bool,
    /// How long to wait for that line.
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            expect_response: false,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl SendOptions {
    /// Write only; return immediately with an empty string.
    pub fn fire_and_forget() -> Self {
        Self::default()
    }

    /// Await one response line within the default window.
    pub fn response() -> Self {
        Self {
            expect_response: true,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Await one response line within `timeout`.
    pub fn response_within(timeout: Duration) -> Self {
        Self {
            expect_response: true,
            timeout,
        }
    }
}

/// Appends the protocol line terminator (CR) if the line lacks one.
pub fn terminated(line: &str) -> Cow<'_, str> {
    if line.ends_with('\r') || line.ends_with('\n') {
        Cow::Borrowed(line)
    } else {
        Cow::Owned(format!("{}\r", line))
    }
}

/// An exclusive channel to the plotting robot.
///
/// Exactly one connection may be open per instance. During a draw run the
/// [`DrawController`](crate::controller::DrawController) owns the transport
/// exclusively; interleaving `send_command` calls from elsewhere corrupts
/// response matching.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name for logs and status lines.
    fn name(&self) -> &'static str;

    /// Capability probe; no side effects.
    fn is_supported(&self) -> bool;

    /// Opens the channel and performs the protocol handshake.
    ///
    /// Returns a human-readable version/status string. The version query is
    /// tolerant: when it times out or errors the connection still succeeds
    /// with a generic "connected" status.
    async fn connect(&mut self) -> Result<String, TransportError>;

    /// Like [`connect`](Transport::connect), but free to silently reuse a
    /// previously authorized channel where the platform allows it.
    ///
    /// Only the serial transport has such a path; the default just connects.
    async fn connect_for_draw(&mut self) -> Result<String, TransportError> {
        self.connect().await
    }

    /// Releases the channel. Idempotent.
    ///
    /// Rejects all pending line waiters, clears buffered state and cancels
    /// the transport's token so an in-flight draw loop halts cooperatively.
    async fn disconnect(&mut self);

    /// True only when every required handle of the channel is present and
    /// live.
    fn is_connected(&self) -> bool;

    /// Writes one command line (CR appended if missing) and, if requested,
    /// awaits exactly one response line.
    ///
    /// Pure writes never time out; only response waits do. Takes `&self`
    /// so a shared controller can issue commands; callers must still
    /// serialize access — concurrent senders interleave responses.
    async fn send_command(
        &self,
        line: &str,
        options: SendOptions,
    ) -> Result<String, TransportError>;

    /// The cancellation token tied to this transport's lifetime.
    fn cancel_token(&self) -> CancelToken;

    /// The tolerant firmware version handshake.
    ///
    /// Issues `v` and waits for one line; any failure downgrades to a
    /// generic status instead of failing the connection. Firmware without
    /// the query stays usable.
    async fn firmware_version(&self) -> String {
        match self
            .send_command(&DeviceCommand::Version.to_string(), SendOptions::response())
            .await
        {
            Ok(version) if !version.is_empty() => version,
            Ok(_) => "connected".to_string(),
            Err(err) => {
                warn!("Version query failed, continuing anyway: {}", err);
                "connected".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_appended_only_when_missing() {
        assert_eq!(terminated("EM,1,1"), "EM,1,1\r");
        assert_eq!(terminated("EM,1,1\r"), "EM,1,1\r");
        assert_eq!(terminated("v\n"), "v\n");
    }

    #[test]
    fn default_options_are_write_only_with_standard_window() {
        let options = SendOptions::default();
        assert!(!options.expect_response);
        assert_eq!(options.timeout, DEFAULT_RESPONSE_TIMEOUT);
        assert!(SendOptions::response().expect_response);
    }
}
