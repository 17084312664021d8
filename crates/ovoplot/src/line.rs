//! Byte/text buffering and line framing shared by all transports.
//!
//! Incoming chunks of arbitrary size are accumulated and split on CR, LF or
//! CRLF; complete, trimmed, non-empty lines are delivered either to the
//! oldest pending response waiter or into an ordered backlog. Line
//! subscribers see every line, best effort.
//!
//! A transport owns one [`LineProtocol`] for its lifetime: `close` rejects
//! every outstanding waiter atomically when the channel goes away, and
//! `reopen` resets the framing state when a new connection is established.

use std::collections::VecDeque;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::FutureExt;
use ovoplot_common::TransportError;
use tracing::trace;

use crate::runtime::Clock;

/// A best-effort line observer. Panics are swallowed.
pub type LineSubscriber = Box<dyn Fn(&str) + Send + Sync>;

struct Waiter {
    id: u64,
    tx: async_channel::Sender<String>,
}

#[derive(Default)]
struct LineState {
    accumulator: Vec<u8>,
    // A CR at a chunk boundary may be the first half of a CRLF; remember to
    // swallow the LF if it arrives at the start of the next chunk.
    swallow_lf: bool,
    backlog: VecDeque<String>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
}

enum Wait {
    Line(String),
    Closed,
    Expired,
}

/// Accumulates raw transport bytes and frames them into response lines.
pub struct LineProtocol {
    state: Mutex<LineState>,
    subscribers: Mutex<Vec<LineSubscriber>>,
    clock: Arc<dyn Clock>,
}

impl LineProtocol {
    /// A fresh, open protocol using `clock` for waiter timeouts.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LineState::default()),
            subscribers: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Feeds one incoming chunk of raw bytes.
    ///
    /// UTF-8 is decoded per complete line, so multi-byte characters split
    /// across chunk boundaries reassemble correctly.
    pub fn feed(&self, chunk: &[u8]) {
        let mut lines = Vec::new();
        {
            let mut state = self.state.lock().expect("line protocol state poisoned");
            if state.closed {
                return;
            }
            for &byte in chunk {
                if state.swallow_lf {
                    state.swallow_lf = false;
                    if byte == b'\n' {
                        continue;
                    }
                }
                match byte {
                    b'\n' => lines.push(mem::take(&mut state.accumulator)),
                    b'\r' => {
                        lines.push(mem::take(&mut state.accumulator));
                        state.swallow_lf = true;
                    }
                    _ => state.accumulator.push(byte),
                }
            }
        }

        for raw in lines {
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            self.dispatch(line);
        }
    }

    /// Feeds a chunk already decoded as text (BLE notification payloads).
    pub fn feed_str(&self, chunk: &str) {
        self.feed(chunk.as_bytes());
    }

    fn dispatch(&self, line: String) {
        trace!(%line, "device line");
        if let Ok(subscribers) = self.subscribers.lock() {
            for subscriber in subscribers.iter() {
                let _ = catch_unwind(AssertUnwindSafe(|| subscriber(&line)));
            }
        }

        let mut state = self.state.lock().expect("line protocol state poisoned");
        // Skip waiters whose callers already gave up (timed out).
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.try_send(line.clone()).is_ok() {
                return;
            }
        }
        state.backlog.push_back(line);
    }

    /// Resolves the next line: immediately from the backlog, otherwise by
    /// waiting at most `timeout` for one to arrive.
    pub async fn next_line(&self, timeout: Duration) -> Result<String, TransportError> {
        let (rx, id) = {
            let mut state = self.state.lock().expect("line protocol state poisoned");
            if let Some(line) = state.backlog.pop_front() {
                return Ok(line);
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            let (tx, rx) = async_channel::bounded(1);
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            (rx, id)
        };

        let receive = async {
            match rx.recv().await {
                Ok(line) => Wait::Line(line),
                Err(_) => Wait::Closed,
            }
        };
        let expire = async {
            self.clock.sleep(timeout).await;
            Wait::Expired
        };

        match receive.or(expire).await {
            Wait::Line(line) => Ok(line),
            Wait::Closed => Err(TransportError::Closed),
            Wait::Expired => {
                let mut state = self.state.lock().expect("line protocol state poisoned");
                state.waiters.retain(|waiter| waiter.id != id);
                drop(state);
                // A line may have been delivered between expiry and removal.
                if let Ok(line) = rx.try_recv() {
                    return Ok(line);
                }
                Err(TransportError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Registers a best-effort observer for every complete line.
    pub fn on_line(&self, subscriber: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Box::new(subscriber));
        }
    }

    /// Marks the underlying transport as gone: rejects all outstanding
    /// waiters and clears buffered state. Further feeds are ignored.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("line protocol state poisoned");
        state.closed = true;
        state.accumulator.clear();
        state.swallow_lf = false;
        state.backlog.clear();
        // Dropping the senders resolves every pending recv with an error.
        state.waiters.clear();
    }

    /// Makes a closed protocol usable for a new connection: clears the
    /// closed flag and every leftover of the previous session. Close always
    /// precedes reopen, so there are no waiters to carry over.
    pub fn reopen(&self) {
        let mut state = self.state.lock().expect("line protocol state poisoned");
        *state = LineState::default();
    }

    /// Number of framed lines waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.state
            .lock()
            .expect("line protocol state poisoned")
            .backlog
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{InstantClock, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn protocol() -> LineProtocol {
        LineProtocol::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn splits_on_all_three_terminators() {
        let protocol = protocol();
        protocol.feed(b"one\rtwo\nthree\r\nfour");
        assert_eq!(protocol.backlog_len(), 3);
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("one".into())
        );
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("two".into())
        );
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("three".into())
        );
        // "four" is still an incomplete trailing segment
        assert_eq!(protocol.backlog_len(), 0);
        protocol.feed(b"\n");
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("four".into())
        );
    }

    #[tokio::test]
    async fn crlf_across_chunk_boundary_is_one_line() {
        let protocol = protocol();
        protocol.feed(b"OK\r");
        protocol.feed(b"\nEBBv13\r\n");
        assert_eq!(protocol.backlog_len(), 2);
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("OK".into())
        );
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("EBBv13".into())
        );
    }

    #[tokio::test]
    async fn multibyte_utf8_across_chunks_reassembles() {
        let protocol = protocol();
        let bytes = "grüß\n".as_bytes();
        protocol.feed(&bytes[..3]); // cuts ü in half
        protocol.feed(&bytes[3..]);
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("grüß".into())
        );
    }

    #[tokio::test]
    async fn empty_and_whitespace_lines_are_dropped() {
        let protocol = protocol();
        protocol.feed(b"\r\n  \r\nreal\r\n");
        assert_eq!(protocol.backlog_len(), 1);
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("real".into())
        );
    }

    #[tokio::test]
    async fn waiter_resolves_when_line_arrives() {
        let protocol = Arc::new(protocol());
        let fed = Arc::clone(&protocol);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            fed.feed(b"later\r");
        });
        let line = protocol.next_line(Duration::from_secs(1)).await;
        assert_eq!(line.ok(), Some("later".into()));
        task.await.expect("feeder task");
    }

    #[tokio::test]
    async fn timeout_is_a_distinct_error() {
        let protocol = LineProtocol::new(Arc::new(InstantClock));
        match protocol.next_line(Duration::from_millis(1200)).await {
            Err(TransportError::Timeout { waited_ms }) => assert_eq!(waited_ms, 1200),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_rejects_outstanding_waiters() {
        let protocol = Arc::new(protocol());
        let closer = Arc::clone(&protocol);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            closer.close();
        });
        match protocol.next_line(Duration::from_secs(1)).await {
            Err(TransportError::Closed) => {}
            other => panic!("expected closed, got {:?}", other),
        }
        task.await.expect("closer task");
        // and feeds after close are ignored
        protocol.feed(b"late\r");
        assert_eq!(protocol.backlog_len(), 0);
    }

    #[tokio::test]
    async fn reopen_restores_a_closed_protocol() {
        let protocol = protocol();
        protocol.feed(b"stale-partial");
        protocol.close();
        protocol.feed(b"ignored\r");
        assert_eq!(protocol.backlog_len(), 0);

        protocol.reopen();
        protocol.feed(b"EBBv13\r");
        assert_eq!(protocol.backlog_len(), 1);
        assert_eq!(
            protocol.next_line(Duration::from_millis(10)).await.ok(),
            Some("EBBv13".into())
        );
        // the pre-close partial segment did not leak into the new session
        protocol.feed(b"\r");
        assert_eq!(protocol.backlog_len(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_lines_and_panics_are_swallowed() {
        let protocol = protocol();
        let seen = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&seen);
        protocol.on_line(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        protocol.on_line(|_| panic!("bad subscriber"));
        protocol.feed(b"a\rb\r");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(protocol.backlog_len(), 2);
    }
}
