#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]

/*!
USB serial transport for the ovoplot workspace.

Wraps a blocking [`serialport`] handle in the async [`Transport`] contract:
writes go straight to the port under a lock, a dedicated reader thread pumps
incoming bytes into the shared [`LineProtocol`] framing layer, and response
waits are ordinary async waits on that protocol.

The serial transport is the only one with a silent reconnect path:
[`Transport::connect_for_draw`] consults a persisted USB vendor/product hint
and reuses the matching port without prompting when exactly one candidate
matches. Anything ambiguous falls back to the explicit chooser.
*/

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ovoplot::{CancelToken, Clock, KeyValueStore, LineProtocol, MemoryStore, SystemClock};
use ovoplot::transport::{SendOptions, Transport, terminated};
use ovoplot_common::{ConnectStage, PORT_HINT_KEY, PersistedPortHint, TransportError};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, info, warn};

/// Default line rate. The device enumerates as CDC-ACM, where the rate is
/// nominal, but a concrete value is still required to open the port.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Reader poll interval; a read timeout at this cadence is an idle poll,
/// not an error.
const READ_POLL: Duration = Duration::from_millis(50);

/// Connect options for [`SerialTransport`].
#[derive(Clone, Debug)]
pub struct SerialSettings {
    /// Exact port to open (for example `/dev/ttyACM0`). When unset the
    /// [`PortChooser`] picks from the enumerated candidates.
    pub port_name: Option<String>,
    /// Line rate to open the port at.
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Picks one port out of the enumerated candidates.
///
/// This is the seam where a UI plugs in its port picker dialog. The default
/// implementation accepts a lone candidate and refuses to guess between
/// several.
pub trait PortChooser: Send + Sync {
    /// Returns the chosen candidate, or `None` to refuse the connection.
    fn choose(&self, candidates: &[SerialPortInfo]) -> Option<SerialPortInfo>;
}

/// Accepts a single candidate; refuses ambiguity.
#[derive(Debug, Default)]
pub struct SoleCandidateChooser;

impl PortChooser for SoleCandidateChooser {
    fn choose(&self, candidates: &[SerialPortInfo]) -> Option<SerialPortInfo> {
        match candidates {
            [only] => Some(only.clone()),
            _ => None,
        }
    }
}

/// State shared between the transport and its reader thread.
struct SerialShared {
    protocol: LineProtocol,
    open: AtomicBool,
    // Bumped on every connect; a reader from a previous session must never
    // close the protocol of its successor.
    session: AtomicU64,
}

/// [`Transport`] implementation over a USB serial port.
pub struct SerialTransport {
    settings: SerialSettings,
    chooser: Box<dyn PortChooser>,
    store: Arc<dyn KeyValueStore>,
    shared: Arc<SerialShared>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    cancel: CancelToken,
}

impl SerialTransport {
    /// A transport with the default chooser, a volatile hint store and the
    /// production clock.
    pub fn new(settings: SerialSettings) -> Self {
        Self::with_parts(
            settings,
            Box::new(SoleCandidateChooser),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Full constructor for injected capabilities.
    pub fn with_parts(
        settings: SerialSettings,
        chooser: Box<dyn PortChooser>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            chooser,
            store,
            shared: Arc::new(SerialShared {
                protocol: LineProtocol::new(clock),
                open: AtomicBool::new(false),
                session: AtomicU64::new(0),
            }),
            writer: Mutex::new(None),
            cancel: CancelToken::new(),
        }
    }

    /// The framing layer, for tests and diagnostics.
    pub fn protocol(&self) -> &LineProtocol {
        &self.shared.protocol
    }

    fn candidates() -> Result<Vec<SerialPortInfo>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|err| TransportError::connect(ConnectStage::Request, err.to_string()))?;
        // Bare tty devices drown out the real candidate on most systems;
        // only fall back to them when no USB port enumerates at all.
        let usb: Vec<SerialPortInfo> = ports
            .iter()
            .filter(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
            .cloned()
            .collect();
        Ok(if usb.is_empty() { ports } else { usb })
    }

    fn pick_port(&self, silent_hint: bool) -> Result<SerialPortInfo, TransportError> {
        let candidates = Self::candidates()?;
        if let Some(name) = &self.settings.port_name {
            return candidates
                .iter()
                .find(|port| &port.port_name == name)
                .cloned()
                .ok_or_else(|| {
                    TransportError::connect(
                        ConnectStage::Request,
                        format!("port {} not present", name),
                    )
                });
        }
        if silent_hint {
            if let Some(hint) = load_hint(self.store.as_ref()) {
                if let [only] = matching_ports(&candidates, &hint)[..] {
                    info!(port = %only.port_name, "Reusing remembered serial port");
                    return Ok(only.clone());
                }
            }
        }
        self.chooser.choose(&candidates).ok_or_else(|| {
            TransportError::connect(
                ConnectStage::Request,
                format!("no port chosen from {} candidates", candidates.len()),
            )
        })
    }

    async fn open_port(&mut self, silent_hint: bool) -> Result<String, TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        let chosen = self.pick_port(silent_hint)?;
        info!(port = %chosen.port_name, "Opening serial port");
        let port = serialport::new(&chosen.port_name, self.settings.baud_rate)
            .timeout(READ_POLL)
            .open()
            .map_err(|err| TransportError::connect(ConnectStage::Open, err.to_string()))?;
        let reader = port
            .try_clone()
            .map_err(|err| TransportError::connect(ConnectStage::Open, err.to_string()))?;

        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.protocol.reopen();
        self.shared.open.store(true, Ordering::SeqCst);
        spawn_reader(Arc::clone(&self.shared), reader, session);
        *self.writer.lock().expect("writer poisoned") = Some(port);
        self.cancel.reset();
        save_hint(self.store.as_ref(), &chosen);

        Ok(self.firmware_version().await)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<String, TransportError> {
        self.open_port(false).await
    }

    async fn connect_for_draw(&mut self) -> Result<String, TransportError> {
        self.open_port(true).await
    }

    async fn disconnect(&mut self) {
        self.shared.open.store(false, Ordering::SeqCst);
        // Dropping the writer closes the OS handle, which unblocks the
        // reader thread's pending read.
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        self.shared.protocol.close();
        self.cancel.cancel();
    }

    fn is_connected(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
            && self
                .writer
                .lock()
                .map(|writer| writer.is_some())
                .unwrap_or(false)
    }

    async fn send_command(
        &self,
        line: &str,
        options: SendOptions,
    ) -> Result<String, TransportError> {
        {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| TransportError::io("writer lock poisoned"))?;
            let port = writer.as_mut().ok_or(TransportError::NotConnected)?;
            let framed = terminated(line);
            port.write_all(framed.as_bytes())
                .map_err(TransportError::io)?;
            port.flush().map_err(TransportError::io)?;
        }
        if options.expect_response {
            self.shared.protocol.next_line(options.timeout).await
        } else {
            Ok(String::new())
        }
    }

    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

fn spawn_reader(shared: Arc<SerialShared>, mut port: Box<dyn SerialPort>, session: u64) {
    std::thread::Builder::new()
        .name("ovoplot-serial-read".into())
        .spawn(move || {
            let current = |shared: &SerialShared| {
                shared.open.load(Ordering::SeqCst)
                    && shared.session.load(Ordering::SeqCst) == session
            };
            let mut buf = [0u8; 256];
            while current(&shared) {
                match port.read(&mut buf) {
                    Ok(0) => break,
                    // Re-check the session: a read may complete after a
                    // reconnect already took the protocol over.
                    Ok(count) if current(&shared) => shared.protocol.feed(&buf[..count]),
                    Ok(_) => break,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::TimedOut
                            || err.kind() == std::io::ErrorKind::Interrupted =>
                    {
                        continue;
                    }
                    Err(err) => {
                        if current(&shared) {
                            warn!("Serial read failed: {}", err);
                        }
                        break;
                    }
                }
            }
            // Only the reader of the current session may mark the transport
            // closed; a successor connection owns the protocol by now.
            if shared.session.load(Ordering::SeqCst) == session {
                shared.open.store(false, Ordering::SeqCst);
                shared.protocol.close();
            }
            debug!("Serial reader stopped");
        })
        .expect("serial reader thread");
}

/// Loads the persisted vendor/product hint, if one was saved.
pub fn load_hint(store: &dyn KeyValueStore) -> Option<PersistedPortHint> {
    let raw = store.get(PORT_HINT_KEY)?;
    match serde_json::from_str(&raw) {
        Ok(hint) => Some(hint),
        Err(err) => {
            warn!("Discarding malformed port hint: {}", err);
            store.remove(PORT_HINT_KEY);
            None
        }
    }
}

/// Remembers the USB identity of a successfully opened port. Non-USB ports
/// leave any existing hint untouched.
pub fn save_hint(store: &dyn KeyValueStore, port: &SerialPortInfo) {
    let SerialPortType::UsbPort(usb) = &port.port_type else {
        return;
    };
    let hint = PersistedPortHint {
        usb_vendor_id: usb.vid,
        usb_product_id: usb.pid,
    };
    match serde_json::to_string(&hint) {
        Ok(raw) => store.set(PORT_HINT_KEY, &raw),
        Err(err) => warn!("Could not serialize port hint: {}", err),
    }
}

fn matching_ports<'a>(
    candidates: &'a [SerialPortInfo],
    hint: &PersistedPortHint,
) -> Vec<&'a SerialPortInfo> {
    candidates
        .iter()
        .filter(|port| match &port.port_type {
            SerialPortType::UsbPort(usb) => {
                usb.vid == hint.usb_vendor_id && usb.pid == hint.usb_product_id
            }
            _ => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serialport::UsbPortInfo;

    use super::*;

    fn usb_port(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_owned(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    fn bare_port(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_owned(),
            port_type: SerialPortType::Unknown,
        }
    }

    #[test]
    fn default_chooser_refuses_ambiguity() {
        let chooser = SoleCandidateChooser;
        let single = vec![usb_port("/dev/ttyACM0", 0x04d8, 0xfd92)];
        assert_eq!(
            chooser.choose(&single).map(|port| port.port_name),
            Some("/dev/ttyACM0".to_owned())
        );

        let several = vec![
            usb_port("/dev/ttyACM0", 0x04d8, 0xfd92),
            usb_port("/dev/ttyACM1", 0x2341, 0x0043),
        ];
        assert!(chooser.choose(&several).is_none());
        assert!(chooser.choose(&[]).is_none());
    }

    #[test]
    fn hint_round_trips_through_a_store() {
        let store = MemoryStore::new();
        save_hint(&store, &usb_port("/dev/ttyACM0", 0x04d8, 0xfd92));
        let hint = load_hint(&store).expect("hint saved");
        assert_eq!(hint.usb_vendor_id, 0x04d8);
        assert_eq!(hint.usb_product_id, 0xfd92);
    }

    #[test]
    fn non_usb_ports_do_not_overwrite_the_hint() {
        let store = MemoryStore::new();
        save_hint(&store, &usb_port("/dev/ttyACM0", 0x04d8, 0xfd92));
        save_hint(&store, &bare_port("/dev/ttyS0"));
        assert!(load_hint(&store).is_some());
    }

    #[test]
    fn malformed_hint_is_discarded() {
        let store = MemoryStore::new();
        store.set(PORT_HINT_KEY, "not json");
        assert!(load_hint(&store).is_none());
        assert!(store.get(PORT_HINT_KEY).is_none());
    }

    #[test]
    fn hint_matching_requires_exactly_one_port() {
        let hint = PersistedPortHint {
            usb_vendor_id: 0x04d8,
            usb_product_id: 0xfd92,
        };
        let candidates = vec![
            usb_port("/dev/ttyACM0", 0x04d8, 0xfd92),
            usb_port("/dev/ttyACM1", 0x2341, 0x0043),
            bare_port("/dev/ttyS0"),
        ];
        let matches = matching_ports(&candidates, &hint);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].port_name, "/dev/ttyACM0");

        let two_plotters = vec![
            usb_port("/dev/ttyACM0", 0x04d8, 0xfd92),
            usb_port("/dev/ttyACM1", 0x04d8, 0xfd92),
        ];
        assert_eq!(matching_ports(&two_plotters, &hint).len(), 2);
    }
}
