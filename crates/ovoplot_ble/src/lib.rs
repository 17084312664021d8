#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]

/*!
Bluetooth Low Energy transport for the ovoplot workspace.

The plotter speaks the Nordic UART Service (NUS): commands are written to
the RX characteristic without response, and device output arrives as
notifications on the TX characteristic, which a background task pumps into
the shared [`LineProtocol`] framing layer.

Connecting is a staged sequence — adapter, scan, GATT connect, service
discovery, characteristic lookup, notification subscribe — and a failure at
any stage disconnects the peripheral again before the staged error is
returned, so a half-open link never lingers.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures::StreamExt;
use ovoplot::transport::{SendOptions, Transport, terminated};
use ovoplot::{CancelToken, Clock, LineProtocol, SystemClock};
use ovoplot_common::{ConnectStage, TransportError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Nordic UART Service.
pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS RX: the host writes command bytes here.
pub const NUS_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS TX: the device notifies response bytes here.
pub const NUS_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Poll interval while scanning for the peripheral.
const SCAN_POLL: Duration = Duration::from_millis(500);

/// Connect options for [`BleTransport`].
#[derive(Clone, Debug)]
pub struct BleSettings {
    /// Advertised local name to match. When unset, any peripheral
    /// advertising the NUS service is accepted.
    pub device_name: Option<String>,
    /// How long to scan before giving up.
    pub scan_timeout: Duration,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            device_name: None,
            scan_timeout: Duration::from_secs(10),
        }
    }
}

/// True when an advertisement matches the configured target.
fn matches_target(settings: &BleSettings, local_name: Option<&str>, services: &[Uuid]) -> bool {
    match &settings.device_name {
        Some(wanted) => local_name.is_some_and(|name| name == wanted),
        None => services.contains(&NUS_SERVICE),
    }
}

struct BleShared {
    protocol: LineProtocol,
    open: AtomicBool,
    // Bumped on every connect; a notification pump from a previous session
    // must never close the protocol of its successor.
    session: AtomicU64,
}

struct BleLink {
    peripheral: Peripheral,
    rx: Characteristic,
}

/// [`Transport`] implementation over a Nordic UART BLE link.
pub struct BleTransport {
    settings: BleSettings,
    clock: Arc<dyn Clock>,
    shared: Arc<BleShared>,
    link: std::sync::Mutex<Option<BleLink>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancelToken,
}

impl BleTransport {
    /// A transport with the production clock.
    pub fn new(settings: BleSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Full constructor for an injected clock.
    pub fn with_clock(settings: BleSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock: Arc::clone(&clock),
            shared: Arc::new(BleShared {
                protocol: LineProtocol::new(clock),
                open: AtomicBool::new(false),
                session: AtomicU64::new(0),
            }),
            link: std::sync::Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            cancel: CancelToken::new(),
        }
    }

    /// The framing layer, for tests and diagnostics.
    pub fn protocol(&self) -> &LineProtocol {
        &self.shared.protocol
    }

    async fn scan_for_peripheral(&self) -> Result<Peripheral, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|err| TransportError::connect(ConnectStage::Request, err.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|err| TransportError::connect(ConnectStage::Request, err.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::connect(ConnectStage::Request, "no bluetooth adapter")
            })?;
        adapter
            .start_scan(ScanFilter {
                services: vec![NUS_SERVICE],
            })
            .await
            .map_err(|err| TransportError::connect(ConnectStage::Request, err.to_string()))?;

        let polls = (self.settings.scan_timeout.as_millis() / SCAN_POLL.as_millis()).max(1);
        let mut found = None;
        'scan: for _ in 0..polls {
            self.clock.sleep(SCAN_POLL).await;
            let peripherals = adapter.peripherals().await.map_err(|err| {
                TransportError::connect(ConnectStage::Request, err.to_string())
            })?;
            for peripheral in peripherals {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                if matches_target(&self.settings, props.local_name.as_deref(), &props.services) {
                    found = Some(peripheral);
                    break 'scan;
                }
            }
        }
        let _ = adapter.stop_scan().await;
        found.ok_or_else(|| {
            TransportError::connect(ConnectStage::Request, "no matching peripheral found")
        })
    }

    /// GATT connect through notification subscribe, unwinding on failure.
    async fn attach(&self, peripheral: &Peripheral) -> Result<Characteristic, TransportError> {
        peripheral
            .connect()
            .await
            .map_err(|err| TransportError::connect(ConnectStage::Gatt, err.to_string()))?;
        match self.attach_connected(peripheral).await {
            Ok(rx) => Ok(rx),
            Err(err) => {
                let _ = peripheral.disconnect().await;
                Err(err)
            }
        }
    }

    async fn attach_connected(
        &self,
        peripheral: &Peripheral,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .discover_services()
            .await
            .map_err(|err| TransportError::connect(ConnectStage::Service, err.to_string()))?;
        let characteristics = peripheral.characteristics();
        let rx = characteristics
            .iter()
            .find(|c| c.uuid == NUS_RX)
            .cloned()
            .ok_or_else(|| {
                TransportError::connect(ConnectStage::Characteristics, "RX characteristic missing")
            })?;
        let tx = characteristics
            .iter()
            .find(|c| c.uuid == NUS_TX)
            .cloned()
            .ok_or_else(|| {
                TransportError::connect(ConnectStage::Characteristics, "TX characteristic missing")
            })?;
        peripheral
            .subscribe(&tx)
            .await
            .map_err(|err| TransportError::connect(ConnectStage::Notify, err.to_string()))?;
        Ok(rx)
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<String, TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        let peripheral = self.scan_for_peripheral().await?;
        info!(id = %peripheral.id(), "Connecting to peripheral");
        let rx = self.attach(&peripheral).await?;

        let notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = peripheral.disconnect().await;
                return Err(TransportError::connect(ConnectStage::Notify, err.to_string()));
            }
        };
        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.protocol.reopen();
        self.shared.open.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(notification) = notifications.next().await {
                if shared.session.load(Ordering::SeqCst) != session {
                    return;
                }
                if notification.uuid == NUS_TX {
                    shared.protocol.feed(&notification.value);
                }
            }
            // Only the pump of the current session may mark the transport
            // closed; a successor connection owns the protocol by now.
            if shared.session.load(Ordering::SeqCst) == session {
                shared.open.store(false, Ordering::SeqCst);
                shared.protocol.close();
            }
            debug!("BLE notification stream ended");
        });
        *self.reader.lock().expect("reader handle poisoned") = Some(handle);
        *self.link.lock().expect("link poisoned") = Some(BleLink { peripheral, rx });
        self.cancel.reset();

        Ok(self.firmware_version().await)
    }

    async fn disconnect(&mut self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let link = self.link.lock().expect("link poisoned").take();
        if let Some(link) = link {
            if let Err(err) = link.peripheral.disconnect().await {
                warn!("BLE disconnect failed: {}", err);
            }
        }
        if let Some(handle) = self
            .reader
            .lock()
            .expect("reader handle poisoned")
            .take()
        {
            handle.abort();
        }
        self.shared.protocol.close();
        self.cancel.cancel();
    }

    fn is_connected(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn send_command(
        &self,
        line: &str,
        options: SendOptions,
    ) -> Result<String, TransportError> {
        let (peripheral, rx) = {
            let link = self
                .link
                .lock()
                .map_err(|_| TransportError::io("link lock poisoned"))?;
            let link = link.as_ref().ok_or(TransportError::NotConnected)?;
            (link.peripheral.clone(), link.rx.clone())
        };
        let framed = terminated(line);
        peripheral
            .write(&rx, framed.as_bytes(), WriteType::WithoutResponse)
            .await
            .map_err(TransportError::io)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nus_uuids_are_the_nordic_defaults() {
        assert_eq!(
            NUS_SERVICE.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(NUS_RX.to_string(), "6e400002-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(NUS_TX.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn unnamed_target_matches_on_the_service_uuid() {
        let settings = BleSettings::default();
        assert!(matches_target(&settings, Some("anything"), &[NUS_SERVICE]));
        assert!(matches_target(&settings, None, &[NUS_SERVICE]));
        assert!(!matches_target(&settings, Some("anything"), &[]));
    }

    #[test]
    fn named_target_matches_on_the_exact_name() {
        let settings = BleSettings {
            device_name: Some("ovoplot".to_owned()),
            ..BleSettings::default()
        };
        assert!(matches_target(&settings, Some("ovoplot"), &[]));
        assert!(!matches_target(&settings, Some("other"), &[NUS_SERVICE]));
        assert!(!matches_target(&settings, None, &[NUS_SERVICE]));
    }
}
