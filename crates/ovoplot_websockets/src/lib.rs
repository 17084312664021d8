#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]

/*!
WiFi transport for the ovoplot workspace.

The plotter's WiFi bridge exposes the same CR-terminated line protocol over
a WebSocket endpoint (port 1337, path `/` by default). Text and binary
frames both carry protocol bytes and are pumped into the shared
[`LineProtocol`] framing layer by a background reader task; commands go out
as text frames through the write half.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use async_tungstenite::WebSocketStream;
use async_tungstenite::tokio::{ConnectStream, connect_async};
use async_tungstenite::tungstenite::{Error as WsError, Message};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use ovoplot::transport::{SendOptions, Transport, terminated};
use ovoplot::{CancelToken, Clock, LineProtocol, SystemClock};
use ovoplot_common::{ConnectStage, TransportError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Default TCP port of the plotter's WebSocket bridge.
pub const DEFAULT_PORT: u16 = 1337;

type WsSink = SplitSink<WebSocketStream<ConnectStream>, Message>;
type WsSource = SplitStream<WebSocketStream<ConnectStream>>;

/// Connect options for [`WifiTransport`].
#[derive(Clone, Debug)]
pub struct WifiSettings {
    /// Full endpoint URL. When set it wins over the host/port/path fields,
    /// though [`secure`](Self::secure) still upgrades `ws` to `wss`.
    pub url: Option<Url>,
    /// Hostname or address of the plotter bridge.
    pub host: String,
    /// TCP port of the bridge.
    pub port: u16,
    /// Request path of the WebSocket endpoint.
    pub path: String,
    /// Use `wss` instead of `ws`.
    pub secure: bool,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "plotter.local".to_owned(),
            port: DEFAULT_PORT,
            path: "/".to_owned(),
            secure: false,
        }
    }
}

impl WifiSettings {
    /// The canonical endpoint these settings describe.
    pub fn endpoint(&self) -> Result<Url, TransportError> {
        let mut url = match &self.url {
            Some(url) => url.clone(),
            None => {
                let path = if self.path.starts_with('/') {
                    self.path.clone()
                } else {
                    format!("/{}", self.path)
                };
                let raw = format!("ws://{}:{}{}", self.host, self.port, path);
                Url::parse(&raw).map_err(|err| {
                    TransportError::connect(ConnectStage::Request, err.to_string())
                })?
            }
        };
        if self.secure && url.scheme() == "ws" {
            url.set_scheme("wss")
                .map_err(|_| TransportError::connect(ConnectStage::Request, "bad scheme"))?;
        }
        Ok(url)
    }
}

struct WsShared {
    protocol: LineProtocol,
    open: AtomicBool,
    // Bumped on every connect; a reader from a previous session must never
    // close the protocol of its successor.
    session: AtomicU64,
}

/// [`Transport`] implementation over a WebSocket connection.
pub struct WifiTransport {
    settings: WifiSettings,
    shared: Arc<WsShared>,
    writer: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancelToken,
}

impl WifiTransport {
    /// A transport with the production clock.
    pub fn new(settings: WifiSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Full constructor for an injected clock.
    pub fn with_clock(settings: WifiSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            shared: Arc::new(WsShared {
                protocol: LineProtocol::new(clock),
                open: AtomicBool::new(false),
                session: AtomicU64::new(0),
            }),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            reader: std::sync::Mutex::new(None),
            cancel: CancelToken::new(),
        }
    }

    /// The framing layer, for tests and diagnostics.
    pub fn protocol(&self) -> &LineProtocol {
        &self.shared.protocol
    }
}

#[async_trait]
impl Transport for WifiTransport {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<String, TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        let endpoint = self.settings.endpoint()?;
        info!(%endpoint, "Opening WebSocket connection");
        let (stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| {
                TransportError::connect(ConnectStage::Socket, describe_ws_error(&err))
            })?;
        let (sink, source) = stream.split();

        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.protocol.reopen();
        self.shared.open.store(true, Ordering::SeqCst);
        *self.writer.lock().await = Some(sink);
        let handle = spawn_reader(
            Arc::clone(&self.shared),
            Arc::clone(&self.writer),
            source,
            session,
        );
        *self.reader.lock().expect("reader handle poisoned") = Some(handle);
        self.cancel.reset();

        Ok(self.firmware_version().await)
    }

    async fn disconnect(&mut self) {
        self.shared.open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
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
        {
            let mut writer = self.writer.lock().await;
            let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
            let framed = terminated(line);
            sink.send(Message::text(framed.into_owned()))
                .await
                .map_err(|err| TransportError::io(describe_ws_error(&err)))?;
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

fn spawn_reader(
    shared: Arc<WsShared>,
    writer: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    mut source: WsSource,
    session: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            if shared.session.load(Ordering::SeqCst) != session {
                return;
            }
            match message {
                Ok(Message::Text(text)) => shared.protocol.feed_str(&text),
                Ok(Message::Binary(data)) => shared.protocol.feed(&data),
                Ok(Message::Ping(payload)) => {
                    if let Some(sink) = writer.lock().await.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if shared.open.load(Ordering::SeqCst) {
                        warn!("WebSocket read failed: {}", describe_ws_error(&err));
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
        debug!("WebSocket reader stopped");
    })
}

fn describe_ws_error(error: &WsError) -> String {
    match error {
        WsError::ConnectionClosed => "Connection closed".to_owned(),
        WsError::AlreadyClosed => "Connection was already closed".to_owned(),
        WsError::Io(io_error) => format!("Io Error: {}", io_error),
        WsError::Capacity(cap) => format!("Capacity Error: {}", cap),
        WsError::Protocol(proto) => format!("Protocol Error: {}", proto),
        WsError::Url(url) => format!("Url Error: {}", url),
        WsError::Http(http) => format!("HTTP Error: {:?}", http.status()),
        other => format!("{}", other),
    }
}
