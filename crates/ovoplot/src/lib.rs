#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]

/*!
The hardware-control core of the ovoplot workspace.

This crate turns a list of normalized strokes into CR-terminated plotter
commands and manages the channel to the device. It is transport-agnostic:
the [`Transport`] trait is implemented by the `ovoplot_serial`,
`ovoplot_ble` and `ovoplot_websockets` crates, all of which share the
[`LineProtocol`] framing layer by composition.

The pieces, leaf to root:

- [`geometry`] — pure path preparation: seam unwrapping, scaling to integer
  steps, wrap-period alignment.
- [`offload`] — runs path preparation on a worker thread, degrading
  permanently to synchronous execution on any failure.
- [`line`] — chunk accumulation and CR/LF line framing with FIFO response
  waiters.
- [`transport`] — the polymorphic channel contract.
- [`controller`] — the draw state machine: configure, trace strokes, pace
  chunked moves, honor cancellation, guarantee pen-up + motor-disable on
  every exit path.

```rust,ignore
use ovoplot::{DrawController, DrawSink, offload::PreparationOffloader};
use ovoplot_serial::{SerialSettings, SerialTransport};

let mut transport = SerialTransport::new(SerialSettings::default());
let status = transport.connect().await?;
tracing::info!("connected: {status}");

let mut controller = DrawController::new(transport);
controller
    .draw_strokes(&strokes, &geometry, &draw_config, &mut sink)
    .await?;
```

Exactly one draw run may be active per controller, and the controller owns
the transport exclusively for the duration of a run; all device access must
be serialized through it.
*/

pub mod cancel;
pub mod controller;
pub mod geometry;
pub mod line;
pub mod offload;
pub mod runtime;
pub mod transport;

pub use cancel::CancelToken;
pub use controller::{ChannelSink, DrawController, DrawEvent, DrawOutcome, DrawSink, NullSink};
pub use line::LineProtocol;
pub use offload::{PreparationOffloader, PreparePayload};
pub use runtime::{Clock, FileStore, InstantClock, KeyValueStore, MemoryStore, SystemClock};
pub use transport::{SendOptions, Transport};

pub use async_channel;
pub use async_trait::async_trait;

pub use ovoplot_common::{
    self as common, CoordinateMode, DeviceCommand, DrawConfig, DrawError, GeometryConfig, Point2D,
    PreparedStroke, StepPoint, Stroke, TransportError,
};
