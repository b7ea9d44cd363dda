//! Event Module - telemetry stream and plugin dispatch
//!
//! Every significant operation emits an event. Key types:
//! - `Event`: Envelope with id + UTC timestamp + kind
//! - `EventKind`: The full emitted taxonomy, serde-tagged snake_case
//! - `TelemetryBus`: Append-only buffer with synchronous plugin fan-out
//! - `Plugin`: Read-only observer; failures are isolated and swallowed
//! - `TraceSink`: NDJSON persistence plugin

mod bus;
mod trace;

pub use bus::{Event, EventKind, Plugin, TelemetryBus};
pub use trace::{TraceSink, TRACE_PLUGIN_ID};
