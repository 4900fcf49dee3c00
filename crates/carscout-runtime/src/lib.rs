//! `carscout-runtime` – the scanner.
//!
//! # Modules
//!
//! - [`feed_listener`] – [`FeedListener`][feed_listener::FeedListener]:
//!   ingests vehicle snapshots and deltas and keeps the spatial index
//!   current.
//! - [`dispatcher`] – [`ReservationDispatcher`][dispatcher::ReservationDispatcher]:
//!   issues booking requests for added vehicles on behalf of eligible
//!   watchers and retires them once their exchange concludes.
//! - [`scanner`] – [`Scanner`][scanner::Scanner] / [`ScannerHandle`][scanner::ScannerHandle]:
//!   the single event loop that owns both of the above and the command
//!   surface used to drive it.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   global `tracing` subscriber with an optional OTLP span exporter.

pub mod dispatcher;
pub mod feed_listener;
pub mod scanner;
pub mod telemetry;

pub use dispatcher::{AttemptOutcome, ReservationDispatcher, ResponseOutcome};
pub use feed_listener::{DeltaOutcome, FeedListener, FeedState, SnapshotOutcome};
pub use scanner::{Scanner, ScannerConfig, ScannerError, ScannerHandle, ScannerStatus};
pub use telemetry::{TracerProviderGuard, init_tracing};
