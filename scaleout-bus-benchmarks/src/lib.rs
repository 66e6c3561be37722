//! Scaleout bus benchmarks
//!
//! Criterion benchmarks for the hot paths of the bus: publishing with many
//! live subscriptions and encoding/decoding resume cursors. Run them with
//! `cargo bench -p scaleout-bus-benchmarks`.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
