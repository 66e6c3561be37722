//! Bus configuration with type-safe validation.
//!
//! Every parameter is a `nutype` newtype validated at construction, so a
//! `BusConfig` that exists is always usable.

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Number of streams (shards) the bus manages.
///
/// Fixed for the lifetime of a bus; validated to be between 1 and 1024.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StreamCount(usize);

/// Number of batches each stream retains before evicting the oldest.
///
/// Validated to be between 1 and 1,000,000 batches.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StreamCapacity(usize);

/// Upper bound on the number of messages handed to a subscriber per call.
///
/// Validated to be between 1 and 100,000 messages.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxMessages(usize);

/// Configuration of a scaleout bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of streams.
    pub stream_count: StreamCount,
    /// Batches retained per stream.
    pub stream_capacity: StreamCapacity,
    /// Batch size used by subscribers that do not ask for a specific one.
    pub default_max_messages: MaxMessages,
}

impl BusConfig {
    /// Create a configuration with safe defaults: one stream, 1000 batches of
    /// backlog and 100 messages per delivery.
    ///
    /// # Errors
    ///
    /// Returns validation errors if any of the default values are invalid
    /// (which should never happen with proper constants).
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            stream_count: StreamCount::try_new(1)?,
            stream_capacity: StreamCapacity::try_new(1_000)?,
            default_max_messages: MaxMessages::try_new(100)?,
        })
    }

    /// Small deliveries and a short backlog; subscribers see data sooner but
    /// a lagging subscriber overruns earlier.
    pub fn low_latency() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            stream_count: StreamCount::try_new(1)?,
            stream_capacity: StreamCapacity::try_new(256)?,
            default_max_messages: MaxMessages::try_new(16)?,
        })
    }

    /// Large deliveries and a deep backlog for bursty feeds.
    pub fn high_throughput() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            stream_count: StreamCount::try_new(1)?,
            stream_capacity: StreamCapacity::try_new(10_000)?,
            default_max_messages: MaxMessages::try_new(1_000)?,
        })
    }

    /// Set the number of streams.
    #[must_use]
    pub const fn with_stream_count(mut self, stream_count: StreamCount) -> Self {
        self.stream_count = stream_count;
        self
    }

    /// Set the per-stream backlog capacity.
    #[must_use]
    pub const fn with_stream_capacity(mut self, stream_capacity: StreamCapacity) -> Self {
        self.stream_capacity = stream_capacity;
        self
    }

    /// Set the default delivery size.
    #[must_use]
    pub const fn with_default_max_messages(mut self, max_messages: MaxMessages) -> Self {
        self.default_max_messages = max_messages;
        self
    }

    /// Number of streams as a plain count.
    pub fn streams(&self) -> usize {
        self.stream_count.into_inner()
    }

    /// Per-stream capacity as a plain count.
    pub fn capacity(&self) -> usize {
        self.stream_capacity.into_inner()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new().expect("Default bus configuration should always be valid")
    }
}
