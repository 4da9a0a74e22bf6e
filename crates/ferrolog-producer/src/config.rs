//! Producer configuration
//!
//! [`ProducerConfig`] is immutable once handed to a [`Producer`](crate::Producer).
//! It can be built in code through [`ProducerConfig::builder`] or deserialized
//! from any serde format; durations accept humantime strings such as `"5ms"`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum number of records per batch
const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default maximum encoded size of a batch
const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;
/// Default request timeout for a single produce call
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default metadata TTL
const DEFAULT_METADATA_MAX_AGE: Duration = Duration::from_secs(300);
/// Upper bound on how long the sender sleeps while batches are open
const DEFAULT_IDLE_TICK: Duration = Duration::from_millis(10);
/// Default delay before a failed batch is retried
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Required acks
// ============================================================================

/// Durability requested for every produce call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum RequiredAcks {
    /// Fire-and-forget: records resolve with offset -1 once handed to the connector
    None,
    /// Wait for the partition leader
    #[default]
    Leader,
    /// Wait for the full in-sync replica set
    All,
}

impl RequiredAcks {
    /// Value sent on the wire
    pub fn as_i16(self) -> i16 {
        match self {
            RequiredAcks::None => 0,
            RequiredAcks::Leader => 1,
            RequiredAcks::All => -1,
        }
    }
}

impl From<RequiredAcks> for i16 {
    fn from(acks: RequiredAcks) -> Self {
        acks.as_i16()
    }
}

impl TryFrom<i16> for RequiredAcks {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self> {
        match value {
            0 => Ok(RequiredAcks::None),
            1 => Ok(RequiredAcks::Leader),
            -1 => Ok(RequiredAcks::All),
            other => Err(Error::Config(format!(
                "required_acks must be 0, 1 or -1, got {}",
                other
            ))),
        }
    }
}

impl FromStr for RequiredAcks {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(RequiredAcks::All),
            "none" => Ok(RequiredAcks::None),
            "leader" => Ok(RequiredAcks::Leader),
            other => other
                .parse::<i16>()
                .map_err(|_| Error::Config(format!("invalid required_acks '{}'", s)))
                .and_then(RequiredAcks::try_from),
        }
    }
}

impl fmt::Display for RequiredAcks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredAcks::All => write!(f, "all"),
            other => write!(f, "{}", other.as_i16()),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Producer configuration with Kafka-like semantics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Maximum number of records in one batch
    pub batch_size: usize,
    /// Maximum key + value bytes in one batch (a single larger record still gets its own batch)
    pub max_batch_bytes: usize,
    /// Maximum time a non-full batch waits before it is sent (zero sends as soon as non-empty)
    #[serde(with = "humantime_serde")]
    pub linger: Duration,
    /// Acks required: 0 = none, 1 = leader, -1 = all
    pub required_acks: RequiredAcks,
    /// Upper bound for one produce call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long topic leadership stays cached
    #[serde(with = "humantime_serde")]
    pub metadata_max_age: Duration,
    /// Longest the sender sleeps between drain cycles
    #[serde(with = "humantime_serde")]
    pub idle_tick: Duration,
    /// Bound on `close`; unresolved records fail with a flush timeout once it elapses
    #[serde(with = "humantime_serde")]
    pub close_timeout: Option<Duration>,
    /// Number of times a batch that failed with a retriable error is re-sent
    pub retries: u32,
    /// Delay before a failed batch becomes ready again
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            linger: Duration::ZERO,
            required_acks: RequiredAcks::Leader,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metadata_max_age: DEFAULT_METADATA_MAX_AGE,
            idle_tick: DEFAULT_IDLE_TICK,
            close_timeout: None,
            retries: 0,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl ProducerConfig {
    /// Configuration with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new builder
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }

    /// High-throughput configuration
    pub fn high_throughput() -> Self {
        Self {
            batch_size: 10_000,
            max_batch_bytes: 4 * 1024 * 1024,
            linger: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Low-latency configuration
    pub fn low_latency() -> Self {
        Self {
            batch_size: 1,
            linger: Duration::ZERO,
            idle_tick: Duration::from_millis(1),
            ..Default::default()
        }
    }

    /// Full-ISR acknowledgement with retries on transient failures
    pub fn durable() -> Self {
        Self {
            required_acks: RequiredAcks::All,
            retries: 5,
            ..Default::default()
        }
    }

    /// Reject settings the accumulator or sender cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.max_batch_bytes == 0 {
            return Err(Error::Config("max_batch_bytes must be at least 1".into()));
        }
        if self.idle_tick.is_zero() {
            return Err(Error::Config("idle_tick must be non-zero".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for ProducerConfig
#[derive(Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    /// Set maximum records per batch
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set maximum bytes per batch
    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.config.max_batch_bytes = bytes;
        self
    }

    /// Set linger time
    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    /// Set linger time in milliseconds
    pub fn linger_ms(mut self, ms: u64) -> Self {
        self.config.linger = Duration::from_millis(ms);
        self
    }

    /// Set acks required
    pub fn required_acks(mut self, acks: RequiredAcks) -> Self {
        self.config.required_acks = acks;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set metadata max age (TTL)
    pub fn metadata_max_age(mut self, duration: Duration) -> Self {
        self.config.metadata_max_age = duration;
        self
    }

    /// Set the sender's idle tick
    pub fn idle_tick(mut self, tick: Duration) -> Self {
        self.config.idle_tick = tick;
        self
    }

    /// Bound how long `close` may wait
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = Some(timeout);
        self
    }

    /// Set number of retries
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ProducerConfig {
        self.config
    }
}
