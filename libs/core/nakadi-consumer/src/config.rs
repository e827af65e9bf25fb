//! Consumer configuration
//!
//! `ConsumerConfig` holds broker location, stream parameters, timeouts and
//! retry policy for every subscription of one consumer name.

use crate::model::ConsumerName;
use core_config::{env_or_default, env_parse, env_parse_optional, env_required, ConfigError, FromEnv};
use std::time::Duration;
use strum::{Display, EnumString};

/// Where to start reading a partition that has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StartOffset {
    #[default]
    Newest,
    Oldest,
}

/// Broker-side long-poll parameters, passed as query parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParameters {
    pub stream_timeout: Option<u32>,
    pub stream_keep_alive_limit: Option<u32>,
    pub batch_limit: Option<u32>,
    pub batch_flush_timeout: Option<u32>,
    pub stream_limit: Option<u32>,
}

impl StreamParameters {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        [
            ("stream_timeout", self.stream_timeout),
            ("stream_keep_alive_limit", self.stream_keep_alive_limit),
            ("batch_limit", self.batch_limit),
            ("batch_flush_timeout", self.batch_flush_timeout),
            ("stream_limit", self.stream_limit),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v.to_string())))
        .collect()
    }
}

/// Configuration for a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Broker base URL, e.g. `https://nakadi.example.org`
    pub nakadi_url: String,

    /// Logical consumer identity shared by all instances
    pub consumer_name: ConsumerName,

    pub stream: StreamParameters,

    /// Read timeout for the partition-list resource
    pub partitions_read_timeout_ms: u64,

    /// Read timeout for event streams; must exceed the stream's keep-alive cadence
    pub events_read_timeout_ms: u64,

    /// Delay before an event stream repeats or retries
    pub retry_after_ms: u64,

    /// Cadence of partition-list polling
    pub partitions_poll_interval_ms: u64,

    /// Upper bound of random jitter added to every delay
    pub jitter_ms: u64,

    pub start_offset: StartOffset,

    /// Delete persisted offsets the broker reports as unavailable
    pub delete_unavailable_cursors: bool,

    /// How long a running-but-unsubscribed channel may stay so before restart
    pub stuck_channel_grace_ms: u64,

    /// How long `close` waits for an in-flight attempt before aborting it
    pub channel_close_timeout_ms: u64,
}

impl ConsumerConfig {
    pub fn new(nakadi_url: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            nakadi_url: nakadi_url.into().trim_end_matches('/').to_string(),
            consumer_name: ConsumerName::new(consumer_name),
            stream: StreamParameters::default(),
            partitions_read_timeout_ms: 10_000,
            events_read_timeout_ms: 60_000,
            retry_after_ms: 1_000,
            partitions_poll_interval_ms: 10_000,
            jitter_ms: 250,
            start_offset: StartOffset::Newest,
            delete_unavailable_cursors: true,
            stuck_channel_grace_ms: 2_000,
            channel_close_timeout_ms: 5_000,
        }
    }

    pub fn with_stream_parameters(mut self, stream: StreamParameters) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_partitions_read_timeout_ms(mut self, timeout: u64) -> Self {
        self.partitions_read_timeout_ms = timeout;
        self
    }

    pub fn with_events_read_timeout_ms(mut self, timeout: u64) -> Self {
        self.events_read_timeout_ms = timeout;
        self
    }

    pub fn with_retry_after_ms(mut self, delay: u64) -> Self {
        self.retry_after_ms = delay;
        self
    }

    pub fn with_partitions_poll_interval_ms(mut self, interval: u64) -> Self {
        self.partitions_poll_interval_ms = interval;
        self
    }

    pub fn with_jitter_ms(mut self, jitter: u64) -> Self {
        self.jitter_ms = jitter;
        self
    }

    pub fn with_start_offset(mut self, start: StartOffset) -> Self {
        self.start_offset = start;
        self
    }

    pub fn with_delete_unavailable_cursors(mut self, enable: bool) -> Self {
        self.delete_unavailable_cursors = enable;
        self
    }

    pub fn with_stuck_channel_grace_ms(mut self, grace: u64) -> Self {
        self.stuck_channel_grace_ms = grace;
        self
    }

    pub fn with_channel_close_timeout_ms(mut self, timeout: u64) -> Self {
        self.channel_close_timeout_ms = timeout;
        self
    }

    pub fn partitions_read_timeout(&self) -> Duration {
        Duration::from_millis(self.partitions_read_timeout_ms)
    }

    pub fn events_read_timeout(&self) -> Duration {
        Duration::from_millis(self.events_read_timeout_ms)
    }

    pub fn channel_close_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_close_timeout_ms)
    }

    pub fn stuck_channel_grace(&self) -> Duration {
        Duration::from_millis(self.stuck_channel_grace_ms)
    }
}

/// Local broker, consumer named after this crate.
impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080", "nakadi-consumer")
    }
}

impl FromEnv for ConsumerConfig {
    /// Requires `NAKADI_URL` and `NAKADI_CONSUMER_NAME`; everything else has defaults.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = ConsumerConfig::new(
            env_required("NAKADI_URL")?,
            env_required("NAKADI_CONSUMER_NAME")?,
        );

        let start_offset = env_or_default("NAKADI_START_OFFSET", "newest")
            .parse::<StartOffset>()
            .map_err(|e| ConfigError::ParseError {
                key: "NAKADI_START_OFFSET".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self {
            stream: StreamParameters {
                stream_timeout: env_parse_optional("NAKADI_STREAM_TIMEOUT_SECS")?,
                stream_keep_alive_limit: env_parse_optional("NAKADI_STREAM_KEEP_ALIVE_LIMIT")?,
                batch_limit: env_parse_optional("NAKADI_BATCH_LIMIT")?,
                batch_flush_timeout: env_parse_optional("NAKADI_BATCH_FLUSH_TIMEOUT_SECS")?,
                stream_limit: env_parse_optional("NAKADI_STREAM_LIMIT")?,
            },
            partitions_read_timeout_ms: env_parse(
                "NAKADI_PARTITIONS_READ_TIMEOUT_MS",
                defaults.partitions_read_timeout_ms,
            )?,
            events_read_timeout_ms: env_parse(
                "NAKADI_EVENTS_READ_TIMEOUT_MS",
                defaults.events_read_timeout_ms,
            )?,
            retry_after_ms: env_parse("NAKADI_RETRY_AFTER_MS", defaults.retry_after_ms)?,
            partitions_poll_interval_ms: env_parse(
                "NAKADI_PARTITIONS_POLL_INTERVAL_MS",
                defaults.partitions_poll_interval_ms,
            )?,
            jitter_ms: env_parse("NAKADI_JITTER_MS", defaults.jitter_ms)?,
            start_offset,
            delete_unavailable_cursors: env_parse(
                "NAKADI_DELETE_UNAVAILABLE_CURSORS",
                defaults.delete_unavailable_cursors,
            )?,
            stuck_channel_grace_ms: env_parse(
                "NAKADI_STUCK_CHANNEL_GRACE_MS",
                defaults.stuck_channel_grace_ms,
            )?,
            channel_close_timeout_ms: env_parse(
                "NAKADI_CHANNEL_CLOSE_TIMEOUT_MS",
                defaults.channel_close_timeout_ms,
            )?,
            ..defaults
        })
    }
}
