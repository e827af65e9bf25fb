//! Distributed coordination primitives.
//!
//! Everything that needs a strongly consistent shared store goes through
//! [`CoordinationStore`]: durable offsets, ephemeral group membership and
//! per-partition leader election. Redis backs it in production; an
//! in-memory store with the same TTL semantics backs single-process runs
//! and tests.

mod election;
mod membership;
pub mod rebalance;
mod redis_store;
mod store;

pub use election::{ElectionState, LeaderElection, LeadershipListener};
pub use membership::{GroupMembership, MembershipEvent};
pub use rebalance::{RebalanceDecision, rebalance};
pub use redis_store::RedisCoordinationStore;
pub use store::{CoordinationStore, MemoryCoordinationStore};

use crate::model::{ConsumerName, EventType, EventTypePartition};
use core_config::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Coordination service settings
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub redis_url: String,

    /// Prefix of every key written by this client
    pub namespace: String,

    /// Lifetime of a membership key without heartbeat
    pub member_ttl_ms: u64,

    pub heartbeat_interval_ms: u64,

    pub membership_poll_interval_ms: u64,

    /// Lifetime of a leadership key without refresh
    pub leader_ttl_ms: u64,

    /// How often a candidate re-contests a partition it does not lead
    pub election_retry_ms: u64,
}

impl CoordinationConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            namespace: "nakadi".to_string(),
            member_ttl_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            membership_poll_interval_ms: 2_000,
            leader_ttl_ms: 10_000,
            election_retry_ms: 2_000,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_member_ttl_ms(mut self, ttl: u64) -> Self {
        self.member_ttl_ms = ttl;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval: u64) -> Self {
        self.heartbeat_interval_ms = interval;
        self
    }

    pub fn with_membership_poll_interval_ms(mut self, interval: u64) -> Self {
        self.membership_poll_interval_ms = interval;
        self
    }

    pub fn with_leader_ttl_ms(mut self, ttl: u64) -> Self {
        self.leader_ttl_ms = ttl;
        self
    }

    pub fn with_election_retry_ms(mut self, interval: u64) -> Self {
        self.election_retry_ms = interval;
        self
    }

    pub fn member_ttl(&self) -> Duration {
        Duration::from_millis(self.member_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn membership_poll_interval(&self) -> Duration {
        Duration::from_millis(self.membership_poll_interval_ms.max(1))
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_millis(self.leader_ttl_ms)
    }

    /// Leaders refresh three times per TTL.
    pub fn leader_refresh_interval(&self) -> Duration {
        Duration::from_millis((self.leader_ttl_ms / 3).max(1))
    }

    pub fn election_retry(&self) -> Duration {
        Duration::from_millis(self.election_retry_ms.max(1))
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(&self.namespace)
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

impl FromEnv for CoordinationConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = CoordinationConfig::default();

        Ok(Self {
            redis_url: env_or_default("COORDINATION_REDIS_URL", &defaults.redis_url),
            namespace: env_or_default("COORDINATION_NAMESPACE", &defaults.namespace),
            member_ttl_ms: env_parse("COORDINATION_MEMBER_TTL_MS", defaults.member_ttl_ms)?,
            heartbeat_interval_ms: env_parse(
                "COORDINATION_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            membership_poll_interval_ms: env_parse(
                "COORDINATION_MEMBERSHIP_POLL_INTERVAL_MS",
                defaults.membership_poll_interval_ms,
            )?,
            leader_ttl_ms: env_parse("COORDINATION_LEADER_TTL_MS", defaults.leader_ttl_ms)?,
            election_retry_ms: env_parse(
                "COORDINATION_ELECTION_RETRY_MS",
                defaults.election_retry_ms,
            )?,
        })
    }
}

/// Key layout inside the coordination store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// `{ns}:offsets:{event_type}:{partition}:{consumer}`
    pub fn offset(&self, partition: &EventTypePartition, consumer: &ConsumerName) -> String {
        format!(
            "{}{}:{}",
            self.offsets_prefix(partition.event_type()),
            partition.partition(),
            consumer
        )
    }

    pub fn offsets_prefix(&self, event_type: &EventType) -> String {
        format!("{}:offsets:{}:", self.namespace, event_type)
    }

    /// Partition id of an offset key written for `consumer`, if it is one.
    ///
    /// Partition ids never contain `:`, so anything left with one belongs to
    /// a consumer or event type whose name extends ours.
    pub fn partition_of_offset_key<'a>(
        &self,
        key: &'a str,
        event_type: &EventType,
        consumer: &ConsumerName,
    ) -> Option<&'a str> {
        let prefix = self.offsets_prefix(event_type);
        let suffix = format!(":{consumer}");
        key.strip_prefix(prefix.as_str())?
            .strip_suffix(suffix.as_str())
            .filter(|partition| !partition.is_empty() && !partition.contains(':'))
    }

    /// `{ns}:members:{event_type}:{consumer}:`
    pub fn members_prefix(&self, event_type: &EventType, consumer: &ConsumerName) -> String {
        format!("{}:members:{}:{}:", self.namespace, event_type, consumer)
    }

    pub fn member(&self, event_type: &EventType, consumer: &ConsumerName, member_id: &str) -> String {
        format!("{}{}", self.members_prefix(event_type, consumer), member_id)
    }

    /// `{ns}:leaders:{event_type}:{partition}:{consumer}`
    pub fn leader(&self, partition: &EventTypePartition, consumer: &ConsumerName) -> String {
        format!(
            "{}:leaders:{}:{}:{}",
            self.namespace,
            partition.event_type(),
            partition.partition(),
            consumer
        )
    }
}
