//! Nakadi Consumer
//!
//! A partition-aware client for the Nakadi event-stream broker.
//!
//! ## Features
//!
//! - **Streaming channels**: long-lived HTTP streams with repeat/retry and
//!   prompt release on close
//! - **Partition fan-out**: one event stream per owned partition, polled
//!   topology, stuck-channel recovery
//! - **Coordinators**: single-node, durable single-node, or Redis-backed
//!   group membership with per-partition leader election
//! - **Offset store**: committed offsets validated and clamped against the
//!   broker's retention window
//! - **Handlers**: raw, JSON or typed listeners, per event or per batch
//! - **Health endpoints**: liveness, readiness and Prometheus metrics
//!
//! ## Example
//!
//! ```ignore
//! use nakadi_consumer::{ConsumerConfig, ConsumerRegistry, EventType, HandlerKind, LocalCoordinator, Transports};
//!
//! let config = ConsumerConfig::from_env()?;
//! let coordinator = Arc::new(LocalCoordinator::simple(&config));
//! let mut registry = ConsumerRegistry::new(config.clone(), coordinator, Transports::reqwest(&config, None)?);
//! registry.subscribe(EventType::new("order.created"), HandlerKind::typed::<OrderCreated, _>(listener))?;
//! registry.run(shutdown_rx).await?;
//! ```

mod auth;
pub mod channel;
mod config;
pub mod controller;
pub mod coordination;
pub mod coordinator;
pub mod dispatcher;
mod error;
mod health;
pub mod http;
pub mod metrics;
pub mod model;
pub mod offsets;
mod registry;
mod retry;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use auth::{AccessTokenProvider, StaticTokenProvider};
pub use config::{ConsumerConfig, StartOffset, StreamParameters};
pub use controller::{PartitionFanOut, Transports};
pub use coordination::{CoordinationConfig, CoordinationStore, MemoryCoordinationStore, RedisCoordinationStore};
pub use coordinator::{
    ErrorHandler, LeaderElectionCoordinator, LocalCoordinator, PartitionCoordinator,
    ProcessingFailure,
};
pub use dispatcher::{
    CommitGranularity, FailedEvent, HandlerKind, ReplayPolicy, ReplayReport, replay_events,
};
pub use error::{ConsumerError, ConsumerResult, ErrorKind, HandlerError};
pub use health::{HealthState, health_router};
pub use metrics::{ConsumerMetrics, init_metrics};
pub use model::{ConsumerName, EventType, EventTypeCursor, EventTypePartition, NakadiPartition, Offset};
pub use offsets::{CoordinatedOffsetStore, OffsetStore};
pub use registry::{ConsumerRegistry, SubscriptionStatus};
pub use retry::{BackoffConfig, RetryPolicy};
