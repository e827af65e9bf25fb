//! Consumer registry: every subscription of one consumer name, started and
//! stopped together around a shared coordinator.

use crate::config::ConsumerConfig;
use crate::controller::{PartitionFanOut, Transports};
use crate::coordinator::PartitionCoordinator;
use crate::dispatcher::HandlerKind;
use crate::error::{ConsumerError, ConsumerResult};
use crate::model::EventType;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, info};

/// Snapshot of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub event_type: String,
    pub running: bool,
    pub owned_partitions: BTreeSet<String>,
    pub stuck_partitions: Vec<String>,
}

pub struct ConsumerRegistry {
    config: ConsumerConfig,
    coordinator: Arc<dyn PartitionCoordinator>,
    transports: Transports,
    subscriptions: Vec<PartitionFanOut>,
    started: AtomicBool,
}

impl ConsumerRegistry {
    pub fn new(
        config: ConsumerConfig,
        coordinator: Arc<dyn PartitionCoordinator>,
        transports: Transports,
    ) -> Self {
        Self {
            config,
            coordinator,
            transports,
            subscriptions: Vec::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &Arc<dyn PartitionCoordinator> {
        &self.coordinator
    }

    /// Add a subscription. One handler per event type.
    pub fn subscribe(&mut self, event_type: EventType, handler: HandlerKind) -> ConsumerResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ConsumerError::registration(
                "subscriptions must be added before start",
            ));
        }
        if self.subscriptions.iter().any(|s| s.event_type() == &event_type) {
            return Err(ConsumerError::registration(format!(
                "event type {event_type} already subscribed"
            )));
        }

        info!(
            event_type = %event_type,
            consumer = %self.config.consumer_name,
            handler = handler.name(),
            "Subscription registered"
        );
        self.subscriptions.push(PartitionFanOut::new(
            event_type,
            handler,
            self.config.clone(),
            self.coordinator.clone(),
            self.transports.clone(),
        ));
        Ok(())
    }

    /// Initialize the coordinator and start every subscription. A failing
    /// subscription stops the ones already started.
    pub async fn start(&self) -> ConsumerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::registration("registry already started"));
        }

        self.coordinator.init().await?;
        for subscription in &self.subscriptions {
            if let Err(e) = subscription.start().await {
                error!(event_type = %subscription.event_type(), error = %e, "Failed to start subscription");
                self.stop().await;
                return Err(e);
            }
        }

        info!(
            consumer = %self.config.consumer_name,
            subscriptions = self.subscriptions.len(),
            "Consumer registry started"
        );
        Ok(())
    }

    /// Stop every subscription, then close the coordinator and wait for its
    /// background work.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let stopping = self.subscriptions.iter().map(|s| s.stop());
        futures::future::join_all(stopping).await;

        if let Err(e) = self.coordinator.close().await {
            error!(consumer = %self.config.consumer_name, error = %e, "Coordinator did not close cleanly");
        }
        info!(consumer = %self.config.consumer_name, "Consumer registry stopped");
    }

    /// Start, wait for `shutdown` to turn true, then stop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ConsumerResult<()> {
        self.start().await?;

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!(consumer = %self.config.consumer_name, "Received shutdown signal, stopping consumer");

        self.stop().await;
        Ok(())
    }

    pub fn status(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions
            .iter()
            .map(|s| SubscriptionStatus {
                event_type: s.event_type().to_string(),
                running: s.is_running(),
                owned_partitions: s.owned_partitions(),
                stuck_partitions: s.stuck_partitions(),
            })
            .collect()
    }

    /// No subscription has a stuck channel.
    pub fn is_healthy(&self) -> bool {
        self.subscriptions
            .iter()
            .all(|s| s.stuck_partitions().is_empty())
    }
}
