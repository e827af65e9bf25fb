//! Partition fan-out: one streaming channel per owned partition.
//!
//! An outer channel polls the partition list and hands every answer to the
//! coordinator. The coordinator answers with assign, revoke and health-check
//! notifications, which are queued and applied by a single event loop:
//!
//! - assign starts a channel per new partition; an existing stuck channel
//!   (running but unsubscribed) gets a short grace period, then is replaced
//! - revoke closes and forgets the partition's channel
//! - health check replaces every stuck channel

mod partitions;
mod stream;

use crate::auth::AccessTokenProvider;
use crate::channel::StreamingChannel;
use crate::config::ConsumerConfig;
use crate::coordinator::{PartitionCoordinator, RebalanceListener};
use crate::dispatcher::{HandlerKind, ResponseDispatcher};
use crate::error::{ConsumerError, ConsumerResult};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::metrics::ConsumerMetrics;
use crate::model::{EventType, EventTypeCursor, EventTypePartition};
use crate::retry::RetryPolicy;
use partitions::PartitionListHandler;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use stream::PartitionStreamHandler;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// HTTP transports for the two resources, each with its own read timeout
#[derive(Clone)]
pub struct Transports {
    pub partitions: Arc<dyn HttpTransport>,
    pub events: Arc<dyn HttpTransport>,
}

impl Transports {
    pub fn reqwest(
        config: &ConsumerConfig,
        tokens: Option<Arc<dyn AccessTokenProvider>>,
    ) -> ConsumerResult<Self> {
        let mut partitions = ReqwestTransport::new(config.partitions_read_timeout())?;
        let mut events = ReqwestTransport::new(config.events_read_timeout())?;
        if let Some(tokens) = tokens {
            partitions = partitions.with_token_provider(tokens.clone());
            events = events.with_token_provider(tokens);
        }

        Ok(Self {
            partitions: Arc::new(partitions),
            events: Arc::new(events),
        })
    }

    /// One transport for both resources.
    pub fn shared(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            partitions: transport.clone(),
            events: transport,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RebalanceEvent {
    Assign(Vec<EventTypeCursor>),
    Revoke(Vec<EventTypePartition>),
    HealthCheck,
}

/// Queues coordinator notifications for the fan-out event loop
struct ForwardingListener {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ForwardingListener {
    fn forward(&self, event: RebalanceEvent) {
        if self.events.send(event).is_err() {
            debug!("Fan-out stopped, dropping rebalance notification");
        }
    }
}

impl RebalanceListener for ForwardingListener {
    fn on_assign(&self, cursors: Vec<EventTypeCursor>) {
        self.forward(RebalanceEvent::Assign(cursors));
    }

    fn on_revoke(&self, partitions: Vec<EventTypePartition>) {
        self.forward(RebalanceEvent::Revoke(partitions));
    }

    fn on_health_check(&self) {
        self.forward(RebalanceEvent::HealthCheck);
    }
}

#[derive(Clone)]
struct Pipeline {
    channel: Arc<StreamingChannel>,
    handler: Arc<PartitionStreamHandler>,
}

/// Owned partitions and their channels
#[derive(Default)]
pub(crate) struct ChannelMap {
    pipelines: Mutex<BTreeMap<String, Pipeline>>,
}

impl ChannelMap {
    fn pipelines(&self) -> MutexGuard<'_, BTreeMap<String, Pipeline>> {
        match self.pipelines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn owned(&self) -> BTreeSet<String> {
        self.pipelines().keys().cloned().collect()
    }

    fn stuck(&self) -> Vec<String> {
        self.pipelines()
            .iter()
            .filter(|(_, pipeline)| pipeline.channel.is_stuck())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn get(&self, partition: &str) -> Option<Pipeline> {
        self.pipelines().get(partition).cloned()
    }

    fn insert(&self, partition: String, pipeline: Pipeline) {
        self.pipelines().insert(partition, pipeline);
    }

    fn remove(&self, partition: &str) -> Option<Pipeline> {
        self.pipelines().remove(partition)
    }

    fn drain(&self) -> Vec<Pipeline> {
        std::mem::take(&mut *self.pipelines()).into_values().collect()
    }

    fn len(&self) -> usize {
        self.pipelines().len()
    }
}

/// State shared by the fan-out and its event loop
struct FanOutInner {
    event_type: EventType,
    config: ConsumerConfig,
    transports: Transports,
    coordinator: Arc<dyn PartitionCoordinator>,
    dispatcher: Arc<ResponseDispatcher>,
    channels: Arc<ChannelMap>,
    metrics: ConsumerMetrics,
}

impl FanOutInner {
    async fn apply(&self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assign(cursors) => {
                for cursor in cursors {
                    self.assign(cursor).await;
                }
            }
            RebalanceEvent::Revoke(partitions) => {
                for partition in partitions {
                    self.revoke(partition.partition()).await;
                }
            }
            RebalanceEvent::HealthCheck => {
                for partition in self.channels.stuck() {
                    if let Some(pipeline) = self.channels.get(&partition) {
                        warn!(event_type = %self.event_type, partition = %partition, "Found stuck channel, restarting");
                        let cursor = pipeline.handler.cursor();
                        self.restart(cursor).await;
                    }
                }
            }
        }
        self.metrics.owned_partitions(self.channels.len());
    }

    async fn assign(&self, cursor: EventTypeCursor) {
        let Some(existing) = self.channels.get(cursor.partition_id()) else {
            self.start_pipeline(cursor).await;
            return;
        };

        if !existing.channel.is_stuck() {
            debug!(cursor = %cursor, "Partition already streaming");
            return;
        }

        tokio::time::sleep(self.config.stuck_channel_grace()).await;
        if existing.channel.is_stuck() {
            warn!(cursor = %cursor, "Assigned partition has a stuck channel, restarting");
            self.restart(cursor).await;
        }
    }

    async fn revoke(&self, partition: &str) {
        match self.channels.remove(partition) {
            Some(pipeline) => {
                pipeline.channel.close().await;
                info!(event_type = %self.event_type, partition, "Partition revoked");
            }
            None => debug!(event_type = %self.event_type, partition, "Revoked partition had no channel"),
        }
    }

    async fn restart(&self, cursor: EventTypeCursor) {
        if let Some(pipeline) = self.channels.remove(cursor.partition_id()) {
            pipeline.channel.close().await;
        }
        self.metrics.channel_restarted();
        self.start_pipeline(cursor).await;
    }

    async fn start_pipeline(&self, cursor: EventTypeCursor) {
        let partition = cursor.partition_id().to_string();
        let handler = Arc::new(PartitionStreamHandler::new(
            cursor.clone(),
            self.config.nakadi_url.clone(),
            self.config.stream.clone(),
            self.config.retry_after_ms,
            self.coordinator.clone(),
            self.dispatcher.clone(),
        ));
        let channel = StreamingChannel::new(
            format!("{}/{}", self.event_type, partition),
            self.transports.events.clone(),
            handler.clone(),
            RetryPolicy::new(self.config.retry_after_ms, self.config.jitter_ms),
        )
        .with_metrics(self.metrics.clone())
        .with_close_timeout(self.config.channel_close_timeout());

        match channel.start().await {
            Ok(()) => {
                info!(cursor = %cursor, "Partition assigned");
                self.channels.insert(
                    partition,
                    Pipeline {
                        channel: Arc::new(channel),
                        handler,
                    },
                );
            }
            Err(e) => warn!(cursor = %cursor, error = %e, "Failed to start partition channel"),
        }
    }
}

/// Consumes one event type with one handler
pub struct PartitionFanOut {
    inner: Arc<FanOutInner>,
    poller: Mutex<Option<Arc<StreamingChannel>>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl PartitionFanOut {
    pub fn new(
        event_type: EventType,
        handler: HandlerKind,
        config: ConsumerConfig,
        coordinator: Arc<dyn PartitionCoordinator>,
        transports: Transports,
    ) -> Self {
        let metrics = ConsumerMetrics::new(event_type.name(), config.consumer_name.as_str());
        let dispatcher = Arc::new(ResponseDispatcher::new(
            event_type.clone(),
            handler,
            coordinator.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(FanOutInner {
                event_type,
                config,
                transports,
                coordinator,
                dispatcher,
                channels: Arc::default(),
                metrics,
            }),
            poller: Mutex::new(None),
            events_task: Mutex::new(None),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.inner.event_type
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn owned_partitions(&self) -> BTreeSet<String> {
        self.inner.channels.owned()
    }

    /// Partitions whose channel is running but unsubscribed.
    pub fn stuck_partitions(&self) -> Vec<String> {
        self.inner.channels.stuck()
    }

    /// Register with the coordinator and start polling the partition list.
    pub async fn start(&self) -> ConsumerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::registration(format!(
                "fan-out for {} already started",
                self.inner.event_type
            )));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        if let Err(e) = self
            .inner
            .coordinator
            .register_rebalance_listener(&self.inner.event_type, Arc::new(ForwardingListener { events }))
        {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let task = tokio::spawn(run_events(
            self.inner.clone(),
            receiver,
            self.shutdown.subscribe(),
        ));
        if let Ok(mut slot) = self.events_task.lock() {
            *slot = Some(task);
        }

        let config = &self.inner.config;
        let poller = Arc::new(
            StreamingChannel::new(
                format!("{}/partitions", self.inner.event_type),
                self.inner.transports.partitions.clone(),
                Arc::new(PartitionListHandler::new(
                    self.inner.event_type.clone(),
                    config.nakadi_url.clone(),
                    config.partitions_poll_interval_ms,
                    self.inner.coordinator.clone(),
                    self.inner.channels.clone(),
                )),
                RetryPolicy::new(config.partitions_poll_interval_ms, config.jitter_ms),
            )
            .with_close_timeout(config.channel_close_timeout()),
        );
        poller.start().await?;
        if let Ok(mut slot) = self.poller.lock() {
            *slot = Some(poller);
        }

        info!(
            event_type = %self.inner.event_type,
            consumer = %config.consumer_name,
            "Fan-out started"
        );
        Ok(())
    }

    /// Stop polling, close every partition channel and unregister.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let poller = self.poller.lock().ok().and_then(|mut slot| slot.take());
        if let Some(poller) = poller {
            poller.close().await;
        }

        self.shutdown.send_replace(true);
        let task = self.events_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }

        let pipelines = self.inner.channels.drain();
        let closing = pipelines.iter().map(|pipeline| pipeline.channel.close());
        futures::future::join_all(closing).await;
        self.inner.metrics.owned_partitions(0);

        self.inner
            .coordinator
            .unregister_rebalance_listener(&self.inner.event_type);
        info!(
            event_type = %self.inner.event_type,
            partitions = pipelines.len(),
            "Fan-out stopped"
        );
    }
}

async fn run_events(
    inner: Arc<FanOutInner>,
    mut events: mpsc::UnboundedReceiver<RebalanceEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => inner.apply(event).await,
                None => break,
            },
        }
    }
    debug!(event_type = %inner.event_type, "Fan-out event loop finished");
}
