//! Resilient long-poll streaming channel.
//!
//! A [`StreamingChannel`] keeps exactly one HTTP request outstanding for one
//! broker resource. When the broker ends the body normally the channel
//! *repeats*; when the attempt fails at transport level it *retries*. Both
//! wait the handler's delay plus jitter, and both waits are cut short by
//! [`StreamingChannel::close`].
//!
//! ```text
//!   start ──► attempt ──► body ends ──► delay ──► attempt ...
//!                │                        ▲
//!                └── transport error ─────┘
//!                │
//!                └── unrecoverable ──► unsubscribed (running stays true)
//! ```

mod framing;

pub use framing::Framing;

use crate::error::{ConsumerError, ConsumerResult};
use crate::http::{HttpTransport, ResourceRequest};
use crate::metrics::{AttemptOutcome, ConsumerMetrics};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use framing::Framer;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One framed piece of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseUnit {
    pub status: u16,
    pub body: String,
}

/// Callbacks driven by a [`StreamingChannel`]. Calls into one handler are
/// never concurrent.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    /// Called once, before the first attempt.
    async fn init(&self) -> ConsumerResult<()> {
        Ok(())
    }

    /// Request for the next attempt.
    fn request(&self) -> ConsumerResult<ResourceRequest>;

    fn framing(&self) -> Framing {
        Framing::Lines
    }

    /// The broker accepted the request.
    async fn on_started(&self) {}

    /// A unit of a successful response. An unrecoverable error unsubscribes
    /// the channel.
    async fn on_response(&self, unit: ResponseUnit) -> ConsumerResult<()>;

    /// Full body of a non-2xx response.
    async fn on_error_response(&self, unit: ResponseUnit) -> ConsumerResult<()>;

    /// Runs once per attempt, whatever its outcome.
    async fn on_finished(&self) {}

    /// Called once from [`StreamingChannel::close`].
    async fn close(&self) {}

    fn retry_after_millis(&self) -> u64;
}

#[derive(Debug, Default)]
struct ChannelState {
    running: AtomicBool,
    subscribed: AtomicBool,
    attempts: AtomicU64,
}

/// Supervises repeat/retry for one resource
pub struct StreamingChannel {
    name: String,
    transport: Arc<dyn HttpTransport>,
    handler: Arc<dyn ChannelHandler>,
    policy: RetryPolicy,
    metrics: Option<ConsumerMetrics>,
    close_timeout: Duration,
    state: Arc<ChannelState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl StreamingChannel {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        handler: Arc<dyn ChannelHandler>,
        policy: RetryPolicy,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            transport,
            handler,
            policy,
            metrics: None,
            close_timeout: Duration::from_secs(5),
            state: Arc::new(ChannelState::default()),
            shutdown,
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical on/off state.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Whether the attempt loop is alive.
    pub fn is_subscribed(&self) -> bool {
        self.state.subscribed.load(Ordering::SeqCst)
    }

    /// Running but no longer subscribed: the loop died on an unrecoverable error.
    pub fn is_stuck(&self) -> bool {
        self.is_running() && !self.is_subscribed()
    }

    pub fn attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Initialize the handler and spawn the attempt loop.
    pub async fn start(&self) -> ConsumerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::registration(format!(
                "channel {} already started",
                self.name
            )));
        }

        self.handler.init().await?;

        // close() may have run while init was pending; checked under the task
        // lock so a spawned loop is always visible to close().
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.closed.load(Ordering::SeqCst) {
            debug!(channel = %self.name, "Channel closed during init, not spawning");
            return Err(ConsumerError::Shutdown);
        }

        self.state.running.store(true, Ordering::SeqCst);
        self.state.subscribed.store(true, Ordering::SeqCst);

        let attempt_loop = AttemptLoop {
            name: self.name.clone(),
            transport: self.transport.clone(),
            handler: self.handler.clone(),
            policy: self.policy,
            metrics: self.metrics.clone(),
            state: self.state.clone(),
        };
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(attempt_loop.run(shutdown)));
        drop(task);

        info!(channel = %self.name, "Channel started");
        Ok(())
    }

    /// Stop the loop, release any in-flight request and close the handler.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.send_replace(true);
        self.state.running.store(false, Ordering::SeqCst);

        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.close_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(channel = %self.name, "Channel did not stop in time, aborting");
                handle.abort();
            }
        }

        self.state.subscribed.store(false, Ordering::SeqCst);

        if self.started.load(Ordering::SeqCst) {
            self.handler.close().await;
        }
        info!(channel = %self.name, attempts = self.attempts(), "Channel closed");
    }
}

impl Drop for StreamingChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

struct AttemptLoop {
    name: String,
    transport: Arc<dyn HttpTransport>,
    handler: Arc<dyn ChannelHandler>,
    policy: RetryPolicy,
    metrics: Option<ConsumerMetrics>,
    state: Arc<ChannelState>,
}

impl AttemptLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(channel = %self.name, attempt, "Starting stream attempt");

            let outcome = tokio::select! {
                result = self.attempt() => Some(result),
                _ = shutdown.changed() => None,
            };

            self.handler.on_finished().await;

            let next = match outcome {
                None => break,
                Some(Ok(())) => {
                    debug!(channel = %self.name, attempt, "Stream completed, repeating");
                    AttemptOutcome::Repeat
                }
                Some(Err(e)) if e.is_unrecoverable() => {
                    error!(channel = %self.name, attempt, error = %e, "Unrecoverable error, unsubscribing channel");
                    self.state.subscribed.store(false, Ordering::SeqCst);
                    break;
                }
                Some(Err(e)) => {
                    warn!(channel = %self.name, attempt, error = %e, "Stream attempt failed, retrying");
                    AttemptOutcome::Retry
                }
            };

            if let Some(metrics) = &self.metrics {
                metrics.stream_attempt(next);
            }

            let delay = self.policy.delay(self.handler.retry_after_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!(channel = %self.name, "Attempt loop finished");
    }

    async fn attempt(&self) -> ConsumerResult<()> {
        let request = self.handler.request()?;
        let response = self.transport.execute(request).await?;
        let status = response.status;

        self.handler.on_started().await;

        if !response.is_success() {
            let body = response.text().await?;
            return self
                .handler
                .on_error_response(ResponseUnit { status, body })
                .await;
        }

        let mut framer = Framer::new(self.handler.framing());
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            for unit in framer.push(&chunk?)? {
                self.handler
                    .on_response(ResponseUnit { status, body: unit })
                    .await?;
            }
        }
        if let Some(unit) = framer.finish()? {
            self.handler
                .on_response(ResponseUnit { status, body: unit })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, wait_until};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        units: StdMutex<Vec<ResponseUnit>>,
        errors: StdMutex<Vec<ResponseUnit>>,
        finished: AtomicU64,
        closed: AtomicU64,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl ChannelHandler for RecordingHandler {
        fn request(&self) -> ConsumerResult<ResourceRequest> {
            Ok(ResourceRequest::get("http://nakadi/event-types/x/events"))
        }

        async fn on_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
            if self.fail_on == Some(unit.body.as_str()) {
                return Err(ConsumerError::unrecoverable("handler contract violated"));
            }
            self.units.lock().unwrap().push(unit);
            Ok(())
        }

        async fn on_error_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
            self.errors.lock().unwrap().push(unit);
            Ok(())
        }

        async fn on_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn retry_after_millis(&self) -> u64 {
            20
        }
    }

    fn channel(transport: &Arc<ScriptedTransport>, handler: &Arc<RecordingHandler>) -> StreamingChannel {
        StreamingChannel::new(
            "test",
            transport.clone(),
            handler.clone(),
            RetryPolicy::new(20, 0),
        )
        .with_close_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_repeats_after_normal_completion() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_body(200, "one\n");
        transport.push_body(200, "two\n");
        let handler = Arc::new(RecordingHandler::default());
        let channel = channel(&transport, &handler);

        channel.start().await.unwrap();
        wait_until(|| handler.units.lock().unwrap().len() == 2).await;

        let bodies: Vec<String> = handler.units.lock().unwrap().iter().map(|u| u.body.clone()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
        assert!(channel.is_running());
        assert!(channel.is_subscribed());

        channel.close().await;
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_retries_after_transport_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_failure("connection refused");
        transport.push_body(200, "after-retry\n");
        let handler = Arc::new(RecordingHandler::default());
        let channel = channel(&transport, &handler);

        channel.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) >= 2).await;

        assert_eq!(handler.units.lock().unwrap()[0].body, "after-retry");
        assert!(channel.attempts() >= 2);
        channel.close().await;
    }

    #[tokio::test]
    async fn test_close_during_delay_prevents_next_attempt() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_body(200, "only\n");
        let handler = Arc::new(RecordingHandler::default());
        let channel = StreamingChannel::new(
            "slow-repeat",
            transport.clone(),
            handler.clone(),
            RetryPolicy::new(10_000, 0),
        );

        channel.start().await.unwrap();
        wait_until(|| handler.finished.load(Ordering::SeqCst) == 1).await;
        channel.close().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.request_count(), 1);
        assert_eq!(channel.attempts(), 1);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_releases_in_flight_stream() {
        let transport = Arc::new(ScriptedTransport::new());
        let handler = Arc::new(RecordingHandler::default());
        let channel = channel(&transport, &handler);

        channel.start().await.unwrap();
        wait_until(|| transport.open_streams() == 1).await;

        channel.close().await;
        assert_eq!(transport.open_streams(), 0);
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);

        // Idempotent
        channel.close().await;
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_unsubscribes() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_body(200, "ok\npoison\nnever\n");
        let handler = Arc::new(RecordingHandler {
            fail_on: Some("poison"),
            ..Default::default()
        });
        let channel = channel(&transport, &handler);

        channel.start().await.unwrap();
        wait_until(|| !channel.is_subscribed()).await;

        assert!(channel.is_running());
        assert!(channel.is_stuck());
        assert_eq!(handler.units.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.request_count(), 1);
        channel.close().await;
    }

    #[tokio::test]
    async fn test_error_response_then_repeat() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_body(503, "{\"detail\":\"unavailable\"}");
        transport.push_body(200, "recovered\n");
        let handler = Arc::new(RecordingHandler::default());
        let channel = channel(&transport, &handler);

        channel.start().await.unwrap();
        wait_until(|| handler.units.lock().unwrap().len() == 1).await;

        let errors = handler.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status, 503);
        channel.close().await;
    }

    /// Handler whose init is still pending when the channel gets closed.
    struct SlowInitHandler {
        inner: RecordingHandler,
    }

    #[async_trait]
    impl ChannelHandler for SlowInitHandler {
        async fn init(&self) -> ConsumerResult<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }

        fn request(&self) -> ConsumerResult<ResourceRequest> {
            self.inner.request()
        }

        async fn on_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
            self.inner.on_response(unit).await
        }

        async fn on_error_response(&self, unit: ResponseUnit) -> ConsumerResult<()> {
            self.inner.on_error_response(unit).await
        }

        fn retry_after_millis(&self) -> u64 {
            5
        }
    }

    #[tokio::test]
    async fn test_close_during_init_never_spawns_loop() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..50 {
            transport.push_body(200, "x\n");
        }
        let handler = Arc::new(SlowInitHandler {
            inner: RecordingHandler::default(),
        });
        let channel = Arc::new(StreamingChannel::new(
            "closed-during-init",
            transport.clone(),
            handler,
            RetryPolicy::new(5, 0),
        ));

        let starting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.start().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close().await;

        let started = starting.await.unwrap();
        assert!(matches!(started, Err(ConsumerError::Shutdown)));
        assert!(!channel.is_running());
        assert!(!channel.is_subscribed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let transport = Arc::new(ScriptedTransport::new());
        let handler = Arc::new(RecordingHandler::default());
        let channel = channel(&transport, &handler);

        channel.start().await.unwrap();
        assert!(matches!(
            channel.start().await,
            Err(ConsumerError::Registration(_))
        ));
        channel.close().await;
        assert!(matches!(channel.start().await, Err(ConsumerError::Shutdown)));
    }
}
