//! Test doubles shared by unit tests.

use crate::coordinator::{CommitCallback, RebalanceListener};
use crate::error::{ConsumerError, ConsumerResult};
use crate::http::{HttpTransport, ResourceRequest, TransportResponse};
use crate::model::{EventTypeCursor, EventTypePartition};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

enum Scripted {
    Body { status: u16, chunks: Vec<Bytes> },
    Failure(String),
}

/// Counts live hanging bodies; decrements when the body is dropped.
struct OpenStream(Arc<AtomicUsize>);

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport answering from a script. Once the script is exhausted every
/// request gets a 200 whose body never ends, like an idle long poll.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    per_url: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    requests: Mutex<Vec<ResourceRequest>>,
    open: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_body(&self, status: u16, body: &str) {
        self.push_chunks(status, &[body]);
    }

    pub(crate) fn push_chunks(&self, status: u16, chunks: &[&str]) {
        self.script.lock().unwrap().push_back(Scripted::Body {
            status,
            chunks: chunks.iter().map(|c| Bytes::from(c.to_string())).collect(),
        });
    }

    pub(crate) fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Failure(message.to_string()));
    }

    /// Script a response for requests whose URL ends with `suffix`.
    pub(crate) fn push_body_for(&self, suffix: &str, status: u16, body: &str) {
        let mut per_url = self.per_url.lock().unwrap();
        let entry = Scripted::Body {
            status,
            chunks: vec![Bytes::from(body.to_string())],
        };
        match per_url.iter_mut().find(|(s, _)| s == suffix) {
            Some((_, queue)) => queue.push_back(entry),
            None => per_url.push((suffix.to_string(), VecDeque::from([entry]))),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ResourceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn next_for(&self, url: &str) -> Option<Scripted> {
        let mut per_url = self.per_url.lock().unwrap();
        if let Some((_, queue)) = per_url.iter_mut().find(|(suffix, _)| url.ends_with(suffix.as_str())) {
            return queue.pop_front();
        }
        drop(per_url);
        self.script.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: ResourceRequest) -> ConsumerResult<TransportResponse> {
        let next = self.next_for(&request.url);
        self.requests.lock().unwrap().push(request);

        match next {
            Some(Scripted::Body { status, chunks }) => Ok(TransportResponse {
                status,
                body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
            }),
            Some(Scripted::Failure(message)) => Err(ConsumerError::Transport(message)),
            None => {
                self.open.fetch_add(1, Ordering::SeqCst);
                let guard = OpenStream(self.open.clone());
                let body = stream::unfold(guard, |guard| async move {
                    futures::future::pending::<()>().await;
                    Some((Ok(Bytes::new()), guard))
                })
                .boxed();
                Ok(TransportResponse { status: 200, body })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notification {
    Assign(Vec<EventTypeCursor>),
    Revoke(Vec<EventTypePartition>),
    HealthCheck,
}

/// Rebalance listener that records every notification.
#[derive(Default)]
pub(crate) struct RecordingListener {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingListener {
    pub(crate) fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub(crate) fn assigned(&self) -> Vec<EventTypeCursor> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Assign(cursors) => Some(cursors),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn revoked(&self) -> Vec<EventTypePartition> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Revoke(partitions) => Some(partitions),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl RebalanceListener for RecordingListener {
    fn on_assign(&self, cursors: Vec<EventTypeCursor>) {
        self.notifications.lock().unwrap().push(Notification::Assign(cursors));
    }

    fn on_revoke(&self, partitions: Vec<EventTypePartition>) {
        self.notifications.lock().unwrap().push(Notification::Revoke(partitions));
    }

    fn on_health_check(&self) {
        self.notifications.lock().unwrap().push(Notification::HealthCheck);
    }
}

/// Commit callback that records committed cursors.
#[derive(Default)]
pub(crate) struct RecordingCommits {
    cursors: Mutex<Vec<EventTypeCursor>>,
}

impl RecordingCommits {
    pub(crate) fn cursors(&self) -> Vec<EventTypeCursor> {
        self.cursors.lock().unwrap().clone()
    }
}

impl CommitCallback for RecordingCommits {
    fn on_commit(&self, cursor: &EventTypeCursor) {
        self.cursors.lock().unwrap().push(cursor.clone());
    }
}
