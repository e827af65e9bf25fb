use super::HandlerKind;
use crate::error::HandlerError;
use crate::model::EventTypeCursor;
use serde_json::value::RawValue;
use strum::{Display, EnumString};
use tracing::{info, warn};

/// What a replay does when an event fails again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ReplayPolicy {
    #[default]
    AbortOnFirstError,
    ContinueOnError,
}

/// An event that failed earlier, as handed to an error handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    pub cursor: EventTypeCursor,
    pub raw_event: String,
}

impl FailedEvent {
    pub fn new(cursor: EventTypeCursor, raw_event: impl Into<String>) -> Self {
        Self {
            cursor,
            raw_event: raw_event.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub processed: usize,
    pub failed: Vec<(EventTypeCursor, HandlerError)>,
    /// Events not attempted because the replay stopped early
    pub skipped: usize,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped == 0
    }
}

/// Feed previously failed events through `handler` again. Nothing is
/// committed; the events are handled one at a time in the given order.
pub async fn replay_events(
    handler: &HandlerKind,
    events: Vec<FailedEvent>,
    policy: ReplayPolicy,
) -> ReplayReport {
    let total = events.len();
    let mut report = ReplayReport::default();

    for (index, event) in events.into_iter().enumerate() {
        let outcome = match RawValue::from_string(event.raw_event) {
            Ok(raw) => handler.handle_event(&event.cursor, &raw).await,
            Err(e) => Err(HandlerError::from(e)),
        };

        match outcome {
            Ok(()) => report.processed += 1,
            Err(e) => {
                warn!(cursor = %event.cursor, error = %e, policy = %policy, "Replayed event failed");
                report.failed.push((event.cursor, e));
                if policy == ReplayPolicy::AbortOnFirstError {
                    report.skipped = total - index - 1;
                    break;
                }
            }
        }
    }

    info!(
        processed = report.processed,
        failed = report.failed.len(),
        skipped = report.skipped,
        "Replay finished"
    );
    report
}
