//! Core data model: event types, partitions, cursors and broker topology.
//!
//! Partition ids and offsets are opaque strings handed out by the broker.
//! Offsets are compared numerically when both sides parse as integers; the
//! `BEGIN` sentinel sorts before every numeric offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Name of a partitioned event stream exposed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical consumer identity shared by every process instance that divides
/// the partitions of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerName(String);

impl ConsumerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single partition of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTypePartition {
    event_type: EventType,
    partition: String,
}

impl EventTypePartition {
    pub fn new(event_type: EventType, partition: impl Into<String>) -> Self {
        Self {
            event_type,
            partition: partition.into(),
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }
}

impl fmt::Display for EventTypePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_type, self.partition)
    }
}

/// Position inside a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Offset {
    /// Before the oldest retained event.
    Begin,
    /// Broker-defined offset string.
    At(String),
}

impl Offset {
    pub const BEGIN: &'static str = "BEGIN";

    pub fn parse(value: &str) -> Self {
        if value == Self::BEGIN {
            Offset::Begin
        } else {
            Offset::At(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Offset::Begin => Self::BEGIN,
            Offset::At(value) => value,
        }
    }

    /// Numeric value of the offset, `None` for `BEGIN` or non-numeric offsets.
    pub fn numeric(&self) -> Option<u64> {
        match self {
            Offset::Begin => None,
            Offset::At(value) => value.parse().ok(),
        }
    }

    /// Position used for ordering: `BEGIN` is -1, numeric offsets are their value.
    pub fn ordinal(&self) -> Option<i128> {
        match self {
            Offset::Begin => Some(-1),
            Offset::At(_) => self.numeric().map(i128::from),
        }
    }

    /// Compare two offsets; `None` when either side is not comparable.
    pub fn compare(&self, other: &Offset) -> Option<Ordering> {
        Some(self.ordinal()?.cmp(&other.ordinal()?))
    }

    /// Offset `steps` positions before this one, when it is numeric.
    /// Zero-padded offsets keep their width.
    pub fn preceding(&self, steps: u64) -> Option<Offset> {
        let raw = self.as_str();
        let width = if raw.len() > 1 && raw.starts_with('0') { raw.len() } else { 0 };
        let value = self.numeric()?.checked_sub(steps)?;
        Some(Offset::At(format!("{value:0width$}")))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partition together with an offset inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventTypeCursor {
    partition: EventTypePartition,
    offset: Offset,
}

impl EventTypeCursor {
    pub fn new(partition: EventTypePartition, offset: Offset) -> Self {
        Self { partition, offset }
    }

    pub fn event_type(&self) -> &EventType {
        self.partition.event_type()
    }

    pub fn partition(&self) -> &EventTypePartition {
        &self.partition
    }

    pub fn partition_id(&self) -> &str {
        self.partition.partition()
    }

    pub fn offset(&self) -> &Offset {
        &self.offset
    }

    pub fn with_offset(&self, offset: Offset) -> Self {
        Self {
            partition: self.partition.clone(),
            offset,
        }
    }

    pub fn to_wire(&self) -> WireCursor {
        WireCursor {
            partition: self.partition_id().to_string(),
            offset: self.offset.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventTypeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Cursor as it appears on the wire (request header and batch envelopes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCursor {
    pub partition: String,
    pub offset: String,
}

/// Broker-reported partition topology, replaced on every partition-list poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakadiPartition {
    pub partition: String,
    pub oldest_available_offset: String,
    pub newest_available_offset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unconsumed_events: Option<u64>,
}

impl NakadiPartition {
    pub fn oldest(&self) -> Offset {
        Offset::parse(&self.oldest_available_offset)
    }

    pub fn newest(&self) -> Offset {
        Offset::parse(&self.newest_available_offset)
    }
}

/// Ephemeral identity of one running process inside a membership group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub member_id: String,
    pub host: String,
    pub created: DateTime<Utc>,
}

impl GroupMember {
    pub fn new(member_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            host: host.into(),
            created: Utc::now(),
        }
    }

    /// Fresh identity for this process: random member id, host from `HOSTNAME`.
    pub fn local() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self::new(Uuid::new_v4().to_string(), host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_parse_and_display() {
        assert_eq!(Offset::parse("BEGIN"), Offset::Begin);
        assert_eq!(Offset::parse("42"), Offset::At("42".to_string()));
        assert_eq!(Offset::Begin.to_string(), "BEGIN");
        assert_eq!(Offset::parse("000123").numeric(), Some(123));
    }

    #[test]
    fn test_offset_ordering() {
        let begin = Offset::Begin;
        let five = Offset::parse("5");
        let twelve = Offset::parse("12");

        assert_eq!(begin.compare(&five), Some(Ordering::Less));
        assert_eq!(twelve.compare(&five), Some(Ordering::Greater));
        assert_eq!(Offset::parse("abc").compare(&five), None);
    }

    #[test]
    fn test_offset_preceding() {
        assert_eq!(Offset::parse("9").preceding(1), Some(Offset::parse("8")));
        assert_eq!(Offset::parse("9").preceding(0), Some(Offset::parse("9")));
        assert_eq!(Offset::parse("0").preceding(1), None);
        assert_eq!(Offset::Begin.preceding(1), None);
        assert_eq!(Offset::parse("10").preceding(1), Some(Offset::parse("9")));
        assert_eq!(
            Offset::parse("000000000000000042").preceding(3),
            Some(Offset::parse("000000000000000039"))
        );
    }

    #[test]
    fn test_nakadi_partition_deserialization() {
        let json = r#"[{"partition":"0","oldest_available_offset":"3","newest_available_offset":"17","unconsumed_events":4},
                       {"partition":"1","oldest_available_offset":"BEGIN","newest_available_offset":"BEGIN"}]"#;
        let partitions: Vec<NakadiPartition> = serde_json::from_str(json).unwrap();

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].newest(), Offset::parse("17"));
        assert_eq!(partitions[0].unconsumed_events, Some(4));
        assert_eq!(partitions[1].oldest(), Offset::Begin);
        assert_eq!(partitions[1].unconsumed_events, None);
    }

    #[test]
    fn test_group_member_json_shape() {
        let member = GroupMember::new("member-1", "host-a");
        let json = serde_json::to_value(&member).unwrap();

        assert_eq!(json["memberId"], "member-1");
        assert_eq!(json["host"], "host-a");
        assert!(json["created"].is_string());
    }

    #[test]
    fn test_cursor_to_wire() {
        let partition = EventTypePartition::new(EventType::new("order.created"), "3");
        let cursor = EventTypeCursor::new(partition, Offset::parse("99"));

        assert_eq!(
            cursor.to_wire(),
            WireCursor {
                partition: "3".to_string(),
                offset: "99".to_string()
            }
        );
        assert_eq!(cursor.to_string(), "order.created/3@99");
    }
}
