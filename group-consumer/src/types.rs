use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Position of a message within one partition.
///
/// Offsets only compare meaningfully within the same partition. On the wire
/// they travel as decimal strings so 64-bit values survive JSON and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Offset(i64);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// The position right after this offset, i.e. what gets committed once
    /// the message at this offset has been handled.
    pub fn next(&self) -> Offset {
        Offset(self.0.saturating_add(1))
    }

    pub fn prev(&self) -> Offset {
        Offset(self.0.saturating_sub(1))
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Offset {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Offset)
    }
}

impl Serialize for Offset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An owned message as handed out by the broker client
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: Option<Bytes>,
    /// `None` is a tombstone
    pub value: Option<Bytes>,
    pub headers: HashMap<String, Bytes>,
    pub offset: Offset,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(offset: Offset, value: Option<Bytes>) -> Self {
        Self {
            key: None,
            value,
            headers: HashMap::new(),
            offset,
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Messages fetched for one partition, in offset order
#[derive(Debug, Clone)]
pub struct Batch {
    topic_partition: TopicPartition,
    fetched_offset: Offset,
    high_watermark: Offset,
    messages: Vec<Message>,
    unfiltered_count: usize,
}

impl Batch {
    /// Build a batch from what the broker returned for a fetch at
    /// `fetched_offset`. Messages below the fetch position are stale leftovers
    /// of a compressed set and are dropped here.
    pub fn new(
        topic_partition: TopicPartition,
        fetched_offset: Offset,
        high_watermark: Offset,
        messages: Vec<Message>,
    ) -> Self {
        let unfiltered_count = messages.len();
        let messages = messages
            .into_iter()
            .filter(|m| m.offset >= fetched_offset)
            .collect();

        Self {
            topic_partition,
            fetched_offset,
            high_watermark,
            messages,
            unfiltered_count,
        }
    }

    pub fn empty(
        topic_partition: TopicPartition,
        fetched_offset: Offset,
        high_watermark: Offset,
    ) -> Self {
        Self::new(topic_partition, fetched_offset, high_watermark, vec![])
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.topic_partition.partition_number()
    }

    pub fn fetched_offset(&self) -> Offset {
        self.fetched_offset
    }

    pub fn high_watermark(&self) -> Offset {
        self.high_watermark
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True only when the broker returned nothing at all, stale data included
    pub fn is_empty_including_filtered(&self) -> bool {
        self.unfiltered_count == 0
    }

    pub fn first_offset(&self) -> Option<Offset> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.messages.last().map(|m| m.offset)
    }

    /// Distance between the last message of the batch and the last message
    /// known to the broker
    pub fn offset_lag(&self) -> i64 {
        match self.last_offset() {
            Some(last) => self
                .high_watermark
                .value()
                .saturating_sub(1)
                .saturating_sub(last.value())
                .max(0),
            None => 0,
        }
    }

    pub fn offset_lag_low(&self) -> i64 {
        match self.first_offset() {
            Some(first) => self
                .high_watermark
                .value()
                .saturating_sub(1)
                .saturating_sub(first.value())
                .max(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TopicPartition {
        TopicPartition::new("events", 0)
    }

    fn message(offset: i64) -> Message {
        Message::new(Offset::new(offset), Some(Bytes::from(format!("msg{offset}"))))
    }

    #[test]
    fn test_offset_travels_as_decimal_string() {
        let offset = Offset::new(9_007_199_254_740_993);
        let json = serde_json::to_string(&offset).unwrap();
        assert_eq!(json, "\"9007199254740993\"");

        let parsed: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, offset);
        assert!(serde_json::from_str::<Offset>("\"not-a-number\"").is_err());
    }

    #[test]
    fn test_offset_lag_at_offset_extremes() {
        let batch = Batch::new(
            tp(),
            Offset::new(i64::MIN),
            Offset::new(i64::MIN),
            vec![message(i64::MAX)],
        );
        assert_eq!(batch.offset_lag(), 0);
        assert_eq!(batch.offset_lag_low(), 0);

        let batch = Batch::new(
            tp(),
            Offset::new(i64::MIN),
            Offset::new(i64::MAX),
            vec![message(i64::MIN)],
        );
        assert_eq!(batch.offset_lag(), i64::MAX);
    }

    #[test]
    fn test_offset_parse_and_next() {
        let offset: Offset = "41".parse().unwrap();
        assert_eq!(offset.next(), Offset::new(42));
        assert_eq!(offset.next().prev(), offset);
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(tp().to_string(), "events:0");
    }

    #[test]
    fn test_empty_batch_has_no_offsets() {
        let batch = Batch::empty(tp(), Offset::new(10), Offset::new(10));

        assert!(batch.is_empty());
        assert!(batch.is_empty_including_filtered());
        assert_eq!(batch.first_offset(), None);
        assert_eq!(batch.last_offset(), None);
        assert_eq!(batch.offset_lag(), 0);
    }

    #[test]
    fn test_batch_drops_messages_below_fetch_offset() {
        let batch = Batch::new(
            tp(),
            Offset::new(12),
            Offset::new(20),
            (10..15).map(message).collect(),
        );

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_offset(), Some(Offset::new(12)));
        assert_eq!(batch.last_offset(), Some(Offset::new(14)));
        assert!(!batch.is_empty_including_filtered());
    }

    #[test]
    fn test_batch_with_only_stale_data_has_no_first_offset() {
        let batch = Batch::new(
            tp(),
            Offset::new(20),
            Offset::new(20),
            (10..15).map(message).collect(),
        );

        assert!(batch.is_empty());
        assert!(!batch.is_empty_including_filtered());
        assert_eq!(batch.first_offset(), None);
    }

    #[test]
    fn test_batch_lag() {
        let batch = Batch::new(
            tp(),
            Offset::new(0),
            Offset::new(100),
            (0..10).map(message).collect(),
        );

        assert_eq!(batch.offset_lag(), 90);
        assert_eq!(batch.offset_lag_low(), 99);
    }

    #[test]
    fn test_tombstone() {
        let tombstone = Message::new(Offset::new(3), None).with_key("user-1");
        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.key, Some(Bytes::from("user-1")));
    }
}
