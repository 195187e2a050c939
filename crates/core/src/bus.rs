//! In-process message bus.
//!
//! Every topic is an append-only log; every consumer group keeps a committed
//! offset per topic. `poll` returns the first record past the committed
//! offset and keeps returning it until it is acked, which gives the same
//! at-least-once contract as the Postgres-backed bus.
//!
//! Records every registered group of a topic has acked are dropped, so a
//! topic retains only what its slowest group still has to consume. A group
//! registered after records were dropped starts at the oldest retained one.

use crate::events::Topic;
use crate::traits::{BusPublisher, BusRecord, BusSubscriber};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Retained tail of a topic. `base` is the offset of `records[0]`.
#[derive(Default)]
struct TopicLog {
    base: usize,
    records: VecDeque<serde_json::Value>,
}

#[derive(Default)]
struct BusInner {
    logs: Mutex<HashMap<Topic, TopicLog>>,
    offsets: Mutex<HashMap<(String, Topic), usize>>,
    published: Notify,
}

/// Cloneable handle to a shared in-memory bus.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `consumer_group` on `topic` and creates a consumer that
    /// resumes from the group's committed offset.
    #[must_use]
    pub fn subscriber(&self, consumer_group: &str, topic: Topic) -> InMemorySubscriber {
        let base = self
            .inner
            .logs
            .lock()
            .get(&topic)
            .map_or(0, |log| log.base);
        self.inner
            .offsets
            .lock()
            .entry((consumer_group.to_string(), topic))
            .or_insert(base);

        InMemorySubscriber {
            bus: self.clone(),
            consumer_group: consumer_group.to_string(),
            topic,
            closed: false,
        }
    }

    /// Snapshot of the payloads still retained on `topic`, oldest first.
    #[must_use]
    pub fn messages(&self, topic: Topic) -> Vec<serde_json::Value> {
        self.inner
            .logs
            .lock()
            .get(&topic)
            .map(|log| log.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn committed(&self, consumer_group: &str, topic: Topic) -> usize {
        self.inner
            .offsets
            .lock()
            .get(&(consumer_group.to_string(), topic))
            .copied()
            .unwrap_or(0)
    }

    fn record_at(&self, topic: Topic, offset: usize) -> Option<BusRecord> {
        let logs = self.inner.logs.lock();
        let log = logs.get(&topic)?;
        let offset = offset.max(log.base);
        let payload = log.records.get(offset - log.base)?.clone();
        Some(BusRecord {
            topic,
            offset: i64::try_from(offset).ok()?,
            payload,
        })
    }

    /// Drops records below the lowest committed offset of `topic`.
    fn compact(&self, topic: Topic) {
        let Some(lowest) = self
            .inner
            .offsets
            .lock()
            .iter()
            .filter(|((_, t), _)| *t == topic)
            .map(|(_, offset)| *offset)
            .min()
        else {
            return;
        };

        let mut logs = self.inner.logs.lock();
        if let Some(log) = logs.get_mut(&topic) {
            let consumed = lowest.saturating_sub(log.base).min(log.records.len());
            log.records.drain(..consumed);
            log.base += consumed;
        }
    }
}

#[async_trait]
impl BusPublisher for InMemoryBus {
    async fn publish(&self, topic: Topic, payload: &serde_json::Value) -> Result<()> {
        self.inner
            .logs
            .lock()
            .entry(topic)
            .or_default()
            .records
            .push_back(payload.clone());
        self.inner.published.notify_waiters();
        tracing::trace!(%topic, "Published to in-memory bus");
        Ok(())
    }
}

pub struct InMemorySubscriber {
    bus: InMemoryBus,
    consumer_group: String,
    topic: Topic,
    closed: bool,
}

#[async_trait]
impl BusSubscriber for InMemorySubscriber {
    fn topic(&self) -> Topic {
        self.topic
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusRecord>> {
        if self.closed {
            anyhow::bail!("Subscriber for {} is closed", self.topic);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking so a publish in between is not missed.
            let published = self.bus.inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            let offset = self.bus.committed(&self.consumer_group, self.topic);
            if let Some(record) = self.bus.record_at(self.topic, offset) {
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, record: &BusRecord) -> Result<()> {
        let next = usize::try_from(record.offset)? + 1;
        {
            let mut offsets = self.bus.inner.offsets.lock();
            let committed = offsets
                .entry((self.consumer_group.clone(), record.topic))
                .or_insert(0);
            *committed = (*committed).max(next);
        }
        self.bus.compact(record.topic);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unacked_record_is_redelivered() {
        let bus = InMemoryBus::new();
        bus.publish(Topic::Signals, &json!({"n": 1})).await.unwrap();
        bus.publish(Topic::Signals, &json!({"n": 2})).await.unwrap();

        let mut sub = bus.subscriber("oms", Topic::Signals);
        let first = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        let again = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first, again);

        sub.ack(&first).await.unwrap();
        let second = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.payload, json!({"n": 2}));
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn test_consumer_groups_and_topics_are_independent() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscriber("a", Topic::MarketData);
        let mut b = bus.subscriber("b", Topic::MarketData);
        bus.publish(Topic::MarketData, &json!("candle")).await.unwrap();

        let record = a.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        a.ack(&record).await.unwrap();
        assert!(a.poll(Duration::from_millis(10)).await.unwrap().is_none());
        assert!(b.poll(Duration::from_millis(10)).await.unwrap().is_some());

        let mut other_topic = bus.subscriber("a", Topic::Signals);
        assert!(other_topic
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_restarted_subscriber_resumes_from_committed_offset() {
        let bus = InMemoryBus::new();
        for n in 0..3 {
            bus.publish(Topic::MarketData, &json!(n)).await.unwrap();
        }

        let mut sub = bus.subscriber("ta", Topic::MarketData);
        let record = sub.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        sub.ack(&record).await.unwrap();
        sub.close().await.unwrap();
        assert!(sub.poll(Duration::from_millis(10)).await.is_err());

        let mut restarted = bus.subscriber("ta", Topic::MarketData);
        let record = restarted
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, json!(1));
    }

    #[tokio::test]
    async fn test_records_are_dropped_once_every_group_acked() {
        let bus = InMemoryBus::new();
        let mut fast = bus.subscriber("fast", Topic::MarketData);
        let mut slow = bus.subscriber("slow", Topic::MarketData);
        for n in 0..3 {
            bus.publish(Topic::MarketData, &json!(n)).await.unwrap();
        }

        for _ in 0..3 {
            let record = fast.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            fast.ack(&record).await.unwrap();
        }
        assert_eq!(bus.messages(Topic::MarketData).len(), 3);

        let record = slow.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        slow.ack(&record).await.unwrap();
        assert_eq!(bus.messages(Topic::MarketData), vec![json!(1), json!(2)]);

        // Offsets keep counting past dropped records.
        bus.publish(Topic::MarketData, &json!(3)).await.unwrap();
        let record = fast.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(record.offset, 3);
        assert_eq!(record.payload, json!(3));

        let record = slow.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(record.offset, 1);

        // A group registered late starts at the oldest retained record.
        let mut late = bus.subscriber("late", Topic::MarketData);
        let record = late.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(record.payload, json!(1));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscriber("sms", Topic::MarketIndicators);

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish(Topic::MarketIndicators, &json!({"ok": true}))
                .await
                .unwrap();
        });

        let record = sub.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.unwrap().payload, json!({"ok": true}));
        assert_eq!(bus.messages(Topic::MarketIndicators).len(), 1);
    }
}
