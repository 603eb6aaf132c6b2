//! Named routing points between steps.
//!
//! # Guarantees
//!
//! - **Exactly one consumer per message**: every published message is
//!   delivered to a single registered consumer
//! - **Deterministic routing**: the consumer is chosen from the message's
//!   lineage id, so a replayed message lands on the same consumer
//! - **Weighted fairness**: a consumer with weight `w` owns `w` slots of
//!   `[0, total_weight)`; a message goes to the owner of
//!   `routing_hash(id) % total_weight`
//! - **No drops**: a bounded stream suspends publishers instead of
//!   discarding messages
//!
//! Each stream feeds the pipeline's [`WorkTracker`]: publishing adds one
//! outstanding unit before the message becomes visible, and the
//! [`Delivery`] handed to the consumer releases it when dropped.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{CascadeError, Result};
use crate::lineage::{validate_step_name, LineageId};
use crate::message::Message;
use crate::tracker::{WorkGuard, WorkTracker};

// =============================================================================
// Bindings
// =============================================================================

/// A step port's attachment to a stream: `stream` or `stream:weight`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamBinding {
    /// Name of the stream.
    pub stream: String,
    /// Consumer weight, at least 1.
    pub weight: u32,
}

impl StreamBinding {
    /// Bind to `stream` with weight 1.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            weight: 1,
        }
    }

    /// Set the consumer weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Reject empty names and zero weights.
    pub fn validate(&self) -> Result<()> {
        validate_step_name(&self.stream).map_err(|_| {
            CascadeError::Config(format!("invalid stream name {:?}", self.stream))
        })?;
        if self.weight == 0 {
            return Err(CascadeError::Config(format!(
                "stream binding {:?} has weight 0; weights must be at least 1",
                self.stream
            )));
        }
        Ok(())
    }
}

impl FromStr for StreamBinding {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self> {
        let binding = match s.rsplit_once(':') {
            Some((stream, weight)) => {
                let weight = weight.parse::<u32>().map_err(|_| {
                    CascadeError::Config(format!("invalid weight in stream binding {s:?}"))
                })?;
                StreamBinding::new(stream).with_weight(weight)
            }
            None => StreamBinding::new(s),
        };
        binding.validate()?;
        Ok(binding)
    }
}

impl TryFrom<String> for StreamBinding {
    type Error = CascadeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StreamBinding> for String {
    fn from(binding: StreamBinding) -> Self {
        binding.to_string()
    }
}

impl fmt::Display for StreamBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weight == 1 {
            f.write_str(&self.stream)
        } else {
            write!(f, "{}:{}", self.stream, self.weight)
        }
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Handle to a registered consumer of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(usize);

/// A claimed message plus the outstanding unit it carries.
///
/// Dropping the delivery releases the unit, so it must be held until every
/// output derived from the message has been published.
pub struct Delivery {
    /// The claimed message.
    pub message: Message,
    guard: WorkGuard,
}

impl Delivery {
    /// Split into the message and its work guard.
    pub fn into_parts(self) -> (Message, WorkGuard) {
        (self.message, self.guard)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.message.id.to_string())
            .finish()
    }
}

// =============================================================================
// Stream
// =============================================================================

struct ConsumerSlot {
    name: String,
    weight: u32,
    start: u64,
    queue: VecDeque<Message>,
    claimed: u64,
}

#[derive(Default)]
struct StreamState {
    consumers: Vec<ConsumerSlot>,
    total_weight: u64,
    pending: usize,
    published: u64,
    closed: bool,
}

impl StreamState {
    fn route(&self, id: &LineageId) -> usize {
        let point = id.routing_hash() % self.total_weight;
        self.consumers
            .iter()
            .position(|c| point < c.start + u64::from(c.weight))
            .unwrap_or(self.consumers.len() - 1)
    }
}

/// Per-consumer view in [`StreamStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Registered consumer name (usually the step name).
    pub name: String,
    /// Consumer weight.
    pub weight: u32,
    /// Messages routed to this consumer and not yet claimed.
    pub pending: usize,
    /// Messages this consumer has claimed.
    pub claimed: u64,
}

/// Point-in-time counters for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    /// Stream name.
    pub name: String,
    /// Messages waiting to be claimed.
    pub pending: usize,
    /// Messages ever published.
    pub published: u64,
    /// Whether the stream refuses new messages.
    pub closed: bool,
    /// Per-consumer breakdown, in registration order.
    pub consumers: Vec<ConsumerStats>,
}

/// A named, weighted, optionally bounded message queue.
pub struct Stream {
    name: String,
    capacity: Option<usize>,
    state: Mutex<StreamState>,
    available: Notify,
    space: Notify,
    tracker: Arc<WorkTracker>,
    shutdown: CancellationToken,
}

impl Stream {
    /// Create an unbounded stream.
    pub fn new(name: impl Into<String>, tracker: Arc<WorkTracker>, shutdown: CancellationToken) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            state: Mutex::new(StreamState::default()),
            available: Notify::new(),
            space: Notify::new(),
            tracker,
            shutdown,
        }
    }

    /// Bound the number of pending messages; publishers suspend when full.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        // Critical sections never panic midway; recover the data as-is
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer owning `weight` routing slots.
    ///
    /// Registration is only allowed before the first publish, since it
    /// changes where existing ids route.
    pub fn register_consumer(&self, name: impl Into<String>, weight: u32) -> Result<ConsumerId> {
        let name = name.into();
        if weight == 0 {
            return Err(CascadeError::topology(format!(
                "consumer {name} of stream {} has weight 0",
                self.name
            )));
        }

        let mut state = self.state();
        if state.published > 0 {
            return Err(CascadeError::topology(format!(
                "cannot register consumer {name} on stream {} after messages were published",
                self.name
            )));
        }
        if state.consumers.iter().any(|c| c.name == name) {
            return Err(CascadeError::topology(format!(
                "consumer {name} registered twice on stream {}",
                self.name
            )));
        }

        let start = state.total_weight;
        state.consumers.push(ConsumerSlot {
            name,
            weight,
            start,
            queue: VecDeque::new(),
            claimed: 0,
        });
        state.total_weight += u64::from(weight);
        Ok(ConsumerId(state.consumers.len() - 1))
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    /// Publish a message to the consumer that owns its id.
    ///
    /// Suspends while a bounded stream is full. Fails with
    /// [`CascadeError::StreamClosed`] after [`close_when_drained`], with a
    /// topology error when nobody consumes the stream, and with
    /// [`CascadeError::Shutdown`] if cancelled while suspended.
    ///
    /// [`close_when_drained`]: Stream::close_when_drained
    pub async fn publish(&self, message: Message) -> Result<()> {
        loop {
            let space = self.space.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return Err(CascadeError::StreamClosed {
                        stream: self.name.clone(),
                    });
                }
                if state.consumers.is_empty() {
                    return Err(CascadeError::topology(format!(
                        "stream {} has no consumers",
                        self.name
                    )));
                }

                let has_room = self.capacity.map_or(true, |cap| state.pending < cap);
                if has_room {
                    let slot = state.route(&message.id);
                    // Count the unit before the message becomes claimable
                    self.tracker.inc(1);
                    state.consumers[slot].queue.push_back(message);
                    state.pending += 1;
                    state.published += 1;
                    drop(state);
                    self.available.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = space => {}
                _ = self.shutdown.cancelled() => return Err(CascadeError::Shutdown),
            }
        }
    }

    /// Claim the next message routed to `consumer`.
    ///
    /// Suspends while the consumer's partition is empty. Returns `None`
    /// once shutdown has begun, or when the stream is closed and the
    /// partition drained.
    pub async fn claim(&self, consumer: ConsumerId) -> Result<Option<Delivery>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }

            let available = self.available.notified();
            {
                let mut state = self.state();
                let slot = state.consumers.get_mut(consumer.0).ok_or_else(|| {
                    CascadeError::topology(format!(
                        "unknown consumer {} on stream {}",
                        consumer.0, self.name
                    ))
                })?;

                if let Some(message) = slot.queue.pop_front() {
                    slot.claimed += 1;
                    state.pending -= 1;
                    drop(state);
                    self.space.notify_waiters();
                    return Ok(Some(Delivery {
                        message,
                        guard: WorkGuard::adopt(self.tracker.clone(), 1),
                    }));
                }

                if state.closed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = available => {}
                _ = self.shutdown.cancelled() => return Ok(None),
            }
        }
    }

    /// Refuse new messages; queued ones remain claimable.
    pub fn close_when_drained(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Messages waiting to be claimed.
    pub fn pending_len(&self) -> usize {
        self.state().pending
    }

    /// Whether nothing is waiting to be claimed.
    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    /// Snapshot of the stream's counters.
    pub fn stats(&self) -> StreamStats {
        let state = self.state();
        StreamStats {
            name: self.name.clone(),
            pending: state.pending,
            published: state.published,
            closed: state.closed,
            consumers: state
                .consumers
                .iter()
                .map(|c| ConsumerStats {
                    name: c.name.clone(),
                    weight: c.weight,
                    pending: c.queue.len(),
                    claimed: c.claimed,
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn stream(name: &str) -> (Stream, Arc<WorkTracker>, CancellationToken) {
        let tracker = Arc::new(WorkTracker::new());
        let shutdown = CancellationToken::new();
        (
            Stream::new(name, tracker.clone(), shutdown.clone()),
            tracker,
            shutdown,
        )
    }

    fn msg(index: u64) -> Message {
        Message::new(LineageId::root("gen", index).unwrap(), json!(index))
    }

    #[test]
    fn test_binding_parse() {
        assert_eq!("vars".parse::<StreamBinding>().unwrap(), StreamBinding::new("vars"));
        assert_eq!(
            "vars:3".parse::<StreamBinding>().unwrap(),
            StreamBinding::new("vars").with_weight(3)
        );
        assert!("vars:0".parse::<StreamBinding>().is_err());
        assert!("vars:x".parse::<StreamBinding>().is_err());
        assert!(":2".parse::<StreamBinding>().is_err());
        assert_eq!(StreamBinding::new("vars").with_weight(2).to_string(), "vars:2");
    }

    #[test]
    fn test_binding_serde_from_string() {
        let binding: StreamBinding = serde_json::from_value(json!("prompts:2")).unwrap();
        assert_eq!(binding.weight, 2);
        assert_eq!(serde_json::to_value(&binding).unwrap(), json!("prompts:2"));
    }

    #[test]
    fn test_register_rejects_zero_and_duplicates() {
        let (stream, _, _) = stream("vars");
        assert!(stream.register_consumer("a", 0).is_err());
        stream.register_consumer("a", 1).unwrap();
        assert!(stream.register_consumer("a", 2).is_err());
        assert_eq!(stream.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_consumers_is_topology_error() {
        let (stream, tracker, _) = stream("orphan");
        let err = stream.publish(msg(0)).await.unwrap_err();
        assert!(matches!(err, CascadeError::Topology(_)));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_publish_claim_tracks_work() {
        let (stream, tracker, _) = stream("vars");
        let consumer = stream.register_consumer("xform", 1).unwrap();

        stream.publish(msg(0)).await.unwrap();
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(stream.pending_len(), 1);

        let delivery = stream.claim(consumer).await.unwrap().unwrap();
        assert_eq!(delivery.message.payload, json!(0));
        assert!(stream.is_empty());
        assert_eq!(tracker.outstanding(), 1);

        drop(delivery);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_weighted_fairness_one_to_three() {
        let (stream, _, _) = stream("vars");
        stream.register_consumer("light", 1).unwrap();
        stream.register_consumer("heavy", 3).unwrap();

        for i in 0..4000 {
            stream.publish(msg(i)).await.unwrap();
        }

        let stats = stream.stats();
        let light = stats.consumers[0].pending as f64;
        let heavy = stats.consumers[1].pending as f64;
        assert_eq!(light + heavy, 4000.0);

        let share = heavy / 4000.0;
        assert!((0.72..=0.78).contains(&share), "heavy share was {share}");
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        let (first, _, _) = stream("vars");
        let (second, _, _) = stream("vars");
        for s in [&first, &second] {
            s.register_consumer("a", 2).unwrap();
            s.register_consumer("b", 1).unwrap();
            s.register_consumer("c", 4).unwrap();
        }

        for i in 0..200 {
            first.publish(msg(i)).await.unwrap();
            second.publish(msg(i)).await.unwrap();
        }

        assert_eq!(first.stats().consumers, second.stats().consumers);
    }

    #[tokio::test]
    async fn test_register_after_publish_is_rejected() {
        let (stream, _, _) = stream("vars");
        stream.register_consumer("a", 1).unwrap();
        stream.publish(msg(0)).await.unwrap();
        assert!(stream.register_consumer("b", 1).is_err());
    }

    #[tokio::test]
    async fn test_bounded_publish_waits_for_space() {
        let (stream, _, _) = stream("vars");
        let stream = Arc::new(stream.with_capacity(1));
        let consumer = stream.register_consumer("xform", 1).unwrap();

        stream.publish(msg(0)).await.unwrap();

        let publisher = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.publish(msg(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publisher.is_finished());
        assert_eq!(stream.pending_len(), 1);

        let first = stream.claim(consumer).await.unwrap().unwrap();
        assert_eq!(first.message.payload, json!(0));

        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .expect("publisher should resume")
            .unwrap()
            .unwrap();
        assert_eq!(stream.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_claim_wakes_on_publish() {
        let (stream, _, _) = stream("vars");
        let stream = Arc::new(stream);
        let consumer = stream.register_consumer("xform", 1).unwrap();

        let claimer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.claim(consumer).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.publish(msg(4)).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), claimer)
            .await
            .expect("claimer should wake")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.id.to_string(), "gen:count=4");
    }

    #[tokio::test]
    async fn test_close_keeps_pending_and_rejects_new() {
        let (stream, _, _) = stream("vars");
        let consumer = stream.register_consumer("xform", 1).unwrap();
        stream.publish(msg(0)).await.unwrap();
        stream.close_when_drained();

        let err = stream.publish(msg(1)).await.unwrap_err();
        assert!(matches!(err, CascadeError::StreamClosed { .. }));

        assert!(stream.claim(consumer).await.unwrap().is_some());
        assert!(stream.claim(consumer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_claims() {
        let (stream, _, shutdown) = stream("vars");
        let consumer = stream.register_consumer("xform", 1).unwrap();
        stream.publish(msg(0)).await.unwrap();

        shutdown.cancel();
        assert!(stream.claim(consumer).await.unwrap().is_none());
        assert_eq!(stream.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_consumer() {
        let (stream, _, _) = stream("vars");
        stream.register_consumer("xform", 1).unwrap();
        let err = stream.claim(ConsumerId(3)).await.unwrap_err();
        assert!(matches!(err, CascadeError::Topology(_)));
    }
}
