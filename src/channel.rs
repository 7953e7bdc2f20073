//! Named, ordered, replayable event channels.
//!
//! Every event published on a channel gets the next sequence number of that channel and a
//! timestamp that never goes backwards, so `(timestamp, sequence)` orders a channel's events
//! totally. That pair is the [`Cursor`] a subscriber resumes from.
//!
//! Each channel retains a bounded window of recent events in memory. A subscriber can attach
//! to live events only ([`EventChannel::subscribe`]), replay the last few retained events first
//! ([`EventChannel::subscribe_with_history`]), or replay everything after a cursor
//! ([`EventChannel::subscribe_from_cursor`]). Events that fell out of the window are read from
//! the [`ChannelPersistence`] collaborator, if one is configured.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::broadcast;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{config::ChannelConfig, metrics::ChannelMetrics};

mod subscription;

pub use self::subscription::Subscription;

/// A position in a channel's event log.
///
/// Cursors order by timestamp first, then by sequence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cursor {
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Per-channel sequence number.
    pub sequence: u64,
}

/// An event published on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubEvent<T> {
    /// Unique id of the event, `{channel}:{sequence}`.
    pub id: String,
    /// Name of the channel the event was published on.
    pub channel: String,
    /// Milliseconds since the unix epoch, never lower than the previous event's.
    pub timestamp: u64,
    /// Per-channel sequence number, starting at 1 and never reused.
    pub sequence: u64,
    /// The published value.
    pub payload: T,
}

impl<T> PubSubEvent<T> {
    /// Returns the cursor pointing at this event.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

/// Diagnostics for a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel name.
    pub name: String,
    /// Number of events retained in memory.
    pub retained: usize,
    /// Number of events ever published on this channel.
    pub published: u64,
    /// Number of live subscribers.
    pub subscribers: usize,
    /// Id of the oldest retained event.
    pub first_id: Option<String>,
    /// Id of the newest retained event.
    pub last_id: Option<String>,
    /// Cursor of the newest event dropped by retention.
    pub trimmed_through: Option<Cursor>,
}

/// Channel errors
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ChannelError {
    #[snafu(display("Subscriber fell behind and missed {missed} events"))]
    Lagged { missed: u64 },
    #[snafu(display("Channel persistence failed: {message}"))]
    Persistence { message: String },
}

impl ChannelError {
    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        PersistenceSnafu {
            message: message.into(),
        }
        .build()
    }
}

/// Durable storage mirroring published events.
///
/// Writes are issued fire-and-forget after an event has been published, and are not ordered
/// with respect to each other.
pub trait ChannelPersistence<T>: std::fmt::Debug + Send + Sync + 'static {
    /// Stores an event.
    fn write(&self, event: PubSubEvent<T>) -> BoxFuture<Result<(), ChannelError>>;

    /// Returns the stored events of `channel` strictly after `cursor`, in cursor order.
    fn read_after(
        &self,
        channel: &str,
        cursor: Cursor,
    ) -> BoxFuture<Result<Vec<PubSubEvent<T>>, ChannelError>>;
}

/// Process-wide set of event channels.
///
/// This is a cheaply cloneable handle; clones share the same channels.
pub struct EventChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("config", &self.inner.config)
            .field("persistence", &self.inner.persistence.is_some())
            .finish_non_exhaustive()
    }
}

struct Inner<T> {
    channels: Mutex<HashMap<String, ChannelLog<T>>>,
    persistence: Option<Arc<dyn ChannelPersistence<T>>>,
    config: ChannelConfig,
    metrics: Arc<ChannelMetrics>,
}

struct ChannelLog<T> {
    next_sequence: u64,
    last: Option<Cursor>,
    trimmed_through: Option<Cursor>,
    events: VecDeque<PubSubEvent<T>>,
    sender: broadcast::Sender<PubSubEvent<T>>,
}

impl<T: Clone> ChannelLog<T> {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            next_sequence: 1,
            last: None,
            trimmed_through: None,
            events: VecDeque::new(),
            sender,
        }
    }

    /// Drops the oldest events while `drop` returns true, returning how many were dropped.
    fn trim_while(&mut self, mut drop: impl FnMut(&PubSubEvent<T>, usize) -> bool) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.events.front() {
            if !drop(front, self.events.len()) {
                break;
            }
            if let Some(event) = self.events.pop_front() {
                self.trimmed_through = Some(event.cursor());
                dropped += 1;
            }
        }
        dropped
    }

    fn retained_after(&self, cursor: Option<Cursor>) -> Vec<PubSubEvent<T>> {
        self.events
            .iter()
            .filter(|event| cursor.is_none_or(|cursor| event.cursor() > cursor))
            .cloned()
            .collect()
    }

    /// Returns true if every event after `cursor` is still retained.
    fn covers(&self, cursor: Option<Cursor>) -> bool {
        match (self.trimmed_through, cursor) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(trimmed), Some(cursor)) => cursor >= trimmed,
        }
    }
}

/// What a new subscriber sees, captured under one lock.
struct Snapshot<T> {
    replay: Vec<PubSubEvent<T>>,
    receiver: broadcast::Receiver<PubSubEvent<T>>,
    last: Option<Cursor>,
    first_retained: Option<Cursor>,
    covered: bool,
    published: bool,
}

impl<T> EventChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty set of channels.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                persistence: None,
                config,
                metrics: Default::default(),
            }),
        }
    }

    /// Mirrors every published event to `persistence`.
    ///
    /// # Panics
    ///
    /// Panics if the channel has already been cloned.
    pub fn with_persistence(mut self, persistence: Arc<dyn ChannelPersistence<T>>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("persistence must be set before the channel is shared")
            .persistence = Some(persistence);
        self
    }

    /// Shares a metrics group with other components.
    ///
    /// # Panics
    ///
    /// Panics if the channel has already been cloned.
    pub fn with_metrics(mut self, metrics: Arc<ChannelMetrics>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("metrics must be set before the channel is shared")
            .metrics = metrics;
        self
    }

    /// Returns the config of this channel set.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Returns the metrics of this channel set.
    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.inner.metrics
    }

    /// Publishes `payload` on `channel` and returns the resulting event.
    ///
    /// The sequence number is assigned and the event appended before this returns, so events
    /// published back to back from one task are always ordered. The write to the persistence
    /// collaborator, if any, happens in the background.
    pub fn publish(&self, channel: &str, payload: T) -> PubSubEvent<T> {
        let event = {
            let mut channels = self.inner.channels.lock().expect("poisoned");
            let log = channels
                .entry(channel.to_string())
                .or_insert_with(|| ChannelLog::new(self.inner.config.subscriber_capacity));
            let sequence = log.next_sequence;
            log.next_sequence += 1;
            let timestamp = log
                .last
                .map_or(0, |last| last.timestamp)
                .max(now_millis());
            let event = PubSubEvent {
                id: format!("{channel}:{sequence}"),
                channel: channel.to_string(),
                timestamp,
                sequence,
                payload,
            };
            log.last = Some(event.cursor());
            log.events.push_back(event.clone());
            let max_retained = self.inner.config.max_retained;
            let trimmed = log.trim_while(|_, len| len > max_retained);
            self.inner.metrics.events_trimmed.inc_by(trimmed as u64);
            // No receivers is fine.
            log.sender.send(event.clone()).ok();
            event
        };
        self.inner.metrics.events_published.inc();
        trace!(channel, sequence = event.sequence, "published");
        self.persist(&event);
        event
    }

    fn persist(&self, event: &PubSubEvent<T>) {
        let Some(persistence) = self.inner.persistence.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(id = %event.id, "no runtime, event not persisted");
            self.inner.metrics.persist_failures.inc();
            return;
        };
        let metrics = self.inner.metrics.clone();
        let event = event.clone();
        let span = error_span!("channel-persist", id = %event.id);
        handle.spawn(
            async move {
                if let Err(err) = persistence.write(event).await {
                    warn!(%err, "failed to persist event");
                    metrics.persist_failures.inc();
                }
            }
            .instrument(span),
        );
    }

    /// Captures the replay and a live receiver under one lock, so no event is missed or
    /// delivered twice between the two.
    fn snapshot(
        &self,
        channel: &str,
        replay: impl FnOnce(&ChannelLog<T>) -> (Vec<PubSubEvent<T>>, bool),
    ) -> Snapshot<T> {
        let mut channels = self.inner.channels.lock().expect("poisoned");
        let log = channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelLog::new(self.inner.config.subscriber_capacity));
        let (events, covered) = replay(log);
        Snapshot {
            replay: events,
            receiver: log.sender.subscribe(),
            last: log.last,
            first_retained: log.events.front().map(PubSubEvent::cursor),
            covered,
            published: log.next_sequence > 1,
        }
    }

    fn subscription(&self, channel: &str, snapshot: Snapshot<T>) -> Subscription<T> {
        self.inner
            .metrics
            .events_replayed
            .inc_by(snapshot.replay.len() as u64);
        Subscription::new(
            self.clone(),
            channel.to_string(),
            snapshot.replay,
            snapshot.receiver,
            snapshot.last,
        )
    }

    /// Subscribes to events published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> Subscription<T> {
        let snapshot = self.snapshot(channel, |_| (Vec::new(), true));
        debug!(channel, "subscribed");
        self.subscription(channel, snapshot)
    }

    /// Subscribes to `channel`, replaying the last `last_n` retained events first.
    pub fn subscribe_with_history(&self, channel: &str, last_n: usize) -> Subscription<T> {
        let snapshot = self.snapshot(channel, |log| {
            let skip = log.events.len().saturating_sub(last_n);
            (log.events.iter().skip(skip).cloned().collect(), true)
        });
        debug!(channel, replay = snapshot.replay.len(), "subscribed with history");
        self.subscription(channel, snapshot)
    }

    /// Subscribes to `channel`, replaying every event strictly after `cursor` first.
    ///
    /// Events that are no longer retained in memory are read from the persistence
    /// collaborator. Without one, the replay starts at the oldest retained event.
    pub async fn subscribe_from_cursor(
        &self,
        channel: &str,
        cursor: Cursor,
    ) -> Result<Subscription<T>, ChannelError> {
        let mut snapshot = self.snapshot(channel, |log| {
            let covered = log.next_sequence > 1 && log.covers(Some(cursor));
            (log.retained_after(Some(cursor)), covered)
        });
        if !snapshot.covered {
            match &self.inner.persistence {
                Some(persistence) => {
                    let first_retained = snapshot.first_retained;
                    let last = snapshot.last;
                    let mut tail: Vec<_> = persistence
                        .read_after(channel, cursor)
                        .await?
                        .into_iter()
                        .filter(|event| {
                            let at = event.cursor();
                            at > cursor
                                && first_retained.is_none_or(|first| at < first)
                                && last.is_none_or(|last| at <= last)
                        })
                        .collect();
                    trace!(channel, tail = tail.len(), "read persisted tail");
                    tail.append(&mut snapshot.replay);
                    snapshot.replay = tail;
                }
                None if snapshot.published => {
                    warn!(channel, ?cursor, "cursor is older than the retained window");
                }
                None => {}
            }
        }
        debug!(channel, ?cursor, replay = snapshot.replay.len(), "subscribed from cursor");
        Ok(self.subscription(channel, snapshot))
    }

    /// Returns the retained events after `cursor`, and whether they are all events after it.
    pub(crate) fn recover(&self, channel: &str, cursor: Option<Cursor>) -> (Vec<PubSubEvent<T>>, bool) {
        let channels = self.inner.channels.lock().expect("poisoned");
        match channels.get(channel) {
            Some(log) => (log.retained_after(cursor), log.covers(cursor)),
            None => (Vec::new(), false),
        }
    }

    /// Returns diagnostics for `channel`.
    pub fn info(&self, channel: &str) -> Option<ChannelInfo> {
        let channels = self.inner.channels.lock().expect("poisoned");
        let log = channels.get(channel)?;
        Some(ChannelInfo {
            name: channel.to_string(),
            retained: log.events.len(),
            published: log.next_sequence - 1,
            subscribers: log.sender.receiver_count(),
            first_id: log.events.front().map(|event| event.id.clone()),
            last_id: log.events.back().map(|event| event.id.clone()),
            trimmed_through: log.trimmed_through,
        })
    }

    /// Lists the names of all channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .channels
            .lock()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Trims `channel` to its newest `keep` events, returning how many were dropped.
    pub fn cleanup_channel(&self, channel: &str, keep: usize) -> usize {
        let mut channels = self.inner.channels.lock().expect("poisoned");
        let Some(log) = channels.get_mut(channel) else {
            return 0;
        };
        let trimmed = log.trim_while(|_, len| len > keep);
        self.inner.metrics.events_trimmed.inc_by(trimmed as u64);
        trimmed
    }

    /// Enforces retention on every channel, returning how many events were dropped.
    ///
    /// Drops events beyond the size limit and events older than the age limit, then removes
    /// channels that retain no events and have no subscribers.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(now_millis())
    }

    fn cleanup_at(&self, now: u64) -> usize {
        let max_retained = self.inner.config.max_retained;
        let max_age = u64::try_from(self.inner.config.max_age.as_millis()).unwrap_or(u64::MAX);
        let mut channels = self.inner.channels.lock().expect("poisoned");
        let mut trimmed = 0;
        for log in channels.values_mut() {
            trimmed += log.trim_while(|event, len| {
                len > max_retained || now.saturating_sub(event.timestamp) > max_age
            });
        }
        let before = channels.len();
        channels.retain(|_, log| !log.events.is_empty() || log.sender.receiver_count() > 0);
        let removed = before - channels.len();
        drop(channels);
        self.inner.metrics.events_trimmed.inc_by(trimmed as u64);
        if trimmed > 0 || removed > 0 {
            debug!(trimmed, removed, "channel cleanup");
        }
        trimmed
    }

    /// Spawns a task running [`Self::cleanup`] at the configured interval.
    ///
    /// The task stops when the returned handle is dropped, or once every handle to this channel
    /// set is gone.
    pub fn spawn_cleanup(&self) -> AbortOnDropHandle<()> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval;
        let task = tokio::task::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    EventChannel { inner }.cleanup();
                }
            }
            .instrument(error_span!("channel-cleanup")),
        );
        AbortOnDropHandle::new(task)
    }

    /// Removes every channel.
    ///
    /// Live subscriptions end after delivering what they already received.
    pub fn teardown(&self) {
        let mut channels = self.inner.channels.lock().expect("poisoned");
        debug!(channels = channels.len(), "teardown");
        channels.clear();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use n0_snafu::Result;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;

    fn channel() -> EventChannel<&'static str> {
        EventChannel::new(ChannelConfig::default())
    }

    #[derive(Debug, Clone)]
    struct Pinned(&'static str, std::marker::PhantomPinned);

    #[tokio::test]
    async fn payloads_need_not_be_unpin() -> Result {
        let channel = EventChannel::new(ChannelConfig::default());
        channel.publish("x", Pinned("a", std::marker::PhantomPinned));
        let mut sub = channel.subscribe_with_history("x", 1);
        let event = sub.next().await.expect("channel open")?;
        assert_eq!(event.payload.0, "a");
        channel.publish("x", Pinned("b", std::marker::PhantomPinned));
        let event = sub.next().await.expect("channel open")?;
        assert_eq!(event.payload.0, "b");
        Ok(())
    }

    async fn next<T: Clone + Send + Sync + 'static>(sub: &mut Subscription<T>) -> PubSubEvent<T> {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("stream error")
    }

    fn payloads<'a, T: Clone + 'a>(events: impl Iterator<Item = &'a PubSubEvent<T>>) -> Vec<T> {
        events.map(|event| event.payload.clone()).collect()
    }

    #[tokio::test]
    async fn publish_assigns_ordered_cursors() {
        let channel = channel();
        let events: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|payload| channel.publish("x", payload))
            .collect();
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(events.windows(2).all(|w| w[0].cursor() < w[1].cursor()));
        assert_eq!(events[1].id, "x:2");
        // Sequences are per channel.
        assert_eq!(channel.publish("y", "d").sequence, 1);
    }

    #[tokio::test]
    async fn live_subscription_only_sees_future_events() {
        let channel = channel();
        channel.publish("x", "old");
        let mut sub = channel.subscribe("x");
        channel.publish("x", "new");
        assert_eq!(next(&mut sub).await.payload, "new");
    }

    #[tokio::test]
    async fn replays_strictly_after_cursor_then_continues_live() -> Result {
        let channel = channel();
        let e1 = channel.publish("X", "e1");
        channel.publish("X", "e2");
        channel.publish("X", "e3");
        let mut sub = channel.subscribe_from_cursor("X", e1.cursor()).await?;
        assert_eq!(next(&mut sub).await.payload, "e2");
        assert_eq!(next(&mut sub).await.payload, "e3");
        channel.publish("X", "e4");
        assert_eq!(next(&mut sub).await.payload, "e4");
        Ok(())
    }

    #[tokio::test]
    async fn replay_from_every_cursor_is_gapless() -> Result {
        let channel = channel();
        let events: Vec<_> = (0..6).map(|_| channel.publish("x", "e")).collect();
        for (index, event) in events.iter().enumerate() {
            let sub = channel.subscribe_from_cursor("x", event.cursor()).await?;
            let replayed: Vec<u64> = sub.pending().map(|e| e.sequence).collect();
            let expected: Vec<u64> = events[index + 1..].iter().map(|e| e.sequence).collect();
            assert_eq!(replayed, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn history_replays_last_n() {
        let channel = channel();
        for payload in ["a", "b", "c"] {
            channel.publish("x", payload);
        }
        let mut sub = channel.subscribe_with_history("x", 2);
        assert_eq!(next(&mut sub).await.payload, "b");
        assert_eq!(next(&mut sub).await.payload, "c");
        channel.publish("x", "d");
        assert_eq!(next(&mut sub).await.payload, "d");
        assert_eq!(channel.metrics().events_replayed.get(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn lagging_subscriber_recovers_from_the_log() {
        let channel = EventChannel::new(ChannelConfig {
            subscriber_capacity: 2,
            ..Default::default()
        });
        let mut sub = channel.subscribe("x");
        for payload in ["a", "b", "c", "d", "e"] {
            channel.publish("x", payload);
        }
        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(next(&mut sub).await.payload);
        }
        assert_eq!(received, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(channel.metrics().subscribers_lagged.get(), 1);
    }

    #[tokio::test]
    async fn lag_beyond_the_retained_window_is_reported() {
        let channel = EventChannel::new(ChannelConfig {
            subscriber_capacity: 2,
            max_retained: 2,
            ..Default::default()
        });
        let mut sub = channel.subscribe("x");
        for payload in ["a", "b", "c", "d", "e"] {
            channel.publish("x", payload);
        }
        let err = sub.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Lagged { missed: 3, .. }));
        assert_eq!(next(&mut sub).await.payload, "d");
        assert_eq!(next(&mut sub).await.payload, "e");
    }

    #[derive(Debug, Default)]
    struct MemoryPersistence {
        events: Mutex<Vec<PubSubEvent<&'static str>>>,
    }

    impl ChannelPersistence<&'static str> for MemoryPersistence {
        fn write(&self, event: PubSubEvent<&'static str>) -> BoxFuture<Result<(), ChannelError>> {
            self.events.lock().unwrap().push(event);
            Box::pin(async { Ok(()) })
        }

        fn read_after(
            &self,
            channel: &str,
            cursor: Cursor,
        ) -> BoxFuture<Result<Vec<PubSubEvent<&'static str>>, ChannelError>> {
            let mut events: Vec<_> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.channel == channel && event.cursor() > cursor)
                .cloned()
                .collect();
            events.sort_by_key(PubSubEvent::cursor);
            Box::pin(async move { Ok(events) })
        }
    }

    #[tokio::test]
    async fn old_cursors_replay_the_persisted_tail() -> Result {
        let persistence = Arc::new(MemoryPersistence::default());
        let channel = EventChannel::new(ChannelConfig {
            max_retained: 2,
            ..Default::default()
        })
        .with_persistence(persistence.clone());
        let events: Vec<_> = ["e1", "e2", "e3", "e4", "e5"]
            .into_iter()
            .map(|payload| channel.publish("x", payload))
            .collect();
        while persistence.events.lock().unwrap().len() < 5 {
            tokio::task::yield_now().await;
        }
        let sub = channel.subscribe_from_cursor("x", events[0].cursor()).await?;
        assert_eq!(payloads(sub.pending()), vec!["e2", "e3", "e4", "e5"]);

        // A channel unknown to this process is served from persistence alone.
        let fresh = EventChannel::new(ChannelConfig::default())
            .with_persistence(persistence.clone());
        let sub = fresh.subscribe_from_cursor("x", events[2].cursor()).await?;
        assert_eq!(payloads(sub.pending()), vec!["e4", "e5"]);
        Ok(())
    }

    #[tokio::test]
    async fn info_and_retention() {
        let channel = channel();
        for payload in ["a", "b", "c", "d"] {
            channel.publish("x", payload);
        }
        let info = channel.info("x").unwrap();
        assert_eq!(info.retained, 4);
        assert_eq!(info.published, 4);
        assert_eq!(info.first_id.as_deref(), Some("x:1"));
        assert_eq!(info.last_id.as_deref(), Some("x:4"));

        assert_eq!(channel.cleanup_channel("x", 1), 3);
        let info = channel.info("x").unwrap();
        assert_eq!(info.retained, 1);
        assert_eq!(info.first_id.as_deref(), Some("x:4"));
        assert_eq!(info.trimmed_through.map(|c| c.sequence), Some(3));
        assert_eq!(channel.cleanup_channel("missing", 1), 0);
        assert!(channel.info("missing").is_none());
    }

    #[tokio::test]
    async fn cleanup_drops_old_events_and_idle_channels() {
        let channel = EventChannel::new(ChannelConfig {
            max_age: Duration::from_secs(60),
            ..Default::default()
        });
        let event = channel.publish("old", "a");
        let _sub = channel.subscribe("watched");
        assert_eq!(channel.cleanup_at(event.timestamp + 1_000), 0);
        assert_eq!(channel.channels(), vec!["old".to_string(), "watched".to_string()]);
        assert_eq!(channel.cleanup_at(event.timestamp + 61_000), 1);
        assert_eq!(channel.channels(), vec!["watched".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_runs_on_interval() {
        let channel = EventChannel::new(ChannelConfig {
            max_retained: 1,
            cleanup_interval: Duration::from_secs(10),
            ..Default::default()
        });
        let _task = channel.spawn_cleanup();
        channel.publish("x", "a");
        // An idle channel with a retained event is kept.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(channel.channels(), vec!["x".to_string()]);
        channel.cleanup_channel("x", 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(channel.channels().is_empty());
    }

    #[tokio::test]
    async fn teardown_ends_subscriptions() {
        let channel = channel();
        let mut sub = channel.subscribe("x");
        channel.publish("x", "a");
        channel.teardown();
        assert_eq!(next(&mut sub).await.payload, "a");
        assert!(sub.next().await.is_none());
        assert!(channel.channels().is_empty());
    }
}
