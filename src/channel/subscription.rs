use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::debug;

use super::{ChannelError, Cursor, EventChannel, LaggedSnafu, PubSubEvent};

/// Events of a single channel, in publication order.
///
/// Replayed events come first, then live ones. A subscriber that falls behind the live feed
/// catches up from the channel's retained log; only if the log no longer holds the missed
/// events does the stream yield [`ChannelError::Lagged`], and then continues with the oldest
/// retained event.
///
/// The stream ends when the channel is torn down.
pub struct Subscription<T> {
    channel: EventChannel<T>,
    name: String,
    replay: VecDeque<PubSubEvent<T>>,
    live: BroadcastStream<PubSubEvent<T>>,
    /// Cursor of the newest event delivered or queued for replay.
    last: Option<Cursor>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("replay", &self.replay.len())
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

// No field is structurally pinned.
impl<T> Unpin for Subscription<T> {}

impl<T> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(super) fn new(
        channel: EventChannel<T>,
        name: String,
        replay: Vec<PubSubEvent<T>>,
        receiver: broadcast::Receiver<PubSubEvent<T>>,
        high_water: Option<Cursor>,
    ) -> Self {
        let last = replay.last().map(PubSubEvent::cursor).max(high_water);
        Self {
            channel,
            name,
            replay: replay.into(),
            live: BroadcastStream::new(receiver),
            last,
        }
    }

    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the events queued for replay that have not been yielded yet.
    pub fn pending(&self) -> impl Iterator<Item = &PubSubEvent<T>> {
        self.replay.iter()
    }

    fn is_new(&self, event: &PubSubEvent<T>) -> bool {
        self.last.is_none_or(|last| event.cursor() > last)
    }

    /// Refills the replay queue from the retained log after the live feed overflowed.
    ///
    /// Returns false if events were lost for good.
    fn recover(&mut self) -> bool {
        let (events, complete) = self.channel.recover(&self.name, self.last);
        debug!(channel = %self.name, recovered = events.len(), complete, "subscriber lagged");
        if let Some(event) = events.last() {
            self.last = Some(event.cursor());
        }
        self.replay.extend(events);
        complete
    }
}

impl<T> Stream for Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = Result<PubSubEvent<T>, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.replay.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            match std::task::ready!(Pin::new(&mut self.live).poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Ok(event)) => {
                    // Already delivered through lag recovery.
                    if !self.is_new(&event) {
                        continue;
                    }
                    self.last = Some(event.cursor());
                    return Poll::Ready(Some(Ok(event)));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    self.channel.metrics().subscribers_lagged.inc();
                    if !self.recover() {
                        return Poll::Ready(Some(Err(LaggedSnafu { missed }.build())));
                    }
                }
            }
        }
    }
}
