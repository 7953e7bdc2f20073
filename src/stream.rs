//! Streaming mutations: running a provider's event stream for a chat session.
//!
//! The [`Orchestrator`] allows at most one live stream per session. Every event a provider
//! emits is published on the session's stream channel, folded into a
//! [`StreamingStateAccumulator`], and written to the [`SessionRepository`] when the state
//! changed. Writes are debounced, except on boundary events, which force a write, so a
//! subscriber attaching late can rebuild the current state from storage.
//!
//! Triggering a stream for a session that is already streaming queues the message instead.
//! The queue is drained after the running stream completes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures_util::StreamExt;
use n0_future::boxed::{BoxFuture, BoxStream};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, error_span, trace, warn};

use crate::{
    channel::{ChannelError, Cursor, EventChannel, Subscription},
    config::StreamConfig,
    metrics::StreamMetrics,
};

pub mod accumulator;

pub use self::accumulator::{
    AskState, PersistDebouncer, StreamingSnapshot, StreamingStateAccumulator, StreamingStatus,
    ToolState,
};

/// Message of the error event emitted when a stream is aborted.
pub const ABORTED_MESSAGE: &str = "stream aborted";

/// Result message of aborting a session without a live stream.
pub const NO_ACTIVE_STREAM: &str = "No active stream found";

/// Returns the channel carrying the live events of a session's stream.
pub fn stream_channel(session_id: &str) -> String {
    format!("session-stream:{session_id}")
}

/// Returns the channel carrying non-streaming lifecycle events of a session.
pub fn session_channel(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// An event emitted by a provider while producing a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ProviderEvent {
    /// The provider opened a session.
    SessionCreated {
        /// Provider side session id.
        session_id: String,
    },
    /// A new text block starts, replacing the previous text.
    TextStart,
    /// Text appended to the current block.
    TextDelta {
        /// The appended text.
        text: String,
    },
    /// The text block is complete.
    TextEnd,
    /// A new reasoning block starts.
    ReasoningStart,
    /// Reasoning appended to the current block.
    ReasoningDelta {
        /// The appended text.
        text: String,
    },
    /// The reasoning block is complete.
    ReasoningEnd,
    /// The model calls a tool.
    ToolCall {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Raw input received with the call.
        #[serde(default)]
        input: String,
    },
    /// Raw input appended to the current tool call.
    ToolInputDelta {
        /// The appended input.
        text: String,
    },
    /// A tool call returned.
    ToolResult {
        /// Tool call id.
        id: String,
        /// What the tool returned.
        #[serde(default)]
        output: Value,
    },
    /// A tool call failed.
    ToolError {
        /// Tool call id.
        id: String,
        /// Failure description.
        message: String,
    },
    /// The model asks the user a question and waits for the answer.
    AskQuestionStart {
        /// Question id.
        id: String,
        /// The question text.
        question: String,
        /// Suggested answers.
        #[serde(default)]
        options: Vec<String>,
    },
    /// The user answered the pending question.
    AskQuestionAnswered {
        /// Question id.
        id: String,
        /// The answer text.
        answer: String,
    },
    /// The stream failed. Terminal.
    Error {
        /// Failure description.
        message: String,
    },
    /// The stream finished. Terminal.
    Complete,
}

impl ProviderEvent {
    /// Returns true for events that force a persist.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            ProviderEvent::TextEnd
                | ProviderEvent::ReasoningEnd
                | ProviderEvent::ToolResult { .. }
                | ProviderEvent::ToolError { .. }
                | ProviderEvent::Error { .. }
                | ProviderEvent::Complete
        )
    }

    /// Returns true for events that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderEvent::Error { .. } | ProviderEvent::Complete)
    }
}

/// Session lifecycle events published by the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum LifecycleEvent {
    /// A stream started for the session, published on the stream channel.
    StreamStarted {
        /// The session.
        session_id: String,
    },
    /// A message was queued behind the live stream, published on the session channel.
    QueueMessageAdded {
        /// The session.
        session_id: String,
        /// Content of the queued message.
        content: String,
    },
}

/// An event published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum StreamEvent {
    /// Published by the orchestrator.
    Lifecycle(LifecycleEvent),
    /// Forwarded from the provider.
    Provider(ProviderEvent),
}

/// A user message starting or queued behind a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    /// The session the message belongs to.
    pub session_id: String,
    /// Message text.
    pub content: String,
    /// Opaque attachments, passed to the provider as is.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
}

impl UserMessage {
    /// Creates a message without attachments.
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

/// A write of a session's streaming state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistRequest {
    /// The session whose state is written.
    pub session_id: String,
    /// The state to store.
    pub snapshot: StreamingSnapshot,
    /// True if the write bypassed the debounce window.
    pub forced: bool,
}

/// The AI provider producing a response.
pub trait Provider: std::fmt::Debug + Send + Sync + 'static {
    /// Streams the response to `message`.
    ///
    /// The stream should end soon after `cancel` is cancelled. A stream that ends without a
    /// [`ProviderEvent::Complete`] or [`ProviderEvent::Error`] is treated as failed.
    fn stream(&self, message: UserMessage, cancel: CancellationToken) -> BoxStream<ProviderEvent>;
}

/// Durable storage of sessions.
pub trait SessionRepository: std::fmt::Debug + Send + Sync + 'static {
    /// Appends a message to the session's queue.
    fn enqueue_message(&self, message: UserMessage) -> BoxFuture<Result<(), OrchestratorError>>;

    /// Removes and returns the oldest queued message of a session.
    fn dequeue_message(
        &self,
        session_id: &str,
    ) -> BoxFuture<Result<Option<UserMessage>, OrchestratorError>> {
        let _ = session_id;
        Box::pin(async { Ok(None) })
    }

    /// Writes a session's streaming state.
    fn persist_streaming_state(
        &self,
        request: PersistRequest,
    ) -> BoxFuture<Result<(), OrchestratorError>> {
        let _ = request;
        Box::pin(async { Ok(()) })
    }
}

/// Orchestrator errors
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OrchestratorError {
    #[snafu(display("Session repository failed: {message}"))]
    Repository { message: String },
    #[snafu(display("A stream is already active for session {session_id}"))]
    StreamAlreadyActive { session_id: String },
    #[snafu(context(false), display("Event channel failed"))]
    Channel { source: ChannelError },
}

impl OrchestratorError {
    /// Creates a repository error.
    pub fn repository(message: impl Into<String>) -> Self {
        RepositorySnafu {
            message: message.into(),
        }
        .build()
    }
}

/// Outcome of [`Orchestrator::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerOutcome {
    /// A new stream was started.
    Started,
    /// A stream was already live, the message was queued.
    Queued,
}

impl TriggerOutcome {
    /// Returns true if the message was queued.
    pub fn is_queued(&self) -> bool {
        matches!(self, TriggerOutcome::Queued)
    }
}

/// Outcome of [`Orchestrator::abort`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortOutcome {
    /// True if a live stream was found.
    pub success: bool,
    /// Why nothing was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives provider streams for sessions.
///
/// This is a cheaply cloneable handle.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    provider: Arc<dyn Provider>,
    repository: Arc<dyn SessionRepository>,
    #[debug("EventChannel")]
    channel: EventChannel<StreamEvent>,
    config: StreamConfig,
    metrics: Arc<StreamMetrics>,
    #[debug("ActiveStreams")]
    active: Mutex<HashMap<String, ActiveStream>>,
    next_generation: Mutex<u64>,
    tasks: TaskTracker,
}

/// Registry entry of a live stream.
///
/// Only the task owning the entry removes it, once the stream has ended and the queue was
/// checked.
struct ActiveStream {
    generation: u64,
    cancel: CancellationToken,
    snapshot: watch::Receiver<StreamingSnapshot>,
    /// Set when a message was queued behind this entry, so a queue read that already
    /// started may have missed it.
    recheck_queue: bool,
}

/// Handed to the task running a stream.
struct StreamTask {
    message: UserMessage,
    generation: u64,
    cancel: CancellationToken,
    snapshot: watch::Sender<StreamingSnapshot>,
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Completed,
    Failed,
    Aborted,
}

impl Orchestrator {
    /// Creates an orchestrator with the default [`StreamConfig`].
    pub fn new(
        provider: Arc<dyn Provider>,
        repository: Arc<dyn SessionRepository>,
        channel: EventChannel<StreamEvent>,
    ) -> Self {
        Self::with_config(provider, repository, channel, StreamConfig::default())
    }

    /// Creates an orchestrator publishing on `channel`.
    pub fn with_config(
        provider: Arc<dyn Provider>,
        repository: Arc<dyn SessionRepository>,
        channel: EventChannel<StreamEvent>,
        config: StreamConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                repository,
                channel,
                config,
                metrics: Default::default(),
                active: Default::default(),
                next_generation: Mutex::new(0),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Shares a metrics group with other components.
    ///
    /// # Panics
    ///
    /// Panics if the orchestrator has already been cloned.
    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("metrics must be set before the orchestrator is shared")
            .metrics = metrics;
        self
    }

    /// Returns the metrics of this orchestrator.
    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.inner.metrics
    }

    /// Returns the channel stream and lifecycle events are published on.
    pub fn channel(&self) -> &EventChannel<StreamEvent> {
        &self.inner.channel
    }

    /// Starts a stream for the message's session, or queues the message if one is live.
    ///
    /// Queuing an empty message fails with [`OrchestratorError::StreamAlreadyActive`].
    pub async fn trigger(&self, message: UserMessage) -> Result<TriggerOutcome, OrchestratorError> {
        let message = match self.try_start(message) {
            None => return Ok(TriggerOutcome::Started),
            Some(message) => message,
        };
        if message.content.trim().is_empty() {
            return Err(StreamAlreadyActiveSnafu {
                session_id: message.session_id,
            }
            .build());
        }
        let session_id = message.session_id.clone();
        let content = message.content.clone();
        self.inner.repository.enqueue_message(message).await?;
        self.inner.metrics.messages_queued.inc();
        debug!(session = %session_id, "stream active, message queued");
        self.inner.channel.publish(
            &session_channel(&session_id),
            LifecycleEvent::QueueMessageAdded {
                session_id: session_id.clone(),
                content,
            }
            .into(),
        );
        let drain = {
            let mut active = self.inner.active.lock().expect("poisoned");
            match active.get_mut(&session_id) {
                Some(stream) => {
                    stream.recheck_queue = true;
                    None
                }
                None => Some(self.reserve(&mut active, &session_id)),
            }
        };
        if let Some(generation) = drain {
            debug!(session = %session_id, "stream ended while queuing, draining queue");
            self.drain_queue(&session_id, generation).await;
        }
        Ok(TriggerOutcome::Queued)
    }

    /// Starts a stream unless one is live, handing the message back in that case.
    fn try_start(&self, message: UserMessage) -> Option<UserMessage> {
        let mut active = self.inner.active.lock().expect("poisoned");
        if active.contains_key(&message.session_id) {
            return Some(message);
        }
        let task = self.register(&mut active, message);
        drop(active);
        self.spawn(task);
        None
    }

    fn next_generation(&self) -> u64 {
        let mut next = self.inner.next_generation.lock().expect("poisoned");
        *next += 1;
        *next
    }

    fn register(
        &self,
        active: &mut HashMap<String, ActiveStream>,
        message: UserMessage,
    ) -> StreamTask {
        let generation = self.next_generation();
        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(StreamingSnapshot::default());
        active.insert(
            message.session_id.clone(),
            ActiveStream {
                generation,
                cancel: cancel.clone(),
                snapshot: snapshot_rx,
                recheck_queue: false,
            },
        );
        StreamTask {
            message,
            generation,
            cancel,
            snapshot: snapshot_tx,
        }
    }

    /// Holds the session while its queue is read, without starting a stream.
    fn reserve(&self, active: &mut HashMap<String, ActiveStream>, session_id: &str) -> u64 {
        let generation = self.next_generation();
        let (_, snapshot) = watch::channel(StreamingSnapshot::default());
        active.insert(
            session_id.to_string(),
            ActiveStream {
                generation,
                cancel: CancellationToken::new(),
                snapshot,
                recheck_queue: false,
            },
        );
        generation
    }

    fn spawn(&self, task: StreamTask) {
        let span = error_span!("session-stream", session = %task.message.session_id);
        self.inner.metrics.streams_started.inc();
        self.inner
            .tasks
            .spawn(self.clone().run(task).instrument(span));
    }

    async fn run(self, task: StreamTask) {
        let StreamTask {
            message,
            generation,
            cancel,
            snapshot,
        } = task;
        let session_id = message.session_id.clone();
        let channel = stream_channel(&session_id);
        debug!("stream started");
        self.inner.channel.publish(
            &channel,
            LifecycleEvent::StreamStarted {
                session_id: session_id.clone(),
            }
            .into(),
        );

        let mut events = self.inner.provider.stream(message, cancel.clone());
        let mut acc = StreamingStateAccumulator::new(self.inner.config.persist_debounce);
        let termination = loop {
            let (event, aborted) = tokio::select! {
                biased;
                _ = cancel.cancelled() => (
                    ProviderEvent::Error { message: ABORTED_MESSAGE.to_string() },
                    true,
                ),
                event = events.next() => match event {
                    Some(event) => (event, false),
                    None => {
                        warn!("provider stream ended without completing");
                        (ProviderEvent::Error { message: "provider stream ended".to_string() }, false)
                    }
                },
            };
            let termination = match &event {
                _ if aborted => Some(Termination::Aborted),
                ProviderEvent::Complete => Some(Termination::Completed),
                ProviderEvent::Error { .. } => Some(Termination::Failed),
                _ => None,
            };
            self.handle_event(&session_id, &channel, &mut acc, event)
                .await;
            snapshot.send_replace(acc.snapshot().clone());
            if let Some(termination) = termination {
                break termination;
            }
        };
        // Release the provider before a queued message starts the next stream.
        drop(events);
        match termination {
            Termination::Completed => debug!("stream completed"),
            Termination::Failed => {
                self.inner.metrics.streams_failed.inc();
                debug!("stream failed");
            }
            Termination::Aborted => debug!("stream aborted"),
        }
        self.finish(&session_id, generation, termination).await;
    }

    async fn handle_event(
        &self,
        session_id: &str,
        channel: &str,
        acc: &mut StreamingStateAccumulator,
        event: ProviderEvent,
    ) {
        trace!(?event, "provider event");
        let changed = acc.apply(&event);
        let forced = event.is_boundary();
        self.inner.channel.publish(channel, event.into());
        if acc
            .debouncer_mut()
            .should_persist(tokio::time::Instant::now(), changed, forced)
        {
            self.persist(session_id, acc.snapshot(), forced).await;
        }
    }

    async fn persist(&self, session_id: &str, snapshot: &StreamingSnapshot, forced: bool) {
        if forced {
            self.inner.metrics.persists_forced.inc();
        } else {
            self.inner.metrics.persists_debounced.inc();
        }
        let request = PersistRequest {
            session_id: session_id.to_string(),
            snapshot: snapshot.clone(),
            forced,
        };
        if let Err(err) = self.inner.repository.persist_streaming_state(request).await {
            self.inner.metrics.persist_failures.inc();
            if forced {
                error!(%err, "failed to persist streaming state");
            } else {
                warn!(%err, "failed to persist streaming state");
            }
        }
    }

    /// Releases the session after its stream ended.
    ///
    /// Only a completed stream hands the session to the next queued message.
    async fn finish(&self, session_id: &str, generation: u64, termination: Termination) {
        match termination {
            Termination::Completed => self.drain_queue(session_id, generation).await,
            Termination::Failed | Termination::Aborted => {
                let mut active = self.inner.active.lock().expect("poisoned");
                if active
                    .get(session_id)
                    .is_some_and(|stream| stream.generation == generation)
                {
                    active.remove(session_id);
                }
            }
        }
    }

    /// Starts the next queued message on the entry `generation`, or removes the entry once
    /// the queue is empty.
    ///
    /// The entry stays registered while the queue is read, so concurrent triggers queue
    /// behind it and mark it for another read.
    async fn drain_queue(&self, session_id: &str, generation: u64) {
        loop {
            {
                let mut active = self.inner.active.lock().expect("poisoned");
                match active.get_mut(session_id) {
                    Some(stream) if stream.generation == generation => {
                        stream.recheck_queue = false
                    }
                    _ => return,
                }
            }
            let closed = self.inner.tasks.is_closed();
            let next = if closed {
                None
            } else {
                match self.inner.repository.dequeue_message(session_id).await {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(%err, "failed to dequeue message");
                        None
                    }
                }
            };
            let task = {
                let mut active = self.inner.active.lock().expect("poisoned");
                let recheck = match active.get(session_id) {
                    Some(stream) if stream.generation == generation => stream.recheck_queue,
                    _ => return,
                };
                match next {
                    Some(message) => self.register(&mut active, message),
                    None if recheck && !closed => continue,
                    None => {
                        active.remove(session_id);
                        return;
                    }
                }
            };
            debug!(session = %session_id, "starting queued message");
            self.spawn(task);
            return;
        }
    }

    /// Aborts the live stream of a session.
    ///
    /// The stream ends through its error path, which forces a final persist and releases the
    /// session. Until then the session stays active, so new messages are queued. Aborting a
    /// session without a live stream is not an error, but reports `success: false`.
    pub fn abort(&self, session_id: &str) -> AbortOutcome {
        let first = {
            let active = self.inner.active.lock().expect("poisoned");
            active.get(session_id).map(|stream| {
                let first = !stream.cancel.is_cancelled();
                stream.cancel.cancel();
                first
            })
        };
        match first {
            Some(first) => {
                if first {
                    self.inner.metrics.streams_aborted.inc();
                    debug!(session = %session_id, "abort requested");
                }
                AbortOutcome {
                    success: true,
                    error: None,
                }
            }
            None => AbortOutcome {
                success: false,
                error: Some(NO_ACTIVE_STREAM.to_string()),
            },
        }
    }

    /// Returns true if the session has a live stream.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner
            .active
            .lock()
            .expect("poisoned")
            .contains_key(session_id)
    }

    /// Lists the sessions with a live stream, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .inner
            .active
            .lock()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect();
        sessions.sort();
        sessions
    }

    /// Returns the current state of a session's live stream.
    pub fn snapshot(&self, session_id: &str) -> Option<StreamingSnapshot> {
        let active = self.inner.active.lock().expect("poisoned");
        let stream = active.get(session_id)?;
        let snapshot = stream.snapshot.borrow().clone();
        Some(snapshot)
    }

    /// Subscribes to a session's stream events.
    ///
    /// The last [`StreamConfig::history_on_attach`] retained events are replayed first.
    pub fn attach(&self, session_id: &str) -> Subscription<StreamEvent> {
        self.inner.channel.subscribe_with_history(
            &stream_channel(session_id),
            self.inner.config.history_on_attach,
        )
    }

    /// Subscribes to a session's stream events, replaying everything after `cursor` first.
    pub async fn attach_from(
        &self,
        session_id: &str,
        cursor: Cursor,
    ) -> Result<Subscription<StreamEvent>, OrchestratorError> {
        let subscription = self
            .inner
            .channel
            .subscribe_from_cursor(&stream_channel(session_id), cursor)
            .await?;
        Ok(subscription)
    }

    /// Aborts every live stream and waits for all stream tasks to finish.
    pub async fn shutdown(&self) {
        // Closed before cancelling, so streams completing now do not start queued messages.
        self.inner.tasks.close();
        let tokens: Vec<CancellationToken> = self
            .inner
            .active
            .lock()
            .expect("poisoned")
            .values()
            .map(|stream| stream.cancel.clone())
            .collect();
        debug!(streams = tokens.len(), "shutdown");
        for token in tokens {
            if !token.is_cancelled() {
                token.cancel();
                self.inner.metrics.streams_aborted.inc();
            }
        }
        self.inner.tasks.wait().await;
    }
}
