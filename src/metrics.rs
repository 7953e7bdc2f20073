//! Metrics for the loader, channel, rpc and streaming components.

use std::sync::Arc;

use iroh_metrics::{Counter, MetricsGroup, MetricsGroupSet};

/// Metrics tracked by [`crate::loader::BatchLoader`]s.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "loader")]
#[non_exhaustive]
pub struct LoaderMetrics {
    /// Number of batch function invocations.
    pub batches: Counter,
    /// Number of keys handed to batch functions, after deduplication.
    pub keys_loaded: Counter,
    /// Number of loads answered from the cache.
    pub cache_hits: Counter,
    /// Number of batches that failed as a whole.
    pub batch_failures: Counter,
}

/// Metrics tracked by [`crate::channel::EventChannel`].
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "channel")]
#[non_exhaustive]
pub struct ChannelMetrics {
    /// Number of events published.
    pub events_published: Counter,
    /// Number of events replayed to subscribers attaching with history or a cursor.
    pub events_replayed: Counter,
    /// Number of subscribers that fell behind the retained window.
    pub subscribers_lagged: Counter,
    /// Number of events dropped by retention.
    pub events_trimmed: Counter,
    /// Number of failed writes to the persistence collaborator.
    pub persist_failures: Counter,
}

/// Metrics tracked by the rpc client and router.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "rpc")]
#[non_exhaustive]
pub struct RpcMetrics {
    /// Number of queries issued.
    pub queries: Counter,
    /// Number of mutations issued.
    pub mutations: Counter,
    /// Number of subscriptions opened.
    pub subscriptions: Counter,
    /// Number of calls that failed.
    pub call_errors: Counter,
    /// Number of optimistic updates that were reverted.
    pub optimistic_reverts: Counter,
    /// Number of subscription emissions encoded as full values.
    pub updates_value: Counter,
    /// Number of subscription emissions encoded as patches.
    pub updates_patch: Counter,
    /// Number of subscription emissions encoded as deltas.
    pub updates_delta: Counter,
}

/// Metrics tracked by the [`crate::stream::Orchestrator`].
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "stream")]
#[non_exhaustive]
pub struct StreamMetrics {
    /// Number of provider streams started.
    pub streams_started: Counter,
    /// Number of messages queued because a stream was already active.
    pub messages_queued: Counter,
    /// Number of streams aborted on request.
    pub streams_aborted: Counter,
    /// Number of streams that ended with an error.
    pub streams_failed: Counter,
    /// Number of persists forced by boundary events.
    pub persists_forced: Counter,
    /// Number of debounced persists.
    pub persists_debounced: Counter,
    /// Number of failed persists.
    pub persist_failures: Counter,
}

/// All metrics tracked by this crate.
#[derive(Debug, Default, Clone, MetricsGroupSet)]
#[metrics(name = "syncwire")]
pub struct SyncwireMetrics {
    /// Batch loader metrics.
    pub loader: Arc<LoaderMetrics>,
    /// Event channel metrics.
    pub channel: Arc<ChannelMetrics>,
    /// Rpc client and router metrics.
    pub rpc: Arc<RpcMetrics>,
    /// Streaming orchestrator metrics.
    pub stream: Arc<StreamMetrics>,
}
