//! Client side of the call protocol.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use syncwire::rpc::{CallError, Client, Transport};
//! # async fn example(transport: Arc<dyn Transport>) -> Result<(), CallError> {
//! let client = Client::new(transport);
//! let session = client
//!     .path("session")
//!     .path("get")
//!     .input(serde_json::json!({ "id": "S" }))
//!     .query()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use n0_future::boxed::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use super::{
    CallError, CallPath, CallRequest, CallType, FieldSelection, Transport, TimeoutSnafu,
    update::{Update, UpdateDecoder, UpdateMode},
};
use crate::{cache::OptimisticCache, config::RpcConfig, metrics::RpcMetrics};

/// Builds calls and carries them over a [`Transport`].
///
/// Owns the [`OptimisticCache`] of its session. This is a cheaply cloneable handle.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    transport: Arc<dyn Transport>,
    cache: OptimisticCache<Value>,
    config: RpcConfig,
    metrics: Arc<RpcMetrics>,
}

impl Client {
    /// Creates a client with a fresh cache and the default config.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, RpcConfig::default())
    }

    /// Creates a client with a fresh cache.
    pub fn with_config(transport: Arc<dyn Transport>, config: RpcConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                cache: OptimisticCache::new(),
                config,
                metrics: Default::default(),
            }),
        }
    }

    /// Returns the cache of this client.
    pub fn cache(&self) -> &OptimisticCache<Value> {
        &self.inner.cache
    }

    /// Returns the metrics of this client.
    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.inner.metrics
    }

    /// Starts a call at the first path segment.
    pub fn path(&self, segment: impl Into<String>) -> Call {
        self.call(CallPath::new().join(segment))
    }

    /// Starts a call at a full path.
    pub fn call(&self, path: CallPath) -> Call {
        Call {
            client: self.clone(),
            path,
            input: Value::Null,
            select: None,
            update_mode: None,
            optimistic: None,
            cache_key: None,
        }
    }
}

/// A call under construction.
///
/// Append segments with [`Call::path`], then finish with [`Call::query`], [`Call::mutate`] or
/// [`Call::subscribe`].
#[derive(Debug, Clone)]
#[must_use = "a call does nothing until a terminal verb is invoked"]
pub struct Call {
    client: Client,
    path: CallPath,
    input: Value,
    select: Option<FieldSelection>,
    update_mode: Option<UpdateMode>,
    optimistic: Option<(String, Value)>,
    cache_key: Option<String>,
}

impl Call {
    /// Appends a path segment.
    pub fn path(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment);
        self
    }

    /// Sets the procedure input.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Restricts the fields returned.
    pub fn select(mut self, select: FieldSelection) -> Self {
        self.select = Some(select);
        self
    }

    /// Requests an update mode for a subscription.
    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = Some(mode);
        self
    }

    /// Applies `data` to the cache under `key` before a mutation is sent.
    ///
    /// The update is confirmed if the mutation succeeds, and reverted if it fails or times out.
    pub fn optimistic(mut self, key: impl Into<String>, data: Value) -> Self {
        self.optimistic = Some((key.into(), data));
        self
    }

    /// Stores the results of a query or subscription in the cache under `key`.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Returns the path built so far.
    pub fn call_path(&self) -> &CallPath {
        &self.path
    }

    /// Packages this call into a request.
    pub fn request(&self, call_type: CallType) -> CallRequest {
        CallRequest {
            call_type,
            path: self.path.clone(),
            input: self.input.clone(),
            select: self.select.clone(),
            update_mode: self.update_mode,
        }
    }

    /// Performs this call as a query.
    pub async fn query(self) -> Result<Value, CallError> {
        let inner = &self.client.inner;
        inner.metrics.queries.inc();
        trace!(path = %self.path, "query");
        let res = inner.transport.query(self.request(CallType::Query)).await;
        match &res {
            Ok(value) => {
                if let Some(key) = &self.cache_key {
                    inner.cache.set(key.clone(), value.clone());
                }
            }
            Err(_) => {
                inner.metrics.call_errors.inc();
            }
        }
        res
    }

    /// Performs this call as a mutation.
    ///
    /// Fails with [`CallError::Timeout`] if the transport does not answer within the configured
    /// mutation timeout. A pending optimistic update is reverted before any error is returned.
    pub async fn mutate(self) -> Result<Value, CallError> {
        let inner = &self.client.inner;
        inner.metrics.mutations.inc();
        if let Some((key, data)) = &self.optimistic {
            inner.cache.optimistic_update(key.clone(), data.clone());
        }
        let after = inner.config.mutation_timeout;
        let fut = inner.transport.mutate(self.request(CallType::Mutation));
        let res = match tokio::time::timeout(after, fut).await {
            Ok(res) => res,
            Err(_) => Err(TimeoutSnafu { after }.build()),
        };
        match &res {
            Ok(_) => {
                if let Some((key, _)) = &self.optimistic {
                    inner.cache.confirm_optimistic(key);
                }
            }
            Err(err) => {
                inner.metrics.call_errors.inc();
                if let Some((key, _)) = &self.optimistic {
                    debug!(path = %self.path, %key, %err, "mutation failed, reverting");
                    inner.metrics.optimistic_reverts.inc();
                    inner.cache.revert_optimistic(key);
                }
            }
        }
        res
    }

    /// Performs this call as a query and decodes the result.
    pub async fn query_as<T: DeserializeOwned>(self) -> Result<T, CallError> {
        decode(self.query().await?)
    }

    /// Performs this call as a mutation and decodes the result.
    pub async fn mutate_as<T: DeserializeOwned>(self) -> Result<T, CallError> {
        decode(self.mutate().await?)
    }

    /// Opens this call as a subscription.
    pub fn subscribe(self) -> SubscriptionStream {
        let inner = &self.client.inner;
        inner.metrics.subscriptions.inc();
        trace!(path = %self.path, "subscribe");
        let updates = inner.transport.subscribe(self.request(CallType::Subscription));
        let cache = self
            .cache_key
            .map(|key| (self.client.inner.cache.clone(), key));
        SubscriptionStream {
            updates,
            decoder: UpdateDecoder::new(),
            cache,
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CallError> {
    serde_json::from_value(value).map_err(|err| {
        super::DecodeSnafu {
            message: err.to_string(),
        }
        .build()
    })
}

/// The values of a subscription.
///
/// Applies each received [`Update`] to the previous value and yields the reconstructed value.
/// If the call had a cache key, every value is reconciled into the client's cache.
#[derive(derive_more::Debug)]
pub struct SubscriptionStream {
    #[debug("UpdateStream")]
    updates: BoxStream<Result<Update, CallError>>,
    decoder: UpdateDecoder,
    cache: Option<(OptimisticCache<Value>, String)>,
}

impl SubscriptionStream {
    /// Returns the last value yielded.
    pub fn current(&self) -> Option<&Value> {
        self.decoder.previous()
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<Value, CallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let update = match std::task::ready!(Pin::new(&mut self.updates).poll_next(cx)) {
            Some(Ok(update)) => update,
            Some(Err(err)) => return Poll::Ready(Some(Err(err))),
            None => return Poll::Ready(None),
        };
        let value = self.decoder.apply(&update);
        if let (Ok(value), Some((cache, key))) = (&value, &self.cache) {
            cache.reconcile(key.clone(), value.clone());
        }
        Poll::Ready(Some(value))
    }
}
