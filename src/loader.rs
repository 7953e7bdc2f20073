//! Key batching loader.
//!
//! A [`BatchLoader`] coalesces every [`BatchLoader::load`] issued within one flush window into a
//! single call of its batch function. A flush window is opened by the first load that misses
//! the cache: it schedules exactly one flush task, which yields once to the scheduler so that
//! other loads issued in the same burst can join, and then calls the batch function with the
//! deduplicated keys in first-seen order.
//!
//! Duplicate keys within one window share one future and one cache slot. The batch function
//! must return one result per key it was given; any other length fails every waiter of that
//! batch with [`LoadError::LengthMismatch`].
//!
//! Loaders are meant to be scoped to a single request or session. Sharing one instance across
//! unrelated sessions shares its cache as well.
//!
//! [`relations`] builds the relationship loaders on top of this primitive.

use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
};

use futures_util::{
    FutureExt,
    future::{Shared, join_all},
};
use n0_future::boxed::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{metrics::LoaderMetrics, registry::RegistryError};

pub mod relations;

pub use self::relations::{RelationLoader, RelationResult, RelationSource};

/// Default maximum number of keys handed to a single batch function call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Errors produced while loading keys.
///
/// These are cloned to every waiter of a failed key or batch.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("Batch load failed: {message}"))]
    Backend { message: String },
    #[snafu(display("Batch function returned {actual} values for {expected} keys"))]
    LengthMismatch { expected: usize, actual: usize },
    #[snafu(display("Batch was dropped before it completed"))]
    Cancelled {},
    #[snafu(display("Relationship configuration error: {message}"))]
    Config { message: String },
}

impl LoadError {
    /// Creates a storage backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        BackendSnafu {
            message: message.into(),
        }
        .build()
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        ConfigSnafu {
            message: message.into(),
        }
        .build()
    }
}

impl From<RegistryError> for LoadError {
    fn from(err: RegistryError) -> Self {
        LoadError::config(err.to_string())
    }
}

/// Options for a [`BatchLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// Maximum number of keys per batch function call.
    ///
    /// Larger windows are split into several calls, issued concurrently.
    pub max_batch_size: usize,
    /// Whether resolved values are kept across flush windows.
    pub cache: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            cache: true,
        }
    }
}

/// The output of a batch function: one result per key, or an error for the whole batch.
pub type BatchResult<V> = Result<Vec<Result<V, LoadError>>, LoadError>;

type BatchFn<K, V> = Arc<dyn Fn(Vec<K>) -> BoxFuture<BatchResult<V>> + Send + Sync + 'static>;
type CacheKeyFn<K> = Arc<dyn Fn(&K) -> String + Send + Sync + 'static>;
type SharedLoad<V> = Shared<BoxFuture<Result<V, LoadError>>>;

/// Coalesces single-key loads into batched calls.
pub struct BatchLoader<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> std::fmt::Debug for BatchLoader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl<K, V> Clone for BatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K, V> {
    batch_fn: BatchFn<K, V>,
    cache_key_fn: CacheKeyFn<K>,
    options: LoaderOptions,
    state: Mutex<State<K, V>>,
    metrics: Arc<LoaderMetrics>,
}

struct State<K, V> {
    /// Loads resolved or in flight, kept across windows if caching is enabled.
    cache: HashMap<String, SharedLoad<V>>,
    /// Loads of the currently open window, by cache key.
    window: HashMap<String, SharedLoad<V>>,
    /// Deduplicated keys of the currently open window, in first-seen order.
    queue: Vec<Waiter<K, V>>,
    flush_scheduled: bool,
}

impl<K, V> Default for State<K, V> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            window: HashMap::new(),
            queue: Vec::new(),
            flush_scheduled: false,
        }
    }
}

struct Waiter<K, V> {
    cache_key: String,
    key: K,
    reply: oneshot::Sender<Result<V, LoadError>>,
}

impl<K, V> BatchLoader<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a loader whose cache keys are the keys' [`Display`] output.
    pub fn new<F, Fut>(batch_fn: F) -> Self
    where
        K: Display,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V>> + Send + 'static,
    {
        Self::with_cache_key_fn(batch_fn, |key: &K| key.to_string())
    }

    /// Creates a loader with a custom cache key function.
    ///
    /// Keys mapping to the same cache key are treated as the same key.
    pub fn with_cache_key_fn<F, Fut, C>(batch_fn: F, cache_key_fn: C) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V>> + Send + 'static,
        C: Fn(&K) -> String + Send + Sync + 'static,
    {
        let batch_fn: BatchFn<K, V> =
            Arc::new(move |keys| -> BoxFuture<BatchResult<V>> { Box::pin(batch_fn(keys)) });
        Self {
            inner: Arc::new(Inner {
                batch_fn,
                cache_key_fn: Arc::new(cache_key_fn),
                options: LoaderOptions::default(),
                state: Mutex::new(State::default()),
                metrics: Default::default(),
            }),
        }
    }

    /// Replaces the options of a freshly created loader.
    ///
    /// # Panics
    ///
    /// Panics if the loader has already been cloned.
    pub fn with_options(mut self, options: LoaderOptions) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("options must be set before the loader is shared")
            .options = options;
        self
    }

    /// Shares a metrics group with other loaders.
    ///
    /// # Panics
    ///
    /// Panics if the loader has already been cloned.
    pub fn with_metrics(mut self, metrics: Arc<LoaderMetrics>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("metrics must be set before the loader is shared")
            .metrics = metrics;
        self
    }

    /// Returns the options of this loader.
    pub fn options(&self) -> LoaderOptions {
        self.inner.options
    }

    /// Returns the metrics of this loader.
    pub fn metrics(&self) -> &Arc<LoaderMetrics> {
        &self.inner.metrics
    }

    /// Loads a single key.
    ///
    /// The key is enqueued when this function is called, not when the returned future is
    /// first polled, so several loads created back to back always share one window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load(&self, key: K) -> impl Future<Output = Result<V, LoadError>> + Send + 'static {
        let cache_key = (self.inner.cache_key_fn)(&key);
        let mut state = self.inner.state.lock().expect("poisoned");
        if let Some(load) = state.cache.get(&cache_key) {
            self.inner.metrics.cache_hits.inc();
            return load.clone();
        }
        if let Some(load) = state.window.get(&cache_key) {
            return load.clone();
        }

        let (reply, reply_rx) = oneshot::channel();
        let load: SharedLoad<V> = async move {
            match reply_rx.await {
                Ok(res) => res,
                Err(_) => Err(CancelledSnafu.build()),
            }
        }
        .boxed()
        .shared();
        state.window.insert(cache_key.clone(), load.clone());
        if self.inner.options.cache {
            state.cache.insert(cache_key.clone(), load.clone());
        }
        state.queue.push(Waiter {
            cache_key,
            key,
            reply,
        });
        if !state.flush_scheduled {
            state.flush_scheduled = true;
            let inner = self.inner.clone();
            tokio::task::spawn(async move {
                // Let the rest of the burst enqueue before flushing.
                tokio::task::yield_now().await;
                inner.flush().await;
            });
        }
        load
    }

    /// Loads several keys, resolving failures per slot instead of failing the whole call.
    pub async fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Vec<Result<V, LoadError>> {
        let loads: Vec<_> = keys.into_iter().map(|key| self.load(key)).collect();
        join_all(loads).await
    }

    /// Seeds the cache with a value for `key`.
    ///
    /// Existing entries are kept; [`Self::clear`] the key first to overwrite it.
    pub fn prime(&self, key: &K, value: V) {
        let cache_key = (self.inner.cache_key_fn)(key);
        let mut state = self.inner.state.lock().expect("poisoned");
        state
            .cache
            .entry(cache_key)
            .or_insert_with(|| futures_util::future::ready(Ok(value)).boxed().shared());
    }

    /// Removes `key` from the cache.
    pub fn clear(&self, key: &K) {
        let cache_key = (self.inner.cache_key_fn)(key);
        self.inner
            .state
            .lock()
            .expect("poisoned")
            .cache
            .remove(&cache_key);
    }

    /// Removes every key from the cache.
    pub fn clear_all(&self) {
        self.inner.state.lock().expect("poisoned").cache.clear();
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn flush(&self) {
        let queue = {
            let mut state = self.state.lock().expect("poisoned");
            state.flush_scheduled = false;
            state.window.clear();
            std::mem::take(&mut state.queue)
        };
        if queue.is_empty() {
            return;
        }
        let max_batch_size = self.options.max_batch_size.max(1);
        debug!(keys = queue.len(), max_batch_size, "flushing batch");

        let mut batches = Vec::new();
        let mut queue = queue.into_iter().peekable();
        while queue.peek().is_some() {
            let batch: Vec<_> = queue.by_ref().take(max_batch_size).collect();
            batches.push(self.dispatch(batch));
        }
        join_all(batches).await;
    }

    async fn dispatch(&self, batch: Vec<Waiter<K, V>>) {
        let keys: Vec<K> = batch.iter().map(|waiter| waiter.key.clone()).collect();
        let expected = keys.len();
        self.metrics.batches.inc();
        self.metrics.keys_loaded.inc_by(expected as u64);

        let values = match (self.batch_fn)(keys).await {
            Ok(values) if values.len() == expected => values,
            Ok(values) => {
                let err = LengthMismatchSnafu {
                    expected,
                    actual: values.len(),
                }
                .build();
                return self.fail_all(batch, err);
            }
            Err(err) => return self.fail_all(batch, err),
        };
        trace!(keys = expected, "batch resolved");

        let failed: Vec<&str> = batch
            .iter()
            .zip(values.iter())
            .filter(|(_, value)| value.is_err())
            .map(|(waiter, _)| waiter.cache_key.as_str())
            .collect();
        if !failed.is_empty() {
            // Errors are not cached, so later loads of the same key retry.
            let mut state = self.state.lock().expect("poisoned");
            for cache_key in failed {
                state.cache.remove(cache_key);
            }
        }
        for (waiter, value) in batch.into_iter().zip(values) {
            waiter.reply.send(value).ok();
        }
    }

    fn fail_all(&self, batch: Vec<Waiter<K, V>>, err: LoadError) {
        warn!(keys = batch.len(), %err, "batch failed");
        self.metrics.batch_failures.inc();
        {
            let mut state = self.state.lock().expect("poisoned");
            for waiter in &batch {
                state.cache.remove(&waiter.cache_key);
            }
        }
        for waiter in batch {
            waiter.reply.send(Err(err.clone())).ok();
        }
    }
}

/// Groups flat rows by a key, aligned with `keys`.
///
/// Storage adapters that fetch all children of many parents in one query can use this to
/// produce the per-key output a batch function must return. Keys without rows get an empty
/// group, and rows whose key is not in `keys` are dropped. `keys` is expected to be
/// deduplicated, as batch functions always receive it.
pub fn group_by_key<T, Q, F>(keys: &[Q], rows: impl IntoIterator<Item = T>, key_of: F) -> Vec<Vec<T>>
where
    Q: Hash + Eq + Clone,
    F: Fn(&T) -> Option<Q>,
{
    let mut groups: HashMap<Q, Vec<T>> = keys.iter().map(|key| (key.clone(), Vec::new())).collect();
    for row in rows {
        if let Some(group) = key_of(&row).and_then(|key| groups.get_mut(&key)) {
            group.push(row);
        }
    }
    keys.iter()
        .map(|key| groups.remove(key).unwrap_or_default())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use n0_snafu::Result;
    use tracing_test::traced_test;

    use super::*;

    /// A batch function that records its invocations and echoes keys back.
    fn recording_loader(
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    ) -> BatchLoader<String, String> {
        BatchLoader::new(move |keys: Vec<String>| {
            calls.lock().unwrap().push(keys.clone());
            async move { Ok(keys.into_iter().map(|k| Ok(format!("value-{k}"))).collect()) }
        })
    }

    #[tokio::test]
    #[traced_test]
    async fn coalesces_one_window_into_one_call() -> Result {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let keys = ["a", "b", "a", "c", "b"].map(String::from);
        let values = loader.load_many(keys).await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
        );
        let values: Vec<String> = values.into_iter().map(|v| v.unwrap()).collect();
        assert_eq!(values[0], values[2]);
        assert_eq!(values[1], values[4]);
        assert_eq!(values[3], "value-c");
        Ok(())
    }

    #[tokio::test]
    async fn separate_loads_in_one_burst_share_a_window() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone());

        let a = loader.load("a".to_string());
        let b = loader.load("b".to_string());
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "value-a");
        assert_eq!(b.unwrap(), "value-b");
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_spans_windows_unless_disabled() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone());
        loader.load("a".to_string()).await.unwrap();
        loader.load("a".to_string()).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(loader.metrics().cache_hits.get(), 1);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone()).with_options(LoaderOptions {
            cache: false,
            ..Default::default()
        });
        loader.load("a".to_string()).await.unwrap();
        loader.load("a".to_string()).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn splits_windows_larger_than_max_batch_size() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone()).with_options(LoaderOptions {
            max_batch_size: 2,
            cache: true,
        });
        let values = loader.load_many(["a", "b", "c"].map(String::from)).await;
        assert!(values.iter().all(|v| v.is_ok()));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(calls[1], vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn failed_batch_rejects_every_waiter() {
        let loader: BatchLoader<String, String> =
            BatchLoader::new(|_keys: Vec<String>| async { Err(LoadError::backend("db down")) });
        let values = loader.load_many(["a", "b", "a"].map(String::from)).await;
        assert_eq!(values.len(), 3);
        for value in values {
            assert_eq!(value, Err(LoadError::backend("db down")));
        }
        assert_eq!(loader.metrics().batch_failures.get(), 1);
    }

    #[tokio::test]
    async fn length_mismatch_fails_the_batch() {
        let loader: BatchLoader<String, String> =
            BatchLoader::new(|_keys: Vec<String>| async { Ok(vec![Ok("only".to_string())]) });
        let values = loader.load_many(["a", "b"].map(String::from)).await;
        for value in values {
            assert!(matches!(
                value,
                Err(LoadError::LengthMismatch {
                    expected: 2,
                    actual: 1
                })
            ));
        }
    }

    #[tokio::test]
    async fn per_key_errors_only_reject_that_key_and_are_not_cached() {
        let calls = Arc::new(Mutex::new(0usize));
        let loader: BatchLoader<String, String> = {
            let calls = calls.clone();
            BatchLoader::new(move |keys: Vec<String>| {
                *calls.lock().unwrap() += 1;
                async move {
                    Ok(keys
                        .into_iter()
                        .map(|k| {
                            if k == "bad" {
                                Err(LoadError::backend("missing"))
                            } else {
                                Ok(k)
                            }
                        })
                        .collect())
                }
            })
        };
        let values = loader.load_many(["good", "bad"].map(String::from)).await;
        assert_eq!(values[0], Ok("good".to_string()));
        assert!(values[1].is_err());

        loader.load("good".to_string()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(loader.load("bad".to_string()).await.is_err());
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn prime_and_clear() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader = recording_loader(calls.clone());
        loader.prime(&"a".to_string(), "primed".to_string());
        assert_eq!(loader.load("a".to_string()).await.unwrap(), "primed");
        assert!(calls.lock().unwrap().is_empty());

        loader.clear(&"a".to_string());
        assert_eq!(loader.load("a".to_string()).await.unwrap(), "value-a");
        assert_eq!(calls.lock().unwrap().len(), 1);

        loader.clear_all();
        loader.load("a".to_string()).await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn custom_cache_key_merges_keys() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let loader: BatchLoader<String, usize> = {
            let calls = calls.clone();
            BatchLoader::with_cache_key_fn(
                move |keys: Vec<String>| {
                    calls.lock().unwrap().push(keys.clone());
                    async move { Ok(keys.iter().map(|k| Ok(k.len())).collect()) }
                },
                |key: &String| key.to_lowercase(),
            )
        };
        let values = loader.load_many(["Ab", "aB", "c"].map(String::from)).await;
        assert_eq!(values, vec![Ok(2), Ok(2), Ok(1)]);
        assert_eq!(calls.lock().unwrap()[0].len(), 2);
    }

    #[test]
    fn group_by_key_aligns_with_keys() {
        let keys = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let rows = vec![("m2", 1), ("m1", 2), ("m2", 3), ("other", 4)];
        let groups = group_by_key(&keys, rows, |(key, _)| Some(key.to_string()));
        assert_eq!(groups, vec![vec![("m1", 2)], vec![("m2", 1), ("m2", 3)], vec![]]);
    }
}
