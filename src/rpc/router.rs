//! In-process transport dispatching calls to registered handlers.
//!
//! Handlers are registered per [`CallType`] and path on a [`RouterBuilder`]:
//!
//! ```
//! # use syncwire::rpc::{CallError, Client, Router};
//! # async fn example() -> Result<(), CallError> {
//! let router = Router::builder()
//!     .query("session.get", |_ctx, input| async move {
//!         Ok(serde_json::json!({ "id": input["id"], "title": "hello" }))
//!     })
//!     .build();
//! let client = Client::new(std::sync::Arc::new(router));
//! let session = client
//!     .path("session")
//!     .path("get")
//!     .input(serde_json::json!({ "id": "S" }))
//!     .query()
//!     .await?;
//! assert_eq!(session["title"], "hello");
//! # Ok(())
//! # }
//! ```
//!
//! Every call gets a fresh [`RequestContext`]. If the router was given a [`RelationSource`],
//! the context carries a [`RelationLoader`] scoped to that call, so relationship loads issued
//! while resolving one call are batched together and never share a cache with other calls.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures_util::{Stream, StreamExt, stream};
use n0_future::boxed::{BoxFuture, BoxStream};
use serde_json::Value;
use tracing::{debug, trace};

use super::{
    CallError, CallPath, CallRequest, CallType, FieldSelection, Transport,
    update::{Update, UpdateEncoder},
};
use crate::{
    config::{Config, RpcConfig},
    loader::{LoaderOptions, RelationLoader, RelationSource},
    metrics::{LoaderMetrics, RpcMetrics},
    registry::Registry,
};

type ResolveFn =
    Arc<dyn Fn(RequestContext, Value) -> BoxFuture<Result<Value, CallError>> + Send + Sync>;
type SubscribeFn =
    Arc<dyn Fn(RequestContext, Value) -> BoxStream<Result<Value, CallError>> + Send + Sync>;

#[derive(derive_more::Debug, Clone)]
enum Handler {
    Query(#[debug("ResolveFn")] ResolveFn),
    Mutation(#[debug("ResolveFn")] ResolveFn),
    Subscription(#[debug("SubscribeFn")] SubscribeFn),
}

impl Handler {
    fn call_type(&self) -> CallType {
        match self {
            Handler::Query(_) => CallType::Query,
            Handler::Mutation(_) => CallType::Mutation,
            Handler::Subscription(_) => CallType::Subscription,
        }
    }
}

/// Handlers, keyed by call type and path.
#[derive(Debug, Clone, Default)]
struct HandlerMap(BTreeMap<(CallType, String), Handler>);

impl HandlerMap {
    fn get(&self, call_type: CallType, path: &CallPath) -> Option<&Handler> {
        self.0.get(&(call_type, path.to_string()))
    }

    fn insert(&mut self, path: String, handler: Handler) {
        self.0.insert((handler.call_type(), path), handler);
    }

    fn paths(&self) -> impl Iterator<Item = (CallType, &str)> {
        self.0
            .keys()
            .map(|(call_type, path)| (*call_type, path.as_str()))
    }
}

/// Per-call state handed to handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    path: CallPath,
    select: Option<FieldSelection>,
    registry: Option<Registry>,
    loader: Option<Arc<RelationLoader<Value>>>,
}

impl RequestContext {
    /// Returns the path of the call.
    pub fn path(&self) -> &CallPath {
        &self.path
    }

    /// Returns the field selection of the call.
    ///
    /// Handlers may use it to skip work for unselected fields.
    pub fn select(&self) -> Option<&FieldSelection> {
        self.select.as_ref()
    }

    /// Returns true if the top level field `name` was selected, or no selection was made.
    pub fn wants(&self, name: &str) -> bool {
        self.select
            .as_ref()
            .is_none_or(|select| select.includes(name))
    }

    /// Returns the resource registry, if the router has one.
    pub fn registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }

    /// Returns the relationship loader scoped to this call.
    pub fn loader(&self) -> Result<&RelationLoader<Value>, CallError> {
        self.loader
            .as_deref()
            .ok_or_else(|| CallError::handler("no relation source configured"))
    }
}

/// Builder for a [`Router`].
#[derive(Debug, Default)]
pub struct RouterBuilder {
    handlers: HandlerMap,
    relations: Option<(Registry, Arc<dyn RelationSource<Value>>)>,
    config: RpcConfig,
    loader_options: LoaderOptions,
    metrics: Arc<RpcMetrics>,
    loader_metrics: Arc<LoaderMetrics>,
}

impl RouterBuilder {
    /// Registers a query handler at `path`.
    pub fn query<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        self.handlers
            .insert(path.into(), Handler::Query(resolve_fn(handler)));
        self
    }

    /// Registers a mutation handler at `path`.
    pub fn mutation<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        self.handlers
            .insert(path.into(), Handler::Mutation(resolve_fn(handler)));
        self
    }

    /// Registers a subscription handler at `path`.
    ///
    /// The handler yields full values; the router encodes them per the requested update mode.
    pub fn subscription<F, S>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Value) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, CallError>> + Send + 'static,
    {
        let handler: SubscribeFn =
            Arc::new(move |ctx, input| -> BoxStream<Result<Value, CallError>> {
                Box::pin(handler(ctx, input))
            });
        self.handlers
            .insert(path.into(), Handler::Subscription(handler));
        self
    }

    /// Resolves relationships of `registry` through `source` in every call.
    pub fn relations(mut self, registry: Registry, source: Arc<dyn RelationSource<Value>>) -> Self {
        self.relations = Some((registry, source));
        self
    }

    /// Sets the rpc config.
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Applies the rpc and loader sections of a full config.
    pub fn with_config(self, config: &Config) -> Self {
        self.config(config.rpc.clone()).loader_options(config.loader)
    }

    /// Sets the options of the per-call batch loaders.
    pub fn loader_options(mut self, options: LoaderOptions) -> Self {
        self.loader_options = options;
        self
    }

    /// Shares metrics groups with other components.
    pub fn metrics(mut self, rpc: Arc<RpcMetrics>, loader: Arc<LoaderMetrics>) -> Self {
        self.metrics = rpc;
        self.loader_metrics = loader;
        self
    }

    /// Finishes the router.
    pub fn build(self) -> Router {
        for (call_type, path) in self.handlers.paths() {
            debug!(%call_type, %path, "registered handler");
        }
        Router {
            inner: Arc::new(RouterInner {
                handlers: self.handlers,
                relations: self.relations,
                config: self.config,
                loader_options: self.loader_options,
                metrics: self.metrics,
                loader_metrics: self.loader_metrics,
            }),
        }
    }
}

fn resolve_fn<F, Fut>(handler: F) -> ResolveFn
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    Arc::new(move |ctx, input| -> BoxFuture<Result<Value, CallError>> {
        Box::pin(handler(ctx, input))
    })
}

/// A [`Transport`] dispatching calls to handlers in the same process.
///
/// This is a cheaply cloneable handle.
#[derive(Debug, Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

#[derive(Debug)]
struct RouterInner {
    handlers: HandlerMap,
    relations: Option<(Registry, Arc<dyn RelationSource<Value>>)>,
    config: RpcConfig,
    loader_options: LoaderOptions,
    metrics: Arc<RpcMetrics>,
    loader_metrics: Arc<LoaderMetrics>,
}

impl Router {
    /// Creates a builder with no handlers.
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Returns the metrics of this router.
    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.inner.metrics
    }

    /// Lists the registered handlers.
    pub fn handlers(&self) -> Vec<(CallType, String)> {
        self.inner
            .handlers
            .paths()
            .map(|(call_type, path)| (call_type, path.to_string()))
            .collect()
    }

    fn context(&self, request: &CallRequest) -> RequestContext {
        let (registry, loader) = match &self.inner.relations {
            Some((registry, source)) => {
                let loader = RelationLoader::new(registry.clone(), source.clone())
                    .with_options(self.inner.loader_options)
                    .with_metrics(self.inner.loader_metrics.clone());
                (Some(registry.clone()), Some(Arc::new(loader)))
            }
            None => (None, None),
        };
        RequestContext {
            path: request.path.clone(),
            select: request.select.clone(),
            registry,
            loader,
        }
    }

    fn prune(&self, select: Option<&FieldSelection>, value: Value) -> Value {
        match select {
            Some(select) if self.inner.config.prune_selection => select.prune(&value),
            _ => value,
        }
    }

    fn resolve(&self, request: CallRequest) -> BoxFuture<Result<Value, CallError>> {
        let handler = match self.inner.handlers.get(request.call_type, &request.path) {
            Some(Handler::Query(handler) | Handler::Mutation(handler)) => handler.clone(),
            _ => {
                self.inner.metrics.call_errors.inc();
                let err = CallError::not_found(request.call_type, &request.path);
                return Box::pin(async move { Err(err) });
            }
        };
        trace!(call_type = %request.call_type, path = %request.path, "dispatching");
        let ctx = self.context(&request);
        let this = self.clone();
        Box::pin(async move {
            match handler(ctx, request.input).await {
                Ok(value) => Ok(this.prune(request.select.as_ref(), value)),
                Err(err) => {
                    debug!(path = %request.path, %err, "handler failed");
                    this.inner.metrics.call_errors.inc();
                    Err(err)
                }
            }
        })
    }
}

impl Transport for Router {
    fn query(&self, request: CallRequest) -> BoxFuture<Result<Value, CallError>> {
        self.inner.metrics.queries.inc();
        self.resolve(request)
    }

    fn mutate(&self, request: CallRequest) -> BoxFuture<Result<Value, CallError>> {
        self.inner.metrics.mutations.inc();
        self.resolve(request)
    }

    fn subscribe(&self, request: CallRequest) -> BoxStream<Result<Update, CallError>> {
        self.inner.metrics.subscriptions.inc();
        let handler = match self.inner.handlers.get(CallType::Subscription, &request.path) {
            Some(Handler::Subscription(handler)) => handler.clone(),
            _ => {
                self.inner.metrics.call_errors.inc();
                let err = CallError::not_found(CallType::Subscription, &request.path);
                return Box::pin(stream::once(async move { Err(err) }));
            }
        };
        let mode = request
            .update_mode
            .unwrap_or(self.inner.config.default_update_mode);
        trace!(path = %request.path, %mode, "subscribing");
        let mut encoder =
            UpdateEncoder::new(mode).with_max_patch_changes(self.inner.config.auto_patch_max_changes);
        let ctx = self.context(&request);
        let values = handler(ctx, request.input);
        let this = self.clone();
        let select = request.select;
        Box::pin(values.map(move |value| -> Result<Update, CallError> {
            let value = this.prune(select.as_ref(), value?);
            let update = encoder.encode(value);
            let metrics = &this.inner.metrics;
            match &update {
                Update::Value { .. } => metrics.updates_value.inc(),
                Update::Patch { .. } => metrics.updates_patch.inc(),
                Update::Delta { .. } => metrics.updates_delta.inc(),
            };
            Ok(update)
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use n0_snafu::{Result, ResultExt};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        loader::{LoadError, group_by_key, relations::ForeignKeyQuery},
        registry::ResourceDefinition,
        rpc::{UpdateMode, client::Client},
    };

    #[derive(Debug, Default)]
    struct Steps {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RelationSource<Value> for Steps {
        fn fetch_by_foreign_key(
            &self,
            query: ForeignKeyQuery,
            parent_ids: Vec<String>,
        ) -> BoxFuture<std::result::Result<Vec<Vec<Value>>, LoadError>> {
            self.calls.lock().unwrap().push(parent_ids.clone());
            let rows = vec![
                json!({ "id": "s1", "message_id": "m1" }),
                json!({ "id": "s2", "message_id": "m1" }),
            ];
            let groups = group_by_key(&parent_ids, rows, |row| {
                row[&query.foreign_key].as_str().map(String::from)
            });
            Box::pin(async move { Ok(groups) })
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register(
                ResourceDefinition::new("message")
                    .fields(json!({}))
                    .has_many("steps", "step", "message_id"),
            )
            .unwrap();
        registry
            .register(ResourceDefinition::new("step").fields(json!({})))
            .unwrap();
        registry
    }

    async fn list_steps(ctx: RequestContext, _input: Value) -> std::result::Result<Value, CallError> {
        let ids = vec!["m1".to_string(), "m2".to_string()];
        let loader = ctx.loader()?;
        let relationship = loader.registry().relationship("message", "steps")?;
        let (a, b) = tokio::join!(
            loader.load_has_many(&ids[..1], &relationship),
            loader.load_has_many(&ids[1..], &relationship),
        );
        Ok(json!({ "m1": a?["m1"], "m2": b?["m2"] }))
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_path_is_not_found() {
        let router = Router::builder()
            .query("a.b", |_, _| async { Ok(json!(1)) })
            .build();
        let client = Client::new(Arc::new(router.clone()));
        let err = client.path("a").path("c").query().await.unwrap_err();
        assert!(matches!(err, CallError::NotFound { .. }));
        // Registered as a query, not a mutation.
        let err = client.path("a").path("b").mutate().await.unwrap_err();
        assert!(matches!(err, CallError::NotFound { call_type: CallType::Mutation, .. }));
        assert_eq!(router.metrics().call_errors.get(), 2);
    }

    #[tokio::test]
    async fn selection_is_pruned_unless_disabled() -> Result {
        let handler = |_: RequestContext, _: Value| async {
            Ok(json!({ "id": "m1", "text": "hi", "secret": true }))
        };
        let select = FieldSelection::Fields(vec!["id".into(), "text".into()]);

        let router = Router::builder().query("message.get", handler).build();
        let value = Client::new(Arc::new(router))
            .path("message")
            .path("get")
            .select(select.clone())
            .query()
            .await?;
        assert_eq!(value, json!({ "id": "m1", "text": "hi" }));

        let router = Router::builder()
            .query("message.get", handler)
            .config(RpcConfig {
                prune_selection: false,
                ..Default::default()
            })
            .build();
        let value = Client::new(Arc::new(router))
            .path("message")
            .path("get")
            .select(select)
            .query()
            .await?;
        assert_eq!(value["secret"], json!(true));
        Ok(())
    }

    #[tokio::test]
    async fn handlers_share_one_relation_loader_per_call() -> Result {
        let steps = Arc::new(Steps::default());
        let router = Router::builder()
            .relations(registry(), steps.clone())
            .query("message.list", list_steps)
            .build();
        let client = Client::new(Arc::new(router));
        let value = client.path("message").path("list").query().await?;
        assert_eq!(
            value,
            json!({
                "m1": [{ "id": "s1", "message_id": "m1" }, { "id": "s2", "message_id": "m1" }],
                "m2": []
            })
        );
        client.path("message").path("list").query().await?;
        // One batch per call, no cache shared between calls.
        assert_eq!(
            *steps.calls.lock().unwrap(),
            vec![
                vec!["m1".to_string(), "m2".to_string()],
                vec!["m1".to_string(), "m2".to_string()]
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn subscription_encodes_per_requested_mode() -> Result {
        let router = Router::builder()
            .subscription("chat.stream", |_, _| {
                stream::iter(["", "Hi", "Hi there"].map(|text| Ok(json!({ "text": text }))))
            })
            .build();
        let updates: Vec<_> = router
            .subscribe(CallRequest {
                update_mode: Some(UpdateMode::Delta),
                ..CallRequest::new(
                    CallType::Subscription,
                    "chat.stream".parse::<CallPath>().e()?,
                )
            })
            .collect()
            .await;
        let updates: Vec<Update> = updates.into_iter().collect::<std::result::Result<_, _>>()?;
        assert_eq!(
            updates,
            vec![
                Update::Value {
                    value: json!({ "text": "" })
                },
                Update::Delta {
                    path: vec!["text".into()],
                    text: "Hi".into()
                },
                Update::Delta {
                    path: vec!["text".into()],
                    text: " there".into()
                },
            ]
        );
        assert_eq!(router.metrics().updates_delta.get(), 2);

        let mut values = Client::new(Arc::new(router))
            .path("chat")
            .path("stream")
            .update_mode(UpdateMode::Patch)
            .subscribe();
        let mut last = None;
        while let Some(value) = values.next().await {
            last = Some(value?);
        }
        assert_eq!(last, Some(json!({ "text": "Hi there" })));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_subscription_yields_error() {
        let router = Router::builder().build();
        let mut updates =
            router.subscribe(CallRequest::new(CallType::Subscription, "nope".parse().unwrap()));
        assert!(matches!(
            updates.next().await,
            Some(Err(CallError::NotFound { .. }))
        ));
        assert!(updates.next().await.is_none());
    }
}
