//! Relationship loaders.
//!
//! A [`RelationLoader`] resolves relationships declared in the [`Registry`] through a
//! [`RelationSource`], the storage boundary. Each relationship gets one [`BatchLoader`] per
//! loader scope, so resolving the same relationship for many parents in one flush window costs
//! a single storage round trip.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex},
};

use n0_future::boxed::BoxFuture;
use tracing::trace;

use super::{BatchLoader, BatchResult, LoadError, LoaderOptions};
use crate::{
    metrics::LoaderMetrics,
    registry::{Registry, Relationship, RelationshipKind, ResourceDefinition},
};

/// Query for the rows of a resource selected by a foreign key.
#[derive(Debug, Clone)]
pub struct ForeignKeyQuery {
    /// The resource the rows belong to.
    pub target: Arc<ResourceDefinition>,
    /// Column of `target` holding the parent id.
    pub foreign_key: String,
    /// Optional ordering column.
    pub order_by: Option<String>,
}

/// Query for the target ids linked to a source through a junction collection.
#[derive(Debug, Clone)]
pub struct JunctionQuery {
    /// The junction collection.
    pub through: String,
    /// Column of the junction pointing at the source.
    pub foreign_key: String,
    /// The resource on the other side of the junction.
    pub target: Arc<ResourceDefinition>,
}

/// Query for the foreign key values stored on child rows.
#[derive(Debug, Clone)]
pub struct ForeignKeysQuery {
    /// The resource holding the foreign key.
    pub child: Arc<ResourceDefinition>,
    /// The foreign key column.
    pub foreign_key: String,
}

/// Storage boundary used by [`RelationLoader`].
///
/// Every method receives deduplicated ids and must return exactly one entry per id, in the same
/// order. The default implementations report the operation as unsupported, so a source only
/// needs to implement what its relationships use.
pub trait RelationSource<T: Send + 'static>: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the rows matching each parent id, grouped per parent.
    ///
    /// [`super::group_by_key`] turns a flat result set into this shape.
    fn fetch_by_foreign_key(
        &self,
        query: ForeignKeyQuery,
        parent_ids: Vec<String>,
    ) -> BoxFuture<Result<Vec<Vec<T>>, LoadError>> {
        let _ = parent_ids;
        unsupported("foreign key lookup", &query.target.name)
    }

    /// Returns the rows of `target` with the given primary ids.
    fn fetch_by_id(
        &self,
        target: Arc<ResourceDefinition>,
        ids: Vec<String>,
    ) -> BoxFuture<Result<Vec<Option<T>>, LoadError>> {
        let _ = ids;
        unsupported("id lookup", &target.name)
    }

    /// Returns the target ids linked to each source id.
    fn fetch_junction(
        &self,
        query: JunctionQuery,
        source_ids: Vec<String>,
    ) -> BoxFuture<Result<Vec<Vec<String>>, LoadError>> {
        let _ = source_ids;
        unsupported("junction lookup", &query.through)
    }

    /// Returns the foreign key stored on each child row.
    ///
    /// Only used by [`RelationLoader::load_relationship`] for `belongsTo` relationships; callers
    /// of [`RelationLoader::load_belongs_to`] supply the foreign keys themselves.
    fn fetch_foreign_keys(
        &self,
        query: ForeignKeysQuery,
        child_ids: Vec<String>,
    ) -> BoxFuture<Result<Vec<Option<String>>, LoadError>> {
        let _ = child_ids;
        unsupported("foreign key read", &query.child.name)
    }
}

fn unsupported<R: Send + 'static>(what: &str, name: &str) -> BoxFuture<Result<R, LoadError>> {
    let err = LoadError::config(format!("{what} on '{name}' is not supported by this source"));
    Box::pin(async move { Err(err) })
}

/// Adapts an aligned source result to the per-key shape of a batch function.
fn per_key<V: Send + 'static>(
    fetch: BoxFuture<Result<Vec<V>, LoadError>>,
) -> impl Future<Output = BatchResult<V>> + Send + 'static {
    async move { Ok(fetch.await?.into_iter().map(Ok).collect()) }
}

/// The result of resolving a relationship, tagged with its kind.
///
/// All maps are keyed by the ids the relationship was resolved for.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationResult<T> {
    /// Children per parent, empty if a parent has none.
    HasMany(HashMap<String, Vec<T>>),
    /// Parent per child.
    BelongsTo(HashMap<String, Option<T>>),
    /// Child per parent.
    HasOne(HashMap<String, Option<T>>),
    /// Linked rows per source.
    ManyToMany(HashMap<String, Vec<T>>),
}

impl<T> RelationResult<T> {
    /// Returns the kind of relationship this result was produced for.
    pub fn kind(&self) -> RelationshipKind {
        match self {
            RelationResult::HasMany(_) => RelationshipKind::HasMany,
            RelationResult::BelongsTo(_) => RelationshipKind::BelongsTo,
            RelationResult::HasOne(_) => RelationshipKind::HasOne,
            RelationResult::ManyToMany(_) => RelationshipKind::ManyToMany,
        }
    }
}

type GroupKey = (String, String, Option<String>);
type JunctionKey = (String, String, String);

/// Per-scope relationship loaders.
///
/// Create one per request or session; the batch loaders and their caches live as long as the
/// [`RelationLoader`].
pub struct RelationLoader<T: Send + 'static> {
    registry: Registry,
    source: Arc<dyn RelationSource<T>>,
    options: LoaderOptions,
    metrics: Arc<LoaderMetrics>,
    loaders: Mutex<Loaders<T>>,
}

impl<T: Send + 'static> std::fmt::Debug for RelationLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationLoader")
            .field("source", &self.source)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct Loaders<T> {
    groups: HashMap<GroupKey, BatchLoader<String, Vec<T>>>,
    by_id: HashMap<String, BatchLoader<String, Option<T>>>,
    junctions: HashMap<JunctionKey, BatchLoader<String, Vec<String>>>,
    foreign_keys: HashMap<(String, String), BatchLoader<String, Option<String>>>,
}

impl<T> Default for Loaders<T> {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            by_id: HashMap::new(),
            junctions: HashMap::new(),
            foreign_keys: HashMap::new(),
        }
    }
}

impl<T> RelationLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a loader scope resolving relationships of `registry` through `source`.
    pub fn new(registry: Registry, source: Arc<dyn RelationSource<T>>) -> Self {
        Self {
            registry,
            source,
            options: LoaderOptions::default(),
            metrics: Default::default(),
            loaders: Mutex::new(Loaders::default()),
        }
    }

    /// Sets the options of the batch loaders created by this scope.
    pub fn with_options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Shares a metrics group with the batch loaders created by this scope.
    pub fn with_metrics(mut self, metrics: Arc<LoaderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the registry relationships are resolved against.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn target(&self, relationship: &Relationship) -> Result<Arc<ResourceDefinition>, LoadError> {
        let target = relationship.target();
        self.registry
            .get(target)
            .ok_or_else(|| LoadError::config(format!("target '{target}' is not registered")))
    }

    fn group_loader(&self, query: ForeignKeyQuery) -> BatchLoader<String, Vec<T>> {
        let key = (
            query.target.name.clone(),
            query.foreign_key.clone(),
            query.order_by.clone(),
        );
        let mut loaders = self.loaders.lock().expect("poisoned");
        loaders
            .groups
            .entry(key)
            .or_insert_with(|| {
                let source = self.source.clone();
                BatchLoader::new(move |ids: Vec<String>| {
                    per_key(source.fetch_by_foreign_key(query.clone(), ids))
                })
                .with_options(self.options)
                .with_metrics(self.metrics.clone())
            })
            .clone()
    }

    fn id_loader(&self, target: Arc<ResourceDefinition>) -> BatchLoader<String, Option<T>> {
        let mut loaders = self.loaders.lock().expect("poisoned");
        loaders
            .by_id
            .entry(target.name.clone())
            .or_insert_with(|| {
                let source = self.source.clone();
                BatchLoader::new(move |ids: Vec<String>| {
                    per_key(source.fetch_by_id(target.clone(), ids))
                })
                .with_options(self.options)
                .with_metrics(self.metrics.clone())
            })
            .clone()
    }

    fn junction_loader(&self, query: JunctionQuery) -> BatchLoader<String, Vec<String>> {
        let key = (
            query.through.clone(),
            query.foreign_key.clone(),
            query.target.name.clone(),
        );
        let mut loaders = self.loaders.lock().expect("poisoned");
        loaders
            .junctions
            .entry(key)
            .or_insert_with(|| {
                let source = self.source.clone();
                BatchLoader::new(move |ids: Vec<String>| {
                    per_key(source.fetch_junction(query.clone(), ids))
                })
                .with_options(self.options)
                .with_metrics(self.metrics.clone())
            })
            .clone()
    }

    fn foreign_keys_loader(&self, query: ForeignKeysQuery) -> BatchLoader<String, Option<String>> {
        let key = (query.child.name.clone(), query.foreign_key.clone());
        let mut loaders = self.loaders.lock().expect("poisoned");
        loaders
            .foreign_keys
            .entry(key)
            .or_insert_with(|| {
                let source = self.source.clone();
                BatchLoader::new(move |ids: Vec<String>| {
                    per_key(source.fetch_foreign_keys(query.clone(), ids))
                })
                .with_options(self.options)
                .with_metrics(self.metrics.clone())
            })
            .clone()
    }

    /// Resolves a `hasMany` relationship for each of `parent_ids`.
    ///
    /// Parents without children map to an empty list.
    pub async fn load_has_many(
        &self,
        parent_ids: &[String],
        relationship: &Relationship,
    ) -> Result<HashMap<String, Vec<T>>, LoadError> {
        let Relationship::HasMany {
            foreign_key,
            order_by,
            ..
        } = relationship
        else {
            return Err(mismatch(RelationshipKind::HasMany, relationship));
        };
        let query = ForeignKeyQuery {
            target: self.target(relationship)?,
            foreign_key: foreign_key.clone(),
            order_by: order_by.clone(),
        };
        let loader = self.group_loader(query);
        let groups = loader.load_many(parent_ids.iter().cloned()).await;
        parent_ids
            .iter()
            .zip(groups)
            .map(|(id, group)| Ok((id.clone(), group?)))
            .collect()
    }

    /// Resolves a `hasOne` relationship for each of `parent_ids`.
    pub async fn load_has_one(
        &self,
        parent_ids: &[String],
        relationship: &Relationship,
    ) -> Result<HashMap<String, Option<T>>, LoadError> {
        let Relationship::HasOne { foreign_key, .. } = relationship else {
            return Err(mismatch(RelationshipKind::HasOne, relationship));
        };
        let query = ForeignKeyQuery {
            target: self.target(relationship)?,
            foreign_key: foreign_key.clone(),
            order_by: None,
        };
        let loader = self.group_loader(query);
        let groups = loader.load_many(parent_ids.iter().cloned()).await;
        parent_ids
            .iter()
            .zip(groups)
            .map(|(id, group)| Ok((id.clone(), group?.into_iter().next())))
            .collect()
    }

    /// Resolves a `belongsTo` relationship for each of `child_ids`.
    ///
    /// `foreign_keys` maps the child ids to the parent id each child references, and must return
    /// one entry per child id. Parents shared by several children are fetched once.
    pub async fn load_belongs_to<F, Fut>(
        &self,
        child_ids: &[String],
        relationship: &Relationship,
        foreign_keys: F,
    ) -> Result<HashMap<String, Option<T>>, LoadError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<Option<String>>, LoadError>>,
    {
        let Relationship::BelongsTo { .. } = relationship else {
            return Err(mismatch(RelationshipKind::BelongsTo, relationship));
        };
        let target = self.target(relationship)?;
        let keys = foreign_keys(child_ids.to_vec()).await?;
        if keys.len() != child_ids.len() {
            return Err(LoadError::LengthMismatch {
                expected: child_ids.len(),
                actual: keys.len(),
            });
        }
        let parents = self.load_distinct(target, keys.iter().flatten()).await?;
        Ok(child_ids
            .iter()
            .zip(keys)
            .map(|(child, key)| {
                let parent = key.and_then(|key| parents.get(&key).cloned().flatten());
                (child.clone(), parent)
            })
            .collect())
    }

    /// Resolves a `manyToMany` relationship for each of `source_ids`.
    ///
    /// Targets linked from several sources are fetched once. Links to missing targets are
    /// skipped.
    pub async fn load_many_to_many(
        &self,
        source_ids: &[String],
        relationship: &Relationship,
    ) -> Result<HashMap<String, Vec<T>>, LoadError> {
        let Relationship::ManyToMany {
            through,
            foreign_key,
            ..
        } = relationship
        else {
            return Err(mismatch(RelationshipKind::ManyToMany, relationship));
        };
        let target = self.target(relationship)?;
        let query = JunctionQuery {
            through: through.clone(),
            foreign_key: foreign_key.clone(),
            target: target.clone(),
        };
        let links = self
            .junction_loader(query)
            .load_many(source_ids.iter().cloned())
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        let targets = self.load_distinct(target, links.iter().flatten()).await?;
        Ok(source_ids
            .iter()
            .zip(links)
            .map(|(source, linked)| {
                let rows = linked
                    .iter()
                    .filter_map(|id| targets.get(id).cloned().flatten())
                    .collect();
                (source.clone(), rows)
            })
            .collect())
    }

    /// Resolves the relationship `key` of `resource`, dispatching on its kind.
    ///
    /// `belongsTo` foreign keys are read through [`RelationSource::fetch_foreign_keys`].
    pub async fn load_relationship(
        &self,
        resource: &str,
        key: &str,
        ids: &[String],
    ) -> Result<RelationResult<T>, LoadError> {
        let relationship = self.registry.relationship(resource, key)?;
        trace!(%resource, relationship = %key, ids = ids.len(), "loading relationship");
        let result = match &relationship {
            Relationship::HasMany { .. } => {
                RelationResult::HasMany(self.load_has_many(ids, &relationship).await?)
            }
            Relationship::HasOne { .. } => {
                RelationResult::HasOne(self.load_has_one(ids, &relationship).await?)
            }
            Relationship::ManyToMany { .. } => {
                RelationResult::ManyToMany(self.load_many_to_many(ids, &relationship).await?)
            }
            Relationship::BelongsTo { foreign_key, .. } => {
                let child = self.registry.get(resource).ok_or_else(|| {
                    LoadError::config(format!("resource '{resource}' is not registered"))
                })?;
                let loader = self.foreign_keys_loader(ForeignKeysQuery {
                    child,
                    foreign_key: foreign_key.clone(),
                });
                let parents = self
                    .load_belongs_to(ids, &relationship, |ids| async move {
                        loader.load_many(ids).await.into_iter().collect()
                    })
                    .await?;
                RelationResult::BelongsTo(parents)
            }
        };
        Ok(result)
    }

    async fn load_distinct<'a>(
        &self,
        target: Arc<ResourceDefinition>,
        ids: impl Iterator<Item = &'a String>,
    ) -> Result<HashMap<String, Option<T>>, LoadError> {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = ids.filter(|id| seen.insert(*id)).cloned().collect();
        let rows = self.id_loader(target).load_many(distinct.iter().cloned()).await;
        distinct
            .into_iter()
            .zip(rows)
            .map(|(id, row)| Ok((id, row?)))
            .collect()
    }
}

fn mismatch(expected: RelationshipKind, relationship: &Relationship) -> LoadError {
    LoadError::config(format!(
        "expected a {expected} relationship, got {}",
        relationship.kind()
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use super::*;
    use crate::loader::group_by_key;

    /// In-memory storage with a call log.
    #[derive(Debug, Default)]
    struct MemorySource {
        rows: HashMap<String, Vec<Value>>,
        junctions: HashMap<String, Vec<(String, String)>>,
        calls: StdMutex<Vec<(String, Vec<String>)>>,
    }

    impl MemorySource {
        fn record(&self, what: &str, ids: &[String]) {
            self.calls
                .lock()
                .unwrap()
                .push((what.to_string(), ids.to_vec()));
        }

        fn calls(&self, what: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(w, _)| w == what)
                .map(|(_, ids)| ids.clone())
                .collect()
        }
    }

    fn field(row: &Value, name: &str) -> Option<String> {
        row.get(name).and_then(|v| v.as_str()).map(String::from)
    }

    impl RelationSource<Value> for MemorySource {
        fn fetch_by_foreign_key(
            &self,
            query: ForeignKeyQuery,
            parent_ids: Vec<String>,
        ) -> BoxFuture<Result<Vec<Vec<Value>>, LoadError>> {
            self.record("fk", &parent_ids);
            let rows = self.rows.get(&query.target.name).cloned().unwrap_or_default();
            let groups = group_by_key(&parent_ids, rows, |row| field(row, &query.foreign_key));
            Box::pin(async move { Ok(groups) })
        }

        fn fetch_by_id(
            &self,
            target: Arc<ResourceDefinition>,
            ids: Vec<String>,
        ) -> BoxFuture<Result<Vec<Option<Value>>, LoadError>> {
            self.record("id", &ids);
            let rows = self.rows.get(&target.name).cloned().unwrap_or_default();
            let found = ids
                .iter()
                .map(|id| rows.iter().find(|row| field(row, "id").as_ref() == Some(id)).cloned())
                .collect();
            Box::pin(async move { Ok(found) })
        }

        fn fetch_junction(
            &self,
            query: JunctionQuery,
            source_ids: Vec<String>,
        ) -> BoxFuture<Result<Vec<Vec<String>>, LoadError>> {
            self.record("junction", &source_ids);
            let links = self.junctions.get(&query.through).cloned().unwrap_or_default();
            let grouped = group_by_key(&source_ids, links, |(source, _)| Some(source.clone()))
                .into_iter()
                .map(|links| links.into_iter().map(|(_, target)| target).collect())
                .collect();
            Box::pin(async move { Ok(grouped) })
        }

        fn fetch_foreign_keys(
            &self,
            query: ForeignKeysQuery,
            child_ids: Vec<String>,
        ) -> BoxFuture<Result<Vec<Option<String>>, LoadError>> {
            let rows = self.rows.get(&query.child.name).cloned().unwrap_or_default();
            let keys = child_ids
                .iter()
                .map(|id| {
                    rows.iter()
                        .find(|row| field(row, "id").as_ref() == Some(id))
                        .and_then(|row| field(row, &query.foreign_key))
                })
                .collect();
            Box::pin(async move { Ok(keys) })
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        let fields = json!({});
        registry
            .register(
                ResourceDefinition::new("message")
                    .fields(fields.clone())
                    .has_many("steps", "step", "message_id")
                    .has_one("summary", "summary", "message_id")
                    .belongs_to("session", "session", "session_id")
                    .many_to_many("tags", "tag", "message_tags", "message_id"),
            )
            .unwrap();
        for name in ["step", "summary", "session", "tag"] {
            registry
                .register(ResourceDefinition::new(name).fields(fields.clone()))
                .unwrap();
        }
        registry
    }

    fn source() -> MemorySource {
        let mut source = MemorySource::default();
        source.rows.insert(
            "step".into(),
            vec![
                json!({ "id": "s1", "message_id": "m1" }),
                json!({ "id": "s2", "message_id": "m1" }),
            ],
        );
        source.rows.insert(
            "summary".into(),
            vec![json!({ "id": "sum1", "message_id": "m2" })],
        );
        source.rows.insert(
            "session".into(),
            vec![json!({ "id": "S1" }), json!({ "id": "S2" })],
        );
        source.rows.insert(
            "message".into(),
            vec![
                json!({ "id": "m1", "session_id": "S1" }),
                json!({ "id": "m2", "session_id": "S1" }),
                json!({ "id": "m3", "session_id": "S2" }),
            ],
        );
        source.rows.insert(
            "tag".into(),
            vec![json!({ "id": "t1" }), json!({ "id": "t2" })],
        );
        source.junctions.insert(
            "message_tags".into(),
            vec![
                ("m1".into(), "t1".into()),
                ("m1".into(), "t2".into()),
                ("m2".into(), "t2".into()),
                ("m2".into(), "gone".into()),
            ],
        );
        source
    }

    fn loader(source: Arc<MemorySource>) -> RelationLoader<Value> {
        RelationLoader::new(registry(), source)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn has_many_groups_and_defaults_to_empty() {
        let source = Arc::new(source());
        let loader = loader(source.clone());
        let relationship = loader.registry().relationship("message", "steps").unwrap();

        let steps = loader
            .load_has_many(&ids(&["m1", "m2"]), &relationship)
            .await
            .unwrap();
        assert_eq!(steps["m1"].len(), 2);
        assert_eq!(steps["m2"], Vec::<Value>::new());
        assert_eq!(source.calls("fk"), vec![ids(&["m1", "m2"])]);
    }

    #[tokio::test]
    async fn has_many_for_concurrent_callers_is_one_query() {
        let source = Arc::new(source());
        let loader = loader(source.clone());
        let relationship = loader.registry().relationship("message", "steps").unwrap();
        let m1 = ids(&["m1"]);
        let m2 = ids(&["m2", "m1"]);
        let (a, b) = tokio::join!(
            loader.load_has_many(&m1, &relationship),
            loader.load_has_many(&m2, &relationship)
        );
        assert_eq!(a.unwrap()["m1"], b.unwrap()["m1"]);
        assert_eq!(source.calls("fk"), vec![ids(&["m1", "m2"])]);
    }

    #[tokio::test]
    async fn has_one_yields_first_or_none() {
        let loader = loader(Arc::new(source()));
        let relationship = loader.registry().relationship("message", "summary").unwrap();
        let summaries = loader
            .load_has_one(&ids(&["m1", "m2"]), &relationship)
            .await
            .unwrap();
        assert_eq!(summaries["m1"], None);
        assert_eq!(summaries["m2"], Some(json!({ "id": "sum1", "message_id": "m2" })));
    }

    #[tokio::test]
    async fn belongs_to_fetches_shared_parents_once() {
        let source = Arc::new(source());
        let loader = loader(source.clone());
        let relationship = loader.registry().relationship("message", "session").unwrap();
        let sessions = loader
            .load_belongs_to(&ids(&["m1", "m2", "m3"]), &relationship, |children| async move {
                assert_eq!(children.len(), 3);
                Ok(vec![Some("S1".into()), Some("S1".into()), None])
            })
            .await
            .unwrap();
        assert_eq!(sessions["m1"], Some(json!({ "id": "S1" })));
        assert_eq!(sessions["m2"], Some(json!({ "id": "S1" })));
        assert_eq!(sessions["m3"], None);
        assert_eq!(source.calls("id"), vec![ids(&["S1"])]);
    }

    #[tokio::test]
    async fn belongs_to_rejects_misaligned_foreign_keys() {
        let loader = loader(Arc::new(source()));
        let relationship = loader.registry().relationship("message", "session").unwrap();
        let err = loader
            .load_belongs_to(&ids(&["m1", "m2"]), &relationship, |_| async {
                Ok(vec![Some("S1".to_string())])
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::LengthMismatch { expected: 2, actual: 1 }));
    }

    #[tokio::test]
    async fn many_to_many_resolves_through_junction() {
        let source = Arc::new(source());
        let loader = loader(source.clone());
        let relationship = loader.registry().relationship("message", "tags").unwrap();
        let tags = loader
            .load_many_to_many(&ids(&["m1", "m2", "m3"]), &relationship)
            .await
            .unwrap();
        assert_eq!(tags["m1"], vec![json!({ "id": "t1" }), json!({ "id": "t2" })]);
        assert_eq!(tags["m2"], vec![json!({ "id": "t2" })]);
        assert_eq!(tags["m3"], Vec::<Value>::new());
        assert_eq!(source.calls("id"), vec![ids(&["t1", "t2", "gone"])]);
    }

    #[tokio::test]
    async fn load_relationship_dispatches_on_kind() {
        let loader = loader(Arc::new(source()));
        let result = loader
            .load_relationship("message", "session", &ids(&["m3"]))
            .await
            .unwrap();
        assert_eq!(result.kind(), RelationshipKind::BelongsTo);
        assert_eq!(
            result,
            RelationResult::BelongsTo(HashMap::from([(
                "m3".to_string(),
                Some(json!({ "id": "S2" }))
            )]))
        );

        let err = loader
            .load_relationship("message", "authors", &ids(&["m1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Config { .. }));
    }

    #[tokio::test]
    async fn wrong_kind_is_a_configuration_error() {
        let loader = loader(Arc::new(source()));
        let relationship = loader.registry().relationship("message", "tags").unwrap();
        let err = loader
            .load_has_many(&ids(&["m1"]), &relationship)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Config { .. }));
    }

    #[tokio::test]
    async fn unregistered_target_is_a_configuration_error() {
        let registry = Registry::new();
        registry
            .register(
                ResourceDefinition::new("message")
                    .fields(json!({}))
                    .has_many("steps", "step", "message_id"),
            )
            .unwrap();
        let loader: RelationLoader<Value> = RelationLoader::new(registry, Arc::new(source()));
        let err = loader
            .load_relationship("message", "steps", &ids(&["m1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Config { .. }));
    }
}
