//! Resource and relationship registry.
//!
//! A [`Registry`] holds the [`ResourceDefinition`]s known to a process. Resources may be
//! registered in any order: a relationship whose target is not registered yet only logs a
//! warning. Once every resource is known, [`Registry::validate_all_relationships`] can be run
//! to make dangling targets a hard error.
//!
//! ```
//! use syncwire::registry::{Registry, ResourceDefinition};
//!
//! # fn main() -> Result<(), syncwire::registry::RegistryError> {
//! let registry = Registry::new();
//! registry.register(
//!     ResourceDefinition::new("message")
//!         .fields(serde_json::json!({ "id": "string" }))
//!         .has_many("steps", "step", "message_id"),
//! )?;
//! registry.register(ResourceDefinition::new("step").fields(serde_json::json!({})))?;
//! registry.validate_all_relationships()?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};
use tracing::{debug, warn};

/// Relationship kinds, as they appear in the `type` tag of a serialized [`Relationship`].
pub const RELATIONSHIP_KINDS: [&str; 4] = ["hasMany", "belongsTo", "hasOne", "manyToMany"];

/// A typed association between two resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Relationship {
    /// Rows of `target` whose `foreign_key` points at the parent.
    #[serde(rename_all = "camelCase")]
    HasMany {
        /// The child resource.
        target: String,
        /// Column of the child holding the parent's id.
        foreign_key: String,
        /// Column the children are ordered by.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_by: Option<String>,
    },
    /// The parent row of `target` referenced by the child's `foreign_key`.
    #[serde(rename_all = "camelCase")]
    BelongsTo {
        /// The parent resource.
        target: String,
        /// Column of the child holding the parent's id.
        foreign_key: String,
    },
    /// At most one row of `target` whose `foreign_key` points at the parent.
    #[serde(rename_all = "camelCase")]
    HasOne {
        /// The child resource.
        target: String,
        /// Column of the child holding the parent's id.
        foreign_key: String,
    },
    /// Rows of `target` linked through the `through` junction collection.
    #[serde(rename_all = "camelCase")]
    ManyToMany {
        /// The linked resource.
        target: String,
        /// The junction collection.
        through: String,
        /// Column of the junction holding the source's id.
        foreign_key: String,
    },
}

/// The kind of a [`Relationship`], without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum RelationshipKind {
    /// See [`Relationship::HasMany`].
    HasMany,
    /// See [`Relationship::BelongsTo`].
    BelongsTo,
    /// See [`Relationship::HasOne`].
    HasOne,
    /// See [`Relationship::ManyToMany`].
    ManyToMany,
}

impl Relationship {
    /// Returns the kind of this relationship.
    pub fn kind(&self) -> RelationshipKind {
        match self {
            Relationship::HasMany { .. } => RelationshipKind::HasMany,
            Relationship::BelongsTo { .. } => RelationshipKind::BelongsTo,
            Relationship::HasOne { .. } => RelationshipKind::HasOne,
            Relationship::ManyToMany { .. } => RelationshipKind::ManyToMany,
        }
    }

    /// Returns the name of the resource this relationship points at.
    pub fn target(&self) -> &str {
        match self {
            Relationship::HasMany { target, .. }
            | Relationship::BelongsTo { target, .. }
            | Relationship::HasOne { target, .. }
            | Relationship::ManyToMany { target, .. } => target,
        }
    }

    /// Returns the foreign key column of this relationship.
    pub fn foreign_key(&self) -> &str {
        match self {
            Relationship::HasMany { foreign_key, .. }
            | Relationship::BelongsTo { foreign_key, .. }
            | Relationship::HasOne { foreign_key, .. }
            | Relationship::ManyToMany { foreign_key, .. } => foreign_key,
        }
    }
}

/// A named, schema-described resource with optional relationships.
///
/// The `fields` schema is opaque to this crate, but it must be present for the definition to
/// be accepted by [`Registry::register`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Unique resource name.
    pub name: String,
    /// Schema of the resource's fields.
    #[serde(default)]
    pub fields: Option<serde_json::Value>,
    /// Relationships by name.
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    /// Storage table, if it differs from the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
}

impl ResourceDefinition {
    /// Creates a definition with no fields schema and no relationships.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: None,
            relationships: BTreeMap::new(),
            table_name: None,
        }
    }

    /// Sets the fields schema.
    pub fn fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Sets the storage table name.
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    /// Adds a relationship under `key`.
    pub fn relationship(mut self, key: impl Into<String>, relationship: Relationship) -> Self {
        self.relationships.insert(key.into(), relationship);
        self
    }

    /// Adds a [`Relationship::HasMany`] to `target` under `key`.
    pub fn has_many(
        self,
        key: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationship(
            key,
            Relationship::HasMany {
                target: target.into(),
                foreign_key: foreign_key.into(),
                order_by: None,
            },
        )
    }

    /// Adds a [`Relationship::BelongsTo`] to `target` under `key`.
    pub fn belongs_to(
        self,
        key: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationship(
            key,
            Relationship::BelongsTo {
                target: target.into(),
                foreign_key: foreign_key.into(),
            },
        )
    }

    /// Adds a [`Relationship::HasOne`] to `target` under `key`.
    pub fn has_one(
        self,
        key: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationship(
            key,
            Relationship::HasOne {
                target: target.into(),
                foreign_key: foreign_key.into(),
            },
        )
    }

    /// Adds a [`Relationship::ManyToMany`] to `target` through the `through` junction.
    pub fn many_to_many(
        self,
        key: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationship(
            key,
            Relationship::ManyToMany {
                target: target.into(),
                through: through.into(),
                foreign_key: foreign_key.into(),
            },
        )
    }

    /// Returns the storage table name, which defaults to the resource name.
    pub fn storage_name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(&self.name)
    }

    /// Parses a definition from its JSON form.
    ///
    /// Relationship `type` tags are checked against [`RELATIONSHIP_KINDS`] before decoding, so
    /// a misspelled kind is reported as [`RegistryError::UnknownRelationshipType`] instead of a
    /// generic decode failure.
    pub fn from_json(value: serde_json::Value) -> Result<Self, RegistryError> {
        let name = value
            .get("name")
            .and_then(|name| name.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(relationships) = value.get("relationships").and_then(|r| r.as_object()) {
            for (key, relationship) in relationships {
                let kind = relationship
                    .get("type")
                    .and_then(|kind| kind.as_str())
                    .unwrap_or_default();
                ensure!(
                    RELATIONSHIP_KINDS.contains(&kind),
                    UnknownRelationshipTypeSnafu {
                        resource: name.clone(),
                        relationship: key.clone(),
                        kind: kind.to_string(),
                    }
                );
            }
        }
        serde_json::from_value(value).map_err(|err| {
            DecodeSnafu {
                resource: name,
                message: err.to_string(),
            }
            .build()
        })
    }
}

/// Registry errors
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RegistryError {
    #[snafu(display("Resource name must not be empty"))]
    EmptyName {},
    #[snafu(display("Resource '{name}' is already registered"))]
    DuplicateResource { name: String },
    #[snafu(display("Resource '{name}' has no fields schema"))]
    MissingFields { name: String },
    #[snafu(display("Relationship '{resource}.{relationship}' is invalid: {reason}"))]
    InvalidRelationship {
        resource: String,
        relationship: String,
        reason: &'static str,
    },
    #[snafu(display("Relationship '{resource}.{relationship}' has unknown type '{kind}'"))]
    UnknownRelationshipType {
        resource: String,
        relationship: String,
        kind: String,
    },
    #[snafu(display("Failed to decode resource '{resource}': {message}"))]
    Decode { resource: String, message: String },
    #[snafu(display("Unresolved relationship targets: {}", dangling.join(", ")))]
    UnresolvedTargets { dangling: Vec<String> },
    #[snafu(display("Resource '{name}' is not registered"))]
    UnknownResource { name: String },
    #[snafu(display("Resource '{resource}' has no relationship '{relationship}'"))]
    UnknownRelationship {
        resource: String,
        relationship: String,
    },
}

/// Registry of resource definitions.
///
/// This is a cheaply cloneable handle; all clones share the same definitions.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    resources: Arc<RwLock<BTreeMap<String, Arc<ResourceDefinition>>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource.
    ///
    /// Fails if the name is empty or already taken, if the fields schema is missing, or if a
    /// relationship does not name a target and foreign key. An existing entry is never
    /// modified by a failed registration.
    ///
    /// Relationship targets that are not registered yet are accepted with a warning.
    pub fn register(&self, definition: ResourceDefinition) -> Result<(), RegistryError> {
        ensure!(!definition.name.is_empty(), EmptyNameSnafu);
        ensure!(
            definition.fields.is_some(),
            MissingFieldsSnafu {
                name: definition.name.clone(),
            }
        );
        for (key, relationship) in &definition.relationships {
            ensure!(
                !relationship.target().is_empty(),
                InvalidRelationshipSnafu {
                    resource: definition.name.clone(),
                    relationship: key.clone(),
                    reason: "missing target",
                }
            );
            ensure!(
                !relationship.foreign_key().is_empty(),
                InvalidRelationshipSnafu {
                    resource: definition.name.clone(),
                    relationship: key.clone(),
                    reason: "missing foreign key",
                }
            );
            if let Relationship::ManyToMany { through, .. } = relationship {
                ensure!(
                    !through.is_empty(),
                    InvalidRelationshipSnafu {
                        resource: definition.name.clone(),
                        relationship: key.clone(),
                        reason: "missing junction",
                    }
                );
            }
        }

        let mut guard = self.resources.write().expect("poisoned");
        ensure!(
            !guard.contains_key(&definition.name),
            DuplicateResourceSnafu {
                name: definition.name.clone(),
            }
        );
        for (key, relationship) in &definition.relationships {
            let target = relationship.target();
            if target != definition.name && !guard.contains_key(target) {
                warn!(
                    resource = %definition.name,
                    relationship = %key,
                    %target,
                    "relationship target is not registered yet"
                );
            }
        }
        debug!(resource = %definition.name, "registered resource");
        guard.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Returns the definition registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ResourceDefinition>> {
        self.resources.read().expect("poisoned").get(name).cloned()
    }

    /// Returns true if a resource named `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.resources.read().expect("poisoned").contains_key(name)
    }

    /// Lists the names of all registered resources.
    pub fn list(&self) -> Vec<String> {
        self.resources
            .read()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Looks up the relationship `key` of `resource`.
    pub fn relationship(&self, resource: &str, key: &str) -> Result<Relationship, RegistryError> {
        let definition = self.get(resource).ok_or_else(|| {
            UnknownResourceSnafu {
                name: resource.to_string(),
            }
            .build()
        })?;
        definition.relationships.get(key).cloned().ok_or_else(|| {
            UnknownRelationshipSnafu {
                resource: resource.to_string(),
                relationship: key.to_string(),
            }
            .build()
        })
    }

    /// Checks that every relationship target names a registered resource.
    ///
    /// All dangling targets are collected into a single error.
    pub fn validate_all_relationships(&self) -> Result<(), RegistryError> {
        let guard = self.resources.read().expect("poisoned");
        let dangling: Vec<String> = guard
            .values()
            .flat_map(|definition| {
                definition
                    .relationships
                    .iter()
                    .filter(|(_, relationship)| !guard.contains_key(relationship.target()))
                    .map(|(key, relationship)| {
                        format!("{}.{} -> {}", definition.name, key, relationship.target())
                    })
            })
            .collect();
        ensure!(dangling.is_empty(), UnresolvedTargetsSnafu { dangling });
        Ok(())
    }

    /// Removes all registered resources.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn clear(&self) {
        self.resources.write().expect("poisoned").clear();
    }
}
