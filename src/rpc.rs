//! Path-addressed call protocol.
//!
//! A call names a procedure by a dotted path, e.g. `session.messages.list`, and has one of
//! three [`CallType`]s. The [`client::Client`] builds calls segment by segment and hands the
//! finished [`CallRequest`] to a [`Transport`], the only component that performs I/O. The
//! in-process [`router::Router`] is a transport that dispatches to registered handlers.
//!
//! Subscriptions emit [`update::Update`]s instead of plain values, see [`update`].

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use n0_future::boxed::{BoxFuture, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::Snafu;

pub mod client;
pub mod router;
pub mod update;

pub use self::{
    client::{Call, Client, SubscriptionStream},
    router::{RequestContext, Router, RouterBuilder},
    update::{Update, UpdateMode},
};

/// The kind of a call.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CallType {
    /// Reads data.
    Query,
    /// Changes data, optionally applying an optimistic update first.
    Mutation,
    /// Streams a sequence of values.
    Subscription,
}

/// The dotted path naming a procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallPath(Vec<String>);

impl CallPath {
    /// Creates an empty path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment.
    pub fn push(&mut self, segment: impl Into<String>) {
        self.0.push(segment.into());
    }

    /// Returns a copy of this path with `segment` appended.
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.push(segment);
        path
    }

    /// Returns the segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns true if the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Error parsing a [`CallPath`].
#[derive(Debug, Snafu)]
#[snafu(display("Invalid call path '{path}': segments must not be empty"))]
pub struct CallPathParseError {
    path: String,
}

impl FromStr for CallPath {
    type Err = CallPathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('.').map(String::from).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(CallPathParseSnafu { path: s }.build());
        }
        Ok(Self(segments))
    }
}

impl<S: Into<String>> FromIterator<S> for CallPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A requested subset of a result's fields.
///
/// A list selects top level fields. A map mirrors the nesting of the result: `true` selects a
/// field with all its descendants, `false` drops it, and a nested selection restricts it.
///
/// ```
/// use syncwire::rpc::FieldSelection;
///
/// let select: FieldSelection = serde_json::from_value(serde_json::json!({
///     "id": true,
///     "steps": ["id", "kind"],
/// }))
/// .unwrap();
/// let pruned = select.prune(&serde_json::json!({
///     "id": "m1",
///     "text": "long",
///     "steps": [{ "id": "s1", "kind": "tool", "output": "..." }],
/// }));
/// assert_eq!(
///     pruned,
///     serde_json::json!({ "id": "m1", "steps": [{ "id": "s1", "kind": "tool" }] })
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelection {
    /// Top level field names, e.g. `["id", "title"]`.
    Fields(Vec<String>),
    /// Field names mapped to `true` or to a selection of their own fields.
    Nested(BTreeMap<String, SelectionNode>),
}

/// A node of a nested [`FieldSelection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionNode {
    /// Selects the whole field if `true`.
    All(bool),
    /// Selects part of the field.
    Sub(FieldSelection),
}

impl FieldSelection {
    /// Returns true if the top level field `name` is selected.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            FieldSelection::Fields(fields) => fields.iter().any(|field| field == name),
            FieldSelection::Nested(nodes) => {
                matches!(nodes.get(name), Some(SelectionNode::All(true) | SelectionNode::Sub(_)))
            }
        }
    }

    /// Returns the selection nested under `name`, if it is restricted.
    pub fn nested(&self, name: &str) -> Option<&FieldSelection> {
        match self {
            FieldSelection::Nested(nodes) => match nodes.get(name) {
                Some(SelectionNode::Sub(sub)) => Some(sub),
                _ => None,
            },
            FieldSelection::Fields(_) => None,
        }
    }

    /// Strips every field outside this selection from `value`.
    ///
    /// Arrays are pruned element by element. Scalars are returned unchanged.
    pub fn prune(&self, value: &Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.iter().map(|item| self.prune(item)).collect()),
            Value::Object(map) => {
                let mut pruned = Map::new();
                for (key, field) in map {
                    if !self.includes(key) {
                        continue;
                    }
                    let field = match self.nested(key) {
                        Some(sub) => sub.prune(field),
                        None => field.clone(),
                    };
                    pruned.insert(key.clone(), field);
                }
                Value::Object(pruned)
            }
            _ => value.clone(),
        }
    }
}

/// A fully built call, as handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// The kind of call.
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// The procedure to call.
    pub path: CallPath,
    /// Procedure input, `null` if none was given.
    #[serde(default)]
    pub input: Value,
    /// Fields the caller wants back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<FieldSelection>,
    /// Encoding of subscription emissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
}

impl CallRequest {
    /// Creates a request without input, selection or update mode.
    pub fn new(call_type: CallType, path: CallPath) -> Self {
        Self {
            call_type,
            path,
            input: Value::Null,
            select: None,
            update_mode: None,
        }
    }
}

/// Errors of a call.
///
/// Errors are cloned to every subscriber of a failed call, so they carry no backtrace.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum CallError {
    #[snafu(display("No {call_type} handler at '{path}'"))]
    NotFound { call_type: CallType, path: String },
    #[snafu(display("Handler failed: {message}"))]
    Handler { message: String },
    #[snafu(display("Call timed out after {after:?}"))]
    Timeout { after: Duration },
    #[snafu(display("Transport failed: {message}"))]
    Transport { message: String },
    #[snafu(display("Invalid update: {message}"))]
    InvalidUpdate { message: String },
    #[snafu(display("Failed to decode result: {message}"))]
    Decode { message: String },
}

impl CallError {
    /// Creates a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        HandlerSnafu {
            message: message.into(),
        }
        .build()
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        TransportSnafu {
            message: message.into(),
        }
        .build()
    }

    /// Creates an invalid update error.
    pub fn invalid_update(message: impl Into<String>) -> Self {
        InvalidUpdateSnafu {
            message: message.into(),
        }
        .build()
    }

    pub(crate) fn not_found(call_type: CallType, path: &CallPath) -> Self {
        NotFoundSnafu {
            call_type,
            path: path.to_string(),
        }
        .build()
    }
}

impl From<crate::loader::LoadError> for CallError {
    fn from(err: crate::loader::LoadError) -> Self {
        CallError::handler(err.to_string())
    }
}

impl From<crate::registry::RegistryError> for CallError {
    fn from(err: crate::registry::RegistryError) -> Self {
        CallError::handler(err.to_string())
    }
}

/// The I/O boundary of the call protocol.
///
/// Implementations carry calls over HTTP, sockets, server-sent events, or, like
/// [`router::Router`], dispatch them in process.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Performs a query.
    fn query(&self, request: CallRequest) -> BoxFuture<Result<Value, CallError>>;

    /// Performs a mutation.
    fn mutate(&self, request: CallRequest) -> BoxFuture<Result<Value, CallError>>;

    /// Opens a subscription.
    ///
    /// The first item of a successful subscription is an [`Update::Value`].
    fn subscribe(&self, request: CallRequest) -> BoxStream<Result<Update, CallError>>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn call_path_parse_and_display() {
        let path: CallPath = "session.messages.list".parse().unwrap();
        assert_eq!(path.segments(), ["session", "messages", "list"]);
        assert_eq!(path.to_string(), "session.messages.list");
        assert_eq!(
            CallPath::new().join("a").join("b"),
            "a.b".parse::<CallPath>().unwrap()
        );
        assert!("a..b".parse::<CallPath>().is_err());
        assert!("".parse::<CallPath>().is_err());
    }

    #[test]
    fn request_wire_shape() {
        let mut request = CallRequest::new(CallType::Subscription, "chat.stream".parse().unwrap());
        request.input = json!({ "sessionId": "S" });
        request.update_mode = Some(UpdateMode::Delta);
        request.select = Some(FieldSelection::Fields(vec!["text".into()]));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "subscription",
                "path": ["chat", "stream"],
                "input": { "sessionId": "S" },
                "select": ["text"],
                "updateMode": "delta",
            })
        );
        let parsed: CallRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn field_selection_prunes_nested_shapes() {
        let select: FieldSelection = serde_json::from_value(json!({
            "id": true,
            "secret": false,
            "author": { "name": true },
        }))
        .unwrap();
        let value = json!([
            { "id": 1, "secret": "x", "extra": 1, "author": { "name": "a", "email": "e" } },
            { "id": 2 }
        ]);
        assert_eq!(
            select.prune(&value),
            json!([{ "id": 1, "author": { "name": "a" } }, { "id": 2 }])
        );
        assert!(select.includes("author"));
        assert!(!select.includes("secret"));
        assert_eq!(select.prune(&json!("scalar")), json!("scalar"));
    }
}
