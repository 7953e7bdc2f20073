//! Subscription update strategies.
//!
//! A subscription emits a sequence of values. Instead of sending every value in full, the
//! emitting side encodes each one relative to the previous emission with an [`UpdateEncoder`],
//! and the receiving side reconstructs it with an [`UpdateDecoder`]. The strategy tag travels
//! with every [`Update`], so the receiver never has to guess how to apply it.
//!
//! - [`UpdateMode::Value`] always sends the full value.
//! - [`UpdateMode::Patch`] sends the [`PatchOp`]s that turn the previous value into the new one.
//! - [`UpdateMode::Delta`] sends the text appended to a single string field, for token by token
//!   streaming.
//! - [`UpdateMode::Auto`] picks a delta for a single growing string, a patch for an object
//!   with few changed leaves, and the full value otherwise.
//!
//! The first emission of a subscription, and any emission a patch or delta cannot describe,
//! is always sent as a full value.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CallError;

/// How subscription emissions are encoded.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateMode {
    /// Emit the full value.
    Value,
    /// Emit set and remove operations.
    Patch,
    /// Emit the text appended to a string field.
    Delta,
    /// Pick one of the above per emission.
    #[default]
    Auto,
}

/// A step in a path into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// An array index.
    Index(usize),
    /// An object key.
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Key(key) => write!(f, "{key}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// A single path-qualified change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Sets the value at `path`, replacing the root if the path is empty.
    ///
    /// Setting the index one past the end of an array appends to it.
    Set {
        /// Where to set the value.
        path: Vec<PathSegment>,
        /// The new value.
        value: Value,
    },
    /// Removes the object key or array element at `path`.
    Remove {
        /// What to remove.
        path: Vec<PathSegment>,
    },
}

/// A single encoded subscription emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Update {
    /// The full value.
    Value {
        /// The emitted value.
        value: Value,
    },
    /// Operations to apply to the previous value.
    Patch {
        /// Operations, in application order.
        ops: Vec<PatchOp>,
    },
    /// Text to append to the string at `path` of the previous value.
    Delta {
        /// Path of the string, empty if the value itself is the string.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        path: Vec<PathSegment>,
        /// The appended text.
        text: String,
    },
}

impl Update {
    /// Returns the strategy this update was encoded with.
    pub fn mode(&self) -> UpdateMode {
        match self {
            Update::Value { .. } => UpdateMode::Value,
            Update::Patch { .. } => UpdateMode::Patch,
            Update::Delta { .. } => UpdateMode::Delta,
        }
    }
}

/// Encodes the emissions of one subscription.
#[derive(Debug, Clone)]
pub struct UpdateEncoder {
    mode: UpdateMode,
    delta_field: Option<Vec<PathSegment>>,
    max_patch_changes: usize,
    previous: Option<Value>,
}

impl UpdateEncoder {
    /// Default number of changed leaves up to which [`UpdateMode::Auto`] picks a patch.
    pub const DEFAULT_MAX_PATCH_CHANGES: usize = 8;

    /// Creates an encoder for a subscription with no emissions yet.
    pub fn new(mode: UpdateMode) -> Self {
        Self {
            mode,
            delta_field: None,
            max_patch_changes: Self::DEFAULT_MAX_PATCH_CHANGES,
            previous: None,
        }
    }

    /// Designates the string field [`UpdateMode::Delta`] streams.
    ///
    /// Without a designated field, a delta is emitted whenever the only change is text
    /// appended to some string.
    pub fn with_delta_field(mut self, path: Vec<PathSegment>) -> Self {
        self.delta_field = Some(path);
        self
    }

    /// Sets the number of changed leaves up to which [`UpdateMode::Auto`] picks a patch.
    pub fn with_max_patch_changes(mut self, max: usize) -> Self {
        self.max_patch_changes = max;
        self
    }

    /// Returns the mode of this encoder.
    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Encodes `next` relative to the previous emission, and remembers it.
    pub fn encode(&mut self, next: Value) -> Update {
        let update = match &self.previous {
            None => Update::Value {
                value: next.clone(),
            },
            Some(previous) => self.encode_change(previous, &next),
        };
        self.previous = Some(next);
        update
    }

    fn encode_change(&self, previous: &Value, next: &Value) -> Update {
        let full = || Update::Value {
            value: next.clone(),
        };
        match self.mode {
            UpdateMode::Value => full(),
            UpdateMode::Patch => Update::Patch {
                ops: diff(previous, next),
            },
            UpdateMode::Delta => {
                let delta = match &self.delta_field {
                    Some(path) => append_at(previous, next, path),
                    None => single_append(previous, next, &diff(previous, next)),
                };
                delta.unwrap_or_else(full)
            }
            UpdateMode::Auto => {
                let ops = diff(previous, next);
                if let Some(delta) = single_append(previous, next, &ops) {
                    delta
                } else if next.is_object() && ops.len() <= self.max_patch_changes {
                    Update::Patch { ops }
                } else {
                    full()
                }
            }
        }
    }
}

/// Reconstructs the values of one subscription from its updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateDecoder {
    previous: Option<Value>,
}

impl UpdateDecoder {
    /// Creates a decoder for a subscription with no emissions yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` and returns the reconstructed value.
    pub fn apply(&mut self, update: &Update) -> Result<Value, CallError> {
        let value = apply_update(self.previous.as_ref(), update)?;
        self.previous = Some(value.clone());
        Ok(value)
    }

    /// Returns the last reconstructed value.
    pub fn previous(&self) -> Option<&Value> {
        self.previous.as_ref()
    }
}

/// Computes the operations that turn `previous` into `next`.
///
/// Objects are compared key by key and arrays index by index; anything else that differs is
/// replaced as a whole.
pub fn diff(previous: &Value, next: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into(previous, next, &mut Vec::new(), &mut ops);
    ops
}

fn diff_into(previous: &Value, next: &Value, path: &mut Vec<PathSegment>, ops: &mut Vec<PatchOp>) {
    if previous == next {
        return;
    }
    match (previous, next) {
        (Value::Object(old), Value::Object(new)) => {
            for key in old.keys().filter(|key| !new.contains_key(*key)) {
                path.push(PathSegment::Key(key.clone()));
                ops.push(PatchOp::Remove { path: path.clone() });
                path.pop();
            }
            for (key, value) in new {
                path.push(PathSegment::Key(key.clone()));
                match old.get(key) {
                    Some(old) => diff_into(old, value, path, ops),
                    None => ops.push(PatchOp::Set {
                        path: path.clone(),
                        value: value.clone(),
                    }),
                }
                path.pop();
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for (index, (old, new)) in old.iter().zip(new).enumerate() {
                path.push(PathSegment::Index(index));
                diff_into(old, new, path, ops);
                path.pop();
            }
            for (index, value) in new.iter().enumerate().skip(common) {
                path.push(PathSegment::Index(index));
                ops.push(PatchOp::Set {
                    path: path.clone(),
                    value: value.clone(),
                });
                path.pop();
            }
            // Back to front, so earlier removals do not shift later indices.
            for index in (common..old.len()).rev() {
                path.push(PathSegment::Index(index));
                ops.push(PatchOp::Remove { path: path.clone() });
                path.pop();
            }
        }
        _ => ops.push(PatchOp::Set {
            path: path.clone(),
            value: next.clone(),
        }),
    }
}

fn single_append(previous: &Value, next: &Value, ops: &[PatchOp]) -> Option<Update> {
    match ops {
        [PatchOp::Set { path, .. }] => append_at(previous, next, path),
        _ => None,
    }
}

/// Returns a delta if `next` equals `previous` with text appended to the string at `path`.
fn append_at(previous: &Value, next: &Value, path: &[PathSegment]) -> Option<Update> {
    let old = resolve(previous, path)?.as_str()?;
    let new = resolve(next, path)?.as_str()?;
    let text = new.strip_prefix(old)?;
    let mut rebuilt = previous.clone();
    *resolve_mut(&mut rebuilt, path).ok()? = Value::String(new.to_string());
    (rebuilt == *next).then(|| Update::Delta {
        path: path.to_vec(),
        text: text.to_string(),
    })
}

/// Applies `update` to the previous value of a subscription.
///
/// Patches and deltas fail with [`CallError::InvalidUpdate`] if there is no previous value or
/// their paths do not match it.
pub fn apply_update(previous: Option<&Value>, update: &Update) -> Result<Value, CallError> {
    match update {
        Update::Value { value } => Ok(value.clone()),
        Update::Patch { ops } => {
            let mut value = previous
                .cloned()
                .ok_or_else(|| CallError::invalid_update("patch without a previous value"))?;
            apply_patch(&mut value, ops)?;
            Ok(value)
        }
        Update::Delta { path, text } => {
            let mut value = previous
                .cloned()
                .ok_or_else(|| CallError::invalid_update("delta without a previous value"))?;
            match resolve_mut(&mut value, path)? {
                Value::String(s) => s.push_str(text),
                _ => {
                    return Err(CallError::invalid_update(format!(
                        "delta target {} is not a string",
                        display_path(path)
                    )));
                }
            }
            Ok(value)
        }
    }
}

/// Applies patch operations to `target`, in order.
pub fn apply_patch(target: &mut Value, ops: &[PatchOp]) -> Result<(), CallError> {
    for op in ops {
        match op {
            PatchOp::Set { path, value } => {
                let Some((last, parent)) = path.split_last() else {
                    *target = value.clone();
                    continue;
                };
                match (resolve_mut(target, parent)?, last) {
                    (Value::Object(map), PathSegment::Key(key)) => {
                        map.insert(key.clone(), value.clone());
                    }
                    (Value::Array(items), PathSegment::Index(index)) => {
                        match (*index).cmp(&items.len()) {
                            Ordering::Less => items[*index] = value.clone(),
                            Ordering::Equal => items.push(value.clone()),
                            Ordering::Greater => return Err(no_such_path(path)),
                        }
                    }
                    _ => return Err(no_such_path(path)),
                }
            }
            PatchOp::Remove { path } => {
                let Some((last, parent)) = path.split_last() else {
                    return Err(CallError::invalid_update("cannot remove the root value"));
                };
                let removed = match (resolve_mut(target, parent)?, last) {
                    (Value::Object(map), PathSegment::Key(key)) => map.remove(key).is_some(),
                    (Value::Array(items), PathSegment::Index(index)) if *index < items.len() => {
                        items.remove(*index);
                        true
                    }
                    _ => false,
                };
                if !removed {
                    return Err(no_such_path(path));
                }
            }
        }
    }
    Ok(())
}

fn resolve<'a>(mut value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    for segment in path {
        value = match (value, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get(key)?,
            (Value::Array(items), PathSegment::Index(index)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(value)
}

fn resolve_mut<'a>(mut value: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, CallError> {
    for (depth, segment) in path.iter().enumerate() {
        let child = match (value, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
            _ => None,
        };
        value = child.ok_or_else(|| no_such_path(&path[..=depth]))?;
    }
    Ok(value)
}

fn no_such_path(path: &[PathSegment]) -> CallError {
    CallError::invalid_update(format!("no such path {}", display_path(path)))
}

fn display_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|segment| format!("/{segment}")).collect()
}
