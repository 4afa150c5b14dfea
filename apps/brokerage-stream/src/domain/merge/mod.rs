//! Delta Merge Engine
//!
//! Rebuilds entity state from a snapshot followed by partial updates.
//!
//! - **Singletons** (balance, price): each delta is a partial object deep-merged
//!   onto the previous value. Nested objects merge; arrays and scalars replace.
//! - **Keyed collections** (orders, positions, closed positions): each delta is
//!   an array of records, each decoded into exactly one [`DeltaRecord`] variant
//!   against the current key set.
//!
//! Every merge produces a new value; the previous one is never mutated, so a
//! rejected delta leaves the caller's state untouched.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Fields that mark a collection record as a deletion when set to `true`.
pub const DELETION_MARKERS: [&str; 2] = ["__meta_deleted", "__deleted"];

// =============================================================================
// Errors
// =============================================================================

/// A payload that could not be merged. Carries one diagnostic per problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delta rejected: {}", .diagnostics.join("; "))]
pub struct MergeError {
    /// Human readable problems, in payload order.
    pub diagnostics: Vec<String>,
}

impl MergeError {
    /// Error with a single diagnostic.
    #[must_use]
    pub fn single(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostics: vec![diagnostic.into()],
        }
    }
}

// =============================================================================
// Entity Traits
// =============================================================================

/// A schema-validated business entity.
pub trait Entity: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Entity name used in diagnostics.
    const NAME: &'static str;
}

/// An entity stored in a keyed collection.
pub trait KeyedEntity: Entity {
    /// Field carrying the domain id.
    const KEY_FIELD: &'static str;

    /// Domain id of this entity.
    fn key(&self) -> &str;
}

/// State a subscription maintains from snapshot plus deltas.
pub trait StreamState: Clone + fmt::Debug + Send + Sync + 'static {
    /// Build the initial state from a subscribe snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot does not validate.
    fn from_snapshot(snapshot: &Value) -> Result<Self, MergeError>;

    /// Produce the next state from one delta payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is ambiguous or the result does not validate.
    fn apply_delta(&self, payload: &Value) -> Result<Self, MergeError>;
}

// =============================================================================
// Singleton Merge
// =============================================================================

/// Deep-merge `patch` into `target`. Objects merge recursively; anything else replaces.
pub fn merge_fields(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (&mut Value::Object(ref mut target), Value::Object(patch)) => {
            for (field, value) in patch {
                match target.get_mut(field) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_fields(existing, value);
                    }
                    _ => {
                        target.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Decode a complete entity, mapping serde failures into diagnostics.
///
/// # Errors
///
/// Returns an error naming the entity when validation fails.
pub fn decode_entity<T: Entity>(value: Value) -> Result<T, MergeError> {
    serde_json::from_value(value)
        .map_err(|e| MergeError::single(format!("{} failed validation: {e}", T::NAME)))
}

/// Merge a partial payload onto a singleton, or decode it when there is no previous value.
///
/// # Errors
///
/// Returns an error if the payload is not an object or the merged result fails validation.
pub fn merge_singleton<T: Entity>(previous: Option<&T>, payload: &Value) -> Result<T, MergeError> {
    if !payload.is_object() {
        return Err(MergeError::single(format!(
            "{} update must be an object, got {}",
            T::NAME,
            json_type(payload)
        )));
    }
    let Some(previous) = previous else {
        return decode_entity(payload.clone());
    };
    let mut merged = serde_json::to_value(previous)
        .map_err(|e| MergeError::single(format!("{} could not be re-encoded: {e}", T::NAME)))?;
    merge_fields(&mut merged, payload);
    decode_entity(merged)
}

// =============================================================================
// Keyed Collection
// =============================================================================

/// One decoded collection record.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaRecord<T> {
    /// New entity with a key not currently present.
    Create(T),
    /// Field changes for a present key.
    Patch {
        /// Domain id.
        key: String,
        /// Changed fields, deletion markers stripped.
        fields: Map<String, Value>,
    },
    /// Removal of a key.
    Delete {
        /// Domain id.
        key: String,
    },
}

impl<T: KeyedEntity> DeltaRecord<T> {
    /// Classify one raw record against the keys currently present.
    ///
    /// # Errors
    ///
    /// Returns a diagnostic when the record is not an object, lacks the key
    /// field, or is a create that fails validation.
    pub fn decode(record: &Value, is_known: impl Fn(&str) -> bool) -> Result<Self, String> {
        let Value::Object(fields) = record else {
            return Err(format!("record must be an object, got {}", json_type(record)));
        };
        let key = match fields.get(T::KEY_FIELD) {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            Some(Value::Number(key)) => key.to_string(),
            Some(other) => {
                return Err(format!(
                    "{} must be a non-empty string or number, got {}",
                    T::KEY_FIELD,
                    json_type(other)
                ));
            }
            None => return Err(format!("record has no {}", T::KEY_FIELD)),
        };

        if is_deletion(fields) {
            return Ok(Self::Delete { key });
        }

        let mut fields = fields.clone();
        for marker in DELETION_MARKERS {
            fields.remove(marker);
        }

        if is_known(&key) {
            Ok(Self::Patch { key, fields })
        } else {
            serde_json::from_value(Value::Object(fields))
                .map(Self::Create)
                .map_err(|e| format!("new {} {key} failed validation: {e}", T::NAME))
        }
    }
}

fn is_deletion(fields: &Map<String, Value>) -> bool {
    DELETION_MARKERS
        .iter()
        .any(|marker| fields.get(*marker) == Some(&Value::Bool(true)))
}

/// Ordered collection of entities with at most one entity per key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCollection<T> {
    entries: IndexMap<String, T>,
}

impl<T> Default for EntityCollection<T> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<T: KeyedEntity> EntityCollection<T> {
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entities in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Apply one decoded record in place.
    fn apply_record(&mut self, record: DeltaRecord<T>) -> Result<(), String> {
        match record {
            DeltaRecord::Create(entity) => {
                self.entries.insert(entity.key().to_string(), entity);
            }
            DeltaRecord::Delete { key } => {
                if self.entries.shift_remove(&key).is_none() {
                    tracing::debug!(entity = T::NAME, key = %key, "deletion for absent key ignored");
                }
            }
            DeltaRecord::Patch { key, fields } => {
                let Some(existing) = self.entries.get_mut(&key) else {
                    return Err(format!("{} {key} vanished before patch", T::NAME));
                };
                let patched = merge_singleton(Some(&*existing), &Value::Object(fields))
                    .map_err(|e| format!("patch for {} {key}: {}", T::NAME, e.diagnostics.join("; ")))?;
                if patched.key() != key {
                    return Err(format!("patch for {} {key} changed its key", T::NAME));
                }
                *existing = patched;
            }
        }
        Ok(())
    }
}

impl<'a, T> IntoIterator for &'a EntityCollection<T> {
    type Item = &'a T;
    type IntoIter = indexmap::map::Values<'a, String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}

/// Records of a collection payload: a bare array or a `{"Data": [...]}` envelope.
///
/// Only snapshots may omit `Data` (an empty collection); a delta object
/// without it is rejected.
fn records(payload: &Value, snapshot: bool) -> Result<&[Value], MergeError> {
    match payload {
        Value::Array(records) => Ok(records),
        Value::Object(envelope) => match envelope.get("Data") {
            Some(Value::Array(records)) => Ok(records),
            None if snapshot => Ok(&[]),
            None => Err(MergeError::single(
                "collection delta must be an array or carry a Data array",
            )),
            Some(other) => Err(MergeError::single(format!(
                "Data must be an array, got {}",
                json_type(other)
            ))),
        },
        other => Err(MergeError::single(format!(
            "collection payload must be an array, got {}",
            json_type(other)
        ))),
    }
}

impl<T: KeyedEntity> StreamState for EntityCollection<T> {
    fn from_snapshot(snapshot: &Value) -> Result<Self, MergeError> {
        Self::new().apply_records(records(snapshot, true)?)
    }

    fn apply_delta(&self, payload: &Value) -> Result<Self, MergeError> {
        self.apply_records(records(payload, false)?)
    }
}

impl<T: KeyedEntity> EntityCollection<T> {
    fn apply_records(&self, records: &[Value]) -> Result<Self, MergeError> {
        let mut next = self.clone();
        let mut diagnostics = Vec::new();

        for (index, raw) in records.iter().enumerate() {
            let outcome = DeltaRecord::<T>::decode(raw, |key| next.entries.contains_key(key))
                .and_then(|record| next.apply_record(record));
            if let Err(diagnostic) = outcome {
                diagnostics.push(format!("record {index}: {diagnostic}"));
            }
        }

        if diagnostics.is_empty() {
            Ok(next)
        } else {
            Err(MergeError { diagnostics })
        }
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
