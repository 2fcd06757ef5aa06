//! Entities: JSON records stored per collection.

use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeSet;

/// Name of the id property.
pub const ID_FIELD: &str = "_id";

/// Name of the metadata property.
pub const METADATA_FIELD: &str = "_kmd";

/// Name of the access-control property.
pub const ACL_FIELD: &str = "_acl";

/// Prefix of client-generated ids not yet confirmed by the server.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Server-maintained timestamps of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Last modified time, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lmt: Option<String>,
    /// Entity creation time, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ect: Option<String>,
}

impl Metadata {
    /// Metadata for a record created and last modified at `at`.
    #[must_use]
    pub fn created_at(at: DateTime<Utc>) -> Self {
        let stamp = format_timestamp(at);
        Self {
            lmt: Some(stamp.clone()),
            ect: Some(stamp),
        }
    }

    /// Parsed last modified time.
    #[must_use]
    pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        self.lmt.as_deref().and_then(parse_timestamp)
    }
}

/// Access control list of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// User id of the creator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Globally readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gr: Option<bool>,
    /// Globally writable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<bool>,
    /// Users allowed to read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub r: Vec<String>,
    /// Users allowed to write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub w: Vec<String>,
}

/// An application record.
///
/// The id is kept apart from the remaining properties; `_kmd` and `_acl`
/// live among the fields exactly as they appear on the wire. An empty id
/// means the entity has not been assigned one yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Entity {
    id: String,
    fields: Map<String, Value>,
}

impl Entity {
    /// Creates an entity without an id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty entity with the given id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builds an entity from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidEntity`] if `value` is not an object or
    /// its `_id` is present but not a string.
    pub fn from_json(value: Value) -> CacheResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(CacheError::invalid_entity("entity must be a JSON object"));
        };
        let id = match fields.remove(ID_FIELD) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(CacheError::invalid_entity(format!(
                    "_id must be a string, got {other}"
                )))
            }
        };
        Ok(Self { id, fields })
    }

    /// Renders the entity as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        if !self.id.is_empty() {
            object.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        }
        Value::Object(object)
    }

    /// Generates a fresh temporary id.
    #[must_use]
    pub fn temporary_id() -> String {
        format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4())
    }

    /// The entity id (empty when unassigned).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether an id has been assigned.
    #[must_use]
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Whether the id is a client-generated placeholder.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }

    /// Replaces the id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Returns the entity without its id, as sent for server-side creation.
    #[must_use]
    pub fn without_id(&self) -> Self {
        Self {
            id: String::new(),
            fields: self.fields.clone(),
        }
    }

    /// All properties except `_id`.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// A top-level property.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a top-level property. Setting `_id` assigns the id.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        let value = value.into();
        if field == ID_FIELD {
            if let Value::String(id) = value {
                self.id = id;
            }
            return;
        }
        self.fields.insert(field, value);
    }

    /// Builder form of [`Entity::set`].
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Resolves a dotted path such as `address.city` or `tags.0`.
    ///
    /// `_id` resolves to the id. Numeric segments index into arrays.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        if path == ID_FIELD {
            return self
                .has_id()
                .then(|| Cow::Owned(Value::String(self.id.clone())));
        }
        let mut segments = path.split('.');
        let first = self.fields.get(segments.next()?)?;
        resolve_path(first, segments).map(Cow::Borrowed)
    }

    /// Typed metadata, if present and well-formed.
    #[must_use]
    pub fn metadata(&self) -> Option<Metadata> {
        self.fields
            .get(METADATA_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Replaces the metadata.
    pub fn set_metadata(&mut self, metadata: &Metadata) {
        if let Ok(value) = serde_json::to_value(metadata) {
            self.fields.insert(METADATA_FIELD.to_string(), value);
        }
    }

    /// The raw last modified time string.
    #[must_use]
    pub fn last_modified(&self) -> Option<&str> {
        self.fields
            .get(METADATA_FIELD)
            .and_then(|kmd| kmd.get("lmt"))
            .and_then(Value::as_str)
    }

    /// Typed access control list, if present and well-formed.
    #[must_use]
    pub fn acl(&self) -> Option<Acl> {
        self.fields
            .get(ACL_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Keeps only the projected top-level properties.
    ///
    /// `_id`, `_kmd` and `_acl` always survive. A dotted projection keeps
    /// its whole top-level property.
    #[must_use]
    pub fn project(&self, fields: &BTreeSet<String>) -> Self {
        if fields.is_empty() {
            return self.clone();
        }
        let keep: BTreeSet<&str> = fields
            .iter()
            .filter_map(|f| f.split('.').next())
            .chain([METADATA_FIELD, ACL_FIELD])
            .collect();
        Self {
            id: self.id.clone(),
            fields: self
                .fields
                .iter()
                .filter(|(k, _)| keep.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl TryFrom<Value> for Entity {
    type Error = CacheError;

    fn try_from(value: Value) -> CacheResult<Self> {
        Self::from_json(value)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        let mut object = entity.fields;
        if !entity.id.is_empty() {
            object.insert(ID_FIELD.to_string(), Value::String(entity.id));
        }
        Value::Object(object)
    }
}

/// Whether `id` is a client-generated placeholder.
#[must_use]
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Parses a server timestamp into an instant.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Formats an instant the way the server does (`2024-01-01T00:00:00.000Z`).
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Walks `segments` from `current`; numeric segments index into arrays.
pub(crate) fn resolve_path<'a, 'p>(
    mut current: &'a Value,
    segments: impl Iterator<Item = &'p str>,
) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
