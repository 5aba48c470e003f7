// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation records: store-independent descriptions of a single mutation.
//!
//! An [`OperationRecord`] is what travels from the primary write path to the
//! secondary, either through a replication channel or directly inside a
//! mirrored transaction. It is fully self-describing: applying it needs
//! nothing beyond a store handle.
//!
//! # Wire Format
//!
//! ```json
//! {"kind":"insert","target":"products","document":{"id":"p1","name":"Widget","price":9.99}}
//! {"kind":"update","target":"carts","filter":{"userId":"u1"},"set":{"items":[]},"upsert":true,"upsert_id":"c-1"}
//! {"kind":"delete","target":"products","filter":{"id":"p1"}}
//! ```
//!
//! The `kind` tag is decoded into the closed [`OperationKind`] set; anything
//! else fails with [`ApplyError::UnknownOperationKind`].
//!
//! # Identity
//!
//! Records are idempotent-by-identity once they carry an explicit `id`.
//! [`OperationRecord::assign_identity()`] pins identifiers *before* the
//! primary write, so the primary and every secondary agree on them.

use crate::error::{ApplyError, ReplicationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "id";

/// A document (or row) as a field map.
pub type Document = serde_json::Map<String, Value>;

/// Equality conditions over top-level fields. Empty matches everything.
pub type Filter = serde_json::Map<String, Value>;

/// Closed set of mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Parse a wire tag. Case-insensitive.
    pub fn parse(tag: &str) -> Result<Self, ApplyError> {
        match tag.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(ApplyError::UnknownOperationKind(tag.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific content of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Insert one full document (including its identifier once pinned).
    Insert { document: Document },

    /// Assign `set` fields on documents matching `filter`.
    Update {
        filter: Filter,
        set: Document,
        /// Insert `filter ∪ set` when nothing matches.
        upsert: bool,
        /// Identifier used if the upsert inserts.
        upsert_id: Option<Value>,
        /// Apply to every match instead of the first one.
        many: bool,
    },

    /// Remove documents matching `filter`.
    Delete { filter: Filter, many: bool },
}

/// An immutable, serializable mutation against a named collection/table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRecord", into = "WireRecord")]
pub struct OperationRecord {
    pub target: String,
    pub payload: Payload,
}

impl OperationRecord {
    /// Insert a document.
    pub fn insert(target: impl Into<String>, document: Document) -> Self {
        Self {
            target: target.into(),
            payload: Payload::Insert { document },
        }
    }

    /// Update the first document matching `filter`.
    pub fn update(target: impl Into<String>, filter: Filter, set: Document) -> Self {
        Self {
            target: target.into(),
            payload: Payload::Update {
                filter,
                set,
                upsert: false,
                upsert_id: None,
                many: false,
            },
        }
    }

    /// Delete the first document matching `filter`.
    pub fn delete(target: impl Into<String>, filter: Filter) -> Self {
        Self {
            target: target.into(),
            payload: Payload::Delete {
                filter,
                many: false,
            },
        }
    }

    /// Make an update insert when nothing matches.
    ///
    /// No-op for other kinds.
    #[must_use]
    pub fn upsert(mut self) -> Self {
        if let Payload::Update { upsert, .. } = &mut self.payload {
            *upsert = true;
        }
        self
    }

    /// Apply an update/delete to every matching document.
    ///
    /// No-op for inserts.
    #[must_use]
    pub fn many(mut self) -> Self {
        match &mut self.payload {
            Payload::Update { many, .. } | Payload::Delete { many, .. } => *many = true,
            Payload::Insert { .. } => {}
        }
        self
    }

    pub fn kind(&self) -> OperationKind {
        match self.payload {
            Payload::Insert { .. } => OperationKind::Insert,
            Payload::Update { .. } => OperationKind::Update,
            Payload::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The identifier this record creates, if any.
    ///
    /// Inserted document id, or the pinned upsert id.
    pub fn pinned_id(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Insert { document } => document.get(ID_FIELD),
            Payload::Update { upsert_id, .. } => upsert_id.as_ref(),
            Payload::Delete { .. } => None,
        }
    }

    /// Pin identifiers so every store applying this record agrees on them.
    ///
    /// Inserts without an `id` get one from `generate`. Upserting updates get an
    /// `upsert_id`, taken from the filter's `id` when present. Already pinned
    /// records are returned unchanged.
    #[must_use]
    pub fn assign_identity_with(mut self, mut generate: impl FnMut() -> Value) -> Self {
        match &mut self.payload {
            Payload::Insert { document } => {
                if !document.contains_key(ID_FIELD) {
                    document.insert(ID_FIELD.to_string(), generate());
                }
            }
            Payload::Update {
                filter,
                upsert: true,
                upsert_id,
                ..
            } => {
                if upsert_id.is_none() {
                    *upsert_id = Some(filter.get(ID_FIELD).cloned().unwrap_or_else(&mut generate));
                }
            }
            Payload::Update { .. } | Payload::Delete { .. } => {}
        }
        self
    }

    /// Pin identifiers using random UUID v4 strings.
    #[must_use]
    pub fn assign_identity(self) -> Self {
        self.assign_identity_with(new_id)
    }

    /// Check structural validity before applying.
    pub fn validate(&self) -> Result<(), ApplyError> {
        if self.target.trim().is_empty() {
            return Err(ApplyError::Malformed("empty target".into()));
        }
        match &self.payload {
            Payload::Insert { document } => {
                if let Some(id) = document.get(ID_FIELD) {
                    if id.is_null() || id.is_array() || id.is_object() {
                        return Err(ApplyError::Malformed(format!(
                            "'{}' must be a scalar, got {}",
                            ID_FIELD, id
                        )));
                    }
                }
            }
            Payload::Update { set, .. } => {
                if set.is_empty() {
                    return Err(ApplyError::Malformed("update with empty set".into()));
                }
                if set.contains_key(ID_FIELD) {
                    return Err(ApplyError::Malformed(format!(
                        "update may not assign '{}'",
                        ID_FIELD
                    )));
                }
            }
            Payload::Delete { .. } => {}
        }
        Ok(())
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        Ok(serde_json::to_vec(&WireRecord::from(self.clone()))?)
    }

    /// Parse from the wire format.
    ///
    /// Unknown `kind` tags fail with [`ApplyError::UnknownOperationKind`],
    /// everything else with [`ApplyError::Malformed`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ApplyError> {
        let wire: WireRecord = serde_json::from_slice(bytes)
            .map_err(|e| ApplyError::Malformed(format!("invalid record JSON: {}", e)))?;
        Self::try_from(wire)
    }
}

/// Flat serde shape of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRecord {
    kind: String,
    target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set: Option<Document>,
    #[serde(default, skip_serializing_if = "is_false")]
    upsert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upsert_id: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    many: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TryFrom<WireRecord> for OperationRecord {
    type Error = ApplyError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let missing = |field: &str| ApplyError::Malformed(format!("{} record without '{}'", wire.kind, field));
        let payload = match OperationKind::parse(&wire.kind)? {
            OperationKind::Insert => Payload::Insert {
                document: wire.document.clone().ok_or_else(|| missing("document"))?,
            },
            OperationKind::Update => Payload::Update {
                filter: wire.filter.clone().ok_or_else(|| missing("filter"))?,
                set: wire.set.clone().ok_or_else(|| missing("set"))?,
                upsert: wire.upsert,
                upsert_id: wire.upsert_id.clone(),
                many: wire.many,
            },
            OperationKind::Delete => Payload::Delete {
                filter: wire.filter.clone().ok_or_else(|| missing("filter"))?,
                many: wire.many,
            },
        };
        Ok(Self {
            target: wire.target,
            payload,
        })
    }
}

impl From<OperationRecord> for WireRecord {
    fn from(record: OperationRecord) -> Self {
        let mut wire = WireRecord {
            kind: record.kind().as_str().to_string(),
            target: record.target,
            document: None,
            filter: None,
            set: None,
            upsert: false,
            upsert_id: None,
            many: false,
        };
        match record.payload {
            Payload::Insert { document } => wire.document = Some(document),
            Payload::Update {
                filter,
                set,
                upsert,
                upsert_id,
                many,
            } => {
                wire.filter = Some(filter);
                wire.set = Some(set);
                wire.upsert = upsert;
                wire.upsert_id = upsert_id;
                wire.many = many;
            }
            Payload::Delete { filter, many } => {
                wire.filter = Some(filter);
                wire.many = many;
            }
        }
        wire
    }
}

/// What a store reports after applying a record.
///
/// Only counts and identifiers: store-local auxiliary values never appear
/// here, so outcomes from two stores compare structurally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inserted_ids: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<Value>,
}

impl ApplyOutcome {
    pub fn inserted(id: Value) -> Self {
        Self {
            inserted_ids: vec![id],
            ..Default::default()
        }
    }

    pub fn updated(matched: u64, modified: u64) -> Self {
        Self {
            matched,
            modified,
            ..Default::default()
        }
    }

    pub fn upserted(id: Value) -> Self {
        Self {
            upserted_id: Some(id),
            ..Default::default()
        }
    }

    pub fn deleted(count: u64) -> Self {
        Self {
            matched: count,
            deleted: count,
            ..Default::default()
        }
    }

    /// Fold another outcome into this one (batched writes).
    pub fn absorb(&mut self, other: ApplyOutcome) {
        self.matched += other.matched;
        self.modified += other.modified;
        self.deleted += other.deleted;
        self.inserted_ids.extend(other.inserted_ids);
        if self.upserted_id.is_none() {
            self.upserted_id = other.upserted_id;
        }
    }
}

/// Generate a fresh identifier.
pub fn new_id() -> Value {
    Value::String(uuid::Uuid::new_v4().to_string())
}

/// Does `document` satisfy every equality in `filter`?
///
/// An absent field equals `null`, as in SQL `IS`.
pub fn matches(document: &Document, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| document.get(field).unwrap_or(&Value::Null) == expected)
}

/// Stable map key for an identifier value.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build a single-field filter on the identifier.
pub fn id_filter(id: Value) -> Filter {
    let mut filter = Filter::new();
    filter.insert(ID_FIELD.to_string(), id);
    filter
}
