//! Entity record data structure.
//!
//! The [`EntityRecord`] is the abstract unit of interchange between the
//! coordination core and the business layer: a typed identity plus a flat
//! field map. The core never interprets or mutates the fields, it only
//! moves them between stores.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An abstract `(entity_type, entity_id, field-map)` record.
///
/// Identity is `(entity_type, entity_id)`. Records are produced by the
/// calling business layer and remain owned by it for the duration of a call.
///
/// # Example
///
/// ```
/// use dualsync::EntityRecord;
/// use serde_json::json;
///
/// let record = EntityRecord::new("Memo", 42)
///     .with_field("content", json!("margin note"))
///     .with_field("page_number", json!(12));
///
/// assert_eq!(record.entity_type, "Memo");
/// assert_eq!(record.entity_id, 42);
/// assert_eq!(record.field("page_number"), Some(&json!(12)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity type tag (e.g., "Memo", "UserShelfBook", "UserDevice")
    pub entity_type: String,
    /// Numeric identity within the entity type
    pub entity_id: i64,
    /// Flat field map; values are opaque to the core
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    /// Create a record with an empty field map.
    pub fn new(entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            fields: Map::new(),
        }
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
