//! Rows as they live in the cache: an id plus a flat map of scalar fields.
//!
//! Collections are server-declared (columns arrive with the data), so rows
//! carry their fields dynamically instead of as typed structs. Field values
//! are `serde_json::Value`, the same shape they had on the wire.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Field name → scalar value. BTreeMap so serialization is canonical.
pub type FieldMap = BTreeMap<String, Value>;

/// One row of a paginated collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
  /// Unique within the collection. Client-generated for optimistic inserts.
  pub id: String,
  pub fields: FieldMap,
}

impl Row {
  pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
    Self {
      id: id.into(),
      fields,
    }
  }

  /// Build a row with a content-addressed id, so a newly created entity has
  /// an identifier before the server has ever seen it.
  pub fn with_generated_id(fields: FieldMap) -> Self {
    let id = generate_row_id(&fields);
    Self { id, fields }
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  /// Return a copy of this row with `patch` merged over its fields.
  /// Untouched fields are kept as-is; the original row is not modified.
  pub fn merged(&self, patch: &FieldMap) -> Row {
    let mut fields = self.fields.clone();
    for (name, value) in patch {
      fields.insert(name.clone(), value.clone());
    }
    Row {
      id: self.id.clone(),
      fields,
    }
  }
}

/// Digest the canonical field serialization plus the creation instant.
///
/// The instant keeps two identical payloads created back-to-back from
/// colliding; the digest is truncated to 32 hex chars, plenty for ids that
/// only need to be unique within one collection.
pub fn generate_row_id(fields: &FieldMap) -> String {
  let mut hasher = Sha256::new();
  let canonical = serde_json::to_vec(fields).unwrap_or_default();
  hasher.update(&canonical);
  hasher.update(Utc::now().timestamp_micros().to_be_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..32].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.clone()))
      .collect()
  }

  #[test]
  fn test_generated_ids_are_stable_length_hex() {
    let row = Row::with_generated_id(fields(&[("name", json!("Baker County"))]));
    assert_eq!(row.id.len(), 32);
    assert!(row.id.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_generated_ids_differ_for_different_content() {
    let a = Row::with_generated_id(fields(&[("name", json!("a"))]));
    let b = Row::with_generated_id(fields(&[("name", json!("b"))]));
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_merged_overlays_patch_without_touching_original() {
    let row = Row::new(
      "r1",
      fields(&[("status", json!("Open")), ("owner", json!("sam"))]),
    );
    let patch = fields(&[("status", json!("Closed"))]);

    let updated = row.merged(&patch);

    assert_eq!(updated.field("status"), Some(&json!("Closed")));
    assert_eq!(updated.field("owner"), Some(&json!("sam")));
    assert_eq!(row.field("status"), Some(&json!("Open")));
  }
}
