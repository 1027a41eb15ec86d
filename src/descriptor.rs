//! Query descriptors: the canonical identity of one paginated collection view.
//!
//! A descriptor is resource + filters + date range + sort + page size. Two
//! descriptors name the same cached collection iff their canonical
//! serializations match, so the cache key is always derived from a serialized
//! snapshot of the descriptor at the moment of the query, never from a live
//! reference that some filter panel might keep mutating.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Inclusive date window applied to a collection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
  pub from: NaiveDate,
  pub to: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
  Asc,
  Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
  pub field: String,
  pub direction: SortDirection,
}

/// Identity of one filtered/sorted paginated view of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
  /// Server collection name, e.g. "mileage_logs", "leads", "referrals".
  pub resource: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub filters: BTreeMap<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date_range: Option<DateRange>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sort: Option<SortSpec>,
  /// Page size requested from the server.
  pub limit: u32,
}

impl QueryDescriptor {
  pub fn new(resource: impl Into<String>, limit: u32) -> Self {
    Self {
      resource: resource.into(),
      filters: BTreeMap::new(),
      date_range: None,
      sort: None,
      limit,
    }
  }

  pub fn with_filter(mut self, name: impl Into<String>, value: Value) -> Self {
    self.filters.insert(name.into(), value);
    self
  }

  pub fn with_date_range(mut self, from: NaiveDate, to: NaiveDate) -> Self {
    self.date_range = Some(DateRange { from, to });
    self
  }

  pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
    self.sort = Some(SortSpec {
      field: field.into(),
      direction,
    });
    self
  }

  /// Canonical serialized form. Filters are a BTreeMap and unset parts are
  /// skipped, so equal descriptors always produce byte-equal output.
  pub fn canonical_json(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }

  /// Cache key for this descriptor: SHA-256 over the canonical form, for
  /// stable fixed-length keys.
  pub fn cache_key(&self) -> DescriptorKey {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical_json().as_bytes());
    DescriptorKey(hex::encode(hasher.finalize()))
  }

  /// Human-readable summary for logs.
  pub fn description(&self) -> String {
    let mut parts = vec![self.resource.clone()];
    if !self.filters.is_empty() {
      parts.push(format!("{} filter(s)", self.filters.len()));
    }
    if let Some(range) = &self.date_range {
      parts.push(format!("{}..{}", range.from, range.to));
    }
    if let Some(sort) = &self.sort {
      let dir = match sort.direction {
        SortDirection::Asc => "asc",
        SortDirection::Desc => "desc",
      };
      parts.push(format!("sort {} {}", sort.field, dir));
    }
    parts.push(format!("limit {}", self.limit));
    parts.join(", ")
  }
}

/// Canonical cache key for one descriptor. Hex SHA-256, cheap to clone and
/// hash, safe to hold long after the descriptor that produced it is gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorKey(String);

impl DescriptorKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for DescriptorKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_equal_descriptors_share_a_key() {
    let a = QueryDescriptor::new("mileage_logs", 25)
      .with_filter("team", json!("north"))
      .with_sort("date", SortDirection::Desc);
    let b = QueryDescriptor::new("mileage_logs", 25)
      .with_filter("team", json!("north"))
      .with_sort("date", SortDirection::Desc);

    assert_eq!(a, b);
    assert_eq!(a.cache_key(), b.cache_key());

    let key = a.cache_key();
    assert_eq!(key.as_str().len(), 64);
    assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_filter_order_does_not_change_the_key() {
    let a = QueryDescriptor::new("leads", 50)
      .with_filter("county", json!("Baker"))
      .with_filter("status", json!("Active"));
    let b = QueryDescriptor::new("leads", 50)
      .with_filter("status", json!("Active"))
      .with_filter("county", json!("Baker"));

    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_any_component_change_changes_the_key() {
    let base = QueryDescriptor::new("referrals", 25).with_filter("source", json!("fax"));

    let other_filter = base.clone().with_filter("source", json!("portal"));
    let other_limit = QueryDescriptor::new("referrals", 50).with_filter("source", json!("fax"));
    let other_sort = base.clone().with_sort("created", SortDirection::Asc);

    assert_ne!(base.cache_key(), other_filter.cache_key());
    assert_ne!(base.cache_key(), other_limit.cache_key());
    assert_ne!(base.cache_key(), other_sort.cache_key());
  }

  #[test]
  fn test_unset_parts_are_skipped_in_canonical_form() {
    let descriptor = QueryDescriptor::new("counties", 100);
    let canonical = descriptor.canonical_json();

    assert!(!canonical.contains("dateRange"));
    assert!(!canonical.contains("date_range"));
    assert!(!canonical.contains("sort"));
    assert!(!canonical.contains("filters"));
  }

  #[test]
  fn test_description_mentions_the_interesting_parts() {
    let descriptor = QueryDescriptor::new("mileage_logs", 25)
      .with_filter("team", json!("north"))
      .with_date_range(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
      );

    let text = descriptor.description();
    assert!(text.contains("mileage_logs"));
    assert!(text.contains("2024-01-01..2024-03-31"));
    assert!(text.contains("limit 25"));
  }
}
