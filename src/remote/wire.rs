//! Serde types matching the collection API's request and response bodies.
//!
//! These are separate from the cache's domain types so the wire format can
//! stay camelCase and tolerant of missing fields without leaking into the
//! rest of the crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::descriptor::{DateRange, SortSpec};
use crate::row::{FieldMap, Row};

// ============================================================================
// Search
// ============================================================================

/// Body of `POST /api/{resource}/search`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSearchRequest<'a> {
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub filters: &'a BTreeMap<String, Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub date_range: Option<&'a DateRange>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sort: Option<&'a SortSpec>,
  pub limit: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page_token: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSearchResponse {
  #[serde(default)]
  pub items: Vec<ApiRow>,
  #[serde(default)]
  pub next_page_token: Option<u64>,
}

/// One row as the server sends it.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiRow {
  pub id: String,
  #[serde(default)]
  pub fields: FieldMap,
}

impl ApiRow {
  pub fn into_row(self) -> Row {
    Row::new(self.id, self.fields)
  }
}

// ============================================================================
// Mutations
// ============================================================================

/// Body of `POST /api/{resource}`. Carries the client-generated id so a
/// retried create stays idempotent.
#[derive(Debug, Serialize)]
pub struct ApiCreateRequest<'a> {
  pub id: &'a str,
  pub fields: &'a FieldMap,
}

/// Body of `PATCH /api/{resource}/{id}`.
#[derive(Debug, Serialize)]
pub struct ApiUpdateRequest<'a> {
  pub fields: &'a FieldMap,
}

/// Body of `POST /api/{resource}/delete`.
#[derive(Debug, Serialize)]
pub struct ApiDeleteRequest<'a> {
  pub ids: &'a [String],
}

/// Error body the server sends on rejections, when it sends one.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: String,
}
