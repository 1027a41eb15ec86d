//! The boundary between the cache and whatever serves the data.

use async_trait::async_trait;

use crate::cache::entry::Page;
use crate::descriptor::QueryDescriptor;
use crate::error::RemoteError;
use crate::row::{FieldMap, Row};

/// One server-bound mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRequest {
  /// Create a row. Carries the full client-built row, derived fields
  /// included, so the server sees exactly what the user was shown.
  Create { resource: String, row: Row },
  /// Merge fields into an existing row.
  Update {
    resource: String,
    id: String,
    fields: FieldMap,
  },
  /// Delete a set of rows.
  Delete { resource: String, ids: Vec<String> },
}

impl MutationRequest {
  /// Collection this mutation targets.
  pub fn resource(&self) -> &str {
    match self {
      MutationRequest::Create { resource, .. }
      | MutationRequest::Update { resource, .. }
      | MutationRequest::Delete { resource, .. } => resource,
    }
  }

  /// Short name for logs.
  pub fn kind(&self) -> &'static str {
    match self {
      MutationRequest::Create { .. } => "create",
      MutationRequest::Update { .. } => "update",
      MutationRequest::Delete { .. } => "delete",
    }
  }
}

/// Server access used by the coordinator. Implementations are shared across
/// tasks, one call may run while another is in flight.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  /// Fetch one page of the collection the descriptor names. `page_token`
  /// of `None` means the first page.
  async fn fetch_page(
    &self,
    descriptor: &QueryDescriptor,
    page_token: Option<u64>,
  ) -> Result<Page, RemoteError>;

  /// Apply one mutation. `Ok(Some(row))` carries the server's adjusted view
  /// of the affected row when it returns one; deletes return `Ok(None)`.
  async fn mutate(&self, request: &MutationRequest) -> Result<Option<Row>, RemoteError>;
}
