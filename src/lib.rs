//! Client-side cache for paginated referral collections with optimistic
//! mutations.
//!
//! The dashboard keeps every server collection it has touched in a
//! [`CollectionCache`]. Reads land pages under a canonical
//! [`QueryDescriptor`] key; creates, edits and deletes apply to the cached
//! rows immediately and settle against the server in the background, rolling
//! back to the pre-mutation snapshot when the server rejects them.

pub mod cache;
pub mod columns;
pub mod config;
pub mod derived;
pub mod descriptor;
pub mod error;
pub mod remote;
pub mod row;

pub use cache::{
  CacheEntry, CollectionCache, EntrySnapshot, Freshness, LoadPhase, MutationOutcome, Notice, Page,
};
pub use columns::{Cell, ColumnKind, ColumnSpec};
pub use config::Config;
pub use derived::{DerivationRegistry, DeriveFields};
pub use descriptor::{DescriptorKey, QueryDescriptor};
pub use error::RemoteError;
pub use remote::{HttpRemoteClient, MutationRequest, RemoteClient};
pub use row::{FieldMap, Row};
