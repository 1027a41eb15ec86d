//! Paginated cache with optimistic mutation support.
//!
//! This module holds the three layers of the cache:
//! - `entry`: immutable page/row containers shared by cheap `Arc` clones
//! - `store`: keyed entry states with fetch landing rules and snapshots
//! - `coordinator`: reads, refreshes and optimistic mutations over a remote

pub mod coordinator;
pub mod entry;
pub mod store;

pub use coordinator::{CollectionCache, MutationOutcome, Notice};
pub use entry::{CacheEntry, EntrySnapshot, Freshness, LoadPhase, Page};
pub use store::PageStore;
