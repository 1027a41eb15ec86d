//! In-memory store of cache entries, keyed by canonical descriptor key.
//!
//! Every operation completes under one lock acquisition and replaces the
//! `Arc<CacheEntry>` wholesale, so no reader ever sees a half-applied
//! update and no two operations interleave mid-write.
//!
//! Fetch landings carry the version token handed out by `begin_fetch`. A
//! landing whose token no longer matches is discarded: either a newer fetch
//! superseded it (that fetch will resolve the load phase) or an optimistic
//! edit touched the entry in the interim (the entry is marked stale so the
//! next read refetches).

use chrono::{DateTime, Duration, Utc};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::cache::entry::{CacheEntry, EntrySnapshot, Freshness, LoadPhase, Page};
use crate::descriptor::{DescriptorKey, QueryDescriptor};
use crate::row::{FieldMap, Row};

/// Everything the store tracks for one descriptor.
struct EntryState {
  descriptor: QueryDescriptor,
  entry: Arc<CacheEntry>,
  version: u64,
  phase: LoadPhase,
  freshness: Freshness,
  fetched_at: Option<DateTime<Utc>>,
  /// Version token of the fetch currently allowed to land, if any.
  active_fetch: Option<u64>,
}

impl EntryState {
  fn new(descriptor: &QueryDescriptor) -> Self {
    Self {
      descriptor: descriptor.clone(),
      entry: Arc::new(CacheEntry::empty()),
      version: 0,
      phase: LoadPhase::Idle,
      freshness: Freshness::Fresh,
      fetched_at: None,
      active_fetch: None,
    }
  }

  fn snapshot(&self) -> EntrySnapshot {
    EntrySnapshot {
      entry: Arc::clone(&self.entry),
      version: self.version,
      phase: self.phase.clone(),
      freshness: self.freshness,
      fetched_at: self.fetched_at,
    }
  }

  /// Outcome of checking a landing token. `Landable` means apply the data;
  /// `Superseded` means drop it silently; `Overtaken` means drop it and
  /// hand the phase back (an interim write made the data stale).
  fn landing(&self, observed_version: u64) -> Landing {
    if self.active_fetch != Some(observed_version) {
      Landing::Superseded
    } else if self.version != observed_version {
      Landing::Overtaken
    } else {
      Landing::Landable
    }
  }

  /// A discarded landing must not leave the entry stuck in `Loading` when
  /// no other fetch is going to resolve it.
  fn resolve_overtaken(&mut self) {
    self.active_fetch = None;
    self.resolve_interrupted_load();
    self.version += 1;
  }

  /// Phase and freshness for a pending load that will never land: whatever
  /// the content supports, stale so the next read reconciles.
  fn resolve_interrupted_load(&mut self) {
    self.phase = if self.entry.pages.is_empty() {
      LoadPhase::Idle
    } else {
      LoadPhase::Ready
    };
    self.freshness = Freshness::Stale;
  }
}

enum Landing {
  Landable,
  Superseded,
  Overtaken,
}

/// In-memory page store. All methods are synchronous and perform no I/O.
#[derive(Default)]
pub struct PageStore {
  entries: Mutex<HashMap<DescriptorKey, EntryState>>,
}

impl PageStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<DescriptorKey, EntryState>>> {
    self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Existing entry for the descriptor, or a fresh empty one. No network.
  pub fn get_or_create(&self, descriptor: &QueryDescriptor) -> Result<EntrySnapshot> {
    let mut entries = self.lock()?;
    let state = entries
      .entry(descriptor.cache_key())
      .or_insert_with(|| EntryState::new(descriptor));
    Ok(state.snapshot())
  }

  /// Current snapshot, if the descriptor has an entry.
  pub fn snapshot(&self, key: &DescriptorKey) -> Result<Option<EntrySnapshot>> {
    Ok(self.lock()?.get(key).map(EntryState::snapshot))
  }

  /// Mark the entry loading and hand out the version token the fetch must
  /// present to land. A newer `begin_fetch` supersedes older tokens.
  pub fn begin_fetch(&self, descriptor: &QueryDescriptor) -> Result<(u64, EntrySnapshot)> {
    let mut entries = self.lock()?;
    let state = entries
      .entry(descriptor.cache_key())
      .or_insert_with(|| EntryState::new(descriptor));
    state.version += 1;
    state.phase = LoadPhase::Loading;
    state.active_fetch = Some(state.version);
    Ok((state.version, state.snapshot()))
  }

  /// Land a next-page fetch. Returns `None` when the token is stale and the
  /// page was discarded.
  pub fn append_page(
    &self,
    descriptor: &QueryDescriptor,
    page: Page,
    observed_version: u64,
  ) -> Result<Option<EntrySnapshot>> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok(None);
    };
    match state.landing(observed_version) {
      Landing::Superseded => {
        warn!(descriptor = %descriptor.description(), "discarding superseded page");
        Ok(None)
      }
      Landing::Overtaken => {
        warn!(descriptor = %descriptor.description(), "discarding page landed after an edit");
        state.resolve_overtaken();
        Ok(None)
      }
      Landing::Landable => {
        state.entry = Arc::new(state.entry.with_appended_page(page));
        state.phase = LoadPhase::Ready;
        state.freshness = Freshness::Fresh;
        state.fetched_at = Some(Utc::now());
        state.version += 1;
        state.active_fetch = None;
        debug!(
          descriptor = %descriptor.description(),
          rows = state.entry.row_count(),
          "page appended"
        );
        Ok(Some(state.snapshot()))
      }
    }
  }

  /// Land a full refetch, replacing every page. Same token guard as
  /// `append_page`.
  pub fn replace_all(
    &self,
    descriptor: &QueryDescriptor,
    pages: Vec<Page>,
    observed_version: u64,
  ) -> Result<Option<EntrySnapshot>> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok(None);
    };
    match state.landing(observed_version) {
      Landing::Superseded => {
        warn!(descriptor = %descriptor.description(), "discarding superseded refetch");
        Ok(None)
      }
      Landing::Overtaken => {
        warn!(descriptor = %descriptor.description(), "discarding refetch landed after an edit");
        state.resolve_overtaken();
        Ok(None)
      }
      Landing::Landable => {
        state.entry = Arc::new(CacheEntry::from_pages(pages));
        state.phase = LoadPhase::Ready;
        state.freshness = Freshness::Fresh;
        state.fetched_at = Some(Utc::now());
        state.version += 1;
        state.active_fetch = None;
        debug!(
          descriptor = %descriptor.description(),
          rows = state.entry.row_count(),
          "entry refreshed"
        );
        Ok(Some(state.snapshot()))
      }
    }
  }

  /// Land a read-path failure as a distinct error state. Rows loaded so far
  /// are kept. Same token guard as `append_page`.
  pub fn mark_load_error(
    &self,
    descriptor: &QueryDescriptor,
    message: &str,
    observed_version: u64,
  ) -> Result<Option<EntrySnapshot>> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok(None);
    };
    match state.landing(observed_version) {
      Landing::Superseded => Ok(None),
      Landing::Overtaken => {
        state.resolve_overtaken();
        Ok(None)
      }
      Landing::Landable => {
        state.phase = LoadPhase::Failed(message.to_string());
        state.version += 1;
        state.active_fetch = None;
        Ok(Some(state.snapshot()))
      }
    }
  }

  /// Merge fields into the row with the given id. Missing row or entry is a
  /// silent no-op returning `None`; the UI may simply be a tick stale.
  pub fn patch_row(
    &self,
    descriptor: &QueryDescriptor,
    id: &str,
    patch: &FieldMap,
  ) -> Result<Option<EntrySnapshot>> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok(None);
    };
    let Some(patched) = state.entry.with_patched_row(id, patch) else {
      return Ok(None);
    };
    state.entry = Arc::new(patched);
    state.version += 1;
    Ok(Some(state.snapshot()))
  }

  /// Prepend a row to the first page, creating the entry when absent.
  pub fn insert_row_at_head(
    &self,
    descriptor: &QueryDescriptor,
    row: Row,
  ) -> Result<EntrySnapshot> {
    let mut entries = self.lock()?;
    let state = entries
      .entry(descriptor.cache_key())
      .or_insert_with(|| EntryState::new(descriptor));
    state.entry = Arc::new(state.entry.with_row_at_head(row));
    if state.phase == LoadPhase::Idle {
      state.phase = LoadPhase::Ready;
    }
    state.version += 1;
    Ok(state.snapshot())
  }

  /// Remove the ids from every page. Idempotent; returns how many rows went
  /// away, with a snapshot only when something actually changed.
  pub fn remove_rows(
    &self,
    descriptor: &QueryDescriptor,
    ids: &[String],
  ) -> Result<(usize, Option<EntrySnapshot>)> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok((0, None));
    };
    let (remaining, removed) = state.entry.without_rows(ids);
    if removed == 0 {
      return Ok((0, None));
    }
    state.entry = Arc::new(remaining);
    state.version += 1;
    Ok((removed, Some(state.snapshot())))
  }

  /// Rollback: reinstate a previously captured snapshot verbatim. The
  /// version still moves forward so stale fetches and observers order
  /// correctly.
  ///
  /// A snapshot captured mid-fetch carries `Loading`; when the fetch it was
  /// waiting on has since been discarded, the phase is resolved from content
  /// instead, or no read would ever go back to the server.
  pub fn restore(
    &self,
    descriptor: &QueryDescriptor,
    rollback_to: &EntrySnapshot,
  ) -> Result<EntrySnapshot> {
    let mut entries = self.lock()?;
    let state = entries
      .entry(descriptor.cache_key())
      .or_insert_with(|| EntryState::new(descriptor));
    warn!(descriptor = %descriptor.description(), "rolling back to pre-mutation snapshot");
    state.entry = Arc::clone(&rollback_to.entry);
    state.phase = rollback_to.phase.clone();
    state.freshness = rollback_to.freshness;
    state.fetched_at = rollback_to.fetched_at;
    if state.phase.is_loading() && state.active_fetch.is_none() {
      state.resolve_interrupted_load();
    }
    state.version += 1;
    Ok(state.snapshot())
  }

  /// Settle bookkeeping: the server confirmed an optimistic edit but the
  /// entry has not been refetched yet.
  pub fn mark_pending_confirmation(
    &self,
    descriptor: &QueryDescriptor,
  ) -> Result<Option<EntrySnapshot>> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok(None);
    };
    if state.freshness != Freshness::PendingConfirmation {
      state.freshness = Freshness::PendingConfirmation;
      state.version += 1;
    }
    Ok(Some(state.snapshot()))
  }

  /// Mark one entry stale so the next read refetches.
  pub fn invalidate(&self, descriptor: &QueryDescriptor) -> Result<Option<EntrySnapshot>> {
    let mut entries = self.lock()?;
    let Some(state) = entries.get_mut(&descriptor.cache_key()) else {
      return Ok(None);
    };
    if state.freshness != Freshness::Stale {
      state.freshness = Freshness::Stale;
      state.version += 1;
    }
    Ok(Some(state.snapshot()))
  }

  /// Mark every fresh entry of one collection stale. A mutation against one
  /// view makes every filtered view of the same resource suspect. Returns
  /// the touched entries.
  pub fn invalidate_resource(
    &self,
    resource: &str,
  ) -> Result<Vec<(DescriptorKey, EntrySnapshot)>> {
    let mut entries = self.lock()?;
    let mut touched = Vec::new();
    for (key, state) in entries.iter_mut() {
      if state.descriptor.resource == resource && state.freshness == Freshness::Fresh {
        state.freshness = Freshness::Stale;
        state.version += 1;
        touched.push((key.clone(), state.snapshot()));
      }
    }
    Ok(touched)
  }

  /// Descriptors of one resource whose entries a read would refetch.
  pub fn stale_descriptors(
    &self,
    resource: &str,
    stale_after: Duration,
  ) -> Result<Vec<QueryDescriptor>> {
    let entries = self.lock()?;
    Ok(
      entries
        .values()
        .filter(|state| {
          state.descriptor.resource == resource && state.snapshot().is_stale(stale_after)
        })
        .map(|state| state.descriptor.clone())
        .collect(),
    )
  }

  /// Drop the entry entirely. GC hook for when the last observer goes away.
  pub fn evict(&self, descriptor: &QueryDescriptor) -> Result<bool> {
    Ok(self.lock()?.remove(&descriptor.cache_key()).is_some())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn descriptor() -> QueryDescriptor {
    QueryDescriptor::new("mileage_logs", 25)
  }

  fn row(id: &str) -> Row {
    let mut fields = FieldMap::new();
    fields.insert("name".to_string(), json!(id.to_uppercase()));
    Row::new(id, fields)
  }

  #[test]
  fn test_get_or_create_starts_idle_and_is_stable() {
    let store = PageStore::new();
    let d = descriptor();

    let first = store.get_or_create(&d).unwrap();
    let second = store.get_or_create(&d).unwrap();

    assert_eq!(first.phase, LoadPhase::Idle);
    assert_eq!(first.version, 0);
    assert_eq!(first.version, second.version);
    assert_eq!(first.row_count(), 0);
  }

  #[test]
  fn test_fetch_lands_under_its_own_token() {
    let store = PageStore::new();
    let d = descriptor();

    let (token, loading) = store.begin_fetch(&d).unwrap();
    assert!(loading.phase.is_loading());

    let landed = store
      .append_page(&d, Page::new(vec![row("r1"), row("r2")], Some(2)), token)
      .unwrap()
      .unwrap();

    assert!(landed.phase.is_ready());
    assert_eq!(landed.freshness, Freshness::Fresh);
    assert_eq!(landed.row_count(), 2);
    assert!(landed.has_more());
    assert!(landed.fetched_at.is_some());
  }

  #[test]
  fn test_edit_between_fetch_and_landing_discards_the_page() {
    let store = PageStore::new();
    let d = descriptor();

    let (token, _) = store.begin_fetch(&d).unwrap();
    // An optimistic insert lands while the fetch is in flight
    store.insert_row_at_head(&d, row("optimistic")).unwrap();

    let landed = store
      .append_page(&d, Page::new(vec![row("server")], None), token)
      .unwrap();
    assert!(landed.is_none());

    // The entry kept the optimistic edit and became stale for reconciliation
    let snapshot = store.get_or_create(&d).unwrap();
    assert_eq!(snapshot.row_count(), 1);
    assert_eq!(snapshot.entry.rows().next().unwrap().id, "optimistic");
    assert_eq!(snapshot.freshness, Freshness::Stale);
    assert!(snapshot.phase.is_ready());
  }

  #[test]
  fn test_newer_fetch_supersedes_an_older_one() {
    let store = PageStore::new();
    let d = descriptor();

    let (old_token, _) = store.begin_fetch(&d).unwrap();
    let (new_token, _) = store.begin_fetch(&d).unwrap();

    // The superseded landing is a pure discard; the newer fetch still lands
    assert!(store
      .replace_all(&d, vec![Page::new(vec![row("old")], None)], old_token)
      .unwrap()
      .is_none());
    let landed = store
      .replace_all(&d, vec![Page::new(vec![row("new")], None)], new_token)
      .unwrap()
      .unwrap();

    assert_eq!(landed.entry.rows().next().unwrap().id, "new");
  }

  #[test]
  fn test_load_error_is_a_distinct_state_that_keeps_rows() {
    let store = PageStore::new();
    let d = descriptor();

    let (token, _) = store.begin_fetch(&d).unwrap();
    store
      .append_page(&d, Page::new(vec![row("r1")], Some(2)), token)
      .unwrap();

    let (token, _) = store.begin_fetch(&d).unwrap();
    let failed = store
      .mark_load_error(&d, "connection reset", token)
      .unwrap()
      .unwrap();

    assert_eq!(failed.phase.error(), Some("connection reset"));
    assert_eq!(failed.row_count(), 1);
  }

  #[test]
  fn test_patch_bumps_only_when_the_row_exists() {
    let store = PageStore::new();
    let d = descriptor();
    let (token, _) = store.begin_fetch(&d).unwrap();
    let before = store
      .append_page(&d, Page::new(vec![row("r1")], None), token)
      .unwrap()
      .unwrap();

    let mut patch = FieldMap::new();
    patch.insert("status".to_string(), json!("Closed"));

    let missing = store.patch_row(&d, "ghost", &patch).unwrap();
    assert!(missing.is_none());
    assert_eq!(store.get_or_create(&d).unwrap().version, before.version);

    let patched = store.patch_row(&d, "r1", &patch).unwrap().unwrap();
    assert_eq!(patched.version, before.version + 1);
    assert_eq!(
      patched.entry.find_row("r1").unwrap().field("status"),
      Some(&json!("Closed"))
    );
  }

  #[test]
  fn test_remove_twice_changes_nothing_the_second_time() {
    let store = PageStore::new();
    let d = descriptor();
    let (token, _) = store.begin_fetch(&d).unwrap();
    store
      .append_page(&d, Page::new(vec![row("a"), row("b"), row("c")], None), token)
      .unwrap();
    let ids = vec!["a".to_string(), "b".to_string()];

    let (removed, snapshot) = store.remove_rows(&d, &ids).unwrap();
    assert_eq!(removed, 2);
    let first_version = snapshot.unwrap().version;

    let (removed_again, snapshot_again) = store.remove_rows(&d, &ids).unwrap();
    assert_eq!(removed_again, 0);
    assert!(snapshot_again.is_none());
    assert_eq!(store.get_or_create(&d).unwrap().version, first_version);
  }

  #[test]
  fn test_restore_reinstates_the_snapshot_and_moves_the_version_forward() {
    let store = PageStore::new();
    let d = descriptor();
    let (token, _) = store.begin_fetch(&d).unwrap();
    let before = store
      .append_page(&d, Page::new(vec![row("a"), row("b"), row("c")], None), token)
      .unwrap()
      .unwrap();

    store
      .remove_rows(&d, &["a".to_string(), "b".to_string()])
      .unwrap();

    let restored = store.restore(&d, &before).unwrap();
    assert_eq!(restored.entry, before.entry);
    assert!(Arc::ptr_eq(&restored.entry, &before.entry));
    assert_eq!(restored.fetched_at, before.fetched_at);
    assert!(restored.version > before.version);
  }

  #[test]
  fn test_restore_resolves_a_loading_snapshot_whose_fetch_was_discarded() {
    let store = PageStore::new();
    let d = descriptor();
    let (first, _) = store.begin_fetch(&d).unwrap();
    store
      .append_page(&d, Page::new(vec![row("a")], None), first)
      .unwrap();

    // A refresh begins, then a mutation snapshots the entry mid-fetch
    let (refresh, _) = store.begin_fetch(&d).unwrap();
    let mid_fetch = store.get_or_create(&d).unwrap();
    assert!(mid_fetch.phase.is_loading());

    // The speculative edit overtakes the refresh, whose landing is dropped
    let mut patch = FieldMap::new();
    patch.insert("name".to_string(), json!("edited"));
    store.patch_row(&d, "a", &patch).unwrap();
    assert!(store
      .replace_all(&d, vec![Page::new(vec![row("server")], None)], refresh)
      .unwrap()
      .is_none());

    // Rolling back must not reinstate `Loading`: no fetch is left to land
    let restored = store.restore(&d, &mid_fetch).unwrap();
    assert!(restored.phase.is_ready());
    assert_eq!(restored.freshness, Freshness::Stale);
    assert_eq!(restored.entry.rows().next().unwrap().id, "a");
  }

  #[test]
  fn test_invalidate_resource_touches_only_fresh_siblings() {
    let store = PageStore::new();
    let logs_a = QueryDescriptor::new("mileage_logs", 25).with_filter("team", json!("north"));
    let logs_b = QueryDescriptor::new("mileage_logs", 25).with_filter("team", json!("south"));
    let leads = QueryDescriptor::new("leads", 25);

    for d in [&logs_a, &logs_b, &leads] {
      let (token, _) = store.begin_fetch(d).unwrap();
      store
        .append_page(d, Page::new(vec![row("r1")], None), token)
        .unwrap();
    }
    store.mark_pending_confirmation(&logs_a).unwrap();

    let touched = store.invalidate_resource("mileage_logs").unwrap();

    // logs_a is already pending confirmation, leads is another resource
    assert_eq!(touched.len(), 1);
    assert_eq!(touched[0].0, logs_b.cache_key());
    assert_eq!(
      store.get_or_create(&logs_a).unwrap().freshness,
      Freshness::PendingConfirmation
    );
    assert_eq!(
      store.get_or_create(&leads).unwrap().freshness,
      Freshness::Fresh
    );
  }

  #[test]
  fn test_stale_descriptors_reports_what_a_read_would_refetch() {
    let store = PageStore::new();
    let fresh = QueryDescriptor::new("mileage_logs", 25).with_filter("team", json!("north"));
    let stale = QueryDescriptor::new("mileage_logs", 25).with_filter("team", json!("south"));

    for d in [&fresh, &stale] {
      let (token, _) = store.begin_fetch(d).unwrap();
      store
        .append_page(d, Page::new(vec![row("r1")], None), token)
        .unwrap();
    }
    store.invalidate(&stale).unwrap();

    let descriptors = store
      .stale_descriptors("mileage_logs", Duration::minutes(5))
      .unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].cache_key(), stale.cache_key());
  }

  #[test]
  fn test_evicted_entries_ignore_late_landings() {
    let store = PageStore::new();
    let d = descriptor();
    let (token, _) = store.begin_fetch(&d).unwrap();
    assert!(store.snapshot(&d.cache_key()).unwrap().is_some());

    assert!(store.evict(&d).unwrap());
    let landed = store
      .append_page(&d, Page::new(vec![row("late")], None), token)
      .unwrap();

    assert!(landed.is_none());
    assert!(store.snapshot(&d.cache_key()).unwrap().is_none());
    assert!(!store.evict(&d).unwrap());
  }
}
