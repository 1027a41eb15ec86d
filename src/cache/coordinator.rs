//! Optimistic mutation coordination over the page store.
//!
//! Every mutation runs the same three phases: capture a snapshot of the
//! entry, apply the edit locally so the UI updates immediately, then settle
//! against the server. A confirmed edit marks the affected views for
//! refetch reconciliation; a rejected edit restores the snapshot verbatim
//! and surfaces a user-visible notice.
//!
//! Mutations targeting the same descriptor are executed by a dedicated
//! worker task in dispatch order, each job running to completion before the
//! next starts. A rollback therefore can never erase a sibling mutation's
//! speculative edit. Mutations on different descriptors proceed
//! independently.

use chrono::Duration;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::cache::entry::{EntrySnapshot, LoadPhase};
use crate::cache::store::PageStore;
use crate::derived::DerivationRegistry;
use crate::descriptor::{DescriptorKey, QueryDescriptor};
use crate::error::RemoteError;
use crate::remote::client::{MutationRequest, RemoteClient};
use crate::row::{FieldMap, Row};

/// What a dispatched mutation settled to.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// The server accepted the mutation; affected views await refetch
  /// reconciliation.
  Committed,
  /// The server rejected the mutation; the cache was restored to its
  /// pre-mutation state.
  RolledBack { message: String },
  /// The target rows were not in the cache; nothing was applied or sent.
  /// The view was likely a tick stale.
  Skipped,
}

/// User-facing notification. Every failed mutation and failed fetch becomes
/// one of these instead of propagating an error to the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
  pub resource: String,
  pub message: String,
}

enum MutationKind {
  Create {
    fields: FieldMap,
  },
  Update {
    id: String,
    patch: FieldMap,
    changed: Option<String>,
  },
  Delete {
    ids: Vec<String>,
  },
}

struct MutationJob {
  descriptor: QueryDescriptor,
  registry: DerivationRegistry,
  kind: MutationKind,
  outcome_tx: oneshot::Sender<MutationOutcome>,
}

type WatcherMap = HashMap<DescriptorKey, watch::Sender<EntrySnapshot>>;
type WorkerMap = HashMap<DescriptorKey, mpsc::UnboundedSender<MutationJob>>;

/// State shared by every handle clone and every worker task.
struct CacheShared<C> {
  store: PageStore,
  client: C,
  watchers: Mutex<WatcherMap>,
  workers: Mutex<WorkerMap>,
  notices: mpsc::UnboundedSender<Notice>,
}

/// Cache for paginated collections with optimistic mutations.
///
/// Explicitly constructed and passed where needed; there is no ambient
/// instance. Handles are cheap to clone and share one store, one remote
/// client and one notice stream. Configure with the `with_*` builders
/// before sharing clones.
pub struct CollectionCache<C: RemoteClient> {
  shared: Arc<CacheShared<C>>,
  registry: DerivationRegistry,
  stale_after: Duration,
}

impl<C: RemoteClient> Clone for CollectionCache<C> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      registry: self.registry.clone(),
      stale_after: self.stale_after,
    }
  }
}

impl<C: RemoteClient + 'static> CollectionCache<C> {
  /// Create a cache over the given remote client. Returns the cache and
  /// the stream of user-facing notices.
  pub fn new(client: C) -> (Self, mpsc::UnboundedReceiver<Notice>) {
    let (notices, notices_rx) = mpsc::unbounded_channel();
    let cache = Self {
      shared: Arc::new(CacheShared {
        store: PageStore::new(),
        client,
        watchers: Mutex::new(HashMap::new()),
        workers: Mutex::new(HashMap::new()),
        notices,
      }),
      registry: DerivationRegistry::standard(),
      stale_after: Duration::minutes(5),
    };
    (cache, notices_rx)
  }

  /// Replace the derived-field registry.
  pub fn with_registry(mut self, registry: DerivationRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Set how long entries stay fresh before a read refetches them.
  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  // ==========================================================================
  // Read path
  // ==========================================================================

  /// Current snapshot for the descriptor, creating an idle entry if none
  /// exists. Never touches the network.
  pub fn current(&self, descriptor: &QueryDescriptor) -> Result<EntrySnapshot> {
    self.shared.store.get_or_create(descriptor)
  }

  /// Watch the descriptor's entry. The receiver always holds the latest
  /// published snapshot; publications are version-gated so a late publisher
  /// can never overwrite a newer one.
  pub fn subscribe(&self, descriptor: &QueryDescriptor) -> Result<watch::Receiver<EntrySnapshot>> {
    let snapshot = self.shared.store.get_or_create(descriptor)?;
    let mut watchers = self.shared.lock_watchers()?;
    let tx = watchers
      .entry(descriptor.cache_key())
      .or_insert_with(|| watch::channel(snapshot.clone()).0);
    tx.send_if_modified(|current| {
      if snapshot.version > current.version {
        *current = snapshot;
        true
      } else {
        false
      }
    });
    Ok(tx.subscribe())
  }

  /// Serve the entry, fetching the first page when it is empty, failed or
  /// stale. A load already in flight is not duplicated.
  pub async fn ensure_loaded(&self, descriptor: &QueryDescriptor) -> Result<EntrySnapshot> {
    let current = self.shared.store.get_or_create(descriptor)?;
    let fetch = match &current.phase {
      LoadPhase::Idle | LoadPhase::Failed(_) => true,
      LoadPhase::Loading => false,
      LoadPhase::Ready => current.is_stale(self.stale_after),
    };
    if !fetch {
      return Ok(current);
    }
    self.refresh(descriptor).await
  }

  /// Unconditional first-page refetch, replacing every loaded page. An
  /// older in-flight fetch is superseded and its result discarded.
  ///
  /// A fetch failure comes back as a `Failed` snapshot, not an `Err`; the
  /// `Err` arm is for internal faults only.
  pub async fn refresh(&self, descriptor: &QueryDescriptor) -> Result<EntrySnapshot> {
    let key = descriptor.cache_key();
    let (token, loading) = self.shared.store.begin_fetch(descriptor)?;
    self.shared.publish(&key, &loading)?;

    match self.shared.client.fetch_page(descriptor, None).await {
      Ok(page) => match self.shared.store.replace_all(descriptor, vec![page], token)? {
        Some(snapshot) => {
          self.shared.publish(&key, &snapshot)?;
          Ok(snapshot)
        }
        // Superseded while in flight; serve whatever is current now
        None => self.shared.store.get_or_create(descriptor),
      },
      Err(error) => self.land_fetch_failure(descriptor, token, error),
    }
  }

  /// Fetch the page after the last one loaded. No-op when the server
  /// reported no more data or a load is already in flight.
  pub async fn load_more(&self, descriptor: &QueryDescriptor) -> Result<EntrySnapshot> {
    let current = self.shared.store.get_or_create(descriptor)?;
    if current.phase.is_loading() {
      return Ok(current);
    }
    let Some(page_token) = current.entry.next_page_token() else {
      return Ok(current);
    };

    let key = descriptor.cache_key();
    let (token, loading) = self.shared.store.begin_fetch(descriptor)?;
    self.shared.publish(&key, &loading)?;

    match self.shared.client.fetch_page(descriptor, Some(page_token)).await {
      Ok(page) => match self.shared.store.append_page(descriptor, page, token)? {
        Some(snapshot) => {
          self.shared.publish(&key, &snapshot)?;
          Ok(snapshot)
        }
        None => self.shared.store.get_or_create(descriptor),
      },
      Err(error) => self.land_fetch_failure(descriptor, token, error),
    }
  }

  /// Mark one entry stale so the next read refetches it.
  pub fn invalidate(&self, descriptor: &QueryDescriptor) -> Result<()> {
    if let Some(snapshot) = self.shared.store.invalidate(descriptor)? {
      self.shared.publish(&descriptor.cache_key(), &snapshot)?;
    }
    Ok(())
  }

  /// Refetch every entry of a resource that a read would refetch, in
  /// parallel. Typically called after a mutation settles to reconcile the
  /// sibling views eagerly instead of waiting for their next read.
  pub async fn refresh_stale(&self, resource: &str) -> Result<Vec<EntrySnapshot>> {
    let descriptors = self
      .shared
      .store
      .stale_descriptors(resource, self.stale_after)?;
    let refreshed = join_all(descriptors.iter().map(|d| self.refresh(d))).await;
    refreshed.into_iter().collect()
  }

  /// Forget the descriptor entirely: entry, watch channel and mutation
  /// worker. For when the surrounding application drops its last observer.
  pub fn evict(&self, descriptor: &QueryDescriptor) -> Result<bool> {
    let key = descriptor.cache_key();
    self.shared.lock_watchers()?.remove(&key);
    // Dropping the sender lets the worker drain its queue and exit
    self.shared.lock_workers()?.remove(&key);
    self.shared.store.evict(descriptor)
  }

  fn land_fetch_failure(
    &self,
    descriptor: &QueryDescriptor,
    token: u64,
    error: RemoteError,
  ) -> Result<EntrySnapshot> {
    match self
      .shared
      .store
      .mark_load_error(descriptor, &error.to_string(), token)?
    {
      Some(snapshot) => {
        self.shared.publish(&descriptor.cache_key(), &snapshot)?;
        let _ = self.shared.notices.send(Notice {
          resource: descriptor.resource.clone(),
          message: error.fetch_message(),
        });
        Ok(snapshot)
      }
      None => self.shared.store.get_or_create(descriptor),
    }
  }

  // ==========================================================================
  // Mutation path
  // ==========================================================================

  /// Create a row optimistically. Derived fields are computed before the
  /// apply so the new row is consistent the moment it appears.
  pub fn create_row(
    &self,
    descriptor: &QueryDescriptor,
    fields: FieldMap,
  ) -> Result<oneshot::Receiver<MutationOutcome>> {
    self.dispatch(descriptor, MutationKind::Create { fields })
  }

  /// Merge fields into a row optimistically. `changed` names the field the
  /// user edited so dependent fields recompute with it.
  pub fn update_row(
    &self,
    descriptor: &QueryDescriptor,
    id: impl Into<String>,
    patch: FieldMap,
    changed: Option<&str>,
  ) -> Result<oneshot::Receiver<MutationOutcome>> {
    self.dispatch(
      descriptor,
      MutationKind::Update {
        id: id.into(),
        patch,
        changed: changed.map(str::to_string),
      },
    )
  }

  /// Remove rows optimistically.
  pub fn delete_rows(
    &self,
    descriptor: &QueryDescriptor,
    ids: Vec<String>,
  ) -> Result<oneshot::Receiver<MutationOutcome>> {
    self.dispatch(descriptor, MutationKind::Delete { ids })
  }

  /// Enqueue a mutation on the descriptor's worker. Never blocks; the
  /// returned receiver resolves when the mutation settles and may be
  /// dropped by callers that do not care.
  fn dispatch(
    &self,
    descriptor: &QueryDescriptor,
    kind: MutationKind,
  ) -> Result<oneshot::Receiver<MutationOutcome>> {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let mut job = MutationJob {
      descriptor: descriptor.clone(),
      registry: self.registry.clone(),
      kind,
      outcome_tx,
    };

    let key = descriptor.cache_key();
    let mut workers = self.shared.lock_workers()?;
    if let Some(worker) = workers.get(&key) {
      match worker.send(job) {
        Ok(()) => return Ok(outcome_rx),
        // Worker task is gone; fall through and replace it
        Err(mpsc::error::SendError(returned)) => job = returned,
      }
    }
    let worker = Self::spawn_worker(&self.shared);
    let _ = worker.send(job);
    workers.insert(key, worker);
    Ok(outcome_rx)
  }

  /// One worker per descriptor serializes its mutations. The worker holds
  /// the shared state weakly so dropping the last cache handle shuts every
  /// worker down.
  fn spawn_worker(shared: &Arc<CacheShared<C>>) -> mpsc::UnboundedSender<MutationJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<MutationJob>();
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
      while let Some(job) = rx.recv().await {
        let Some(shared) = weak.upgrade() else { break };
        if let Err(error) = shared.execute_job(job).await {
          warn!("mutation worker error: {}", error);
        }
      }
    });
    tx
  }
}

impl<C: RemoteClient> CacheShared<C> {
  fn lock_watchers(&self) -> Result<MutexGuard<'_, WatcherMap>> {
    self.watchers.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn lock_workers(&self) -> Result<MutexGuard<'_, WorkerMap>> {
    self.workers.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Push a snapshot to the descriptor's watch channel. Gated on the
  /// version counter so publications can arrive in any order.
  fn publish(&self, key: &DescriptorKey, snapshot: &EntrySnapshot) -> Result<()> {
    let watchers = self.lock_watchers()?;
    if let Some(tx) = watchers.get(key) {
      tx.send_if_modified(|current| {
        if snapshot.version > current.version {
          *current = snapshot.clone();
          true
        } else {
          false
        }
      });
    }
    Ok(())
  }

  /// Snapshot, speculative apply, settle. Runs to completion; the caller
  /// (the descriptor's worker) must not start another job before this one
  /// returns.
  async fn execute_job(&self, job: MutationJob) -> Result<()> {
    let MutationJob {
      descriptor,
      registry,
      kind,
      outcome_tx,
    } = job;
    let key = descriptor.cache_key();
    let resource = descriptor.resource.clone();

    // Phase 1: snapshot. Copy-on-write entries make this a cheap capture
    // with deep-isolation semantics.
    let snapshot = self.store.get_or_create(&descriptor)?;

    // Phase 2: speculative apply with client-computed values.
    let applied = self.apply(&descriptor, &registry, &snapshot, kind)?;
    let Some((published, request)) = applied else {
      debug!(resource = %resource, "mutation target not in cache, skipping");
      let _ = outcome_tx.send(MutationOutcome::Skipped);
      return Ok(());
    };
    self.publish(&key, &published)?;
    debug!(kind = request.kind(), resource = %resource, "speculative apply");

    // Phase 3: settle.
    match self.client.mutate(&request).await {
      Ok(_) => {
        if let Some(confirmed) = self.store.mark_pending_confirmation(&descriptor)? {
          self.publish(&key, &confirmed)?;
        }
        for (sibling_key, stale) in self.store.invalidate_resource(&resource)? {
          self.publish(&sibling_key, &stale)?;
        }
        debug!(kind = request.kind(), resource = %resource, "mutation committed");
        let _ = outcome_tx.send(MutationOutcome::Committed);
      }
      Err(error) => {
        let restored = self.store.restore(&descriptor, &snapshot)?;
        self.publish(&key, &restored)?;
        warn!(
          kind = request.kind(),
          resource = %resource,
          error = %error,
          "mutation failed, rolled back"
        );
        let message = error.mutation_message();
        let _ = self.notices.send(Notice {
          resource: resource.clone(),
          message: message.clone(),
        });
        let _ = outcome_tx.send(MutationOutcome::RolledBack { message });
      }
    }
    Ok(())
  }

  /// Apply the mutation to the store and build the matching server request.
  /// `None` means the target rows were absent and nothing changed.
  fn apply(
    &self,
    descriptor: &QueryDescriptor,
    registry: &DerivationRegistry,
    snapshot: &EntrySnapshot,
    kind: MutationKind,
  ) -> Result<Option<(EntrySnapshot, MutationRequest)>> {
    let resource = &descriptor.resource;
    match kind {
      MutationKind::Create { mut fields } => {
        let derived = registry.derive_for(resource, &fields, None);
        fields.extend(derived);
        let row = Row::with_generated_id(fields);
        let request = MutationRequest::Create {
          resource: resource.clone(),
          row: row.clone(),
        };
        let published = self.store.insert_row_at_head(descriptor, row)?;
        Ok(Some((published, request)))
      }
      MutationKind::Update { id, patch, changed } => {
        let Some(current) = snapshot.entry.find_row(&id) else {
          return Ok(None);
        };
        // Derive over the post-edit field set so dependent fields are
        // consistent before the server confirms
        let merged = current.merged(&patch);
        let derived = registry.derive_for(resource, &merged.fields, changed.as_deref());
        let mut full_patch = patch;
        full_patch.extend(derived);

        match self.store.patch_row(descriptor, &id, &full_patch)? {
          None => Ok(None),
          Some(published) => Ok(Some((
            published,
            MutationRequest::Update {
              resource: resource.clone(),
              id,
              fields: full_patch,
            },
          ))),
        }
      }
      MutationKind::Delete { ids } => {
        let (_, published) = self.store.remove_rows(descriptor, &ids)?;
        match published {
          None => Ok(None),
          Some(published) => Ok(Some((
            published,
            MutationRequest::Delete {
              resource: resource.clone(),
              ids,
            },
          ))),
        }
      }
    }
  }
}
