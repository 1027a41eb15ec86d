//! Cache entry model: the pages loaded so far for one descriptor.
//!
//! Entries are copy-on-write. Every transform returns a new `CacheEntry`
//! that shares `Arc`s with the old one for everything it did not touch, so
//! readers holding a snapshot never observe a half-applied change and
//! untouched rows stay reference-identical across edits (render-skip
//! optimizations rely on this).

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::row::{FieldMap, Row};

/// One fetched page of rows. Immutable once built; refetches replace the
/// whole page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  pub items: Vec<Arc<Row>>,
  pub next_page_token: Option<u64>,
}

impl Page {
  pub fn new(items: Vec<Row>, next_page_token: Option<u64>) -> Self {
    Self {
      items: items.into_iter().map(Arc::new).collect(),
      next_page_token,
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// Ordered pages for one descriptor. The concatenation of `items` across
/// pages in page order is the collection as last seen from the server,
/// modulo pending optimistic edits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
  pub pages: Vec<Arc<Page>>,
}

impl CacheEntry {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn from_pages(pages: Vec<Page>) -> Self {
    Self {
      pages: pages.into_iter().map(Arc::new).collect(),
    }
  }

  pub fn row_count(&self) -> usize {
    self.pages.iter().map(|page| page.items.len()).sum()
  }

  /// All rows in page order.
  pub fn rows(&self) -> impl Iterator<Item = &Arc<Row>> {
    self.pages.iter().flat_map(|page| page.items.iter())
  }

  pub fn find_row(&self, id: &str) -> Option<&Arc<Row>> {
    self.rows().find(|row| row.id == id)
  }

  /// Continuation token of the last loaded page, if the server reported
  /// more data.
  pub fn next_page_token(&self) -> Option<u64> {
    self.pages.last().and_then(|page| page.next_page_token)
  }

  pub fn with_appended_page(&self, page: Page) -> CacheEntry {
    let mut pages = self.pages.clone();
    pages.push(Arc::new(page));
    CacheEntry { pages }
  }

  /// Merge `patch` into the row with the given id. Returns `None` when no
  /// row matches; every other row and page keeps its `Arc` identity.
  pub fn with_patched_row(&self, id: &str, patch: &FieldMap) -> Option<CacheEntry> {
    let (page_idx, row_idx) = self.locate(id)?;
    let source = &self.pages[page_idx];

    let mut items = source.items.clone();
    items[row_idx] = Arc::new(items[row_idx].merged(patch));

    let mut pages = self.pages.clone();
    pages[page_idx] = Arc::new(Page {
      items,
      next_page_token: source.next_page_token,
    });
    Some(CacheEntry { pages })
  }

  /// Prepend a row to the first page, creating it for an empty entry, so a
  /// freshly created row is visible at the top before the server re-sorts.
  pub fn with_row_at_head(&self, row: Row) -> CacheEntry {
    match self.pages.first() {
      Some(first) => {
        let mut items = Vec::with_capacity(first.items.len() + 1);
        items.push(Arc::new(row));
        items.extend(first.items.iter().cloned());
        let head = Arc::new(Page {
          items,
          next_page_token: first.next_page_token,
        });

        let mut pages = self.pages.clone();
        pages[0] = head;
        CacheEntry { pages }
      }
      None => CacheEntry {
        pages: vec![Arc::new(Page::new(vec![row], None))],
      },
    }
  }

  /// Drop every row whose id is in `ids`. Untouched pages keep their `Arc`
  /// identity; removing an absent id is a no-op, so the operation is
  /// idempotent.
  pub fn without_rows(&self, ids: &[String]) -> (CacheEntry, usize) {
    let mut removed = 0;
    let mut pages = Vec::with_capacity(self.pages.len());

    for page in &self.pages {
      let kept: Vec<Arc<Row>> = page
        .items
        .iter()
        .filter(|row| !ids.iter().any(|id| *id == row.id))
        .cloned()
        .collect();

      if kept.len() == page.items.len() {
        pages.push(Arc::clone(page));
      } else {
        removed += page.items.len() - kept.len();
        pages.push(Arc::new(Page {
          items: kept,
          next_page_token: page.next_page_token,
        }));
      }
    }

    (CacheEntry { pages }, removed)
  }

  fn locate(&self, id: &str) -> Option<(usize, usize)> {
    for (page_idx, page) in self.pages.iter().enumerate() {
      for (row_idx, row) in page.items.iter().enumerate() {
        if row.id == id {
          return Some((page_idx, row_idx));
        }
      }
    }
    None
  }
}

/// Load state of an entry. A fetch failure is its own state rather than
/// silently empty data.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadPhase {
  /// Nothing fetched yet
  Idle,
  /// First page or refetch in flight
  Loading,
  /// At least one page landed
  Ready,
  /// Last fetch failed
  Failed(String),
}

impl LoadPhase {
  pub fn is_loading(&self) -> bool {
    matches!(self, LoadPhase::Loading)
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, LoadPhase::Ready)
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      LoadPhase::Failed(message) => Some(message),
      _ => None,
    }
  }
}

/// How much the entry can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  Fresh,
  /// Invalidated; next read should refetch
  Stale,
  /// An optimistic edit was confirmed by the server but the entry has not
  /// been re-reconciled by refetch yet
  PendingConfirmation,
}

/// What observers receive: the entry plus its bookkeeping, all cheap to
/// clone and safe to hold across awaits.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
  pub entry: Arc<CacheEntry>,
  /// Monotonic per-descriptor version, bumped on every landed write.
  pub version: u64,
  pub phase: LoadPhase,
  pub freshness: Freshness,
  pub fetched_at: Option<DateTime<Utc>>,
}

impl EntrySnapshot {
  pub fn row_count(&self) -> usize {
    self.entry.row_count()
  }

  pub fn has_more(&self) -> bool {
    self.entry.next_page_token().is_some()
  }

  /// Whether a read should go back to the server: invalidated entries
  /// always, fresh ones once they outlive `stale_after`.
  pub fn is_stale(&self, stale_after: Duration) -> bool {
    match self.phase {
      LoadPhase::Ready => match self.freshness {
        Freshness::Fresh => self
          .fetched_at
          .map(|at| Utc::now() - at > stale_after)
          .unwrap_or(true),
        Freshness::Stale | Freshness::PendingConfirmation => true,
      },
      _ => false,
    }
  }
}
