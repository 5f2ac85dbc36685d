//! Region registry and page-slot bookkeeping.
//!
//! Two tables, tied together by ids: a region table keyed by region id that
//! carries the page bases backing each region, and a page-slot table keyed
//! by page base that carries the region ids intersecting each page. Neither
//! owns the other.
//!
//! Structural changes happen under the writer lock. The page-slot table is
//! additionally readable from signal context: buckets are published through
//! release/acquire atomics, slots are never deallocated while the registry
//! lives, and retirement is a `live` flag rather than a removal.

use crate::engine::WatchOptions;
use crate::fault::CANDIDATE_IDS;
use crate::snapshot::Snapshot;
use crate::{page, protect, util, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Bookkeeping overhead attributed to each region besides its snapshot.
const REGION_OVERHEAD: usize = 160;

/// Page slot lifecycle states.
pub(crate) mod page_state {
  /// No protection applied (polling, teardown, or between transitions).
  pub const UNPROTECTED: u8 = 0;
  /// Writes to the page fault.
  pub const PROTECTED: u8 = 1;
  /// A fault opened a writable window that the worker has yet to close.
  pub const WINDOW_OPEN: u8 = 2;
}

/// A user-declared watched span.
pub(crate) struct Region {
  pub id: u64,
  pub base: usize,
  pub len: usize,
  pub label: Option<String>,
  pub capture: crate::CaptureMode,
  pub adapter_id: u32,
  pub metadata_ref: u64,
  pub variable_id: Option<u64>,
  pub metadata: BTreeMap<String, String>,
  pub snapshot: Snapshot,
  pub epoch: u64,
  pub seq: u64,
  /// Protection was refused; the region is detected by checksum polling.
  pub poll_only: bool,
  /// Page bases this region contributes a protection count to.
  pub pages: Vec<usize>,
}

impl Region {
  #[inline]
  pub(crate) fn contains(&self, address: usize) -> bool {
    self.base <= address && address < self.base + self.len
  }

  /// The region's live bytes. Valid while the watch is active, per the
  /// caller contract of `watch`.
  pub(crate) unsafe fn current_bytes(&self) -> &[u8] {
    std::slice::from_raw_parts(self.base as *const u8, self.len)
  }
}

/// Engine bookkeeping for one hardware page backing any live region.
pub(crate) struct PageSlot {
  pub page_base: usize,
  pub protect_count: AtomicU32,
  pub state: AtomicU8,
  pub live: AtomicBool,
  pub window_deadline_ns: AtomicU64,
  /// First few region ids on this page, readable from signal context.
  pub candidates: [AtomicU64; CANDIDATE_IDS],
  /// All region ids intersecting this page, ascending by region base.
  /// Structural edits happen under the registry writer lock only.
  pub region_ids: Mutex<Vec<u64>>,
}

impl PageSlot {
  fn new(page_base: usize) -> Self {
    PageSlot {
      page_base,
      protect_count: AtomicU32::new(0),
      state: AtomicU8::new(page_state::UNPROTECTED),
      live: AtomicBool::new(true),
      window_deadline_ns: AtomicU64::new(0),
      candidates: Default::default(),
      region_ids: Mutex::new(Vec::new()),
    }
  }

  fn refresh_candidates(&self, ids: &[u64]) {
    for index in 0..CANDIDATE_IDS {
      let id = ids.get(index).copied().unwrap_or(0);
      self.candidates[index].store(id, Ordering::Release);
    }
  }

  /// Copies the candidate cache; async-signal-safe.
  pub(crate) fn snapshot_candidates(&self) -> [u64; CANDIDATE_IDS] {
    let mut ids = [0; CANDIDATE_IDS];
    for (index, id) in ids.iter_mut().enumerate() {
      *id = self.candidates[index].load(Ordering::Relaxed);
    }
    ids
  }
}

struct Bucket {
  key: AtomicUsize,
  slot: AtomicPtr<PageSlot>,
}

/// Open-addressed page-base lookup table, sized once at initialization.
///
/// Keys are only ever added; a page leaving the registry retires its slot
/// through the `live` flag instead of deleting the bucket, which keeps the
/// linear probe correct for concurrent, lock-free readers.
struct PageTable {
  buckets: Box<[Bucket]>,
  mask: usize,
}

unsafe impl Send for PageTable {}
unsafe impl Sync for PageTable {}

impl PageTable {
  fn with_capacity(capacity: usize) -> Self {
    assert!(capacity.is_power_of_two());

    let buckets = (0..capacity)
      .map(|_| Bucket {
        key: AtomicUsize::new(0),
        slot: AtomicPtr::new(std::ptr::null_mut()),
      })
      .collect::<Vec<_>>()
      .into_boxed_slice();

    PageTable {
      buckets,
      mask: capacity - 1,
    }
  }

  fn index(&self, page_base: usize) -> usize {
    let hash = (page_base as u64 / page::size() as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (hash ^ (hash >> 33)) as usize & self.mask
  }

  /// Lock-free lookup; safe to call from signal context.
  fn lookup(&self, page_base: usize) -> Option<&PageSlot> {
    let mut index = self.index(page_base);

    for _ in 0..self.buckets.len() {
      let bucket = &self.buckets[index];
      let key = bucket.key.load(Ordering::Acquire);

      if key == 0 {
        return None;
      }

      if key == page_base {
        let slot = bucket.slot.load(Ordering::Acquire);
        return unsafe { slot.as_ref() };
      }

      index = (index + 1) & self.mask;
    }

    None
  }

  /// Finds or creates the slot for a page. Callers hold the writer lock, so
  /// insertions never race each other; the slot pointer is published before
  /// the key so lock-free readers always observe initialized slots.
  fn get_or_insert(&self, page_base: usize) -> Result<(&PageSlot, bool)> {
    let mut index = self.index(page_base);

    for _ in 0..self.buckets.len() {
      let bucket = &self.buckets[index];
      let key = bucket.key.load(Ordering::Acquire);

      if key == page_base {
        let slot = bucket.slot.load(Ordering::Acquire);
        return Ok((unsafe { &*slot }, false));
      }

      if key == 0 {
        let slot = Box::into_raw(Box::new(PageSlot::new(page_base)));
        bucket.slot.store(slot, Ordering::Release);
        bucket.key.store(page_base, Ordering::Release);
        return Ok((unsafe { &*slot }, true));
      }

      index = (index + 1) & self.mask;
    }

    Err(Error::ResourceExhausted("page table"))
  }

  fn memory_bytes(&self) -> usize {
    self.buckets.len() * std::mem::size_of::<Bucket>()
  }
}

impl Drop for PageTable {
  fn drop(&mut self) {
    for bucket in self.buckets.iter() {
      let slot = bucket.slot.load(Ordering::Acquire);
      if !slot.is_null() {
        drop(unsafe { Box::from_raw(slot) });
      }
    }
  }
}

/// Registry construction parameters.
pub(crate) struct RegistrySettings {
  /// Whether joined pages are write-protected (false in polling mode).
  pub protect: bool,
  pub allow_overlap: bool,
  pub max_pages: usize,
  pub max_memory: Option<usize>,
}

/// The result of registering a watch.
pub(crate) struct WatchOutcome {
  pub id: u64,
  /// Protection was refused and the region was downgraded to polling.
  pub downgraded: bool,
}

struct Inner {
  regions: BTreeMap<u64, Region>,
  next_id: u64,
}

pub(crate) struct Registry {
  settings: RegistrySettings,
  inner: RwLock<Inner>,
  pages: PageTable,
  page_count: AtomicUsize,
  mem_bytes: AtomicUsize,
}

impl Registry {
  pub(crate) fn new(settings: RegistrySettings, table_capacity: usize) -> Self {
    Registry {
      settings,
      inner: RwLock::new(Inner {
        regions: BTreeMap::new(),
        next_id: 1,
      }),
      pages: PageTable::with_capacity(table_capacity),
      page_count: AtomicUsize::new(0),
      mem_bytes: AtomicUsize::new(0),
    }
  }

  /// Registers a watch over `[base, base + len)`.
  ///
  /// The initial contents are snapshotted and hashed, every intersecting
  /// page slot is joined, and pages whose protection count transitions from
  /// zero to one are write-protected. A refused protection rolls the page
  /// joins back and downgrades the region to polling detection.
  pub(crate) fn watch(&self, base: usize, len: usize, options: WatchOptions) -> Result<WatchOutcome> {
    let end = util::checked_span(base, len)?;
    let mut inner = self.inner.write();

    if !self.settings.allow_overlap {
      for region in inner.regions.values() {
        if region.adapter_id == options.adapter_id && base < region.base + region.len && region.base < end {
          return Err(Error::RegionOverlap);
        }
      }
    }

    let cost = len + REGION_OVERHEAD;
    if let Some(budget) = self.settings.max_memory {
      if self.mem_bytes.load(Ordering::Relaxed) + cost > budget {
        return Err(Error::ResourceExhausted("memory budget"));
      }
    }

    let span: Vec<usize> = page::bases(base, len).collect();
    let new_pages = span
      .iter()
      .filter(|pb| {
        self
          .pages
          .lookup(**pb)
          .map_or(true, |slot| !slot.live.load(Ordering::Acquire))
      })
      .count();
    if self.page_count.load(Ordering::Relaxed) + new_pages > self.settings.max_pages {
      return Err(Error::ResourceExhausted("page table"));
    }

    let id = inner.next_id;
    inner.next_id += 1;

    let snapshot = Snapshot::capture(unsafe { std::slice::from_raw_parts(base as *const u8, len) });

    let mut joined: Vec<usize> = Vec::with_capacity(span.len());
    let mut downgraded = false;

    for pb in &span {
      let (slot, created) = match self.pages.get_or_insert(*pb) {
        Ok(entry) => entry,
        Err(err) => {
          for joined_pb in &joined {
            if let Some(slot) = self.pages.lookup(*joined_pb) {
              self.leave_page(slot, id);
            }
          }
          return Err(err);
        }
      };

      if created {
        self.page_count.fetch_add(1, Ordering::Relaxed);
      } else if !slot.live.load(Ordering::Acquire) {
        slot.live.store(true, Ordering::Release);
        slot.state.store(page_state::UNPROTECTED, Ordering::Release);
        slot.window_deadline_ns.store(0, Ordering::Release);
        self.page_count.fetch_add(1, Ordering::Relaxed);
      }

      insert_region_id(&inner.regions, slot, id, base);
      joined.push(*pb);

      let previous = slot.protect_count.fetch_add(1, Ordering::AcqRel);
      if previous == 0 && self.settings.protect {
        match unsafe { protect::write_protect_page(*pb) } {
          Ok(()) => slot.state.store(page_state::PROTECTED, Ordering::Release),
          Err(err) => {
            log::warn!("write-protecting page {:#x} failed: {}", pb, err);
            downgraded = true;
            break;
          }
        }
      }
    }

    if downgraded {
      for pb in &joined {
        if let Some(slot) = self.pages.lookup(*pb) {
          self.leave_page(slot, id);
        }
      }
    }

    let region = Region {
      id,
      base,
      len,
      label: options.label,
      capture: options.capture,
      adapter_id: options.adapter_id,
      metadata_ref: options.metadata_ref,
      variable_id: options.variable_id,
      metadata: options.metadata.into_iter().collect(),
      snapshot,
      epoch: 0,
      seq: 0,
      poll_only: downgraded,
      pages: if downgraded { Vec::new() } else { span },
    };

    inner.regions.insert(id, region);
    self.mem_bytes.fetch_add(cost, Ordering::Relaxed);
    Ok(WatchOutcome { id, downgraded })
  }

  /// Deregisters a region. Returns false for unknown ids.
  pub(crate) fn unwatch(&self, id: u64) -> bool {
    let mut inner = self.inner.write();

    let region = match inner.regions.remove(&id) {
      Some(region) => region,
      None => return false,
    };

    for pb in &region.pages {
      if let Some(slot) = self.pages.lookup(*pb) {
        self.leave_page(slot, id);
      }
    }

    self
      .mem_bytes
      .fetch_sub(region.len + REGION_OVERHEAD, Ordering::Relaxed);
    true
  }

  /// Deregisters every region, restoring all page protection.
  pub(crate) fn clear_all(&self) {
    let mut inner = self.inner.write();
    let ids: Vec<u64> = inner.regions.keys().copied().collect();

    for id in ids {
      if let Some(region) = inner.regions.remove(&id) {
        for pb in &region.pages {
          if let Some(slot) = self.pages.lookup(*pb) {
            self.leave_page(slot, id);
          }
        }
        self
          .mem_bytes
          .fetch_sub(region.len + REGION_OVERHEAD, Ordering::Relaxed);
      }
    }
  }

  fn leave_page(&self, slot: &PageSlot, id: u64) {
    {
      let mut ids = slot.region_ids.lock();
      if let Some(position) = ids.iter().position(|other| *other == id) {
        ids.remove(position);
      }
      slot.refresh_candidates(&ids);
    }

    let previous = slot.protect_count.fetch_sub(1, Ordering::AcqRel);
    if previous == 1 {
      slot.state.store(page_state::UNPROTECTED, Ordering::Release);
      if self.settings.protect {
        if let Err(err) = unsafe { protect::unprotect_page(slot.page_base) } {
          log::warn!(
            "restoring write access to page {:#x} failed: {}",
            slot.page_base,
            err
          );
        }
      }
      slot.live.store(false, Ordering::Release);
      self.page_count.fetch_sub(1, Ordering::Relaxed);
    }
  }

  /// Region ids covering the exact byte address.
  pub(crate) fn find_regions(&self, address: usize) -> Vec<u64> {
    let inner = self.inner.read();

    let slot = match self.pages.lookup(page::floor(address)) {
      Some(slot) => slot,
      None => return Vec::new(),
    };

    let ids = slot.region_ids.lock().clone();
    ids
      .into_iter()
      .filter(|id| inner.regions.get(id).map_or(false, |region| region.contains(address)))
      .collect()
  }

  /// Lock-free page slot lookup; safe to call from signal context.
  pub(crate) fn lookup_page(&self, page_base: usize) -> Option<&PageSlot> {
    self.pages.lookup(page_base)
  }

  pub(crate) fn with_regions<R>(&self, f: impl FnOnce(&BTreeMap<u64, Region>) -> R) -> R {
    f(&self.inner.read().regions)
  }

  pub(crate) fn for_each_region(&self, mut f: impl FnMut(&Region)) {
    let inner = self.inner.read();
    for region in inner.regions.values() {
      f(region);
    }
  }

  /// Installs the post-event snapshot and advances the region's counters.
  pub(crate) fn commit_event(&self, id: u64, bytes: Vec<u8>, hash: u64) -> bool {
    let mut inner = self.inner.write();

    match inner.regions.get_mut(&id) {
      Some(region) => {
        region.snapshot.replace(bytes, hash);
        region.epoch += 1;
        region.seq += 1;
        true
      }
      None => false,
    }
  }

  pub(crate) fn region_count(&self) -> usize {
    self.inner.read().regions.len()
  }

  pub(crate) fn page_count(&self) -> usize {
    self.page_count.load(Ordering::Relaxed)
  }

  pub(crate) fn mem_bytes(&self) -> usize {
    self.mem_bytes.load(Ordering::Relaxed)
  }

  pub(crate) fn table_memory_bytes(&self) -> usize {
    self.pages.memory_bytes()
  }
}

fn insert_region_id(regions: &BTreeMap<u64, Region>, slot: &PageSlot, id: u64, base: usize) {
  let mut ids = slot.region_ids.lock();

  let position = ids
    .iter()
    .position(|other| {
      let other_base = regions.get(other).map_or(usize::MAX, |region| region.base);
      (other_base, *other) > (base, id)
    })
    .unwrap_or(ids.len());

  ids.insert(position, id);
  slot.refresh_candidates(&ids);
}
