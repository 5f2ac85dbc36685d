//! Background worker: turns fault records into change events.
//!
//! The worker is the single consumer of the event ring. For each page it
//! waits out the writable window, rehashes every candidate region, emits one
//! event per region that actually changed (ascending base order), installs
//! the new snapshots, and re-protects the page. Records for the same page
//! that queued up back to back collapse into one pass, so rapid stores
//! within a window produce a single event per region.

use crate::engine::{Engine, Mode};
use crate::event::{ChangeEvent, Origin};
use crate::fault::FaultRecord;
use crate::registry::page_state;
use crate::{os, protect, snapshot, storage};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// State shared between the worker thread and the control surface.
pub(crate) struct WorkerShared {
  pub cv: parking_lot::Condvar,
  pub lock: parking_lot::Mutex<()>,
  pub stop: AtomicBool,
  /// Region currently mid-event; `unwatch` waits for it to clear.
  pub current_region: AtomicU64,
}

impl WorkerShared {
  pub(crate) fn new() -> Self {
    WorkerShared {
      cv: parking_lot::Condvar::new(),
      lock: parking_lot::Mutex::new(()),
      stop: AtomicBool::new(false),
      current_region: AtomicU64::new(0),
    }
  }
}

/// An event staged under the read lock, emitted after it is released.
struct Staged {
  region_id: u64,
  base: usize,
  size: usize,
  adapter_id: u32,
  metadata_ref: u64,
  variable_id: Option<u64>,
  variable_name: Option<String>,
  metadata: BTreeMap<String, String>,
  capture: crate::CaptureMode,
  /// The per-region sequence number this event will commit.
  region_seq: u64,
  first_diff: Option<usize>,
  old_bytes: Vec<u8>,
  new_bytes: Vec<u8>,
  new_hash: u64,
}

pub(crate) fn run(engine: Arc<Engine>) {
  engine.worker_tid.store(os::thread_id(), Ordering::Release);
  log::debug!("worker started");

  loop {
    if engine.worker.stop.load(Ordering::Acquire) {
      break;
    }

    let batch = drain(&engine);
    if batch.is_empty() {
      let mut guard: MutexGuard<()> = engine.worker.lock.lock();
      engine
        .worker
        .cv
        .wait_for(&mut guard, Duration::from_millis(1));
      continue;
    }

    // Records for one page that arrived back to back collapse into a
    // single pass over that page.
    let mut index = 0;
    while index < batch.len() {
      let page_base = batch[index].page_base;
      let mut next = index + 1;
      while next < batch.len() && batch[next].page_base == page_base {
        next += 1;
      }
      process_page(&engine, &batch[index..next]);
      index = next;
    }
  }

  log::debug!("worker stopped");
}

fn drain(engine: &Engine) -> Vec<FaultRecord> {
  let mut batch = Vec::new();

  while let Some(record) = engine.ring.pop() {
    batch.push(record);
    if batch.len() >= 1024 {
      break;
    }
  }

  batch
}

fn process_page(engine: &Engine, records: &[FaultRecord]) {
  let record = records[0];
  let slot = engine.registry.lookup_page(record.page_base);

  // The window deadline is the coalescing boundary: give the mutator its
  // window before reading the page's regions back.
  if let Some(slot) = slot {
    let deadline = slot.window_deadline_ns.load(Ordering::Acquire);
    let now = os::monotonic_ns();
    if now < deadline {
      std::thread::sleep(Duration::from_nanos(deadline - now));
    }
  }

  let mut candidate_ids: Vec<u64> = slot
    .map(|slot| slot.region_ids.lock().clone())
    .unwrap_or_default();

  for queued in records {
    for id in queued.candidates {
      if id != 0 && !candidate_ids.contains(&id) {
        candidate_ids.push(id);
      }
    }
  }

  let mut staged: Vec<Staged> = Vec::new();
  engine.registry.with_regions(|regions| {
    for id in &candidate_ids {
      let region = match regions.get(id) {
        Some(region) => region,
        None => continue,
      };

      let current = unsafe { region.current_bytes() };
      let hash = snapshot::hash_bytes(current);
      if hash == region.snapshot.hash() {
        // Untouched; another region on the same page was the writer.
        continue;
      }

      staged.push(Staged {
        region_id: region.id,
        base: region.base,
        size: region.len,
        adapter_id: region.adapter_id,
        metadata_ref: region.metadata_ref,
        variable_id: region.variable_id,
        variable_name: region.label.clone(),
        metadata: region.metadata.clone(),
        capture: region.capture,
        region_seq: region.seq + 1,
        first_diff: snapshot::first_diff(region.snapshot.bytes(), current),
        old_bytes: region.snapshot.bytes().to_vec(),
        new_bytes: current.to_vec(),
        new_hash: hash,
      });
    }
  });

  staged.sort_by_key(|entry| entry.base);

  for entry in staged {
    emit(engine, entry, &record);
  }

  close_window(engine, record.page_base);
}

fn emit(engine: &Engine, staged: Staged, record: &FaultRecord) {
  engine
    .worker
    .current_region
    .store(staged.region_id, Ordering::Release);

  // An unwatch may have landed between staging and emission; it waits on
  // `current_region`, so the check must come after the store above.
  let live = engine
    .registry
    .with_regions(|regions| regions.contains_key(&staged.region_id));
  if !live {
    engine.worker.current_region.store(0, Ordering::Release);
    return;
  }

  let seq = engine.next_seq();
  let preview_bytes = engine.config.default_preview_bytes;
  let anchor = staged.first_diff.unwrap_or(0);

  let (old_value, new_value, storage_key_old, storage_key_new) = capture_values(engine, &staged);

  let event = ChangeEvent {
    seq,
    timestamp_ns: record.wall_time_ns,
    adapter_id: staged.adapter_id,
    region_id: staged.region_id,
    variable_id: staged.variable_id,
    variable_name: staged.variable_name.clone(),
    origin: Origin::new(
      record.fault_ip,
      engine.resolve(staged.adapter_id, record.fault_ip),
    ),
    size: staged.size,
    old_preview: snapshot::preview(&staged.old_bytes, anchor, preview_bytes),
    new_preview: snapshot::preview(&staged.new_bytes, anchor, preview_bytes),
    old_value,
    new_value,
    storage_key_old,
    storage_key_new,
    metadata: staged.metadata,
    metadata_ref: staged.metadata_ref,
  };

  engine.count_emitted();

  if let Some(callback) = engine.callback() {
    if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
      engine.count_callback_error();
      log::warn!("change callback panicked for region {}", staged.region_id);
    }
  }

  engine
    .registry
    .commit_event(staged.region_id, staged.new_bytes, staged.new_hash);

  engine.worker.current_region.store(0, Ordering::Release);
}

type CapturedValues = (
  Option<Vec<u8>>,
  Option<Vec<u8>>,
  Option<String>,
  Option<String>,
);

fn capture_values(engine: &Engine, staged: &Staged) -> CapturedValues {
  let old = staged.capture.apply(&staged.old_bytes);
  let new = staged.capture.apply(&staged.new_bytes);

  let (old, new) = match (old, new) {
    (Some(old), Some(new)) => (old, new),
    _ => return (None, None, None, None),
  };

  let threshold = engine.config.inline_threshold_bytes;
  if old.len() <= threshold && new.len() <= threshold {
    return (Some(old), Some(new), None, None);
  }

  let store = match engine.store() {
    Some(store) => store,
    None => return (None, None, None, None),
  };

  let key_old = storage::storage_key(staged.region_id, staged.region_seq, "old");
  let key_new = storage::storage_key(staged.region_id, staged.region_seq, "new");

  for (key, bytes) in [(&key_old, &old), (&key_new, &new)] {
    if let Err(err) = store.put(key, bytes) {
      log::warn!("persisting {} failed: {}", key, err);
      return (None, None, None, None);
    }
  }

  (None, None, Some(key_old), Some(key_new))
}

/// Re-protects the page, closing its writable window.
fn close_window(engine: &Engine, page_base: usize) {
  if engine.mode != Mode::Fault {
    return;
  }

  let slot = match engine.registry.lookup_page(page_base) {
    Some(slot) => slot,
    None => return,
  };

  if !slot.live.load(Ordering::Acquire)
    || slot.state.load(Ordering::Acquire) != page_state::WINDOW_OPEN
  {
    return;
  }

  if slot.protect_count.load(Ordering::Acquire) == 0 {
    slot.state.store(page_state::UNPROTECTED, Ordering::Release);
    return;
  }

  match unsafe { protect::write_protect_page(page_base) } {
    Ok(()) => slot.state.store(page_state::PROTECTED, Ordering::Release),
    Err(err) => {
      slot.state.store(page_state::UNPROTECTED, Ordering::Release);
      log::warn!("re-protecting page {:#x} failed: {}", page_base, err);
    }
  }
}
