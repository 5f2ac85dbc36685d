//! The process-wide watcher engine and its public control surface.
//!
//! Fault handlers are process-wide, so the engine is too: a single instance
//! lives behind a global cell from [`init`] to [`shutdown`], and re-init
//! after shutdown is permitted. Application threads register and deregister
//! regions and read statistics; a dedicated worker owns event production;
//! a scanner thread exists only when checksum polling is in play.

use crate::event::{ChangeEvent, SourceLocation};
use crate::fault::FaultRecord;
use crate::registry::{page_state, Registry, RegistrySettings};
use crate::ring::Ring;
use crate::storage::ValueStore;
use crate::worker::WorkerShared;
#[cfg(unix)]
use crate::fault;
use crate::{os, page, poll, protect, worker, CaptureMode, Error, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifier assigned to a watched region.
pub type RegionId = u64;

type Callback = dyn Fn(&ChangeEvent) + Send + Sync;
type Resolver = dyn Fn(u64, u32) -> SourceLocation + Send + Sync;

/// Change detection strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
  /// Prefer fault-driven detection, falling back to polling.
  Auto,
  /// Page-protection faults; unavailable on some platforms.
  Fault,
  /// Periodic checksum polling.
  Polling,
}

impl std::fmt::Display for Mode {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let name = match self {
      Mode::Auto => "auto",
      Mode::Fault => "fault",
      Mode::Polling => "polling",
    };
    write!(f, "{}", name)
  }
}

/// Engine configuration, with defaults suitable for most uses.
#[derive(Clone, Debug)]
pub struct Config {
  /// Capacity of the pending-event ring; must be a power of two.
  pub ring_capacity: usize,
  /// Minimum lifetime of a writable window, in nanoseconds.
  pub window_ns: u64,
  /// Scan interval of the polling fallback, in milliseconds.
  pub poll_interval_ms: u64,
  /// Largest captured value carried inline in an event, in bytes.
  pub inline_threshold_bytes: usize,
  /// Length of the old/new previews attached to every event, in bytes.
  pub default_preview_bytes: usize,
  /// Total snapshot memory budget; `None` means unlimited.
  pub max_memory_bytes: Option<usize>,
  /// Maximum number of simultaneously tracked pages.
  pub max_tracked_pages: usize,
  /// Requested detection mode.
  pub mode: Mode,
  /// Permit overlapping watches from the same adapter.
  pub allow_overlap: bool,
  /// How long `shutdown` may spend draining queued events, in milliseconds.
  pub shutdown_deadline_ms: u64,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      ring_capacity: 65_536,
      window_ns: 50_000,
      poll_interval_ms: 100,
      inline_threshold_bytes: 4096,
      default_preview_bytes: 256,
      max_memory_bytes: None,
      max_tracked_pages: 16_384,
      mode: Mode::Auto,
      allow_overlap: false,
      shutdown_deadline_ms: 1000,
    }
  }
}

impl Config {
  fn validate(&self) -> Result<()> {
    if !self.ring_capacity.is_power_of_two() || self.ring_capacity < 2 {
      return Err(Error::InvalidParameter("ring_capacity"));
    }

    if self.default_preview_bytes == 0 {
      return Err(Error::InvalidParameter("default_preview_bytes"));
    }

    if self.max_tracked_pages == 0 {
      return Err(Error::InvalidParameter("max_tracked_pages"));
    }

    if self.poll_interval_ms == 0 {
      return Err(Error::InvalidParameter("poll_interval_ms"));
    }

    Ok(())
  }
}

/// Per-watch parameters.
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
  /// Opaque tag identifying the owning binding.
  pub adapter_id: u32,
  /// Opaque owner-side handle carried through every event unchanged.
  pub metadata_ref: u64,
  /// Owner-assigned variable id, if any.
  pub variable_id: Option<u64>,
  /// Human-readable name reported as `variable_name` in events.
  pub label: Option<String>,
  /// How much of the region's contents each event captures.
  pub capture: CaptureMode,
  /// Free-form key/value pairs carried verbatim in every event.
  pub metadata: Vec<(String, String)>,
}

impl WatchOptions {
  /// Options with the given label and defaults otherwise.
  pub fn labeled(label: impl Into<String>) -> Self {
    WatchOptions {
      label: Some(label.into()),
      ..WatchOptions::default()
    }
  }

  /// Replaces the capture mode.
  pub fn capture(mut self, capture: CaptureMode) -> Self {
    self.capture = capture;
    self
  }
}

/// A point-in-time view of the engine's counters.
#[derive(Clone, Debug, Serialize)]
pub struct Stats {
  /// Live watched regions.
  pub num_tracked_regions: usize,
  /// Live page slots.
  pub num_tracked_pages: usize,
  /// Configured ring capacity.
  pub ring_capacity: usize,
  /// Records currently queued (approximate).
  pub ring_used: usize,
  /// Records discarded because the ring was full.
  pub dropped_events: u64,
  /// Change events produced since init.
  pub events_emitted: u64,
  /// Callback invocations that panicked.
  pub callback_errors: u64,
  /// Regions downgraded to polling because protection was refused.
  pub protection_failures: u64,
  /// Approximate engine-owned memory: snapshots, ring, page table.
  pub native_memory_bytes: usize,
  /// The detection mode in effect.
  pub mode: Mode,
}

static CONTROL: Mutex<()> = Mutex::new(());
static ENGINE: Mutex<Option<Arc<Engine>>> = Mutex::new(None);
static ACTIVE: AtomicPtr<Engine> = AtomicPtr::new(std::ptr::null_mut());

pub(crate) struct Engine {
  pub(crate) config: Config,
  /// Resolved mode; never `Auto`.
  pub(crate) mode: Mode,
  pub(crate) registry: Registry,
  pub(crate) ring: Ring,
  pub(crate) worker: WorkerShared,
  pub(crate) worker_tid: AtomicU64,
  poll_lock: Mutex<()>,
  poll_cv: Condvar,
  callback: RwLock<Option<Arc<Callback>>>,
  resolvers: RwLock<HashMap<u32, Arc<Resolver>>>,
  store: RwLock<Option<Arc<dyn ValueStore>>>,
  seq: AtomicU64,
  events_emitted: AtomicU64,
  dropped_events: AtomicU64,
  callback_errors: AtomicU64,
  protection_failures: AtomicU64,
  worker_handle: Mutex<Option<JoinHandle<()>>>,
  poller_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
  fn new(config: &Config, mode: Mode) -> Arc<Engine> {
    let table_capacity = config.max_tracked_pages.saturating_mul(2).next_power_of_two();

    Arc::new(Engine {
      config: config.clone(),
      mode,
      registry: Registry::new(
        RegistrySettings {
          protect: mode == Mode::Fault,
          allow_overlap: config.allow_overlap,
          max_pages: config.max_tracked_pages,
          max_memory: config.max_memory_bytes,
        },
        table_capacity,
      ),
      ring: Ring::with_capacity(config.ring_capacity),
      worker: WorkerShared::new(),
      worker_tid: AtomicU64::new(0),
      poll_lock: Mutex::new(()),
      poll_cv: Condvar::new(),
      callback: RwLock::new(None),
      resolvers: RwLock::new(HashMap::new()),
      store: RwLock::new(None),
      seq: AtomicU64::new(0),
      events_emitted: AtomicU64::new(0),
      dropped_events: AtomicU64::new(0),
      callback_errors: AtomicU64::new(0),
      protection_failures: AtomicU64::new(0),
      worker_handle: Mutex::new(None),
      poller_handle: Mutex::new(None),
    })
  }

  /// The engine the fault handler should consult, if any.
  ///
  /// The referent is kept alive by the global cell until after this pointer
  /// is cleared during shutdown.
  pub(crate) fn active() -> Option<&'static Engine> {
    let ptr = ACTIVE.load(Ordering::Acquire);
    unsafe { ptr.as_ref() }
  }

  /// The fault-handler fast path. Returns false for foreign faults.
  ///
  /// Runs in signal context: no allocation, no locks, only the lock-free
  /// page lookup, a ring push, and the protection flip.
  pub(crate) fn on_protected_fault(&self, fault_addr: usize, fault_ip: u64) -> bool {
    let page_base = page::floor(fault_addr);

    let slot = match self.registry.lookup_page(page_base) {
      Some(slot) => slot,
      None => return false,
    };

    match slot.state.load(Ordering::Acquire) {
      // A racing thread faulted while the unprotect was still in flight;
      // returning re-executes the store, which now succeeds.
      page_state::WINDOW_OPEN => true,
      page_state::PROTECTED => {
        let now = os::monotonic_ns();
        let record = FaultRecord {
          page_base,
          fault_addr,
          fault_ip,
          thread_id: os::thread_id(),
          wall_time_ns: now,
          candidates: slot.snapshot_candidates(),
        };

        if !self.ring.push(record) {
          self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }

        slot
          .window_deadline_ns
          .store(now + self.config.window_ns, Ordering::Release);
        slot.state.store(page_state::WINDOW_OPEN, Ordering::Release);
        let _ = unsafe { protect::unprotect_page(page_base) };
        true
      }
      _ => false,
    }
  }

  fn start(engine: &Arc<Engine>) -> Result<()> {
    let worker_engine = Arc::clone(engine);
    let handle = thread::Builder::new()
      .name("memwatch-worker".into())
      .spawn(move || worker::run(worker_engine))
      .map_err(|err| Error::ThreadSpawn("worker", err))?;
    *engine.worker_handle.lock() = Some(handle);

    if engine.mode == Mode::Polling {
      Engine::ensure_poller(engine)?;
    }

    Ok(())
  }

  /// Starts the scanner thread if it is not already running.
  pub(crate) fn ensure_poller(engine: &Arc<Engine>) -> Result<()> {
    let mut handle = engine.poller_handle.lock();

    if handle.is_none() {
      let poll_engine = Arc::clone(engine);
      *handle = Some(
        thread::Builder::new()
          .name("memwatch-poll".into())
          .spawn(move || poll::run(poll_engine))
          .map_err(|err| Error::ThreadSpawn("poller", err))?,
      );
    }

    Ok(())
  }

  fn stop_threads(&self) {
    self.worker.stop.store(true, Ordering::Release);
    self.notify_worker();
    self.poll_cv.notify_all();

    if let Some(handle) = self.worker_handle.lock().take() {
      if handle.join().is_err() {
        log::error!("worker thread panicked");
      }
    }

    if let Some(handle) = self.poller_handle.lock().take() {
      if handle.join().is_err() {
        log::error!("poller thread panicked");
      }
    }
  }

  pub(crate) fn notify_worker(&self) {
    self.worker.cv.notify_one();
  }

  /// Sleeps between poll sweeps, waking early on shutdown.
  pub(crate) fn poll_sleep(&self, interval: Duration) {
    let mut guard = self.poll_lock.lock();
    self.poll_cv.wait_for(&mut guard, interval);
  }

  pub(crate) fn next_seq(&self) -> u64 {
    self.seq.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub(crate) fn count_emitted(&self) {
    self.events_emitted.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn count_dropped(&self) {
    self.dropped_events.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn count_callback_error(&self) {
    self.callback_errors.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn callback(&self) -> Option<Arc<Callback>> {
    self.callback.read().clone()
  }

  pub(crate) fn store(&self) -> Option<Arc<dyn ValueStore>> {
    self.store.read().clone()
  }

  pub(crate) fn resolve(&self, adapter_id: u32, fault_ip: u64) -> Option<SourceLocation> {
    let resolver = self.resolvers.read().get(&adapter_id).cloned();
    resolver.map(|resolver| resolver(fault_ip, adapter_id))
  }

  fn stats(&self) -> Stats {
    Stats {
      num_tracked_regions: self.registry.region_count(),
      num_tracked_pages: self.registry.page_count(),
      ring_capacity: self.ring.capacity(),
      ring_used: self.ring.len(),
      dropped_events: self.dropped_events.load(Ordering::Relaxed),
      events_emitted: self.events_emitted.load(Ordering::Relaxed),
      callback_errors: self.callback_errors.load(Ordering::Relaxed),
      protection_failures: self.protection_failures.load(Ordering::Relaxed),
      native_memory_bytes: self.ring.memory_bytes()
        + self.registry.table_memory_bytes()
        + self.registry.mem_bytes(),
      mode: self.mode,
    }
  }
}

fn current() -> Result<Arc<Engine>> {
  ENGINE.lock().as_ref().cloned().ok_or(Error::NotInitialized)
}

fn teardown(engine: &Arc<Engine>) {
  #[cfg(unix)]
  if engine.mode == Mode::Fault {
    ACTIVE.store(std::ptr::null_mut(), Ordering::Release);
    fault::uninstall();
  }

  engine.stop_threads();
}

/// Initializes the engine: starts the worker and either installs the fault
/// handler or starts the polling scanner.
///
/// With [`Mode::Auto`], fault detection is preferred and polling is the
/// fallback when handler installation fails or the environment variable
/// `MEMWATCH_NO_MPROTECT` is set to a non-empty value.
///
/// Only one engine may exist at a time; re-initialization after
/// [`shutdown`] is permitted.
pub fn init(config: Config) -> Result<()> {
  config.validate()?;
  let _control = CONTROL.lock();

  if ENGINE.lock().is_some() {
    return Err(Error::AlreadyInitialized);
  }

  let forced_polling =
    std::env::var_os("MEMWATCH_NO_MPROTECT").map_or(false, |value| !value.is_empty());
  let fault_capable = cfg!(unix);

  let mode = match config.mode {
    Mode::Polling => Mode::Polling,
    Mode::Fault => {
      if !fault_capable {
        return Err(Error::Unsupported("fault mode"));
      }
      Mode::Fault
    }
    Mode::Auto => {
      if fault_capable && !forced_polling {
        Mode::Fault
      } else {
        Mode::Polling
      }
    }
  };

  #[allow(unused_mut)]
  let mut engine = Engine::new(&config, mode);

  #[cfg(unix)]
  if engine.mode == Mode::Fault {
    ACTIVE.store(Arc::as_ptr(&engine) as *mut Engine, Ordering::Release);

    if let Err(err) = fault::install() {
      ACTIVE.store(std::ptr::null_mut(), Ordering::Release);

      if config.mode == Mode::Auto {
        log::warn!("fault handler unavailable ({}); falling back to polling", err);
        engine = Engine::new(&config, Mode::Polling);
      } else {
        return Err(err);
      }
    }
  }

  if let Err(err) = Engine::start(&engine) {
    teardown(&engine);
    return Err(err);
  }

  log::debug!("initialized in {} mode", engine.mode);
  *ENGINE.lock() = Some(engine);
  Ok(())
}

/// Stops the engine: drains queued events (bounded by the configured
/// deadline), removes all page protection, uninstalls the fault handler,
/// and joins the background threads. Calling it again is a no-op.
pub fn shutdown() -> Result<()> {
  let _control = CONTROL.lock();

  let engine = match ENGINE.lock().take() {
    Some(engine) => engine,
    None => return Ok(()),
  };

  let deadline = Instant::now() + Duration::from_millis(engine.config.shutdown_deadline_ms);
  while !engine.ring.is_empty() && Instant::now() < deadline {
    engine.notify_worker();
    thread::sleep(Duration::from_millis(1));
  }

  engine.registry.clear_all();

  #[cfg(unix)]
  if engine.mode == Mode::Fault {
    ACTIVE.store(std::ptr::null_mut(), Ordering::Release);
    fault::uninstall();
  }

  engine.stop_threads();
  log::debug!("shut down");
  Ok(())
}

/// Begins watching `[base, base + len)` and returns the region's id.
///
/// The initial contents are snapshotted before this returns, so mutations
/// from this point on are reported. When write protection is refused (for
/// example a read-only mapping) the region is kept but downgraded to
/// checksum polling.
///
/// # Safety
///
/// The span must remain valid, and must not be moved by its owner, until
/// [`unwatch`] returns for this id or the engine is shut down.
pub unsafe fn watch(base: *const u8, len: usize, options: WatchOptions) -> Result<RegionId> {
  let engine = current()?;
  let outcome = engine.registry.watch(base as usize, len, options)?;

  if outcome.downgraded {
    engine.protection_failures.fetch_add(1, Ordering::Relaxed);
    Engine::ensure_poller(&engine)?;
  }

  Ok(outcome.id)
}

/// Stops watching a region. Returns false for unknown ids.
///
/// Synchronous with event delivery: when this returns, no event for the
/// region is being constructed or delivered, and none ever will be again.
pub fn unwatch(id: RegionId) -> Result<bool> {
  let engine = current()?;

  if !engine.registry.unwatch(id) {
    return Ok(false);
  }

  // Wait out any in-flight event, unless called from the callback itself.
  if os::thread_id() != engine.worker_tid.load(Ordering::Acquire) {
    while engine.worker.current_region.load(Ordering::Acquire) == id {
      thread::sleep(Duration::from_micros(50));
    }
  }

  Ok(true)
}

/// Sets the change callback, replacing any previous one.
///
/// The callback runs on the worker thread; blocking it back-pressures
/// event delivery but never the mutating application threads.
pub fn set_callback<F>(callback: F) -> Result<()>
where
  F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
  *current()?.callback.write() = Some(Arc::new(callback));
  Ok(())
}

/// Removes the change callback. Events are still counted while no callback
/// is installed.
pub fn clear_callback() -> Result<()> {
  *current()?.callback.write() = None;
  Ok(())
}

/// Registers a resolver that maps fault instruction pointers to source
/// locations for events originating from `adapter_id`.
pub fn set_resolver<F>(adapter_id: u32, resolver: F) -> Result<()>
where
  F: Fn(u64, u32) -> SourceLocation + Send + Sync + 'static,
{
  current()?
    .resolvers
    .write()
    .insert(adapter_id, Arc::new(resolver));
  Ok(())
}

/// Configures the store that receives captured values larger than the
/// inline threshold.
pub fn set_value_store(store: Arc<dyn ValueStore>) -> Result<()> {
  *current()?.store.write() = Some(store);
  Ok(())
}

/// Returns the ids of every live region covering the exact byte address.
pub fn find_regions(address: usize) -> Result<Vec<RegionId>> {
  Ok(current()?.registry.find_regions(address))
}

/// Returns a snapshot of the engine's statistics.
pub fn stats() -> Result<Stats> {
  Ok(current()?.stats())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alloc::Mapping;
  use crate::storage::MemoryStore;
  use std::sync::atomic::AtomicBool;
  use std::sync::Mutex as StdMutex;

  /// The engine is process-wide; engine tests must not interleave.
  static SERIAL: Mutex<()> = Mutex::new(());

  fn begin() -> parking_lot::MutexGuard<'static, ()> {
    let guard = SERIAL.lock();
    let _ = env_logger::builder().is_test(true).try_init();
    let _ = shutdown();
    guard
  }

  fn polling_config() -> Config {
    Config {
      mode: Mode::Polling,
      poll_interval_ms: 10,
      ..Config::default()
    }
  }

  #[cfg(unix)]
  fn fault_config() -> Config {
    Config {
      mode: Mode::Fault,
      ..Config::default()
    }
  }

  type EventLog = Arc<StdMutex<Vec<ChangeEvent>>>;

  fn recorder() -> (EventLog, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
    let events: EventLog = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &ChangeEvent| {
      sink.lock().unwrap().push(event.clone())
    })
  }

  fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      if condition() {
        return true;
      }
      thread::sleep(Duration::from_millis(2));
    }
    false
  }

  #[test]
  fn polling_reports_a_small_buffer_edit() {
    let _guard = begin();
    init(polling_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    unsafe {
      std::ptr::copy_nonoverlapping(b"Hello, memwatch!".as_ptr(), map.as_mut_ptr(), 16);
    }

    let id = unsafe {
      watch(
        map.as_ptr(),
        16,
        WatchOptions::labeled("test_data").capture(CaptureMode::Full),
      )
      .unwrap()
    };

    unsafe { *map.as_mut_ptr() = b'J' };

    assert!(wait_until(|| !events.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(50));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);

    let event = &events[0];
    assert_eq!(event.region_id, id);
    assert_eq!(event.seq, 1);
    assert_eq!(event.size, 16);
    assert_eq!(event.variable_name.as_deref(), Some("test_data"));
    assert_eq!(event.origin.fault_ip, 0);
    assert!(event.old_value.as_deref().unwrap().starts_with(b"Hello"));
    assert!(event.new_value.as_deref().unwrap().starts_with(b"Jello"));
    assert_eq!(event.old_preview[0], b'H');
    assert_eq!(event.new_preview[0], b'J');

    drop(events);
    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn fault_mode_reports_and_reprotects() {
    let _guard = begin();
    init(fault_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    unsafe {
      std::ptr::copy_nonoverlapping(b"Hello, memwatch!".as_ptr(), map.as_mut_ptr(), 16);
    }

    let id = unsafe {
      watch(
        map.as_ptr(),
        16,
        WatchOptions::labeled("test_data").capture(CaptureMode::Full),
      )
      .unwrap()
    };

    unsafe { *map.as_mut_ptr() = b'J' };
    assert!(wait_until(|| events.lock().unwrap().len() == 1));

    {
      let events = events.lock().unwrap();
      let event = &events[0];
      assert_eq!(event.region_id, id);
      assert_eq!(event.size, 16);
      assert!(event.old_value.as_deref().unwrap().starts_with(b"Hello"));
      assert!(event.new_value.as_deref().unwrap().starts_with(b"Jello"));
    }

    // The window has closed, so the next store faults and reports again.
    thread::sleep(Duration::from_millis(20));
    unsafe { *map.as_mut_ptr().add(5) = b'!' };
    assert!(wait_until(|| events.lock().unwrap().len() == 2));

    let seqs: Vec<u64> = events.lock().unwrap().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2]);

    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn regions_sharing_a_page_report_independently() {
    let _guard = begin();
    init(fault_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    // Eight 256-byte buffers laid out on a single page.
    let mut map = Mapping::new(page::size()).unwrap();
    let mut ids = Vec::new();
    for i in 0..8 {
      let base = unsafe { map.as_ptr().add(i * 256) };
      let id = unsafe { watch(base, 256, WatchOptions::labeled(format!("small_{}", i))).unwrap() };
      ids.push(id);
    }

    unsafe {
      *map.as_mut_ptr() = b'A';
      *map.as_mut_ptr().add(5 * 256) = b'B';
    }

    assert!(wait_until(|| events.lock().unwrap().len() == 2));
    thread::sleep(Duration::from_millis(50));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);

    // One event per modified region, ascending by base address.
    let observed: Vec<u64> = events.iter().map(|e| e.region_id).collect();
    assert_eq!(observed, vec![ids[0], ids[5]]);
    assert_eq!(events[0].new_value.as_deref().unwrap()[0], b'A');
    assert_eq!(events[1].new_value.as_deref().unwrap()[0], b'B');

    drop(events);
    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn rapid_writes_coalesce_into_one_event() {
    let _guard = begin();
    init(fault_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    let id = unsafe { watch(map.as_ptr(), 64, WatchOptions::labeled("coalesce")).unwrap() };

    // Five stores well inside one writable window.
    for i in 0..5 {
      unsafe { *map.as_mut_ptr().add(10 + i) = b'0' + i as u8 };
    }

    assert!(wait_until(|| !events.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(50));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].region_id, id);
    assert_eq!(events[0].new_value.as_deref().unwrap()[10..15], *b"01234");

    drop(events);
    shutdown().unwrap();
  }

  #[test]
  fn large_regions_offload_to_the_value_store() {
    let _guard = begin();
    init(polling_config()).unwrap();

    let store = Arc::new(MemoryStore::new());
    set_value_store(Arc::clone(&store) as Arc<dyn ValueStore>).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let len = 10 * 1024;
    let mut map = Mapping::new(len).unwrap();
    let id = unsafe {
      watch(
        map.as_ptr(),
        len,
        WatchOptions::labeled("large_buffer").capture(CaptureMode::Full),
      )
      .unwrap()
    };

    unsafe { *map.as_mut_ptr().add(1000) = b'Y' };

    assert!(wait_until(|| !events.lock().unwrap().is_empty()));

    let events = events.lock().unwrap();
    let event = &events[0];
    assert_eq!(event.region_id, id);
    assert_eq!(event.size, len);
    assert!(event.old_value.is_none());
    assert!(event.new_value.is_none());

    // Previews stay inline and are anchored at the first differing byte.
    assert!(!event.new_preview.is_empty() && event.new_preview.len() <= 256);
    assert_eq!(event.new_preview[0], b'Y');

    let key_old = event.storage_key_old.clone().unwrap();
    let key_new = event.storage_key_new.clone().unwrap();
    assert!(key_old.starts_with("mw:"));

    let stored = store.get(&key_new).unwrap();
    assert_eq!(stored.len(), len);
    assert_eq!(stored[1000], b'Y');
    assert_eq!(store.get(&key_old).unwrap()[1000], 0);

    drop(events);
    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn ring_overflow_counts_drops_and_recovers() {
    let _guard = begin();

    let mut config = fault_config();
    config.ring_capacity = 8;
    init(config).unwrap();

    let events: EventLog = Arc::new(StdMutex::new(Vec::new()));
    let blocker_cell = Arc::new(AtomicU64::new(0));
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    {
      let sink = Arc::clone(&events);
      let blocker_cell = Arc::clone(&blocker_cell);
      let entered = Arc::clone(&entered);
      let release = Arc::clone(&release);
      set_callback(move |event: &ChangeEvent| {
        if event.region_id == blocker_cell.load(Ordering::Acquire) {
          entered.store(true, Ordering::Release);
          while !release.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
          }
        }
        sink.lock().unwrap().push(event.clone());
      })
      .unwrap();
    }

    let mut map = Mapping::new(page::size() * 18).unwrap();

    let blocker = unsafe { watch(map.as_ptr(), 64, WatchOptions::labeled("blocker")).unwrap() };
    blocker_cell.store(blocker, Ordering::Release);
    unsafe { *map.as_mut_ptr() = 1 };
    assert!(wait_until(|| entered.load(Ordering::Acquire)));

    // The worker is parked inside the callback; sixteen faults on sixteen
    // fresh pages now race into a ring that holds eight.
    for i in 1..=16 {
      let base = unsafe { map.as_ptr().add(i * page::size()) };
      unsafe { watch(base, 64, WatchOptions::default()).unwrap() };
    }
    for i in 1..=16 {
      unsafe { *map.as_mut_ptr().add(i * page::size()) = 7 };
    }

    assert!(stats().unwrap().dropped_events >= 8);
    release.store(true, Ordering::Release);

    // The blocker's event plus the eight that fit in the ring.
    assert!(wait_until(|| events.lock().unwrap().len() >= 9));

    // A freshly watched region still reports exactly once.
    let fresh_base = unsafe { map.as_ptr().add(17 * page::size()) };
    let fresh = unsafe { watch(fresh_base, 64, WatchOptions::labeled("fresh")).unwrap() };
    unsafe { *map.as_mut_ptr().add(17 * page::size()) = 9 };

    assert!(wait_until(|| {
      events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.region_id == fresh)
        .count()
        == 1
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
      events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.region_id == fresh)
        .count(),
      1
    );

    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn one_byte_regions_at_page_boundaries_stay_independent() {
    let _guard = begin();
    init(fault_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let psz = page::size();
    let mut map = Mapping::new(psz * 2).unwrap();

    let tail = unsafe { watch(map.as_ptr().add(psz - 1), 1, WatchOptions::labeled("tail")).unwrap() };
    let head = unsafe { watch(map.as_ptr().add(psz), 1, WatchOptions::labeled("head")).unwrap() };

    unsafe { *map.as_mut_ptr().add(psz - 1) = 7 };
    assert!(wait_until(|| events.lock().unwrap().len() == 1));

    unsafe { *map.as_mut_ptr().add(psz) = 9 };
    assert!(wait_until(|| events.lock().unwrap().len() == 2));
    thread::sleep(Duration::from_millis(50));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].region_id, tail);
    assert_eq!(events[0].size, 1);
    assert_eq!(events[0].new_value.as_deref(), Some(&[7][..]));
    assert_eq!(events[1].region_id, head);
    assert_eq!(events[1].new_value.as_deref(), Some(&[9][..]));

    drop(events);
    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn identical_bytes_produce_no_event() {
    let _guard = begin();
    init(fault_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    unsafe { *map.as_mut_ptr() = b'H' };

    unsafe { watch(map.as_ptr(), 16, WatchOptions::labeled("noop")).unwrap() };

    // Same value: the store faults, but the rehash matches the snapshot.
    unsafe { *map.as_mut_ptr() = b'H' };
    thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(stats().unwrap().events_emitted, 0);

    // The silent pass still re-protected the page.
    unsafe { *map.as_mut_ptr() = b'X' };
    assert!(wait_until(|| events.lock().unwrap().len() == 1));

    shutdown().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn watch_unwatch_round_trip_restores_the_page() {
    let _guard = begin();
    init(fault_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    let id = unsafe { watch(map.as_ptr(), 64, WatchOptions::default()).unwrap() };

    let tracked = stats().unwrap();
    assert_eq!(tracked.num_tracked_regions, 1);
    assert_eq!(tracked.num_tracked_pages, 1);

    assert!(unwatch(id).unwrap());

    let cleared = stats().unwrap();
    assert_eq!(cleared.num_tracked_regions, 0);
    assert_eq!(cleared.num_tracked_pages, 0);

    // The page is writable again and no longer reports.
    unsafe { *map.as_mut_ptr() = 1 };
    thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());

    assert!(!unwatch(id).unwrap());
    assert!(!unwatch(4242).unwrap());

    shutdown().unwrap();
  }

  #[test]
  fn double_shutdown_and_reinit_are_permitted() {
    let _guard = begin();

    init(polling_config()).unwrap();
    assert!(matches!(init(polling_config()), Err(Error::AlreadyInitialized)));

    shutdown().unwrap();
    shutdown().unwrap();
    assert!(matches!(stats(), Err(Error::NotInitialized)));

    init(polling_config()).unwrap();
    assert_eq!(stats().unwrap().mode, Mode::Polling);
    shutdown().unwrap();
  }

  #[test]
  fn control_surface_requires_init() {
    let _guard = begin();

    assert!(matches!(stats(), Err(Error::NotInitialized)));
    assert!(matches!(unwatch(1), Err(Error::NotInitialized)));
    assert!(matches!(clear_callback(), Err(Error::NotInitialized)));
    assert!(matches!(
      unsafe { watch(0x1000 as *const u8, 1, WatchOptions::default()) },
      Err(Error::NotInitialized)
    ));
  }

  #[test]
  fn invalid_configs_are_rejected() {
    let _guard = begin();

    let cases = [
      Config {
        ring_capacity: 100,
        ..Config::default()
      },
      Config {
        default_preview_bytes: 0,
        ..Config::default()
      },
      Config {
        max_tracked_pages: 0,
        ..Config::default()
      },
      Config {
        poll_interval_ms: 0,
        ..Config::default()
      },
    ];

    for config in cases {
      assert!(matches!(init(config), Err(Error::InvalidParameter(_))));
    }
    assert!(matches!(stats(), Err(Error::NotInitialized)));
  }

  #[test]
  fn seq_is_gap_free_across_regions() {
    let _guard = begin();
    init(polling_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let psz = page::size();
    let mut map = Mapping::new(psz * 3).unwrap();
    for i in 0..3 {
      let base = unsafe { map.as_ptr().add(i * psz) };
      unsafe { watch(base, 32, WatchOptions::labeled(format!("r{}", i))).unwrap() };
    }

    for i in 0..3 {
      unsafe { *map.as_mut_ptr().add(i * psz) = 1 + i as u8 };
      assert!(wait_until(|| events.lock().unwrap().len() == i + 1));
    }

    let seqs: Vec<u64> = events.lock().unwrap().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    shutdown().unwrap();
  }

  #[test]
  fn overlapping_regions_each_report_when_opted_in() {
    let _guard = begin();

    let mut config = polling_config();
    config.allow_overlap = true;
    init(config).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    let first = unsafe { watch(map.as_ptr(), 64, WatchOptions::labeled("outer")).unwrap() };
    let second =
      unsafe { watch(map.as_ptr().add(16), 64, WatchOptions::labeled("inner")).unwrap() };

    // One store inside both spans yields one event per covering region.
    unsafe { *map.as_mut_ptr().add(20) = 5 };

    assert!(wait_until(|| events.lock().unwrap().len() == 2));
    thread::sleep(Duration::from_millis(50));

    let events = events.lock().unwrap();
    let observed: Vec<u64> = events.iter().map(|e| e.region_id).collect();
    assert_eq!(observed, vec![first, second]);

    drop(events);
    shutdown().unwrap();
  }

  #[test]
  fn callback_panics_are_contained() {
    let _guard = begin();
    init(polling_config()).unwrap();

    let events: EventLog = Arc::new(StdMutex::new(Vec::new()));
    let panic_next = Arc::new(AtomicBool::new(true));

    {
      let sink = Arc::clone(&events);
      let panic_next = Arc::clone(&panic_next);
      set_callback(move |event: &ChangeEvent| {
        if panic_next.swap(false, Ordering::AcqRel) {
          panic!("callback failure");
        }
        sink.lock().unwrap().push(event.clone());
      })
      .unwrap();
    }

    let mut map = Mapping::new(page::size()).unwrap();
    unsafe { watch(map.as_ptr(), 32, WatchOptions::labeled("survivor")).unwrap() };

    unsafe { *map.as_mut_ptr() = 1 };
    assert!(wait_until(|| stats().unwrap().callback_errors == 1));

    // The worker survived and keeps delivering.
    unsafe { *map.as_mut_ptr().add(1) = 2 };
    assert!(wait_until(|| events.lock().unwrap().len() == 1));
    assert_eq!(stats().unwrap().events_emitted, 2);

    shutdown().unwrap();
  }

  #[test]
  fn resolver_populates_the_origin() {
    let _guard = begin();
    init(polling_config()).unwrap();

    let (events, callback) = recorder();
    set_callback(callback).unwrap();

    set_resolver(0, |_fault_ip, _adapter_id| SourceLocation {
      file: Some("app.rs".into()),
      function: Some("mutate".into()),
      line: Some(42),
      stack: None,
    })
    .unwrap();

    let mut map = Mapping::new(page::size()).unwrap();
    unsafe { watch(map.as_ptr(), 16, WatchOptions::default()).unwrap() };
    unsafe { *map.as_mut_ptr() = 1 };

    assert!(wait_until(|| !events.lock().unwrap().is_empty()));

    let events = events.lock().unwrap();
    let origin = &events[0].origin;
    assert_eq!(origin.file.as_deref(), Some("app.rs"));
    assert_eq!(origin.function.as_deref(), Some("mutate"));
    assert_eq!(origin.line, Some(42));
    assert_eq!(origin.fault_ip, 0);

    drop(events);
    shutdown().unwrap();
  }

  #[test]
  fn stats_reflect_engine_state() {
    let _guard = begin();
    init(polling_config()).unwrap();

    let psz = page::size();
    let map = Mapping::new(psz * 2).unwrap();
    unsafe {
      watch(map.as_ptr(), 32, WatchOptions::default()).unwrap();
      watch(map.as_ptr().add(psz), 32, WatchOptions::labeled("second")).unwrap();
    }

    let stats = stats().unwrap();
    assert_eq!(stats.num_tracked_regions, 2);
    assert_eq!(stats.num_tracked_pages, 2);
    assert_eq!(stats.ring_capacity, 65_536);
    assert_eq!(stats.ring_used, 0);
    assert_eq!(stats.mode, Mode::Polling);
    assert!(stats.native_memory_bytes > 0);

    assert_eq!(find_regions(map.as_ptr() as usize).unwrap().len(), 1);
    assert!(find_regions(map.as_ptr() as usize + 32).unwrap().is_empty());

    shutdown().unwrap();
  }
}
