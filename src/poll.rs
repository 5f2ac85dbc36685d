//! Checksum polling fallback.
//!
//! When fault handling is unavailable (or refused for a particular region)
//! a scanner thread walks the registry on an interval, rehashes the relevant
//! regions, and feeds synthetic fault records with a zero instruction
//! pointer into the same worker path. Drop accounting and coalescing match
//! the fault path.

use crate::engine::{Engine, Mode};
use crate::fault::FaultRecord;
use crate::{os, page, snapshot};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn run(engine: Arc<Engine>) {
  let interval = Duration::from_millis(engine.config.poll_interval_ms);
  log::debug!("poller started, interval {:?}", interval);

  loop {
    if engine.worker.stop.load(Ordering::Acquire) {
      break;
    }

    scan(&engine);
    engine.poll_sleep(interval);
  }

  log::debug!("poller stopped");
}

fn scan(engine: &Engine) {
  let scan_everything = engine.mode == Mode::Polling;
  let mut pending: Vec<FaultRecord> = Vec::new();

  engine.registry.for_each_region(|region| {
    if !(scan_everything || region.poll_only) {
      return;
    }

    let current = unsafe { region.current_bytes() };
    if snapshot::hash_bytes(current) == region.snapshot.hash() {
      return;
    }

    let mut record = FaultRecord {
      page_base: page::floor(region.base),
      fault_addr: region.base,
      fault_ip: 0,
      thread_id: os::thread_id(),
      wall_time_ns: os::monotonic_ns(),
      ..FaultRecord::default()
    };
    record.candidates[0] = region.id;
    pending.push(record);
  });

  if pending.is_empty() {
    return;
  }

  for record in pending {
    if !engine.ring.push(record) {
      engine.count_dropped();
    }
  }

  engine.notify_worker();
}
