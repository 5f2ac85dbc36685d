#![deny(missing_docs, nonstandard_style)]
#![warn(clippy::all)]
//! Watch memory for mutations.
//!
//! This crate observes user-designated byte ranges in the current process
//! and reports an event whenever a watched range is modified: what changed,
//! where in the program it changed, and with which bytes, all without
//! instrumenting any store site. Watched pages are write-protected; the
//! first store to one raises an access fault whose handler queues a record
//! and opens a brief writable window, and a background worker then diffs
//! the region against its last snapshot, delivers a [`ChangeEvent`] to the
//! registered callback, and re-protects the page. Platforms (or mappings)
//! where protection is unavailable fall back to checksum polling with the
//! same event pipeline.
//!
//! The engine is process-wide, like the fault handlers it installs: one
//! [`init`] / [`shutdown`] pair brackets a session. The library is a core
//! for debuggers, record/replay tooling, and audit trails; language
//! bindings extract `(address, length)` pairs and register them here.
//!
//! # Examples
//!
//! ```
//! # use std::{thread, time::Duration};
//! use memwatch::{Config, Mode, WatchOptions};
//!
//! # fn main() -> memwatch::Result<()> {
//! memwatch::init(Config {
//!   mode: Mode::Polling,
//!   poll_interval_ms: 10,
//!   ..Config::default()
//! })?;
//!
//! memwatch::set_callback(|event| {
//!   eprintln!("region {} changed, {} bytes", event.region_id, event.size);
//! })?;
//!
//! let mut data = *b"Hello, memwatch!";
//! let id = unsafe { memwatch::watch(data.as_ptr(), data.len(), WatchOptions::labeled("data"))? };
//!
//! data[0] = b'J';
//! thread::sleep(Duration::from_millis(100));
//!
//! memwatch::unwatch(id)?;
//! memwatch::shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Caveats
//!
//! Detection is page-granular: regions sharing a page are disambiguated by
//! rehashing, and stores landing inside an open writable window coalesce
//! into one event per region. The mutating thread is never serialized
//! against the watcher; observers see pre-mutation and post-window values,
//! not a stream of individual stores.

#[macro_use]
extern crate bitflags;

pub use crate::alloc::Mapping;
pub use crate::engine::{
  clear_callback, find_regions, init, set_callback, set_resolver, set_value_store, shutdown,
  stats, unwatch, watch, Config, Mode, RegionId, Stats, WatchOptions,
};
pub use crate::error::{Error, Result};
pub use crate::event::{CaptureMode, ChangeEvent, Origin, SourceLocation};
pub use crate::protect::Protection;
pub use crate::storage::{MemoryStore, ValueStore};

mod alloc;
mod engine;
mod error;
mod event;
mod fault;
mod os;
pub mod page;
mod poll;
mod protect;
mod registry;
mod ring;
mod snapshot;
mod storage;
mod util;
mod worker;
