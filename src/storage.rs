//! External value store contract.
//!
//! Values larger than the inline threshold are handed to a [`ValueStore`]
//! and the change event carries the resulting keys instead of the bytes.
//! The engine does not mandate persistence properties; when no store is
//! configured, oversized values are dropped and only previews are emitted.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A key/value sink for captured region contents.
pub trait ValueStore: Send + Sync {
  /// Stores `bytes` under `key`, replacing any previous value.
  fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

  /// Retrieves the value stored under `key`.
  fn get(&self, key: &str) -> Result<Vec<u8>>;

  /// Removes the value stored under `key`.
  fn delete(&self, key: &str) -> Result<()>;
}

/// An in-memory [`ValueStore`] suitable for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, Vec<u8>>>,
  bytes_used: AtomicUsize,
}

impl MemoryStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the total number of payload bytes currently held.
  pub fn bytes_used(&self) -> usize {
    self.bytes_used.load(Ordering::Relaxed)
  }

  /// Returns the number of stored values.
  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  /// Returns whether the store holds no values.
  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }
}

impl ValueStore for MemoryStore {
  fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
    let mut entries = self.entries.lock();

    if let Some(previous) = entries.insert(key.to_owned(), bytes.to_vec()) {
      self.bytes_used.fetch_sub(previous.len(), Ordering::Relaxed);
    }

    self.bytes_used.fetch_add(bytes.len(), Ordering::Relaxed);
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Vec<u8>> {
    self
      .entries
      .lock()
      .get(key)
      .cloned()
      .ok_or_else(|| Error::Storage(format!("key not found: {}", key)))
  }

  fn delete(&self, key: &str) -> Result<()> {
    let mut entries = self.entries.lock();

    match entries.remove(key) {
      Some(previous) => {
        self.bytes_used.fetch_sub(previous.len(), Ordering::Relaxed);
        Ok(())
      }
      None => Err(Error::Storage(format!("key not found: {}", key))),
    }
  }
}

/// Builds the storage key for one side of a change.
pub(crate) fn storage_key(region_id: u64, region_seq: u64, side: &str) -> String {
  format!("mw:{}:{}:{}", region_id, region_seq, side)
}
