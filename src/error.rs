//! Error types and utilities.

use thiserror::Error;

/// The result type used by this library.
pub type Result<T> = std::result::Result<T, Error>;

/// A collection of possible errors.
#[derive(Debug, Error)]
pub enum Error {
  /// The supplied address is null.
  #[error("address must not be null")]
  NullAddress,
  /// A supplied parameter is out of range.
  #[error("invalid parameter: {0}")]
  InvalidParameter(&'static str),
  /// The span overlaps a live region registered by the same adapter.
  #[error("span overlaps a live region with the same adapter")]
  RegionOverlap,
  /// A configured capacity limit was reached.
  #[error("{0} exhausted")]
  ResourceExhausted(&'static str),
  /// The OS rejected a page protection change.
  #[error("changing page protection failed: {0}")]
  ProtectionFailed(errno::Errno),
  /// The access-violation handler could not be installed.
  #[error("installing the fault handler failed: {0}")]
  HandlerInstall(errno::Errno),
  /// The requested detection mode is not available on this platform.
  #[error("{0} is not supported on this platform")]
  Unsupported(&'static str),
  /// The watcher has already been initialized.
  #[error("watcher is already initialized")]
  AlreadyInitialized,
  /// The watcher has not been initialized.
  #[error("watcher is not initialized")]
  NotInitialized,
  /// A system call failed.
  #[error("system call failed: {0}")]
  SystemCall(errno::Errno),
  /// Spawning a background thread failed.
  #[error("spawning the {0} thread failed: {1}")]
  ThreadSpawn(&'static str, std::io::Error),
  /// A value store operation failed.
  #[error("value store: {0}")]
  Storage(String),
}
