//! Change events and their supporting types.

use serde::Serialize;
use std::collections::BTreeMap;

/// How much of a region's contents is captured per change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
  /// Only metadata and previews are captured.
  None,
  /// Up to the given number of bytes are captured.
  Truncated(usize),
  /// The entire region contents are captured.
  Full,
}

impl CaptureMode {
  /// Decodes the wire form: `0` none, `N > 0` truncated, `-1` full.
  pub fn from_raw(raw: i64) -> Self {
    match raw {
      0 => CaptureMode::None,
      n if n < 0 => CaptureMode::Full,
      n => CaptureMode::Truncated(n as usize),
    }
  }

  /// Encodes the wire form.
  pub fn as_raw(&self) -> i64 {
    match self {
      CaptureMode::None => 0,
      CaptureMode::Truncated(n) => *n as i64,
      CaptureMode::Full => -1,
    }
  }

  /// Applies the mode to a byte slice, yielding the captured portion.
  pub(crate) fn apply(&self, bytes: &[u8]) -> Option<Vec<u8>> {
    match self {
      CaptureMode::None => None,
      CaptureMode::Truncated(n) => Some(bytes[..bytes.len().min(*n)].to_vec()),
      CaptureMode::Full => Some(bytes.to_vec()),
    }
  }
}

impl Default for CaptureMode {
  fn default() -> Self {
    CaptureMode::Truncated(256)
  }
}

/// Source-level position information produced by a registered resolver.
#[derive(Clone, Debug, Default)]
pub struct SourceLocation {
  /// Source file of the mutating instruction.
  pub file: Option<String>,
  /// Enclosing function of the mutating instruction.
  pub function: Option<String>,
  /// Line number of the mutating instruction.
  pub line: Option<u32>,
  /// Return addresses of the mutating call chain, innermost first.
  pub stack: Option<Vec<u64>>,
}

/// Where a mutation happened in the program.
///
/// Only `fault_ip` is captured unconditionally; the remaining fields are
/// populated when a resolver is registered for the originating adapter.
/// Polling-detected changes carry a `fault_ip` of zero.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Origin {
  /// Source file, if resolved.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  /// Enclosing function, if resolved.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub function: Option<String>,
  /// Line number, if resolved.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  /// Instruction pointer captured at the fault, zero for polling.
  pub fault_ip: u64,
  /// Call stack, if resolved.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stack: Option<Vec<u64>>,
}

impl Origin {
  pub(crate) fn new(fault_ip: u64, location: Option<SourceLocation>) -> Self {
    let location = location.unwrap_or_default();
    Origin {
      file: location.file,
      function: location.function,
      line: location.line,
      fault_ip,
      stack: location.stack,
    }
  }
}

/// A fully populated record of one observed mutation.
#[derive(Clone, Debug, Serialize)]
pub struct ChangeEvent {
  /// Globally monotonic, gap-free event sequence number.
  pub seq: u64,
  /// Monotonic timestamp of the detection, in nanoseconds.
  pub timestamp_ns: u64,
  /// Adapter that registered the mutated region.
  pub adapter_id: u32,
  /// The mutated region.
  pub region_id: u64,
  /// Owner-assigned variable id, if any.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub variable_id: Option<u64>,
  /// Human-readable name of the watched span, if any.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub variable_name: Option<String>,
  /// Where the mutation happened.
  #[serde(rename = "where")]
  pub origin: Origin,
  /// Size of the region in bytes.
  pub size: usize,
  /// Bounded window of the previous contents, anchored at the first change.
  pub old_preview: Vec<u8>,
  /// Bounded window of the current contents, anchored at the first change.
  pub new_preview: Vec<u8>,
  /// Previous contents, when captured inline.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub old_value: Option<Vec<u8>>,
  /// Current contents, when captured inline.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub new_value: Option<Vec<u8>>,
  /// Value store key of the previous contents, when offloaded.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub storage_key_old: Option<String>,
  /// Value store key of the current contents, when offloaded.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub storage_key_new: Option<String>,
  /// Owner-supplied key/value pairs, carried verbatim.
  pub metadata: BTreeMap<String, String>,
  /// Owner-side handle supplied at watch time, carried verbatim.
  #[serde(skip)]
  pub metadata_ref: u64,
}
