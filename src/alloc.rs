//! Page-aligned anonymous mappings.
//!
//! Watch targets normally live wherever the host application put them; a
//! [`Mapping`] exists for the cases that need deterministic page placement,
//! such as demos and tests that lay several regions out on one page.

use crate::{os, page, Error, Result};

/// A handle to an anonymous, page-aligned, read-write mapping.
///
/// The memory is zero-initialized and released when the handle is dropped.
pub struct Mapping {
  base: *mut u8,
  size: usize,
}

impl Mapping {
  /// Allocates one or more pages of zeroed, writable memory.
  ///
  /// The size is rounded up to the closest page boundary.
  ///
  /// # Examples
  ///
  /// ```
  /// # fn main() -> memwatch::Result<()> {
  /// let map = memwatch::Mapping::new(1)?;
  /// assert_eq!(map.len(), memwatch::page::size());
  /// # Ok(())
  /// # }
  /// ```
  pub fn new(size: usize) -> Result<Self> {
    if size == 0 {
      return Err(Error::InvalidParameter("size"));
    }

    let size = page::ceil(size);
    let base = unsafe { os::alloc(size)? };
    Ok(Mapping { base, size })
  }

  /// Returns a pointer to the mapping's base address.
  ///
  /// The address is always aligned to the operating system's page size.
  #[inline]
  pub fn as_ptr(&self) -> *const u8 {
    self.base
  }

  /// Returns a mutable pointer to the mapping's base address.
  #[inline]
  pub fn as_mut_ptr(&mut self) -> *mut u8 {
    self.base
  }

  /// Returns the size of the mapping.
  ///
  /// The size is always a multiple of the operating system's page size.
  #[inline]
  pub fn len(&self) -> usize {
    self.size
  }

  /// Returns whether the mapping is empty or not.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Views the mapping as a byte slice.
  #[inline]
  pub fn as_slice(&self) -> &[u8] {
    unsafe { std::slice::from_raw_parts(self.base, self.size) }
  }
}

impl Drop for Mapping {
  fn drop(&mut self) {
    let result = unsafe { os::free(self.base, self.size) };
    debug_assert!(result.is_ok(), "freeing mapping: {:?}", result);
  }
}

unsafe impl Send for Mapping {}
