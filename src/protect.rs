//! Page protection primitives.
//!
//! Watched pages are held at [`Protection::READ`] so that any store faults,
//! and restored to [`Protection::READ_WRITE`] whenever a writable window is
//! opened or a page leaves the registry.

use crate::{os, page, util, Result};

bitflags! {
  /// A bitflag of zero or more protection attributes.
  ///
  /// Determines the access rights for a specific page and/or region. Some
  /// combination of flags may not be applicable, depending on the OS (e.g
  /// macOS enforces executable pages to be readable, OpenBSD requires W^X).
  ///
  /// # Examples
  ///
  /// ```
  /// use memwatch::Protection;
  ///
  /// let combine = Protection::READ | Protection::WRITE;
  /// let shorthand = Protection::READ_WRITE;
  /// ```
  #[derive(Default)]
  pub struct Protection: usize {
    /// No access allowed at all.
    const NONE = 0;
    /// Read access; writing and/or executing data will panic.
    const READ = (1 << 1);
    /// Write access; this flag alone may not be supported on all OSs.
    const WRITE = (1 << 2);
    /// Execute access; this may not be allowed depending on DEP.
    const EXECUTE = (1 << 3);
    /// Read and execute shorthand.
    const READ_EXECUTE = (Self::READ.bits | Self::EXECUTE.bits);
    /// Read and write shorthand.
    const READ_WRITE = (Self::READ.bits | Self::WRITE.bits);
    /// Read, write and execute shorthand.
    const READ_WRITE_EXECUTE = (Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits);
  }
}

impl std::fmt::Display for Protection {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    const MAPPINGS: &[(Protection, char)] = &[
      (Protection::READ, 'r'),
      (Protection::WRITE, 'w'),
      (Protection::EXECUTE, 'x'),
    ];

    for (flag, symbol) in MAPPINGS {
      if self.contains(*flag) {
        write!(f, "{}", symbol)?;
      } else {
        write!(f, "-")?;
      }
    }

    Ok(())
  }
}

/// Changes the memory protection of one or more pages.
///
/// The address is rounded down, and the size up, to their closest page
/// boundaries.
///
/// # Safety
///
/// Altering the protection of pages the caller does not control can crash
/// the process at an arbitrary later point.
pub(crate) unsafe fn protect(address: usize, size: usize, protection: Protection) -> Result<()> {
  let (address, size) = util::round_to_page_boundaries(address, size)?;
  os::set_protection(address, size, protection)
}

/// Denies writes to a single page.
///
/// # Safety
///
/// See [`protect`].
pub(crate) unsafe fn write_protect_page(page_base: usize) -> Result<()> {
  protect(page_base, page::size(), Protection::READ)
}

/// Restores write access to a single page.
///
/// # Safety
///
/// See [`protect`].
pub(crate) unsafe fn unprotect_page(page_base: usize) -> Result<()> {
  protect(page_base, page::size(), Protection::READ_WRITE)
}
