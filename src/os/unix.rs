use crate::error::{Error, Result};
use crate::protect::Protection;

pub(crate) fn page_size() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl From<Protection> for libc::c_int {
  fn from(protection: Protection) -> Self {
    let mut flags = libc::PROT_NONE;

    if protection.contains(Protection::READ) {
      flags |= libc::PROT_READ;
    }

    if protection.contains(Protection::WRITE) {
      flags |= libc::PROT_WRITE;
    }

    if protection.contains(Protection::EXECUTE) {
      flags |= libc::PROT_EXEC;
    }

    flags
  }
}

pub(crate) unsafe fn set_protection(base: usize, size: usize, protection: Protection) -> Result<()> {
  let result = libc::mprotect(base as *mut libc::c_void, size, protection.into());

  if result == 0 {
    Ok(())
  } else {
    Err(Error::ProtectionFailed(errno::errno()))
  }
}

pub(crate) unsafe fn alloc(size: usize) -> Result<*mut u8> {
  let base = libc::mmap(
    std::ptr::null_mut(),
    size,
    libc::PROT_READ | libc::PROT_WRITE,
    libc::MAP_PRIVATE | libc::MAP_ANON,
    -1,
    0,
  );

  if base == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(base.cast())
  }
}

pub(crate) unsafe fn free(base: *mut u8, size: usize) -> Result<()> {
  if libc::munmap(base.cast(), size) == 0 {
    Ok(())
  } else {
    Err(Error::SystemCall(errno::errno()))
  }
}

/// Nanoseconds from the monotonic clock; async-signal-safe.
pub(crate) fn monotonic_ns() -> u64 {
  let mut ts = libc::timespec {
    tv_sec: 0,
    tv_nsec: 0,
  };

  unsafe {
    libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
  }

  ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
