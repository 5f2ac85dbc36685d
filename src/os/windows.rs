use crate::error::{Error, Result};
use crate::protect::Protection;
use once_cell::sync::Lazy;
use std::time::Instant;
use winapi::shared::minwindef::DWORD;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::processthreadsapi::GetCurrentThreadId;
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::{
  MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
  PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};

fn to_native(protection: Protection) -> DWORD {
  match protection {
    Protection::NONE => PAGE_NOACCESS,
    Protection::READ => PAGE_READONLY,
    Protection::EXECUTE => PAGE_EXECUTE,
    Protection::READ_EXECUTE => PAGE_EXECUTE_READ,
    Protection::READ_WRITE => PAGE_READWRITE,
    _ => PAGE_EXECUTE_READWRITE,
  }
}

pub(crate) fn page_size() -> usize {
  unsafe {
    let mut info = std::mem::zeroed();
    GetSystemInfo(&mut info);
    info.dwPageSize as usize
  }
}

pub(crate) unsafe fn set_protection(base: usize, size: usize, protection: Protection) -> Result<()> {
  let mut previous = 0;
  let result = VirtualProtect(base as *mut _, size, to_native(protection), &mut previous);

  if result != 0 {
    Ok(())
  } else {
    Err(Error::ProtectionFailed(errno::errno()))
  }
}

pub(crate) unsafe fn alloc(size: usize) -> Result<*mut u8> {
  let base = VirtualAlloc(
    std::ptr::null_mut(),
    size,
    MEM_COMMIT | MEM_RESERVE,
    PAGE_READWRITE,
  );

  if base.is_null() {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(base.cast())
  }
}

pub(crate) unsafe fn free(base: *mut u8, _size: usize) -> Result<()> {
  if VirtualFree(base.cast(), 0, MEM_RELEASE) != 0 {
    Ok(())
  } else {
    Err(Error::SystemCall(errno::errno()))
  }
}

/// Nanoseconds from a process-local monotonic clock.
pub(crate) fn monotonic_ns() -> u64 {
  static START: Lazy<Instant> = Lazy::new(Instant::now);
  START.elapsed().as_nanos() as u64
}

pub(crate) fn thread_id() -> u64 {
  unsafe { GetCurrentThreadId() as u64 }
}
