use nix::sys::signal::Signal;

/// Darwin reports access violations as SIGBUS for some mappings.
pub(crate) fn fault_signals() -> &'static [Signal] {
  &[Signal::SIGSEGV, Signal::SIGBUS]
}

/// The faulting address carried by the signal information.
pub(crate) unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
  (*info).si_addr as usize
}

cfg_if::cfg_if! {
  if #[cfg(target_arch = "x86_64")] {
    /// The instruction pointer at the time of the fault.
    pub(crate) unsafe fn fault_ip(context: *mut libc::c_void) -> u64 {
      let ucontext = context as *const libc::ucontext_t;
      (*(*ucontext).uc_mcontext).__ss.__rip
    }
  } else if #[cfg(target_arch = "aarch64")] {
    /// The instruction pointer at the time of the fault.
    pub(crate) unsafe fn fault_ip(context: *mut libc::c_void) -> u64 {
      let ucontext = context as *const libc::ucontext_t;
      (*(*ucontext).uc_mcontext).__ss.__pc
    }
  } else {
    /// Register state is not decodable on this architecture.
    pub(crate) unsafe fn fault_ip(context: *mut libc::c_void) -> u64 {
      let _ = context;
      0
    }
  }
}

/// An opaque id for the calling thread; async-signal-safe.
pub(crate) fn thread_id() -> u64 {
  unsafe { libc::pthread_self() as u64 }
}
