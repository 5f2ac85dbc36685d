use nix::sys::signal::Signal;

/// Signals delivered for write access violations on this platform.
pub(crate) fn fault_signals() -> &'static [Signal] {
  &[Signal::SIGSEGV]
}

/// The faulting address carried by the signal information.
pub(crate) unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
  (*info).si_addr() as usize
}

cfg_if::cfg_if! {
  if #[cfg(all(target_arch = "x86_64", target_env = "gnu"))] {
    /// The instruction pointer at the time of the fault.
    pub(crate) unsafe fn fault_ip(context: *mut libc::c_void) -> u64 {
      let ucontext = context as *const libc::ucontext_t;
      (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    }
  } else if #[cfg(target_arch = "aarch64")] {
    /// The instruction pointer at the time of the fault.
    pub(crate) unsafe fn fault_ip(context: *mut libc::c_void) -> u64 {
      let ucontext = context as *const libc::ucontext_t;
      (*ucontext).uc_mcontext.pc
    }
  } else {
    /// Register state is not decodable on this architecture.
    pub(crate) unsafe fn fault_ip(context: *mut libc::c_void) -> u64 {
      let _ = context;
      0
    }
  }
}

/// The kernel task id of the calling thread; async-signal-safe.
pub(crate) fn thread_id() -> u64 {
  unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}
