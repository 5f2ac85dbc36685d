//! Fault records and the access-violation handler.
//!
//! The handler runs in signal context and therefore does nothing but decide
//! ownership, enqueue a fixed-size record, and lift the page's protection so
//! the faulting store can re-execute. Everything heavier happens on the
//! worker. Faults on addresses outside any tracked page are forwarded to
//! whatever handler was installed before: a crash must remain a crash.

/// Number of region ids a fault record can carry inline.
pub(crate) const CANDIDATE_IDS: usize = 4;

/// Minimal, fixed-size datum produced in signal context (or synthesized by
/// the poller) and consumed by the worker.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FaultRecord {
  pub page_base: usize,
  pub fault_addr: usize,
  /// Instruction pointer of the faulting store; zero when synthesized.
  pub fault_ip: u64,
  pub thread_id: u64,
  pub wall_time_ns: u64,
  /// Best-effort region ids snapshotted from the page slot, zero-padded.
  pub candidates: [u64; CANDIDATE_IDS],
}

#[cfg(unix)]
pub(crate) use self::handler::{install, uninstall};

#[cfg(unix)]
mod handler {
  use crate::engine::Engine;
  use crate::error::{Error, Result};
  use crate::os;
  use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
  use once_cell::sync::OnceCell;
  use std::cell::UnsafeCell;

  const ALT_STACK_SIZE: usize = 64 * 1024;
  const MAX_FAULT_SIGNALS: usize = 2;

  /// Previously installed dispositions, written only while installing or
  /// uninstalling (which the engine serializes) and read in signal context.
  struct PrevActions(UnsafeCell<[Option<(libc::c_int, SigAction)>; MAX_FAULT_SIGNALS]>);

  unsafe impl Sync for PrevActions {}

  static PREV: PrevActions = PrevActions(UnsafeCell::new([None; MAX_FAULT_SIGNALS]));
  static ALT_STACK: OnceCell<usize> = OnceCell::new();

  /// Registers an alternate stack for the calling thread, best effort.
  fn ensure_alt_stack() {
    let base = *ALT_STACK.get_or_init(|| unsafe {
      os::alloc(ALT_STACK_SIZE).map(|ptr| ptr as usize).unwrap_or(0)
    });

    if base == 0 {
      return;
    }

    let stack = libc::stack_t {
      ss_sp: base as *mut libc::c_void,
      ss_flags: 0,
      ss_size: ALT_STACK_SIZE,
    };

    if unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) } != 0 {
      log::warn!("installing the alternate signal stack failed: {}", errno::errno());
    }
  }

  /// Installs the access-violation handler for this platform's fault
  /// signals, chaining to any previously installed dispositions.
  pub(crate) fn install() -> Result<()> {
    ensure_alt_stack();

    let action = SigAction::new(
      SigHandler::SigAction(on_fault),
      SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
      SigSet::empty(),
    );

    for (index, fault_signal) in os::fault_signals().iter().enumerate() {
      match unsafe { signal::sigaction(*fault_signal, &action) } {
        Ok(previous) => unsafe {
          (*PREV.0.get())[index] = Some((*fault_signal as libc::c_int, previous));
        },
        Err(err) => {
          uninstall();
          return Err(Error::HandlerInstall(errno::Errno(err as i32)));
        }
      }
    }

    Ok(())
  }

  /// Restores the previously installed dispositions.
  pub(crate) fn uninstall() {
    let entries = unsafe { &mut *PREV.0.get() };

    for entry in entries.iter_mut() {
      if let Some((signo, action)) = entry.take() {
        if let Ok(fault_signal) = Signal::try_from(signo) {
          let _ = unsafe { signal::sigaction(fault_signal, &action) };
        }
      }
    }
  }

  extern "C" fn on_fault(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
  ) {
    let fault_addr = unsafe { os::fault_address(info) };

    if let Some(engine) = Engine::active() {
      let fault_ip = unsafe { os::fault_ip(context) };
      if engine.on_protected_fault(fault_addr, fault_ip) {
        return;
      }
    }

    forward(signo, info, context);
  }

  /// Hands a foreign fault to the previous disposition.
  fn forward(signo: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let entries = unsafe { &*PREV.0.get() };
    let previous = entries
      .iter()
      .flatten()
      .find(|(prev_signo, _)| *prev_signo == signo)
      .map(|(_, action)| *action);

    match previous.map(|action| action.handler()) {
      Some(SigHandler::Handler(previous_handler)) => previous_handler(signo),
      Some(SigHandler::SigAction(previous_handler)) => previous_handler(signo, info, context),
      Some(SigHandler::SigIgn) => {}
      _ => {
        // Restore the default disposition and return; the instruction
        // re-executes, faults again, and takes the normal crash path.
        if let Ok(fault_signal) = Signal::try_from(signo) {
          let _ = unsafe { signal::signal(fault_signal, SigHandler::SigDfl) };
        }
      }
    }
  }
}
