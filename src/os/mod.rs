cfg_if::cfg_if! {
  if #[cfg(unix)] {
    mod unix;
    pub(crate) use self::unix::*;
  } else if #[cfg(windows)] {
    mod windows;
    pub(crate) use self::windows::*;
  }
}

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub(crate) use self::linux::*;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub(crate) use self::macos::*;
