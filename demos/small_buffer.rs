//! Watch a small buffer and print the change events it produces.

use memwatch::{CaptureMode, Config, Mapping, WatchOptions};
use std::thread;
use std::time::Duration;

fn main() -> memwatch::Result<()> {
  env_logger::init();
  memwatch::init(Config::default())?;

  memwatch::set_callback(|event| {
    println!(
      "#{} region {} ({}) changed {} bytes at ip {:#x}",
      event.seq,
      event.region_id,
      event.variable_name.as_deref().unwrap_or("?"),
      event.size,
      event.origin.fault_ip,
    );
    println!("  old: {:?}", String::from_utf8_lossy(&event.old_preview));
    println!("  new: {:?}", String::from_utf8_lossy(&event.new_preview));
  })?;

  let mut map = Mapping::new(memwatch::page::size())?;
  let message = b"Hello, memwatch!";
  unsafe {
    std::ptr::copy_nonoverlapping(message.as_ptr(), map.as_mut_ptr(), message.len());
  }

  let id = unsafe {
    memwatch::watch(
      map.as_ptr(),
      message.len(),
      WatchOptions::labeled("greeting").capture(CaptureMode::Full),
    )?
  };
  println!("watching {} bytes as region {}", message.len(), id);

  unsafe { *map.as_mut_ptr() = b'J' };
  thread::sleep(Duration::from_millis(200));

  unsafe {
    *map.as_mut_ptr().add(7) = b'w';
    *map.as_mut_ptr().add(8) = b'a';
  }
  thread::sleep(Duration::from_millis(200));

  let stats = memwatch::stats()?;
  println!(
    "emitted {} event(s) over {} region(s) in {} mode",
    stats.events_emitted, stats.num_tracked_regions, stats.mode
  );

  memwatch::unwatch(id)?;
  memwatch::shutdown()
}
