//! Watch a buffer larger than the inline threshold: captured values are
//! handed to a value store and events carry keys instead of bytes.

use memwatch::{CaptureMode, Config, Mapping, MemoryStore, ValueStore, WatchOptions};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> memwatch::Result<()> {
  env_logger::init();
  memwatch::init(Config::default())?;

  let store = Arc::new(MemoryStore::new());
  memwatch::set_value_store(Arc::clone(&store) as Arc<dyn ValueStore>)?;

  {
    let store = Arc::clone(&store);
    memwatch::set_callback(move |event| {
      println!(
        "#{} region {} changed ({} bytes), preview {:?}...",
        event.seq,
        event.region_id,
        event.size,
        &event.new_preview[..event.new_preview.len().min(8)],
      );

      if let (Some(key_old), Some(key_new)) = (&event.storage_key_old, &event.storage_key_new) {
        let old = store.get(key_old).expect("old value was persisted");
        let new = store.get(key_new).expect("new value was persisted");
        println!("  {} -> {} bytes, {} -> {} bytes", key_old, old.len(), key_new, new.len());
      }
    })?;
  }

  let len = 10 * 1024;
  let mut map = Mapping::new(len)?;
  let id = unsafe {
    memwatch::watch(
      map.as_ptr(),
      len,
      WatchOptions::labeled("large_buffer").capture(CaptureMode::Full),
    )?
  };
  println!("watching {} KiB as region {}", len / 1024, id);

  unsafe { *map.as_mut_ptr().add(1000) = b'Y' };
  thread::sleep(Duration::from_millis(200));

  unsafe { *map.as_mut_ptr().add(9000) = b'Z' };
  thread::sleep(Duration::from_millis(200));

  println!("store holds {} value(s), {} bytes", store.len(), store.bytes_used());

  memwatch::unwatch(id)?;
  memwatch::shutdown()
}
