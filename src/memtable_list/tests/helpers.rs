use tempfile::TempDir;

use crate::memtable::Memtable;
use crate::memtable_list::{MemtableHandle, MemtableHandleInner};

/// Builds a frozen memtable backed by a fresh WAL at `<dir>/wal-<id>.log`,
/// seeded with `key -> value`, and wraps it in a handle with id `id`.
pub fn sealed(temp: &TempDir, id: u64, key: &[u8], value: &[u8]) -> MemtableHandle {
    let path = temp.path().join(format!("wal-{id:06}.log"));
    let memtable = Memtable::new(&path, None, 1 << 20).unwrap();
    memtable.put(key.to_vec(), value.to_vec()).unwrap();
    let frozen = memtable.frozen().unwrap();
    MemtableHandleInner::new(frozen, id)
}

/// Same as [`sealed`] but with an empty memtable (no writes) — useful when
/// only the handle's identity and flush bookkeeping matter.
pub fn empty_sealed(temp: &TempDir, id: u64) -> MemtableHandle {
    let path = temp.path().join(format!("wal-{id:06}.log"));
    let memtable = Memtable::new(&path, None, 1 << 20).unwrap();
    let frozen = memtable.frozen().unwrap();
    MemtableHandleInner::new(frozen, id)
}
