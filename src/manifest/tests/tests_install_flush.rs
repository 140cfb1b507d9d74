//! Flush-install bridge tests: the manifest-side half of the memtable
//! list's flush-commit protocol.
//!
//! `install_flush` adds the SSTables produced by a flush and removes the
//! frozen WALs they replace in one durable WAL entry — modeled directly on
//! `apply_compaction`, differing only in which companion list it touches.
//!
//! ## Coverage
//! - Atomic add-SSTs + remove-frozen-WALs application
//! - Encode/decode round-trip via WAL replay (no checkpoint)
//! - Survives checkpoint + reopen
//! - Repeated install calls accumulate correctly
//!
//! ## See also
//! - [`tests_checkpoint`] — `compaction_event_survives_checkpoint`, the
//!   direct precedent for these tests

#[cfg(test)]
mod tests {
    use crate::manifest::{Manifest, ManifestSstEntry};
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn open_manifest(temp: &TempDir) -> Manifest {
        Manifest::open(temp.path()).expect("Manifest open failed")
    }

    fn sst_entry(id: u64) -> ManifestSstEntry {
        ManifestSstEntry {
            id,
            path: format!("sst_{:06}.sst", id).into(),
        }
    }

    // ================================================================
    // 1. Basic atomic apply
    // ================================================================

    /// # Scenario
    /// Seed two frozen WALs, then install a flush that adds one SSTable
    /// and removes one of them.
    ///
    /// # Expected behavior
    /// The added SSTable appears; the removed frozen WAL disappears; the
    /// other frozen WAL is untouched.
    #[test]
    fn installs_sstable_and_removes_frozen_wal() {
        init_tracing();

        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);

        m.add_frozen_wal(1).unwrap();
        m.add_frozen_wal(2).unwrap();

        m.install_flush(vec![sst_entry(100)], vec![1]).unwrap();

        let frozen = m.get_frozen_wals().unwrap();
        assert_eq!(frozen, vec![2]);

        let ssts = m.get_sstables().unwrap();
        assert_eq!(ssts.len(), 1);
        assert_eq!(ssts[0].id, 100);
    }

    // ================================================================
    // 2. Multiple SSTables in one batch
    // ================================================================

    /// # Scenario
    /// A single install call can commit several memtables' worth of
    /// flush output at once (the contiguous-completed-batch case).
    ///
    /// # Expected behavior
    /// All added SSTables appear; all listed frozen WALs are removed.
    #[test]
    fn installs_batch_of_several_sstables() {
        init_tracing();

        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);

        m.add_frozen_wal(1).unwrap();
        m.add_frozen_wal(2).unwrap();
        m.add_frozen_wal(3).unwrap();

        m.install_flush(
            vec![sst_entry(10), sst_entry(11), sst_entry(12)],
            vec![1, 2, 3],
        )
        .unwrap();

        assert!(m.get_frozen_wals().unwrap().is_empty());
        let ids: Vec<u64> = m.get_sstables().unwrap().iter().map(|e| e.id).collect();
        assert!(ids.contains(&10));
        assert!(ids.contains(&11));
        assert!(ids.contains(&12));
    }

    // ================================================================
    // 3. Survives crash-style recovery via WAL replay
    // ================================================================

    /// # Scenario
    /// Install a flush without checkpointing, then reopen the manifest
    /// from the same directory. Replay must reconstruct the post-install
    /// state from the single `InstallFlush` WAL record.
    ///
    /// # Expected behavior
    /// Reopened manifest shows the added SSTable and the frozen WAL gone.
    #[test]
    fn install_flush_survives_wal_replay() {
        init_tracing();

        let temp = TempDir::new().unwrap();

        {
            let m = open_manifest(&temp);
            m.add_frozen_wal(7).unwrap();
            m.install_flush(vec![sst_entry(42)], vec![7]).unwrap();
        }

        let m2 = open_manifest(&temp);
        assert!(m2.get_frozen_wals().unwrap().is_empty());
        let ssts = m2.get_sstables().unwrap();
        assert_eq!(ssts.len(), 1);
        assert_eq!(ssts[0].id, 42);
    }

    // ================================================================
    // 4. Survives checkpoint + reopen
    // ================================================================

    /// # Scenario
    /// Install a flush, checkpoint, then reopen.
    ///
    /// # Expected behavior
    /// State is recovered identically from the snapshot.
    #[test]
    fn install_flush_survives_checkpoint() {
        init_tracing();

        let temp = TempDir::new().unwrap();

        {
            let m = open_manifest(&temp);
            m.add_frozen_wal(3).unwrap();
            m.install_flush(vec![sst_entry(55)], vec![3]).unwrap();
            m.checkpoint().unwrap();
        }

        let m2 = open_manifest(&temp);
        assert!(m2.get_frozen_wals().unwrap().is_empty());
        let ssts = m2.get_sstables().unwrap();
        assert_eq!(ssts.len(), 1);
        assert_eq!(ssts[0].id, 55);
    }

    // ================================================================
    // 5. Repeated installs accumulate
    // ================================================================

    /// # Scenario
    /// Two separate install calls, simulating two successive flush
    /// rounds being committed one at a time as each becomes the oldest
    /// completed entry.
    ///
    /// # Expected behavior
    /// Both rounds' SSTables are present; both frozen WALs removed.
    #[test]
    fn repeated_installs_accumulate() {
        init_tracing();

        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);

        m.add_frozen_wal(1).unwrap();
        m.add_frozen_wal(2).unwrap();

        m.install_flush(vec![sst_entry(1)], vec![1]).unwrap();
        m.install_flush(vec![sst_entry(2)], vec![2]).unwrap();

        assert!(m.get_frozen_wals().unwrap().is_empty());
        let ids: Vec<u64> = m.get_sstables().unwrap().iter().map(|e| e.id).collect();
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
    }

    // ================================================================
    // 6. next_sst_id advances past installed entries
    // ================================================================

    /// # Scenario
    /// Installing an SSTable with a high id must not let
    /// `allocate_sst_id` hand out a colliding id afterward.
    ///
    /// # Expected behavior
    /// The next allocated id is strictly greater than the installed one.
    #[test]
    fn install_flush_advances_next_sst_id() {
        init_tracing();

        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);

        m.install_flush(vec![sst_entry(1000)], vec![]).unwrap();

        let next = m.allocate_sst_id().unwrap();
        assert!(next > 1000, "next id ({next}) must exceed installed id 1000");
    }
}
