//! Tests for [`MemtableList::install_memtable_flush_results`] (C4): the
//! flush-install bridge's strict creation-order commit protocol, history
//! routing, and precondition checks.

#[cfg(test)]
mod tests {
    use crate::manifest::{Manifest, ManifestSstEntry};
    use crate::memtable_list::tests::helpers::*;
    use crate::memtable_list::{FlushEdit, MemtableHandle, MemtableList, MemtableListError};
    use tempfile::TempDir;

    fn open_manifest(temp: &TempDir) -> Manifest {
        Manifest::open(temp.path().join("manifest")).expect("manifest open failed")
    }

    fn edit_for(id: u64) -> FlushEdit {
        FlushEdit {
            sstable: ManifestSstEntry {
                id,
                path: format!("sst_{id:06}.sst").into(),
            },
            frozen_wal_id: id,
        }
    }

    /// Builds `(handle, edit)` pairs for every handle in `picked`, in the
    /// same order, ready to hand to `install_memtable_flush_results`.
    fn edits_for(picked: &[MemtableHandle]) -> Vec<(MemtableHandle, FlushEdit)> {
        picked.iter().map(|h| (h.clone(), edit_for(h.id))).collect()
    }

    // ================================================================
    // Empty batch and precondition violations
    // ================================================================

    #[test]
    fn install_rejects_empty_edit_set() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        let err = list
            .install_memtable_flush_results(&[], &m, &mut to_delete)
            .unwrap_err();
        assert!(matches!(err, MemtableListError::Precondition(_)));
    }

    #[test]
    fn install_rejects_handle_not_flush_in_progress() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        let handle = sealed(&temp, 1, b"a", b"1");
        list.add(handle.clone(), &mut to_delete);
        // Never picked, so `flush_in_progress` is still false.

        let err = list
            .install_memtable_flush_results(&[(handle.clone(), edit_for(1))], &m, &mut to_delete)
            .unwrap_err();
        assert!(matches!(err, MemtableListError::Precondition(_)));
    }

    // ================================================================
    // Straight single-memtable install
    // ================================================================

    #[test]
    fn install_commits_single_memtable_to_history() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(1, 2);
        let mut to_delete = Vec::new();

        let handle = sealed(&temp, 1, b"a", b"1");
        list.add(handle, &mut to_delete);
        let picked = list.pick_memtables_to_flush();

        list.install_memtable_flush_results(&edits_for(&picked), &m, &mut to_delete)
            .unwrap();

        assert_eq!(list.num_not_flushed(), 0);
        assert_eq!(list.num_flushed(), 1);
        assert!(to_delete.is_empty());

        let version = list.current();
        assert_eq!(
            version.get(b"a", u64::MAX).unwrap(),
            crate::memtable_list::MemtableListLookup::NotFound,
            "flushed memtable no longer visible via get()"
        );
        assert_eq!(
            version.get_from_history(b"a", u64::MAX).unwrap(),
            crate::memtable_list::MemtableListLookup::Found(
                crate::memtable::MemtableGetResult::Put(b"1".to_vec())
            )
        );

        let ssts = m.get_sstables().unwrap();
        assert_eq!(ssts.len(), 1);
        assert_eq!(ssts[0].id, 1);
    }

    #[test]
    fn install_with_zero_history_drops_memtable_to_delete_list() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        let handle = sealed(&temp, 1, b"a", b"1");
        list.add(handle, &mut to_delete);
        let picked = list.pick_memtables_to_flush();

        list.install_memtable_flush_results(&edits_for(&picked), &m, &mut to_delete)
            .unwrap();

        assert_eq!(list.num_not_flushed(), 0);
        assert_eq!(list.num_flushed(), 0, "H=0 disables retention entirely");
        assert_eq!(to_delete.len(), 1);
        assert_eq!(to_delete[0].id, 1);
    }

    // ================================================================
    // History window eviction (S3)
    // ================================================================

    #[test]
    fn history_window_evicts_oldest_on_overflow() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(1, 2);
        let mut to_delete = Vec::new();

        for (id, key) in [(1u64, b"a" as &[u8]), (2, b"b"), (3, b"c")] {
            let handle = sealed(&temp, id, key, b"v");
            list.add(handle, &mut to_delete);
            let picked = list.pick_memtables_to_flush();
            list.install_memtable_flush_results(&edits_for(&picked), &m, &mut to_delete)
                .unwrap();
        }

        assert_eq!(list.num_flushed(), 2, "capped at H=2");
        assert_eq!(to_delete.len(), 1, "oldest (id=1) evicted on the third install");
        assert_eq!(to_delete[0].id, 1);

        let ids: Vec<u64> = list.current().history().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    // ================================================================
    // Strict creation-order commit (S4)
    // ================================================================

    #[test]
    fn install_defers_when_oldest_unflushed_not_yet_completed() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(10, 7);
        let mut to_delete = Vec::new();

        // T0 is added and picked but *not* installed yet — it stays the
        // oldest unflushed entry with `flush_completed = false`.
        let t0 = sealed(&temp, 0, b"t0", b"v");
        list.add(t0, &mut to_delete);
        let pick0 = list.pick_memtables_to_flush();
        assert_eq!(pick0.len(), 1);

        // T1 is added, picked, and its edit is ready — but it must not
        // jump ahead of T0 in the manifest.
        let t1 = sealed(&temp, 1, b"t1", b"v");
        list.add(t1, &mut to_delete);
        let pick1 = list.pick_memtables_to_flush();
        assert_eq!(pick1.len(), 1);
        assert_eq!(pick1[0].id, 1);

        list.install_memtable_flush_results(&edits_for(&pick1), &m, &mut to_delete)
            .unwrap();

        assert_eq!(
            list.num_not_flushed(),
            2,
            "both T0 and T1 remain unflushed: T1 completed but is withheld behind T0"
        );
        assert_eq!(list.num_flushed(), 0);
        assert!(
            m.get_sstables().unwrap().is_empty(),
            "nothing reaches the manifest until T0 completes"
        );

        // Completing T0 now unblocks both T0 and the waiting T1 in one
        // install call.
        list.install_memtable_flush_results(&edits_for(&pick0), &m, &mut to_delete)
            .unwrap();

        assert_eq!(list.num_not_flushed(), 0);
        assert_eq!(list.num_flushed(), 2);
        let ids: Vec<u64> = m.get_sstables().unwrap().iter().map(|e| e.id).collect();
        assert!(ids.contains(&0));
        assert!(ids.contains(&1));
    }

    #[test]
    fn interleaved_picks_commit_in_creation_order() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(100, 7);
        let mut to_delete = Vec::new();

        // Seal T0..T2, pick all three in one go.
        for id in 0..3u64 {
            list.add(sealed(&temp, id, format!("k{id}").as_bytes(), b"v"), &mut to_delete);
        }
        let first_pick = list.pick_memtables_to_flush();
        assert_eq!(first_pick.iter().map(|h| h.id).collect::<Vec<_>>(), vec![0, 1, 2]);

        // Seal T3, pick it separately — disjoint from the first pick.
        list.add(sealed(&temp, 3, b"k3", b"v"), &mut to_delete);
        let second_pick = list.pick_memtables_to_flush();
        assert_eq!(second_pick.iter().map(|h| h.id).collect::<Vec<_>>(), vec![3]);

        // Installing {T0,T1,T2} first commits all three; T3's edit hasn't
        // been recorded yet so it isn't part of this batch.
        list.install_memtable_flush_results(&edits_for(&first_pick), &m, &mut to_delete)
            .unwrap();
        assert_eq!(list.num_not_flushed(), 1, "only T3 remains");
        assert_eq!(list.num_flushed(), 3);

        // Installing {T3} now commits it too.
        list.install_memtable_flush_results(&edits_for(&second_pick), &m, &mut to_delete)
            .unwrap();
        assert_eq!(list.num_not_flushed(), 0);
        assert_eq!(list.num_flushed(), 4.min(7));

        let ids: Vec<u64> = m.get_sstables().unwrap().iter().map(|e| e.id).collect();
        for id in 0..4u64 {
            assert!(ids.contains(&id), "sstable {id} missing from manifest");
        }
    }

    // ================================================================
    // Re-installing an already-committed handle is a no-op
    // ================================================================

    #[test]
    fn reinstalling_an_already_committed_handle_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let m = open_manifest(&temp);
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();
        let handle = sealed(&temp, 1, b"a", b"1");
        list.add(handle, &mut to_delete);
        let picked = list.pick_memtables_to_flush();

        list.install_memtable_flush_results(&edits_for(&picked), &m, &mut to_delete)
            .unwrap();

        // The handle is no longer in `unflushed` (it was already committed
        // and dropped to `to_delete` under H=0), so the walk from the
        // oldest unflushed entry finds nothing to batch — a harmless no-op
        // rather than a double commit to the manifest.
        list.install_memtable_flush_results(&edits_for(&picked), &m, &mut to_delete)
            .unwrap();

        assert_eq!(m.get_sstables().unwrap().len(), 1, "no duplicate manifest entry");
    }
}
