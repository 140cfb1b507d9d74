//! Tests for [`MemtableList`]'s state machine (C3): pending-flush
//! detection, picking, and rollback. Installation is covered separately in
//! [`super::tests_install`].

#[cfg(test)]
mod tests {
    use crate::memtable_list::MemtableList;
    use crate::memtable_list::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn new_list_has_no_flush_pending() {
        let list = MemtableList::new(1, 0);
        assert!(!list.is_flush_pending());
        assert!(!list.imm_flush_needed());
        assert_eq!(list.num_not_flushed(), 0);
        assert_eq!(list.num_flushed(), 0);
    }

    #[test]
    fn is_flush_pending_once_threshold_reached() {
        let temp = TempDir::new().unwrap();
        // M = 1: a single unflushed memtable is already enough.
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        assert!(!list.is_flush_pending());
        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);
        assert!(list.is_flush_pending());
        assert!(list.imm_flush_needed());
    }

    #[test]
    fn is_flush_pending_respects_merge_threshold() {
        let temp = TempDir::new().unwrap();
        // M = 2: one unflushed memtable is not enough yet.
        let mut list = MemtableList::new(2, 0);
        let mut to_delete = Vec::new();

        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);
        assert!(!list.is_flush_pending(), "below M, no flush pending yet");

        list.add(sealed(&temp, 2, b"b", b"2"), &mut to_delete);
        assert!(list.is_flush_pending(), "at M, flush is now pending");
    }

    #[test]
    fn flush_requested_forces_pending_regardless_of_threshold() {
        let temp = TempDir::new().unwrap();
        let mut list = MemtableList::new(5, 0);
        let mut to_delete = Vec::new();
        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);

        assert!(!list.is_flush_pending());
        list.flush_requested();
        assert!(list.is_flush_pending());
    }

    #[test]
    fn flush_requested_is_noop_with_nothing_unflushed() {
        let mut list = MemtableList::new(1, 0);
        list.flush_requested();
        assert!(!list.is_flush_pending(), "nothing to flush even if requested");
    }

    #[test]
    fn pick_claims_entire_not_in_progress_prefix_oldest_first() {
        let temp = TempDir::new().unwrap();
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);
        list.add(sealed(&temp, 2, b"b", b"2"), &mut to_delete);
        list.add(sealed(&temp, 3, b"c", b"3"), &mut to_delete);

        let picked = list.pick_memtables_to_flush();
        let ids: Vec<u64> = picked.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 2, 3], "picked set is oldest-first");

        for handle in &picked {
            assert!(handle.flush_in_progress());
        }
    }

    #[test]
    fn pick_stops_at_an_already_in_progress_memtable() {
        let temp = TempDir::new().unwrap();
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);
        list.add(sealed(&temp, 2, b"b", b"2"), &mut to_delete);

        let first_pick = list.pick_memtables_to_flush();
        assert_eq!(first_pick.len(), 2);

        list.add(sealed(&temp, 3, b"c", b"3"), &mut to_delete);
        let second_pick = list.pick_memtables_to_flush();
        let ids: Vec<u64> = second_pick.iter().map(|h| h.id).collect();
        assert_eq!(
            ids,
            vec![3],
            "memtables 1 and 2 are already in-progress from the first pick"
        );
    }

    #[test]
    fn pick_clears_flush_requested_and_decrements_not_started() {
        let temp = TempDir::new().unwrap();
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();
        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);
        list.flush_requested();

        list.pick_memtables_to_flush();

        // Nothing new added, and flush_requested consumed — no longer pending.
        assert!(!list.is_flush_pending());
    }

    #[test]
    fn rollback_clears_in_progress_and_restores_pending() {
        let temp = TempDir::new().unwrap();
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();
        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);

        let picked = list.pick_memtables_to_flush();
        assert!(picked[0].flush_in_progress());

        list.rollback_memtable_flush(&picked);

        assert!(!picked[0].flush_in_progress());
        assert!(list.is_flush_pending(), "rolled-back memtable is pending again");
        assert!(list.imm_flush_needed());
    }

    #[test]
    fn rollback_allows_re_picking_the_same_memtable() {
        let temp = TempDir::new().unwrap();
        let mut list = MemtableList::new(1, 0);
        let mut to_delete = Vec::new();
        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);

        let picked = list.pick_memtables_to_flush();
        list.rollback_memtable_flush(&picked);

        let repicked = list.pick_memtables_to_flush();
        assert_eq!(repicked.len(), 1);
        assert_eq!(repicked[0].id, 1);
    }
}
