//! Tests for [`MemtableListVersion`] (C2): immutable successor
//! construction, newest-first ordering, and `get`/`get_from_history`
//! lookup scope.

#[cfg(test)]
mod tests {
    use crate::memtable::MemtableGetResult;
    use crate::memtable_list::MemtableListLookup;
    use crate::memtable_list::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn empty_version_has_no_memtables() {
        let version = crate::memtable_list::MemtableList::new(1, 0).current();
        assert!(version.unflushed().is_empty());
        assert!(version.history().is_empty());
    }

    #[test]
    fn add_memtable_prepends_to_unflushed() {
        let temp = TempDir::new().unwrap();
        let mut list = crate::memtable_list::MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);
        list.add(sealed(&temp, 2, b"b", b"2"), &mut to_delete);
        list.add(sealed(&temp, 3, b"c", b"3"), &mut to_delete);

        let version = list.current();
        let ids: Vec<u64> = version.unflushed().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 2, 1], "newest add must be at the front");
        assert!(to_delete.is_empty());
    }

    #[test]
    fn get_scans_unflushed_newest_first_and_returns_first_hit() {
        let temp = TempDir::new().unwrap();
        let mut list = crate::memtable_list::MemtableList::new(1, 0);
        let mut to_delete = Vec::new();

        // Oldest writes "a" -> "old", newest overwrites with "new".
        list.add(sealed(&temp, 1, b"a", b"old"), &mut to_delete);
        list.add(sealed(&temp, 2, b"a", b"new"), &mut to_delete);

        let version = list.current();
        let result = version.get(b"a", u64::MAX).unwrap();
        assert_eq!(
            result,
            MemtableListLookup::Found(MemtableGetResult::Put(b"new".to_vec()))
        );
    }

    #[test]
    fn get_returns_not_found_for_absent_key() {
        let temp = TempDir::new().unwrap();
        let mut list = crate::memtable_list::MemtableList::new(1, 0);
        let mut to_delete = Vec::new();
        list.add(sealed(&temp, 1, b"a", b"1"), &mut to_delete);

        let version = list.current();
        assert_eq!(
            version.get(b"z", u64::MAX).unwrap(),
            MemtableListLookup::NotFound
        );
    }

    #[test]
    fn get_does_not_consult_history() {
        let temp = TempDir::new().unwrap();
        // H=1 so a flushed memtable is retained in history.
        let mut list = crate::memtable_list::MemtableList::new(1, 1);
        let mut to_delete = Vec::new();
        let handle = sealed(&temp, 1, b"a", b"1");
        list.add(handle.clone(), &mut to_delete);

        // Manually move it into history via the version's own helper, since
        // driving a real install is exercised in tests_install.
        let version = list.current();
        let (after_remove, removed) = version.remove(1);
        let with_history = after_remove.push_history(removed.unwrap(), 1, &mut to_delete);

        assert!(with_history.unflushed().is_empty());
        assert_eq!(with_history.get(b"a", u64::MAX).unwrap(), MemtableListLookup::NotFound);
        assert_eq!(
            with_history.get_from_history(b"a", u64::MAX).unwrap(),
            MemtableListLookup::Found(MemtableGetResult::Put(b"1".to_vec()))
        );
    }

    #[test]
    fn trim_history_evicts_oldest_past_cap() {
        let temp = TempDir::new().unwrap();
        let mut list = crate::memtable_list::MemtableList::new(1, 2);
        let mut to_delete = Vec::new();

        let mut version = list.current();
        for id in 1..=3u64 {
            let handle = sealed(&temp, id, b"k", b"v");
            version = version.push_history(handle, 2, &mut to_delete);
        }

        assert_eq!(version.history().len(), 2, "capped at max_h = 2");
        let ids: Vec<u64> = version.history().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 2], "oldest (id=1) must be evicted first");
        assert_eq!(to_delete.len(), 1);
        assert_eq!(to_delete[0].id, 1);
    }
}
