//! Tests for [`MemtableHandleInner`]'s ref-counting and default flush-state
//! (C1). State transitions driven by flush picking/installing are covered
//! in [`super::tests_list`] and [`super::tests_install`], since this
//! engine's `MemtableList` — not the handle itself — owns those
//! transitions.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::memtable_list::tests::helpers::empty_sealed;
    use tempfile::TempDir;

    #[test]
    fn fresh_handle_has_no_flush_state() {
        let temp = TempDir::new().unwrap();
        let handle = empty_sealed(&temp, 1);

        assert!(!handle.flush_in_progress());
        assert!(!handle.flush_completed());
        assert!(handle.edit().is_none());
    }

    #[test]
    fn handle_id_is_preserved() {
        let temp = TempDir::new().unwrap();
        let handle = empty_sealed(&temp, 99);
        assert_eq!(handle.id, 99);
    }

    #[test]
    fn arc_strong_count_tracks_clones() {
        let temp = TempDir::new().unwrap();
        let handle = empty_sealed(&temp, 1);

        assert_eq!(Arc::strong_count(&handle), 1);
        let clone_a = Arc::clone(&handle);
        assert_eq!(Arc::strong_count(&handle), 2);
        let clone_b = Arc::clone(&handle);
        assert_eq!(Arc::strong_count(&handle), 3);

        drop(clone_a);
        assert_eq!(Arc::strong_count(&handle), 2);
        drop(clone_b);
        assert_eq!(Arc::strong_count(&handle), 1);
    }
}
