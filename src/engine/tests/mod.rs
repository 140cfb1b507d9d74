pub mod helpers;
mod tests_crash_compaction;
mod tests_crash_flush;
mod tests_crash_recovery;
mod tests_delete;
mod tests_edge_cases;
mod tests_flush_api;
mod tests_hardening;
mod tests_layers;
mod tests_lsn_continuity;
mod tests_lsn_crash;
mod tests_multi_crash;
mod tests_multi_sstable;
mod tests_mvcc_scan;
mod tests_precedence;
mod tests_put_get;
mod tests_range_delete;
mod tests_recovery;
mod tests_scan;
mod tests_stress;

// Priority 2 — robustness tests
mod tests_boundary_values;
mod tests_compaction_edge;
mod tests_concurrent_ops;
mod tests_file_cleanup;

// Priority 3 — hardening (edge cases)
mod tests_hardening_edge;
mod tests_scan_edge;
mod tests_tombstone_gc;
mod tests_utils_coverage;
