pub mod helpers;

mod tests_basic;
mod tests_edge_cases;
mod tests_truncation;

// Priority 2 — robustness tests
mod tests_corruption;

// Priority 3 — hardening (edge cases)
mod tests_rotation_edge;

// Priority 4 — coverage
mod tests_coverage;
