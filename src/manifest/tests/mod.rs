mod tests_api;
mod tests_basic;
mod tests_checkpoint;
mod tests_edge_cases;

// memtable-list flush-install bridge (C4)
mod tests_install_flush;
