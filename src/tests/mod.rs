mod concurrent_tests;

use crate::{Item, Registry};
use std::sync::{Arc, Mutex};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Registry that records the key of every item it frees.
pub(crate) fn recording_registry(threshold: Option<usize>) -> (Registry, Arc<Mutex<Vec<i64>>>) {
    init_logging();
    let freed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&freed);
    let registry = Registry::builder()
        .auto_reclaim_threshold(threshold)
        .on_reclaim(move |item: &Item| sink.lock().unwrap().push(item.key()))
        .build();
    (registry, freed)
}
