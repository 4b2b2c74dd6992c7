use crate::state::{INACTIVE_EPOCH, SharedState};
use crate::sync::{Arc, Ordering, fence};

/// What the detector saw in one scan of the reader slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Observation {
    /// Retired entries stamped strictly below this are unobservable.
    pub(crate) oldest_observable: usize,
    pub(crate) active_readers: usize,
}

/// Compute the oldest epoch any open read section could still observe.
///
/// With no active reader this is the current global epoch, which is above
/// every stamp handed out so far. A reader that entered after an item was
/// retired carries a larger epoch and therefore never holds that item back.
///
/// The global epoch is read before the slots are scanned: a reader that
/// shows up in between publishes an epoch at least that large, so reading
/// in this order can only under-reclaim.
pub(crate) fn observe(shared: &SharedState) -> Observation {
    let mut oldest_observable = shared.global_epoch.load(Ordering::SeqCst);
    let mut active_readers = 0;

    // Pairs with the fence in `LocalEpoch::enter`.
    fence(Ordering::SeqCst);

    let cycle = shared.drain_cycles.fetch_add(1, Ordering::Relaxed) + 1;
    let interval = shared.config.cleanup_interval;
    let should_cleanup = interval > 0 && cycle % interval == 0;

    let mut readers = shared.readers.lock();
    let mut dead_count = 0;

    for slot in readers.iter() {
        let epoch = slot.active_epoch.load(Ordering::SeqCst);
        if epoch != INACTIVE_EPOCH {
            oldest_observable = oldest_observable.min(epoch);
            active_readers += 1;
        } else if should_cleanup && Arc::strong_count(slot) == 1 {
            // Only this list holds the slot, its `LocalEpoch` is gone.
            dead_count += 1;
        }
    }

    if should_cleanup && dead_count > 0 {
        readers.retain(|slot| Arc::strong_count(slot) > 1);
        log::trace!("pruned {} dead reader slots", dead_count);
    }

    Observation {
        oldest_observable,
        active_readers,
    }
}

/// Count readers currently inside a read section.
pub(crate) fn active_readers(shared: &SharedState) -> usize {
    shared
        .readers
        .lock()
        .iter()
        .filter(|slot| slot.active_epoch.load(Ordering::SeqCst) != INACTIVE_EPOCH)
        .count()
}
