use crate::garbage::ReclamationQueue;
use crate::item::Item;
use crate::list::{List, WriterState};
use crate::sync::{Arc, AtomicUsize, Mutex};
use std::fmt;
use std::time::Duration;
use std::vec::Vec;

/// Default threshold for automatic reclamation (count of retired items).
pub(crate) const AUTO_RECLAIM_THRESHOLD: usize = 64;

/// Default interval for cleaning up dead reader slots (in drain cycles).
pub(crate) const DEFAULT_CLEANUP_INTERVAL: usize = 16;

/// Represents a reader that is not currently inside a read section.
pub(crate) const INACTIVE_EPOCH: usize = usize::MAX;

pub(crate) type ReclaimCallback = std::sync::Arc<dyn Fn(&Item) + Send + Sync + 'static>;

/// A slot allocated for a reader to publish the epoch of its open section.
///
/// Cache-aligned to prevent false sharing between readers.
#[derive(Debug)]
#[repr(align(64))]
pub(crate) struct ReaderSlot {
    /// The epoch captured at section entry, or `INACTIVE_EPOCH`.
    pub(crate) active_epoch: AtomicUsize,
}

impl ReaderSlot {
    pub(crate) fn new() -> Self {
        ReaderSlot {
            active_epoch: AtomicUsize::new(INACTIVE_EPOCH),
        }
    }
}

/// Settings fixed at build time.
pub(crate) struct Config {
    pub(crate) auto_reclaim_threshold: Option<usize>,
    pub(crate) cleanup_interval: usize,
    pub(crate) capacity: Option<usize>,
    pub(crate) on_reclaim: Option<ReclaimCallback>,
    pub(crate) read_section_warning: Option<Duration>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("auto_reclaim_threshold", &self.auto_reclaim_threshold)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("capacity", &self.capacity)
            .field("on_reclaim", &self.on_reclaim.is_some())
            .field("read_section_warning", &self.read_section_warning)
            .finish()
    }
}

/// Process-wide state of one registry: the list, the epoch counter, the
/// reader slots and the reclamation queue.
#[repr(align(64))]
pub(crate) struct SharedState {
    /// Bumped once per successful removal.
    pub(crate) global_epoch: AtomicUsize,
    /// All registered reader slots. Only touched on reader registration and
    /// by the detector, never on section entry or exit.
    pub(crate) readers: Mutex<Vec<Arc<ReaderSlot>>>,
    pub(crate) list: List,
    /// The exclusive writer lock.
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) garbage: Mutex<ReclamationQueue>,
    /// Items allocated and not yet freed: live plus unlinked.
    pub(crate) allocated: AtomicUsize,
    pub(crate) reclaimed: AtomicUsize,
    pub(crate) violations: AtomicUsize,
    pub(crate) drain_cycles: AtomicUsize,
    /// Epoch of the last reader dropped with a forgotten token, or
    /// `INACTIVE_EPOCH`. Reported and cleared by shutdown.
    pub(crate) leaked_reader_epoch: AtomicUsize,
    pub(crate) config: Config,
}

impl SharedState {
    pub(crate) fn new(config: Config) -> Self {
        SharedState {
            global_epoch: AtomicUsize::new(0),
            readers: Mutex::new(Vec::new()),
            list: List::new(),
            writer: Mutex::new(WriterState::default()),
            garbage: Mutex::new(ReclamationQueue::new()),
            allocated: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            drain_cycles: AtomicUsize::new(0),
            leaked_reader_epoch: AtomicUsize::new(INACTIVE_EPOCH),
            config,
        }
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("global_epoch", &self.global_epoch)
            .field("allocated", &self.allocated)
            .field("reclaimed", &self.reclaimed)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
