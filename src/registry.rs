use crate::detector::{self, Observation};
use crate::error::{InvariantViolation, RegistryError};
use crate::garbage;
use crate::item::{Handle, Item, Key, Payload};
use crate::list::Node;
use crate::reader::LocalEpoch;
use crate::state::{
    AUTO_RECLAIM_THRESHOLD, Config, DEFAULT_CLEANUP_INTERVAL, INACTIVE_EPOCH, ReclaimCallback,
    SharedState,
};
use crate::sync::{Arc, Ordering, yield_now};
use std::ptr::NonNull;
use std::time::{Duration, Instant};
use std::vec::Vec;

/// Spins before the shutdown wait starts sleeping.
const SPIN_LIMIT: u32 = 64;

/// Builder for configuring a [`Registry`].
///
/// # Example
/// ```
/// use epoch_registry::Registry;
///
/// let registry = Registry::builder()
///     .auto_reclaim_threshold(128)
///     .cleanup_interval(32)
///     .capacity(1024)
///     .build();
/// assert!(registry.add(1, "one").is_ok());
/// ```
pub struct RegistryBuilder {
    auto_reclaim_threshold: Option<usize>,
    cleanup_interval: usize,
    capacity: Option<usize>,
    on_reclaim: Option<ReclaimCallback>,
    read_section_warning: Option<Duration>,
}

impl RegistryBuilder {
    /// Create a new builder with default settings.
    #[inline]
    pub fn new() -> Self {
        Self {
            auto_reclaim_threshold: Some(AUTO_RECLAIM_THRESHOLD),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            capacity: None,
            on_reclaim: None,
            read_section_warning: None,
        }
    }

    /// Set the automatic reclamation threshold.
    ///
    /// When a removal leaves more than this many items in the reclamation
    /// queue, a drain runs right away. Pass `None` to only reclaim on
    /// [`Registry::force_reclaim`] and [`Registry::shutdown`].
    ///
    /// Default: `Some(64)`
    #[inline]
    pub fn auto_reclaim_threshold(mut self, threshold: impl Into<Option<usize>>) -> Self {
        self.auto_reclaim_threshold = threshold.into();
        self
    }

    /// Set the cleanup interval for dead reader slots.
    ///
    /// Slots of dropped readers are pruned every N drain cycles.
    /// Set to `0` to disable pruning (not recommended).
    ///
    /// Default: `16`
    #[inline]
    pub fn cleanup_interval(mut self, interval: usize) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Bound the number of allocated items, counting both live items and
    /// removed items whose memory has not been reclaimed yet. Inserts past
    /// the bound fail with [`RegistryError::OutOfMemory`].
    ///
    /// Default: unbounded
    #[inline]
    pub fn capacity(mut self, capacity: impl Into<Option<usize>>) -> Self {
        self.capacity = capacity.into();
        self
    }

    /// Run `callback` on every item right before its memory is freed.
    ///
    /// The callback runs on whichever thread performs the drain, outside
    /// every internal lock.
    #[inline]
    pub fn on_reclaim<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Item) + Send + Sync + 'static,
    {
        self.on_reclaim = Some(std::sync::Arc::new(callback));
        self
    }

    /// Log a warning whenever a read section stays open longer than `limit`.
    #[inline]
    pub fn read_section_warning(mut self, limit: Duration) -> Self {
        self.read_section_warning = Some(limit);
        self
    }

    #[inline]
    pub fn build(self) -> Registry {
        let config = Config {
            auto_reclaim_threshold: self.auto_reclaim_threshold,
            cleanup_interval: self.cleanup_interval,
            capacity: self.capacity,
            on_reclaim: self.on_reclaim,
            read_section_warning: self.read_section_warning,
        };

        Registry {
            shared: Arc::new(SharedState::new(config)),
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What a successful removal hands back: the identity of the unlinked item
/// and the epoch it was retired at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    pub key: Key,
    pub serial: u64,
    pub retire_epoch: usize,
}

/// Point-in-time counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Items currently linked.
    pub live: usize,
    /// Items unlinked but not yet freed.
    pub pending_reclaim: usize,
    /// Items freed so far.
    pub reclaimed: usize,
    pub epoch: usize,
    pub active_readers: usize,
    pub violations: usize,
}

/// A read-mostly keyed registry.
///
/// Readers register once with [`register_reader`](Self::register_reader) and
/// then open cheap read sections that never take a lock. Mutations are
/// serialized on one writer lock, held only for the structural change.
/// Removed items are freed by a drain once no read section that could have
/// seen them is still open.
///
/// `Registry` is `Clone`; clones share the same contents.
///
/// ```
/// use epoch_registry::Registry;
///
/// let registry = Registry::new();
/// registry.add(1, "a").unwrap();
/// registry.add(2, "b").unwrap();
///
/// let reader = registry.register_reader();
/// {
///     let token = reader.enter();
///     assert_eq!(token.lookup(2).map(|item| item.payload()), Some("b"));
///
///     // The removed item stays readable for this section.
///     let item = token.lookup(1).unwrap();
///     registry.remove(1).unwrap();
///     assert_eq!(registry.force_reclaim(), Ok(0));
///     assert_eq!(item.payload(), "a");
/// }
/// assert_eq!(registry.force_reclaim(), Ok(1));
/// ```
#[derive(Clone)]
pub struct Registry {
    pub(crate) shared: Arc<SharedState>,
}

impl Registry {
    /// Create a registry with default settings.
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[inline]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Register a new reader.
    ///
    /// Keep the returned `LocalEpoch` around and reuse it for every read
    /// section on that thread.
    #[inline]
    pub fn register_reader(&self) -> LocalEpoch {
        LocalEpoch::new(self.shared.clone())
    }

    /// Insert a new item at the end of the registry.
    pub fn add(&self, key: Key, payload: &str) -> Result<Handle, RegistryError> {
        let payload = Payload::new(payload)?;

        let mut writer = self.shared.writer.lock();
        if writer.closed {
            return Err(RegistryError::ShutDown);
        }

        let tail = self.shared.list.tail_for_insert(key, &writer)?;

        if let Some(capacity) = self.shared.config.capacity {
            // Only inserts raise the count, and they are serialized here.
            if self.shared.allocated.load(Ordering::Acquire) >= capacity {
                return Err(RegistryError::OutOfMemory);
            }
        }

        let serial = writer.next_serial;
        let node = Node::try_alloc(Item::new(key, payload, serial))?;
        writer.next_serial += 1;
        self.shared.allocated.fetch_add(1, Ordering::AcqRel);
        self.shared.list.link_after(tail, node, &mut writer);
        drop(writer);

        log::debug!("added key={} payload={:?} serial={}", key, payload, serial);
        Ok(Handle { key, serial })
    }

    /// Unlink the item with `key` and hand it to the reclamation queue.
    ///
    /// Returns as soon as the item is invisible to new read sections; its
    /// memory is freed by a later drain.
    pub fn remove(&self, key: Key) -> Result<Retired, RegistryError> {
        let (node, retired) = {
            let mut writer = self.shared.writer.lock();
            let node = self
                .shared
                .list
                .unlink(key, &mut writer)
                .ok_or(RegistryError::NotFound(key))?;
            (node, self.stamp(node))
        };

        log::debug!(
            "removed key={} serial={} retire_epoch={}",
            retired.key,
            retired.serial,
            retired.retire_epoch
        );

        self.retire(node, retired.retire_epoch);
        Ok(retired)
    }

    /// Bump the epoch and stamp `node` with the value from before the bump.
    /// Called under the writer lock, right after the unlink.
    fn stamp(&self, node: NonNull<Node>) -> Retired {
        let retire_epoch = self.shared.global_epoch.fetch_add(1, Ordering::SeqCst);
        // SAFETY: the node was just unlinked under the writer lock and
        // nothing can free it before it is queued.
        let item = unsafe { &node.as_ref().item };
        item.mark_unlinked(retire_epoch);

        Retired {
            key: item.key(),
            serial: item.serial(),
            retire_epoch,
        }
    }

    fn retire(&self, node: NonNull<Node>, retire_epoch: usize) {
        let over_threshold = {
            let mut queue = self.shared.garbage.lock();
            queue.retire(node, retire_epoch);
            self.shared
                .config
                .auto_reclaim_threshold
                .is_some_and(|threshold| queue.len() > threshold)
        };

        if over_threshold {
            if let Err(err) = self.drain() {
                log::error!("automatic reclamation failed: {}", err);
            }
        }
    }

    /// One detector scan plus one queue drain.
    fn drain(&self) -> Result<usize, RegistryError> {
        let (bags, observation) = {
            let mut queue = self.shared.garbage.lock();
            let observation: Observation = detector::observe(&self.shared);
            (queue.take_reclaimable(observation.oldest_observable), observation)
        };

        if bags.is_empty() {
            return Ok(0);
        }

        let outcome = garbage::reclaim(
            bags,
            observation.oldest_observable,
            self.shared.config.on_reclaim.as_ref(),
        );

        self.shared
            .allocated
            .fetch_sub(outcome.freed + outcome.leaked, Ordering::AcqRel);
        self.shared
            .reclaimed
            .fetch_add(outcome.freed, Ordering::Relaxed);

        log::trace!(
            "drained {} items below epoch {} ({} readers active)",
            outcome.freed,
            observation.oldest_observable,
            observation.active_readers
        );

        match outcome.violation {
            Some(violation) => {
                self.shared
                    .violations
                    .fetch_add(outcome.leaked, Ordering::Relaxed);
                Err(violation.into())
            }
            None => Ok(outcome.freed),
        }
    }

    /// Free every retired item whose grace period has ended, returning how
    /// many were freed. Safe to call from any thread at any time.
    #[inline]
    pub fn force_reclaim(&self) -> Result<usize, RegistryError> {
        self.drain()
    }

    /// Owned copy of a live item, read in a short-lived section.
    pub fn lookup(&self, key: Key) -> Option<(Key, String)> {
        let reader = self.register_reader();
        let token = reader.enter();
        token.lookup(key).map(Item::entry)
    }

    /// Owned copy of every live item in insertion order, read in one section.
    pub fn entries(&self) -> Vec<(Key, String)> {
        let reader = self.register_reader();
        let token = reader.enter();
        token.iter().map(Item::entry).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let (live, allocated) = {
            let writer = self.shared.writer.lock();
            (writer.len, self.shared.allocated.load(Ordering::Acquire))
        };

        RegistryStats {
            live,
            pending_reclaim: allocated.saturating_sub(live),
            reclaimed: self.shared.reclaimed.load(Ordering::Relaxed),
            epoch: self.shared.global_epoch.load(Ordering::Acquire),
            active_readers: detector::active_readers(&self.shared),
            violations: self.shared.violations.load(Ordering::Relaxed),
        }
    }

    /// Unlink and retire every item, then block until all of them are freed.
    ///
    /// If a reader was dropped with a forgotten token since the last
    /// shutdown, everything is still freed but the call reports
    /// [`InvariantViolation::LeakedReader`].
    ///
    /// Later inserts fail with [`RegistryError::ShutDown`]. Never call this
    /// while holding a [`ReaderToken`](crate::ReaderToken) on the same
    /// thread: the grace period can then never end. Use
    /// [`shutdown_timeout`](Self::shutdown_timeout) to bound the wait.
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        self.shutdown_inner(None)
    }

    /// Like [`shutdown`](Self::shutdown), but gives up with
    /// [`RegistryError::Timeout`] once `timeout` has passed. Everything is
    /// still retired in that case; a later `force_reclaim` or `shutdown`
    /// finishes the job.
    pub fn shutdown_timeout(&self, timeout: Duration) -> Result<(), RegistryError> {
        self.shutdown_inner(Some(Instant::now() + timeout))
    }

    fn shutdown_inner(&self, deadline: Option<Instant>) -> Result<(), RegistryError> {
        let retired = {
            let mut writer = self.shared.writer.lock();
            writer.closed = true;

            let mut retired = Vec::with_capacity(writer.len);
            while let Some(node) = self.shared.list.unlink_front(&mut writer) {
                let stamp = self.stamp(node);
                retired.push((node, stamp.retire_epoch));
            }
            retired
        };

        log::info!("shutting down: retiring {} remaining items", retired.len());

        {
            let mut queue = self.shared.garbage.lock();
            for (node, retire_epoch) in retired {
                queue.retire(node, retire_epoch);
            }
        }

        let mut step = 0u32;
        loop {
            self.drain()?;

            // Includes removals that unlinked before we closed the registry
            // but have not reached the queue yet.
            let pending = self.shared.allocated.load(Ordering::Acquire);
            if pending == 0 {
                break;
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let active_readers = detector::active_readers(&self.shared);
                    log::warn!(
                        "shutdown timed out with {} items pending and {} readers active",
                        pending,
                        active_readers
                    );
                    return Err(RegistryError::Timeout {
                        pending,
                        active_readers,
                    });
                }
            }

            snooze(&mut step);
        }

        let leaked = self
            .shared
            .leaked_reader_epoch
            .swap(INACTIVE_EPOCH, Ordering::AcqRel);
        if leaked != INACTIVE_EPOCH {
            let violation = InvariantViolation::LeakedReader { epoch: leaked };
            log::error!("shutdown found a leaked reader: {}", violation);
            return Err(violation.into());
        }

        log::info!("shutdown complete");
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("shared", &self.shared)
            .finish()
    }
}

fn snooze(step: &mut u32) {
    if *step < SPIN_LIMIT {
        std::hint::spin_loop();
    } else if *step < SPIN_LIMIT * 2 {
        yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
    *step = step.saturating_add(1);
}
