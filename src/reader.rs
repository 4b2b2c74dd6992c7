use crate::item::{Handle, Item, Key};
use crate::list::Node;
use crate::state::{INACTIVE_EPOCH, ReaderSlot, SharedState};
use crate::sync::{Arc, Cell, Ordering, fence};
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::time::Instant;

/// A reader's registration with one registry.
///
/// Created by [`Registry::register_reader`](crate::Registry::register_reader).
/// Registration takes a short lock once; after that, entering and exiting
/// read sections are a couple of atomic operations with no lock involved.
/// A slot left behind by a dropped reader is handed to the next one, so the
/// slot list stays as long as the peak number of live readers.
///
/// `LocalEpoch` is `!Sync` (due to `Cell`) and must be used by one thread
/// at a time. Each thread should register its own.
pub struct LocalEpoch {
    slot: Arc<ReaderSlot>,
    shared: Arc<SharedState>,
    depth: Cell<usize>,
    entered_at: Cell<Option<Instant>>,
}

impl LocalEpoch {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        let slot = {
            let mut readers = shared.readers.lock();
            // Slots are only cloned under this lock, so a count of one means
            // the owning `LocalEpoch` is gone and nobody can revive it.
            let idle = readers
                .iter()
                .find(|slot| Arc::strong_count(*slot) == 1)
                .cloned();

            match idle {
                Some(slot) => {
                    // Synchronizes with the previous owner's drop, so its
                    // final `INACTIVE_EPOCH` store is ordered before ours.
                    fence(Ordering::Acquire);
                    debug_assert_eq!(slot.active_epoch.load(Ordering::Relaxed), INACTIVE_EPOCH);
                    slot
                }
                None => {
                    let slot = Arc::new(ReaderSlot::new());
                    readers.push(Arc::clone(&slot));
                    slot
                }
            }
        };

        LocalEpoch {
            slot,
            shared,
            depth: Cell::new(0),
            entered_at: Cell::new(None),
        }
    }

    /// Enter a read section.
    ///
    /// The returned token captures the current epoch and publishes it in the
    /// reader's slot. Every item reachable while the token is alive stays
    /// allocated until the token is gone.
    ///
    /// Reentrant: a nested call (or [`ReaderToken::clone`]) keeps the
    /// section open until the last token is dropped, and keeps the epoch of
    /// the outermost entry.
    #[inline]
    pub fn enter(&self) -> ReaderToken<'_> {
        let depth = self.depth.get();

        if depth == 0 {
            let mut epoch = self.shared.global_epoch.load(Ordering::SeqCst);
            loop {
                self.slot.active_epoch.store(epoch, Ordering::SeqCst);
                // Pairs with the fence in `detector::observe`: either the
                // detector sees this slot, or the reload below sees its epoch.
                fence(Ordering::SeqCst);

                // If a removal slipped in between the load and the store, the
                // detector may have scanned without us. Publish the newer
                // epoch instead; nothing has been read yet.
                let current = self.shared.global_epoch.load(Ordering::SeqCst);
                if current == epoch {
                    break;
                }
                epoch = current;
            }

            if self.shared.config.read_section_warning.is_some() {
                self.entered_at.set(Some(Instant::now()));
            }
        }

        self.depth.set(depth + 1);

        ReaderToken {
            reader: self,
            _not_send: PhantomData,
        }
    }

    /// Whether a read section is currently open.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    fn leave(&self) {
        let depth = self.depth.get();

        assert!(
            depth > 0,
            "BUG: leaving a read section that was never entered (depth = 0)"
        );

        if depth == 1 {
            self.slot
                .active_epoch
                .store(INACTIVE_EPOCH, Ordering::Release);

            let started = self.entered_at.get();
            self.entered_at.set(None);
            if let (Some(limit), Some(started)) = (self.shared.config.read_section_warning, started) {
                let elapsed = started.elapsed();
                if elapsed > limit {
                    log::warn!(
                        "read section held for {:?}, longer than {:?}; reclamation was stalled meanwhile",
                        elapsed,
                        limit
                    );
                }
            }
        }

        self.depth.set(depth - 1);
    }
}

impl Drop for LocalEpoch {
    fn drop(&mut self) {
        let depth = self.depth.get();
        if depth > 0 {
            // Only reachable through `mem::forget` on a token. The forgotten
            // token's borrow has ended, so no item reference survives it and
            // the slot can be released.
            let epoch = self.slot.active_epoch.load(Ordering::Relaxed);
            let violation = crate::error::InvariantViolation::LeakedReader { epoch };
            log::error!("{}", violation);
            self.shared.violations.fetch_add(1, Ordering::Relaxed);
            self.shared.leaked_reader_epoch.store(epoch, Ordering::Release);
            self.slot
                .active_epoch
                .store(INACTIVE_EPOCH, Ordering::Release);
        }
    }
}

/// Proof that the holder is inside a read section.
///
/// Dropping the token (or calling [`exit`](Self::exit)) leaves the section,
/// including when the reader unwinds or abandons an iteration half way.
/// Lookups and iteration go through the token, so returned references can
/// never outlive it.
///
/// `!Send` and `!Sync`: a section belongs to the thread that opened it.
#[must_use]
pub struct ReaderToken<'a> {
    reader: &'a LocalEpoch,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReaderToken<'a> {
    /// The epoch captured when the outermost section was entered.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.reader.slot.active_epoch.load(Ordering::Relaxed)
    }

    /// Look up a live item by key.
    #[inline]
    pub fn lookup(&self, key: Key) -> Option<&Item> {
        // SAFETY: the token keeps the section open for the borrow of `self`.
        unsafe { self.reader.shared.list.find(key) }
    }

    /// Re-validate a handle: return the item only if that exact instance is
    /// still reachable.
    pub fn resolve(&self, handle: &Handle) -> Option<&Item> {
        self.lookup(handle.key)
            .filter(|item| item.serial() == handle.serial)
    }

    /// Walk the registry in insertion order.
    ///
    /// The walk may miss items inserted after it started and may still
    /// yield items removed after it started. Call again to restart.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.reader.shared.list.first(),
            _token: PhantomData,
        }
    }

    /// Leave the read section.
    #[inline]
    pub fn exit(self) {
        drop(self);
    }
}

impl<'a> Clone for ReaderToken<'a> {
    /// Clone this token to create a nested section.
    #[inline]
    fn clone(&self) -> Self {
        let depth = self.reader.depth.get();

        assert!(
            depth > 0,
            "BUG: cloning a ReaderToken outside a read section (depth = 0)"
        );

        self.reader.depth.set(depth + 1);

        ReaderToken {
            reader: self.reader,
            _not_send: PhantomData,
        }
    }
}

impl<'a> Drop for ReaderToken<'a> {
    #[inline]
    fn drop(&mut self) {
        self.reader.leave();
    }
}

impl<'a> std::fmt::Debug for ReaderToken<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderToken")
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Lazy walk over the registry, borrowed from a [`ReaderToken`].
#[derive(Clone)]
pub struct Iter<'g> {
    next: *const Node,
    _token: PhantomData<&'g Item>,
}

impl<'g> Iterator for Iter<'g> {
    type Item = &'g Item;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: the token borrowed for 'g keeps every node reachable from
        // the list at entry, and every node reachable from those, allocated.
        let node = unsafe { self.next.as_ref() }?;
        self.next = node.next.load(Ordering::Acquire);
        Some(&node.item)
    }
}

impl<'g> FusedIterator for Iter<'g> {}
