use crate::error::RegistryError;
use crate::item::{Item, Key};
use crate::sync::{AtomicPtr, Ordering};
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

/// A list node. Owned by the list while linked, by the reclamation queue
/// once unlinked.
pub(crate) struct Node {
    pub(crate) item: Item,
    pub(crate) next: AtomicPtr<Node>,
}

impl Node {
    /// Allocate a node without aborting on allocation failure.
    pub(crate) fn try_alloc(item: Item) -> Result<NonNull<Node>, RegistryError> {
        let layout = Layout::new::<Node>();
        // SAFETY: `Node` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) } as *mut Node;
        let node = NonNull::new(raw).ok_or(RegistryError::OutOfMemory)?;

        // SAFETY: freshly allocated with the layout of `Node`.
        unsafe {
            node.as_ptr().write(Node {
                item,
                next: AtomicPtr::new(ptr::null_mut()),
            });
        }
        Ok(node)
    }

    /// Drop and deallocate a node.
    ///
    /// # Safety
    /// `node` must come from `try_alloc`, must be unreachable by every reader,
    /// and must not be freed again.
    pub(crate) unsafe fn free(node: NonNull<Node>) {
        // `try_alloc` used the global allocator with `Layout::new::<Node>()`,
        // which is exactly what `Box<Node>` expects.
        unsafe {
            drop(Box::from_raw(node.as_ptr()));
        }
    }
}

/// Writer-only bookkeeping. Reachable only through the writer lock, so a
/// `&mut WriterState` doubles as proof that the caller is the writer.
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    pub(crate) len: usize,
    pub(crate) next_serial: u64,
    pub(crate) closed: bool,
}

/// Insertion-ordered singly linked list.
///
/// Readers walk it with plain acquire loads. The writer publishes new nodes
/// with a release store of the predecessor's `next`, and unlinks by swinging
/// the predecessor past the victim. An unlinked node keeps its own `next`
/// so a reader standing on it can still finish the walk.
pub(crate) struct List {
    head: AtomicPtr<Node>,
}

impl List {
    pub(crate) fn new() -> Self {
        List {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn first(&self) -> *const Node {
        self.head.load(Ordering::Acquire)
    }

    /// Find the live item with `key`.
    ///
    /// # Safety
    /// The caller must be inside a read section (or hold the writer lock)
    /// for the whole of `'g`.
    pub(crate) unsafe fn find<'g>(&self, key: Key) -> Option<&'g Item> {
        let mut cur = self.first();
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.item.key() == key {
                return Some(&node.item);
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Check that `key` is free and return the current tail.
    pub(crate) fn tail_for_insert(
        &self,
        key: Key,
        _writer: &WriterState,
    ) -> Result<*mut Node, RegistryError> {
        let mut last = ptr::null_mut();
        let mut cur = self.head.load(Ordering::Acquire);
        // SAFETY: the writer lock is held, so nothing linked can be unlinked
        // or freed underneath us.
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.item.key() == key {
                return Err(RegistryError::DuplicateKey(key));
            }
            last = cur;
            cur = node.next.load(Ordering::Acquire);
        }
        Ok(last)
    }

    /// Publish `node` after `tail` (or as head when `tail` is null).
    pub(crate) fn link_after(&self, tail: *mut Node, node: NonNull<Node>, writer: &mut WriterState) {
        // SAFETY: `tail` was returned by `tail_for_insert` under the same lock.
        match unsafe { tail.as_ref() } {
            Some(tail) => tail.next.store(node.as_ptr(), Ordering::Release),
            None => self.head.store(node.as_ptr(), Ordering::Release),
        }
        writer.len += 1;
    }

    /// Unlink the item with `key`. The node stays allocated and keeps its
    /// `next` pointer intact.
    pub(crate) fn unlink(&self, key: Key, writer: &mut WriterState) -> Option<NonNull<Node>> {
        let mut prev: *mut Node = ptr::null_mut();
        let mut cur = self.head.load(Ordering::Acquire);

        // SAFETY: writer lock held.
        while let Some(node) = unsafe { cur.as_ref() } {
            let next = node.next.load(Ordering::Acquire);
            if node.item.key() == key {
                match unsafe { prev.as_ref() } {
                    Some(prev) => prev.next.store(next, Ordering::Release),
                    None => self.head.store(next, Ordering::Release),
                }
                writer.len -= 1;
                return NonNull::new(cur);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Unlink the first node, used when tearing the list down.
    pub(crate) fn unlink_front(&self, writer: &mut WriterState) -> Option<NonNull<Node>> {
        let first = NonNull::new(self.head.load(Ordering::Acquire))?;
        // SAFETY: writer lock held.
        let next = unsafe { first.as_ref() }.next.load(Ordering::Acquire);
        self.head.store(next, Ordering::Release);
        writer.len -= 1;
        Some(first)
    }
}

impl Drop for List {
    fn drop(&mut self) {
        // With `&mut self` no reader can be walking the list any more.
        let mut cur = self.head.load(Ordering::Relaxed);
        while let Some(node) = NonNull::new(cur) {
            cur = unsafe { node.as_ref() }.next.load(Ordering::Relaxed);
            unsafe { Node::free(node) };
        }
    }
}
