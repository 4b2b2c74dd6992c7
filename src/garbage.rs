use crate::error::InvariantViolation;
use crate::list::Node;
use crate::state::ReclaimCallback;
use std::collections::VecDeque;
use std::mem;
use std::ptr::NonNull;
use std::vec::Vec;

/// An unlinked node waiting for its grace period to end.
pub(crate) struct RetiredNode {
    node: NonNull<Node>,
}

// SAFETY: the node is unreachable for new readers and owned solely by the
// queue; moving that ownership between threads is fine.
unsafe impl Send for RetiredNode {}

impl RetiredNode {
    fn into_raw(self) -> NonNull<Node> {
        let node = self.node;
        mem::forget(self);
        node
    }
}

impl Drop for RetiredNode {
    /// Only reached when the whole registry is torn down, at which point no
    /// reader can exist any more.
    fn drop(&mut self) {
        let node = unsafe { self.node.as_ref() };
        if node.item.mark_reclaimed() {
            unsafe { Node::free(self.node) };
        }
    }
}

/// Result of one drain pass.
#[derive(Debug, Default)]
pub(crate) struct DrainOutcome {
    pub(crate) freed: usize,
    pub(crate) leaked: usize,
    pub(crate) violation: Option<InvariantViolation>,
}

/// Retired nodes grouped in bags by retire epoch, oldest first.
pub(crate) struct ReclamationQueue {
    queue: VecDeque<(usize, Vec<RetiredNode>)>,
    count: usize,
}

impl ReclamationQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            count: 0,
        }
    }

    /// Total number of retired nodes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Queue an unlinked node stamped with `retire_epoch`.
    ///
    /// Removals are stamped under the writer lock but retired after it is
    /// released, so two racing removers can arrive out of order. The bag
    /// order is kept sorted either way.
    pub(crate) fn retire(&mut self, node: NonNull<Node>, retire_epoch: usize) {
        let node = RetiredNode { node };

        let last_epoch = self.queue.back().map(|(epoch, _)| *epoch);

        match last_epoch {
            Some(last) if last == retire_epoch => {
                if let Some((_, bag)) = self.queue.back_mut() {
                    bag.push(node);
                }
            }
            Some(last) if last > retire_epoch => {
                let at = self.queue.partition_point(|(epoch, _)| *epoch < retire_epoch);
                match self.queue.get_mut(at) {
                    Some((epoch, bag)) if *epoch == retire_epoch => bag.push(node),
                    _ => self.queue.insert(at, (retire_epoch, vec![node])),
                }
            }
            _ => self.queue.push_back((retire_epoch, vec![node])),
        }

        self.count += 1;
    }

    /// Detach every bag whose epoch is strictly older than
    /// `oldest_observable`. The caller frees them with [`reclaim`] outside
    /// the queue lock.
    pub(crate) fn take_reclaimable(&mut self, oldest_observable: usize) -> Vec<(usize, Vec<RetiredNode>)> {
        let mut taken = Vec::new();
        while let Some((epoch, _)) = self.queue.front() {
            if *epoch >= oldest_observable {
                break;
            }
            if let Some(bag) = self.queue.pop_front() {
                self.count -= bag.1.len();
                taken.push(bag);
            }
        }
        taken
    }
}

/// Free detached bags, checking each node's stamp and lifecycle first.
///
/// A node that fails a check is leaked rather than freed.
pub(crate) fn reclaim(
    bags: Vec<(usize, Vec<RetiredNode>)>,
    oldest_observable: usize,
    on_reclaim: Option<&ReclaimCallback>,
) -> DrainOutcome {
    let mut outcome = DrainOutcome::default();

    for (_, bag) in bags {
        for retired in bag {
            let node = retired.into_raw();
            let item = unsafe { &node.as_ref().item };

            let retire_epoch = item.retire_epoch();
            if !matches!(retire_epoch, Some(epoch) if epoch < oldest_observable) {
                let violation = InvariantViolation::PrematureReclaim {
                    key: item.key(),
                    retire_epoch: retire_epoch.unwrap_or(usize::MAX),
                    oldest_observable,
                };
                report(&mut outcome, violation);
                continue;
            }

            if !item.mark_reclaimed() {
                let violation = InvariantViolation::DoubleReclaim {
                    key: item.key(),
                    serial: item.serial(),
                };
                report(&mut outcome, violation);
                continue;
            }

            if let Some(callback) = on_reclaim {
                callback(item);
            }
            log::debug!(
                "reclaiming key={} payload={:?} retire_epoch={}",
                item.key(),
                item.payload(),
                retire_epoch.unwrap_or_default()
            );

            // SAFETY: the node is unlinked, its grace period is over, and
            // the lifecycle CAS above guarantees this is the only free.
            unsafe { Node::free(node) };
            outcome.freed += 1;
        }
    }

    outcome
}

fn report(outcome: &mut DrainOutcome, violation: InvariantViolation) {
    log::error!("{}", violation);
    debug_assert!(false, "{}", violation);
    outcome.leaked += 1;
    outcome.violation.get_or_insert(violation);
}
