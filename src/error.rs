use crate::item::{Key, PAYLOAD_CAPACITY};
use std::fmt;

/// Programming errors detected by the reclamation machinery.
///
/// These never happen through the safe API unless the crate itself is broken,
/// with the exception of `LeakedReader`, which is reachable by forgetting a
/// `ReaderToken` with `std::mem::forget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    /// An item reached the free path after it had already been reclaimed.
    DoubleReclaim { key: Key, serial: u64 },
    /// An item was about to be freed while a reader could still observe it.
    PrematureReclaim {
        key: Key,
        retire_epoch: usize,
        oldest_observable: usize,
    },
    /// A reader went away while one of its tokens was still registered.
    LeakedReader { epoch: usize },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::DoubleReclaim { key, serial } => {
                write!(f, "item {} (serial {}) reclaimed twice", key, serial)
            }
            InvariantViolation::PrematureReclaim {
                key,
                retire_epoch,
                oldest_observable,
            } => write!(
                f,
                "item {} retired at epoch {} reclaimed before grace period (oldest observable epoch {})",
                key, retire_epoch, oldest_observable
            ),
            InvariantViolation::LeakedReader { epoch } => {
                write!(f, "reader dropped while still pinned at epoch {}", epoch)
            }
        }
    }
}

/// Errors returned by [`Registry`](crate::Registry) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A live item already uses this key.
    DuplicateKey(Key),
    /// No live item has this key.
    NotFound(Key),
    /// The item could not be allocated, either because the allocator failed
    /// or because the configured capacity is exhausted.
    OutOfMemory,
    /// Payload does not fit the fixed item buffer.
    PayloadTooLong { len: usize },
    /// The registry has been shut down and accepts no more mutations.
    ShutDown,
    /// A bounded shutdown gave up waiting for readers to leave.
    Timeout {
        pending: usize,
        active_readers: usize,
    },
    InvariantViolation(InvariantViolation),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateKey(key) => write!(f, "key {} already present", key),
            RegistryError::NotFound(key) => write!(f, "key {} not found", key),
            RegistryError::OutOfMemory => write!(f, "out of memory"),
            RegistryError::PayloadTooLong { len } => write!(
                f,
                "payload of {} bytes exceeds the {} byte limit",
                len, PAYLOAD_CAPACITY
            ),
            RegistryError::ShutDown => write!(f, "registry is shut down"),
            RegistryError::Timeout {
                pending,
                active_readers,
            } => write!(
                f,
                "timed out waiting for grace period: {} items pending, {} readers active",
                pending, active_readers
            ),
            RegistryError::InvariantViolation(violation) => {
                write!(f, "invariant violation: {}", violation)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<InvariantViolation> for RegistryError {
    fn from(violation: InvariantViolation) -> Self {
        RegistryError::InvariantViolation(violation)
    }
}
