//! A read-mostly keyed registry with lock-free readers and epoch-based
//! reclamation.
//!
//! Any number of readers traverse the registry without taking a lock while a
//! single writer at a time inserts and removes items. Removed items are not
//! freed on the spot: they are stamped with the epoch they were retired at
//! and queued, and a drain frees them only once every read section that
//! could still observe them has ended.
//!
//! The moving parts:
//! - the registry itself, an insertion-ordered linked list;
//! - reader slots publishing the epoch each open read section started at;
//! - the grace-period detector, which finds the oldest epoch still observable;
//! - the reclamation queue, holding unlinked items until that epoch passes them;
//! - the writer coordinator, [`Registry`], which ties them together.
//!
//! ```
//! use epoch_registry::{Registry, RegistryError};
//!
//! let registry = Registry::new();
//! registry.add(1, "a")?;
//! registry.add(2, "b")?;
//! registry.add(3, "c")?;
//!
//! registry.remove(2)?;
//! assert_eq!(registry.entries(), vec![(1, "a".to_owned()), (3, "c".to_owned())]);
//! assert_eq!(registry.force_reclaim()?, 1);
//!
//! assert_eq!(registry.remove(2), Err(RegistryError::NotFound(2)));
//! assert_eq!(registry.add(1, "x"), Err(RegistryError::DuplicateKey(1)));
//!
//! // Readers register once and then enter sections without locking.
//! let reader = registry.register_reader();
//! let token = reader.enter();
//! let keys: Vec<i64> = token.iter().map(|item| item.key()).collect();
//! assert_eq!(keys, vec![1, 3]);
//! drop(token);
//!
//! registry.shutdown()?;
//! assert!(registry.entries().is_empty());
//! # Ok::<(), RegistryError>(())
//! ```

mod detector;
mod error;
mod garbage;
mod item;
mod list;
mod reader;
mod registry;
mod state;
mod sync;

pub use error::{InvariantViolation, RegistryError};
pub use item::{Handle, Item, Key, Lifecycle, PAYLOAD_CAPACITY, Payload};
pub use reader::{Iter, LocalEpoch, ReaderToken};
pub use registry::{Registry, RegistryBuilder, RegistryStats, Retired};

#[cfg(test)]
mod tests;
