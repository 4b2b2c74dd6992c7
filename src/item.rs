use crate::error::RegistryError;
use crate::sync::{AtomicU8, AtomicUsize, Ordering};
use std::fmt;

/// Key type of registry items.
pub type Key = i64;

/// Maximum payload length in bytes.
pub const PAYLOAD_CAPACITY: usize = 31;

/// Marker for an item that has not been retired yet.
pub(crate) const NOT_RETIRED: usize = usize::MAX;

/// A short UTF-8 string stored inline in the item.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Payload {
    len: u8,
    bytes: [u8; PAYLOAD_CAPACITY],
}

impl Payload {
    /// Copy `s` into a fixed buffer, rejecting strings longer than
    /// [`PAYLOAD_CAPACITY`] bytes.
    pub fn new(s: &str) -> Result<Self, RegistryError> {
        let len = s.len();
        if len > PAYLOAD_CAPACITY {
            return Err(RegistryError::PayloadTooLong { len });
        }

        let mut bytes = [0u8; PAYLOAD_CAPACITY];
        bytes[..len].copy_from_slice(s.as_bytes());
        Ok(Payload {
            len: len as u8,
            bytes,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // The buffer is only ever filled from a whole `&str`.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Payload {
    type Error = RegistryError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Payload::new(s)
    }
}

/// Where an item is in its life.
///
/// `Live -> Unlinked -> Reclaimed`, never skipped, never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Live = 0,
    Unlinked = 1,
    Reclaimed = 2,
}

impl Lifecycle {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Live,
            1 => Lifecycle::Unlinked,
            _ => Lifecycle::Reclaimed,
        }
    }
}

/// A registry entry.
///
/// Readers only ever see `&Item` borrowed from a [`ReaderToken`](crate::ReaderToken),
/// so the reference cannot outlive the read section that protects it.
pub struct Item {
    key: Key,
    payload: Payload,
    serial: u64,
    retire_epoch: AtomicUsize,
    lifecycle: AtomicU8,
}

impl Item {
    pub(crate) fn new(key: Key, payload: Payload, serial: u64) -> Self {
        Item {
            key,
            payload,
            serial,
            retire_epoch: AtomicUsize::new(NOT_RETIRED),
            lifecycle: AtomicU8::new(Lifecycle::Live as u8),
        }
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    pub fn payload(&self) -> &str {
        self.payload.as_str()
    }

    /// Unique per registry; distinguishes a re-inserted key from the
    /// instance it replaced.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The epoch this item was retired at, if it has been unlinked.
    #[inline]
    pub fn retire_epoch(&self) -> Option<usize> {
        match self.retire_epoch.load(Ordering::Acquire) {
            NOT_RETIRED => None,
            epoch => Some(epoch),
        }
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Writer side of `Live -> Unlinked`. Called under the writer lock.
    pub(crate) fn mark_unlinked(&self, retire_epoch: usize) {
        self.retire_epoch.store(retire_epoch, Ordering::Release);
        let prev = self
            .lifecycle
            .swap(Lifecycle::Unlinked as u8, Ordering::AcqRel);
        debug_assert_eq!(prev, Lifecycle::Live as u8, "unlinked an item that was not live");
    }

    /// `Unlinked -> Reclaimed`. Returns `false` if the item was not in the
    /// unlinked state, which means something tried to free it twice.
    pub(crate) fn mark_reclaimed(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Unlinked as u8,
                Lifecycle::Reclaimed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn entry(&self) -> (Key, String) {
        (self.key, self.payload().to_owned())
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("serial", &self.serial)
            .field("retire_epoch", &self.retire_epoch())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Returned by a successful insert. Identifies one specific instance of a
/// key, so a reader can later check whether that exact item is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) key: Key,
    pub(crate) serial: u64,
}

impl Handle {
    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }
}
