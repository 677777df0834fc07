use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use keystone_types::Oid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serialization::Serialization;

/// Lifecycle of a managed reference within one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReferenceState {
    /// Known by oid only; the payload has not been loaded.
    Empty,
    /// Created in this transaction; never stored before.
    New,
    /// Loaded and unchanged.
    NotModified,
    /// Loaded and marked for write.
    Modified,
    /// Removed without ever being loaded.
    RemovedEmpty,
    /// Removed after being loaded or created.
    RemovedFetched,
}

impl ReferenceState {
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::RemovedEmpty | Self::RemovedFetched)
    }

    /// States whose payload is written on flush.
    pub fn needs_flush(&self) -> bool {
        matches!(self, Self::New | Self::Modified)
    }
}

/// A typed pointer to a managed object.
///
/// A `ManagedRef` is only an oid: it may be stored inside other managed
/// objects and carried across transactions. Resolving it to the object always
/// goes through a [`crate::Transaction`].
pub struct ManagedRef<T> {
    oid: Oid,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ManagedRef<T> {
    pub fn from_oid(oid: Oid) -> Self {
        Self {
            oid,
            _marker: PhantomData,
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }
}

impl<T> Clone for ManagedRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ManagedRef<T> {}

impl<T> PartialEq for ManagedRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
    }
}

impl<T> Eq for ManagedRef<T> {}

impl<T> std::hash::Hash for ManagedRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.oid.hash(state);
    }
}

impl<T> fmt::Debug for ManagedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedRef<{}>({})", std::any::type_name::<T>(), self.oid)
    }
}

impl<T> Serialize for ManagedRef<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.oid.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for ManagedRef<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Oid::deserialize(deserializer).map(Self::from_oid)
    }
}

/// One row of a transaction's reference table.
pub(crate) struct ManagedReference {
    pub(crate) state: ReferenceState,
    pub(crate) object: Option<Box<dyn Any + Send>>,
    pub(crate) serialization: Arc<dyn Serialization>,
}

impl ManagedReference {
    pub(crate) fn empty(serialization: Arc<dyn Serialization>) -> Self {
        Self {
            state: ReferenceState::Empty,
            object: None,
            serialization,
        }
    }

    pub(crate) fn new_object(object: Box<dyn Any + Send>, serialization: Arc<dyn Serialization>) -> Self {
        Self {
            state: ReferenceState::New,
            object: Some(object),
            serialization,
        }
    }

    /// Hand the cached payload back to its strategy and clear it.
    pub(crate) fn finalize(&mut self) {
        if let Some(object) = self.object.take() {
            self.serialization.finalize(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Room;

    #[test]
    fn managed_ref_serializes_as_oid() {
        let r: ManagedRef<Room> = ManagedRef::from_oid(Oid::new(0x2a));
        let bytes = bincode::serialize(&r).unwrap();
        assert_eq!(bytes, bincode::serialize(&Oid::new(0x2a)).unwrap());

        let back: ManagedRef<Room> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn flush_and_removed_states() {
        assert!(ReferenceState::New.needs_flush());
        assert!(ReferenceState::Modified.needs_flush());
        assert!(!ReferenceState::NotModified.needs_flush());
        assert!(!ReferenceState::RemovedFetched.needs_flush());
        assert!(ReferenceState::RemovedEmpty.is_removed());
        assert!(!ReferenceState::Empty.is_removed());
    }
}
