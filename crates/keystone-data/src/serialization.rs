use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DataError, DataResult};

/// A named strategy for turning managed objects into bytes and back.
///
/// Strategies are looked up by name when persisted data is loaded without
/// compile-time knowledge of its type (task recovery, for instance), so the
/// name must stay stable across releases.
pub trait Serialization: Send + Sync {
    fn name(&self) -> &str;

    /// Append the encoded form of `object` to `out`.
    fn serialize(&self, object: &(dyn Any + Send), out: &mut Vec<u8>) -> DataResult<()>;

    fn deserialize(&self, bytes: &[u8]) -> DataResult<Box<dyn Any + Send>>;

    /// Release a payload at the end of its owning transaction.
    fn finalize(&self, object: Box<dyn Any + Send>) {
        drop(object);
    }

    /// Whether `object` is of a type this strategy can encode.
    fn accepts(&self, _object: &(dyn Any + Send)) -> bool {
        true
    }
}

/// `bincode` encoding for any serde type.
pub struct BincodeSerialization<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerialization<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> Serialization for BincodeSerialization<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn serialize(&self, object: &(dyn Any + Send), out: &mut Vec<u8>) -> DataResult<()> {
        let value = object
            .downcast_ref::<T>()
            .ok_or_else(|| DataError::Serialization(format!("{}: expected {}", self.name, type_name::<T>())))?;
        bincode::serialize_into(out, value).map_err(|e| DataError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> DataResult<Box<dyn Any + Send>> {
        let value: T =
            bincode::deserialize(bytes).map_err(|e| DataError::Serialization(e.to_string()))?;
        Ok(Box::new(value))
    }

    fn accepts(&self, object: &(dyn Any + Send)) -> bool {
        object.is::<T>()
    }
}

/// Name-keyed table of serialization strategies.
///
/// Built once at startup and shared behind an `Arc`. Strategies registered
/// with [`SerializationRegistry::register_type`] are also reachable by Rust
/// type, which is what the typed transaction API uses.
#[derive(Default)]
pub struct SerializationRegistry {
    by_name: HashMap<String, Arc<dyn Serialization>>,
    by_type: HashMap<TypeId, String>,
}

impl SerializationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn Serialization>) -> DataResult<()> {
        let name = strategy.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(DataError::DuplicateSerialization(name));
        }
        self.by_name.insert(name, strategy);
        Ok(())
    }

    /// Register a strategy and make it the default for `T`.
    pub fn register_for<T: 'static>(&mut self, strategy: Arc<dyn Serialization>) -> DataResult<()> {
        let name = strategy.name().to_string();
        self.register(strategy)?;
        self.by_type.insert(TypeId::of::<T>(), name);
        Ok(())
    }

    /// Register a [`BincodeSerialization`] for `T` under `name`.
    pub fn register_type<T>(&mut self, name: &str) -> DataResult<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_for::<T>(Arc::new(BincodeSerialization::<T>::new(name)))
    }

    pub fn get(&self, name: &str) -> DataResult<Arc<dyn Serialization>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::UnknownSerialization(name.to_string()))
    }

    /// The default strategy registered for `T`.
    pub fn for_type<T: 'static>(&self) -> DataResult<Arc<dyn Serialization>> {
        let name = self
            .by_type
            .get(&TypeId::of::<T>())
            .ok_or(DataError::UnregisteredType(type_name::<T>()))?;
        self.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl std::fmt::Debug for SerializationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SerializationRegistry")
            .field("strategies", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Player {
        name: String,
        score: u32,
    }

    #[test]
    fn bincode_roundtrip_preserves_fields() {
        let strategy = BincodeSerialization::<Player>::new("player");
        let player = Player {
            name: "ada".into(),
            score: 12,
        };
        let mut bytes = Vec::new();
        strategy.serialize(&player, &mut bytes).unwrap();

        let restored = strategy.deserialize(&bytes).unwrap();
        assert_eq!(restored.downcast_ref::<Player>(), Some(&player));
    }

    #[test]
    fn bincode_rejects_foreign_type() {
        let strategy = BincodeSerialization::<Player>::new("player");
        let mut bytes = Vec::new();
        assert!(matches!(
            strategy.serialize(&42u32, &mut bytes),
            Err(DataError::Serialization(_))
        ));
        assert!(!strategy.accepts(&42u32));
        assert!(bytes.is_empty());
    }

    #[test]
    fn registry_lookup_by_name_and_type() {
        let mut registry = SerializationRegistry::new();
        registry.register_type::<Player>("player").unwrap();

        assert_eq!(registry.get("player").unwrap().name(), "player");
        assert_eq!(registry.for_type::<Player>().unwrap().name(), "player");
        assert!(matches!(
            registry.get("monster"),
            Err(DataError::UnknownSerialization(_))
        ));
        assert!(matches!(
            registry.for_type::<u64>(),
            Err(DataError::UnregisteredType(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = SerializationRegistry::new();
        registry.register_type::<Player>("player").unwrap();
        assert!(matches!(
            registry.register_type::<u32>("player"),
            Err(DataError::DuplicateSerialization(_))
        ));
        assert_eq!(registry.len(), 1);
    }
}
