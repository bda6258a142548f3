use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use crate::error::{Result, WeftError};

/// Typed key into a [`TypedStore`].
///
/// Identity is the `(name, T)` pair: `StorageKey::<i64>::new("n")` and
/// `StorageKey::<String>::new("n")` address different entries.
pub struct StorageKey<T> {
    name: Cow<'static, str>,
    _type: PhantomData<fn() -> T>,
}

impl<T> StorageKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _type: PhantomData,
        }
    }

    pub fn owned(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for StorageKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for StorageKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

struct Entry {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

/// Type-safe key/value store carried by an execution context.
///
/// Interior mutability keeps the store usable through shared context handles;
/// a run only ever touches its own store, so the lock is uncontended.
#[derive(Default)]
pub struct TypedStore {
    entries: Mutex<HashMap<(String, TypeId), Entry>>,
}

impl TypedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `key`, returning the previous one.
    pub fn set<T>(&self, key: &StorageKey<T>, value: T) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        let mut entries = self.lock();
        let previous = entries.insert(
            (key.name().to_string(), TypeId::of::<T>()),
            Entry {
                type_name: std::any::type_name::<T>(),
                value: Box::new(value),
            },
        );
        previous.and_then(|e| e.value.downcast::<T>().ok().map(|b| *b))
    }

    /// Read a copy of the value for `key`.
    ///
    /// `Ok(None)` when nothing is stored under the name at all;
    /// `StorageTypeMismatch` when the name is only registered with another type.
    pub fn get<T>(&self, key: &StorageKey<T>) -> Result<Option<T>>
    where
        T: Any + Clone + Send + Sync,
    {
        let entries = self.lock();
        if let Some(entry) = entries.get(&(key.name().to_string(), TypeId::of::<T>())) {
            return Ok(entry.value.downcast_ref::<T>().cloned());
        }
        match entries
            .iter()
            .find(|((name, _), _)| name.as_str() == key.name())
        {
            Some((_, other)) => Err(WeftError::StorageTypeMismatch {
                key: key.name().to_string(),
                expected: std::any::type_name::<T>().to_string(),
                found: other.type_name.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing value is an error.
    pub fn require<T>(&self, key: &StorageKey<T>) -> Result<T>
    where
        T: Any + Clone + Send + Sync,
    {
        self.get(key)?
            .ok_or_else(|| WeftError::StorageKeyMissing(key.name().to_string()))
    }

    /// Mutate the value in place, inserting `T::default()` first if absent.
    pub fn update<T, R>(&self, key: &StorageKey<T>, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Default + Send + Sync,
    {
        let mut entries = self.lock();
        let entry = entries
            .entry((key.name().to_string(), TypeId::of::<T>()))
            .or_insert_with(|| Entry {
                type_name: std::any::type_name::<T>(),
                value: Box::new(T::default()),
            });
        match entry.value.downcast_mut::<T>() {
            Some(value) => f(value),
            // The map key carries T's TypeId, so the downcast cannot fail.
            None => unreachable!("entry type matches its key"),
        }
    }

    pub fn remove<T>(&self, key: &StorageKey<T>) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        self.lock()
            .remove(&(key.name().to_string(), TypeId::of::<T>()))
            .and_then(|e| e.value.downcast::<T>().ok().map(|b| *b))
    }

    pub fn contains<T: Any>(&self, key: &StorageKey<T>) -> bool {
        self.lock()
            .contains_key(&(key.name().to_string(), TypeId::of::<T>()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, TypeId), Entry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TypedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .map(|((name, _), e)| format!("{}: {}", name, e.type_name))
            .collect();
        keys.sort();
        f.debug_struct("TypedStore").field("entries", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNT: StorageKey<i64> = StorageKey::new("count");
    const COUNT_AS_TEXT: StorageKey<String> = StorageKey::new("count");

    #[test]
    fn set_and_get() {
        let store = TypedStore::new();
        assert_eq!(store.get(&COUNT).unwrap(), None);
        assert_eq!(store.set(&COUNT, 3), None);
        assert_eq!(store.get(&COUNT).unwrap(), Some(3));
        assert_eq!(store.set(&COUNT, 4), Some(3));
        assert_eq!(store.require(&COUNT).unwrap(), 4);
    }

    #[test]
    fn wrong_type_is_a_mismatch() {
        let store = TypedStore::new();
        store.set(&COUNT, 7);

        match store.get(&COUNT_AS_TEXT) {
            Err(WeftError::StorageTypeMismatch {
                key,
                expected,
                found,
            }) => {
                assert_eq!(key, "count");
                assert!(expected.contains("String"));
                assert_eq!(found, "i64");
            }
            other => panic!("expected StorageTypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn same_name_different_types_coexist() {
        let store = TypedStore::new();
        store.set(&COUNT, 1);
        store.set(&COUNT_AS_TEXT, "one".to_string());
        assert_eq!(store.get(&COUNT).unwrap(), Some(1));
        assert_eq!(store.get(&COUNT_AS_TEXT).unwrap().as_deref(), Some("one"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn require_missing() {
        let store = TypedStore::new();
        assert!(matches!(
            store.require(&COUNT),
            Err(WeftError::StorageKeyMissing(k)) if k == "count"
        ));
    }

    #[test]
    fn update_inserts_default() {
        let store = TypedStore::new();
        let after = store.update(&COUNT, |n| {
            *n += 1;
            *n
        });
        assert_eq!(after, 1);
        store.update(&COUNT, |n| *n += 10);
        assert_eq!(store.get(&COUNT).unwrap(), Some(11));
    }

    #[test]
    fn remove_and_clear() {
        let store = TypedStore::new();
        store.set(&COUNT, 9);
        assert!(store.contains(&COUNT));
        assert_eq!(store.remove(&COUNT), Some(9));
        assert!(!store.contains(&COUNT));
        store.set(&COUNT_AS_TEXT, "x".into());
        store.clear();
        assert!(store.is_empty());
    }
}
