//! Typed key-value store.
//!
//! A [`Registry`] maps string keys to values of any `Send + Sync` type. Layers keep their
//! parameters and buffers in registries, optimisers their hyperparameters and per-parameter
//! memory, and the [`Environment`](crate::Environment) its global settings.
//!
//! # Example
//!
//! ```rust
//! use sigma_core::{Error, Registry};
//!
//! let mut registry = Registry::new();
//! registry.set("learning_rate", 0.01f64);
//! assert_eq!(registry.get::<f64>("learning_rate").unwrap(), 0.01);
//! assert!(matches!(registry.get::<u32>("learning_rate"), Err(Error::TypeMismatch { .. })));
//! assert!(matches!(registry.get::<f64>("momentum"), Err(Error::KeyNotFound(_))));
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// String-keyed store of typed values.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.iter().collect();
        keys.sort_by(|a, b| a.0.cmp(b.0));
        f.debug_map()
            .entries(keys.into_iter().map(|(k, e)| (k, e.type_name)))
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value of any type.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(
            key.into(),
            Entry {
                value: Box::new(value),
                type_name: type_name::<T>(),
            },
        );
    }

    /// The value under `key`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` when nothing is stored under `key`, `TypeMismatch` when the stored
    /// value is not a `T`.
    pub fn get_ref<T: Any>(&self, key: &str) -> Result<&T> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_owned()))?;
        entry.value.downcast_ref::<T>().ok_or_else(|| Error::TypeMismatch {
            key: key.to_owned(),
            expected: type_name::<T>(),
            found: entry.type_name,
        })
    }

    /// Mutable access to the value under `key`.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Result<&mut T> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_owned()))?;
        let found = entry.type_name;
        entry.value.downcast_mut::<T>().ok_or_else(|| Error::TypeMismatch {
            key: key.to_owned(),
            expected: type_name::<T>(),
            found,
        })
    }

    /// A clone of the value under `key`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Result<T> {
        self.get_ref(key).cloned()
    }

    /// Removes and returns the value under `key`.
    ///
    /// A value of another type stays in place and fails with `TypeMismatch`.
    pub fn remove<T: Any>(&mut self, key: &str) -> Result<T> {
        let (key, Entry { value, type_name: found }) = self
            .entries
            .remove_entry(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_owned()))?;
        match value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(value) => {
                let err = Error::TypeMismatch {
                    key: key.clone(),
                    expected: type_name::<T>(),
                    found,
                };
                self.entries.insert(key, Entry { value, type_name: found });
                Err(err)
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn typed_access() {
        let mut registry = Registry::new();
        registry.set("steps", 3usize);
        *registry.get_mut::<usize>("steps").unwrap() += 1;
        assert_eq!(registry.get::<usize>("steps").unwrap(), 4);

        assert_matches!(
            registry.get_mut::<f32>("steps"),
            Err(Error::TypeMismatch { expected: "f32", found: "usize", .. })
        );
        assert_matches!(
            registry.remove::<String>("steps"),
            Err(Error::TypeMismatch { expected, found: "usize", .. }) if expected.ends_with("String")
        );
        assert_eq!(registry.get::<usize>("steps").unwrap(), 4);
        assert_matches!(registry.remove::<usize>("missing"), Err(Error::KeyNotFound(_)));
        assert_eq!(registry.remove::<usize>("steps").unwrap(), 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn overwrite_changes_type() {
        let mut registry = Registry::new();
        registry.set("x", 1u8);
        registry.set("x", String::from("one"));
        assert_eq!(registry.get::<String>("x").unwrap(), "one");
        assert_eq!(registry.keys(), vec!["x"]);
    }
}
