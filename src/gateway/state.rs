use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

type Value = Arc<dyn Any + Send + Sync>;

/// Process-wide application state.
///
/// Populated by the application while handling `lifespan.startup` and
/// shared into every connection scope afterwards. Values are stored by key
/// and retrieved by type.
#[derive(Clone, Default)]
pub struct State(Arc<RwLock<HashMap<String, Value>>>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.0.write().insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.0.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.0.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.0.read();
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        f.debug_tuple("State").field(&keys).finish()
    }
}
