/*
 *
 * Copyright 2025 Crossbar authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! Shared plumbing for the crate's pluggable-component registries.  Name
//! resolvers, LB policies, and transports are all registered the same way:
//! a string key mapping to a shared trait object.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// A shared, string-keyed collection of pluggable components.
///
/// Clones are cheap and observe the same entries, which is what lets a
/// channel hold a registry while the application keeps registering into it.
/// Registering a key again replaces the earlier entry.
pub(crate) struct SharedRegistry<T: ?Sized + Send + Sync> {
    entries: Arc<RwLock<BTreeMap<String, Arc<T>>>>,
}

impl<T: ?Sized + Send + Sync> SharedRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Stores `value` under `key`, returning the entry it replaced.
    pub(crate) fn insert(&self, key: &str, value: Arc<T>) -> Option<Arc<T>> {
        self.entries.write().insert(key.to_string(), value)
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.read().get(key).cloned()
    }
}

impl<T: ?Sized + Send + Sync> Clone for SharedRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync> Default for SharedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::SharedRegistry;

    #[test]
    fn later_registrations_replace_earlier_ones() {
        let registry: SharedRegistry<str> = SharedRegistry::new();
        assert!(registry.insert("k", Arc::from("one")).is_none());
        let replaced = registry.insert("k", Arc::from("two")).unwrap();
        assert_eq!(&*replaced, "one");
        assert_eq!(&*registry.get("k").unwrap(), "two");
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn clones_share_entries() {
        let registry: SharedRegistry<str> = SharedRegistry::new();
        let clone = registry.clone();
        registry.insert("k", Arc::from("v"));
        assert!(clone.get("k").is_some());
    }
}
