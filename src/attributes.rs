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

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Restricts attribute values to types that support value-based equality, so
/// two attribute bags can be compared without resorting to pointer identity.
trait AttributeValue: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeValue) -> bool;
}

impl<T: Any + Send + Sync + Eq + Debug> AttributeValue for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeValue) -> bool {
        match other.any_ref().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// An immutable, typed bag of optional data attached to addresses, endpoints,
/// and resolver updates.  At most one value per type is stored; `with_value`
/// returns an extended copy rather than mutating in place.
#[derive(Clone, Default, Debug)]
pub struct Attributes {
    entries: BTreeMap<TypeId, Arc<dyn AttributeValue>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this bag with the given value set, replacing any
    /// previous value of the same type.
    pub fn with_value<T: Any + Send + Sync + Eq + Debug>(&self, value: T) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(TypeId::of::<T>(), Arc::new(value));
        Self { entries }
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.any_ref().downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.entries.get(k).is_some_and(|o| v.dyn_eq(o.as_ref())))
    }
}

impl Eq for Attributes {}

#[cfg(test)]
mod test {
    use super::Attributes;

    #[derive(Debug, PartialEq, Eq)]
    struct Weight(u32);

    #[derive(Debug, PartialEq, Eq)]
    struct Label(String);

    #[test]
    fn set_get_and_replace() {
        let attrs = Attributes::new().with_value(Weight(5));
        assert_eq!(attrs.get::<Weight>(), Some(&Weight(5)));
        assert_eq!(attrs.get::<Label>(), None);

        let attrs = attrs.with_value(Weight(7));
        assert_eq!(attrs.get::<Weight>(), Some(&Weight(7)));
    }

    #[test]
    fn value_equality() {
        let a = Attributes::new()
            .with_value(Weight(1))
            .with_value(Label("x".to_string()));
        let b = Attributes::new()
            .with_value(Label("x".to_string()))
            .with_value(Weight(1));
        assert_eq!(a, b);

        let c = b.with_value(Weight(2));
        assert_ne!(a, c);
    }
}
