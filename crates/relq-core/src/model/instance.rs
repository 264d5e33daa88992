use crate::value::Value;
use parking_lot::RwLock;
use std::{collections::BTreeMap, fmt, sync::Arc};

///
/// EntityInstance
///
/// Materialized entity: concrete type name, column values by property
/// name, and any navigations wired by Include.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityInstance {
    pub entity_type: String,
    pub values: BTreeMap<String, Value>,
    pub navigations: BTreeMap<String, NavigationValue>,
}

impl EntityInstance {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(property.into(), value.into());
        self
    }

    /// Stored column value; missing properties read as null.
    #[must_use]
    pub fn get(&self, property: &str) -> Value {
        self.values.get(property).cloned().unwrap_or_default()
    }
}

///
/// NavigationValue
///

#[derive(Clone, Debug, PartialEq)]
pub enum NavigationValue {
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
}

///
/// EntityRef
///
/// Shared handle to one identity-resolved entity. Every row carrying the
/// same key within an execution yields the same handle.
///

#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityInstance>>);

impl EntityRef {
    #[must_use]
    pub fn new(instance: EntityInstance) -> Self {
        Self(Arc::new(RwLock::new(instance)))
    }

    #[must_use]
    pub fn entity_type(&self) -> String {
        self.0.read().entity_type.clone()
    }

    #[must_use]
    pub fn get(&self, property: &str) -> Value {
        self.0.read().get(property)
    }

    #[must_use]
    pub fn navigation(&self, name: &str) -> Option<NavigationValue> {
        self.0.read().navigations.get(name).cloned()
    }

    pub fn set_navigation(&self, name: impl Into<String>, value: NavigationValue) {
        self.0.write().navigations.insert(name.into(), value);
    }

    /// Run `f` against the current state of the entity.
    pub fn with<T>(&self, f: impl FnOnce(&EntityInstance) -> T) -> T {
        f(&self.0.read())
    }

    #[must_use]
    pub fn snapshot(&self) -> EntityInstance {
        self.0.read().clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0.read() == *other.0.read()
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.read();
        f.debug_struct("EntityRef")
            .field("entity_type", &inner.entity_type)
            .field("values", &inner.values)
            .finish_non_exhaustive()
    }
}
