use crate::{
    model::{EntityInstance, EntityRef, Model, Navigation, NavigationKind, NavigationValue},
    value::{OrderedValue, Value},
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt};

///
/// QueryBuffer
///
/// Identity map and navigation wiring for the entities one query context
/// materializes.
///

pub trait QueryBuffer: Send + Sync {
    /// The shared instance for `key` within the hierarchy rooted at
    /// `root`. `create` only runs the first time a key is seen.
    fn resolve_entity(
        &self,
        root: &str,
        key: Vec<Value>,
        create: &mut dyn FnMut() -> EntityInstance,
    ) -> EntityRef;

    /// Attach `related` to `navigation` of `entity`.
    fn include(
        &self,
        model: &Model,
        entity: &EntityRef,
        navigation: &Navigation,
        related: NavigationValue,
    );
}

///
/// FixupQueryBuffer
///
/// Default buffer: one instance per key, and collection includes also set
/// the inverse reference on every loaded element.
///

#[derive(Default)]
pub struct FixupQueryBuffer {
    identities: Mutex<BTreeMap<(String, Vec<OrderedValue>), EntityRef>>,
}

impl FixupQueryBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct entities resolved so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueryBuffer for FixupQueryBuffer {
    fn resolve_entity(
        &self,
        root: &str,
        key: Vec<Value>,
        create: &mut dyn FnMut() -> EntityInstance,
    ) -> EntityRef {
        let key = (
            root.to_string(),
            key.into_iter().map(OrderedValue).collect::<Vec<_>>(),
        );

        self.identities
            .lock()
            .entry(key)
            .or_insert_with(|| EntityRef::new(create()))
            .clone()
    }

    fn include(
        &self,
        model: &Model,
        entity: &EntityRef,
        navigation: &Navigation,
        related: NavigationValue,
    ) {
        if let NavigationValue::Collection(items) = &related
            && let Some(inverse) = inverse_reference(model, &entity.entity_type(), navigation)
        {
            for item in items {
                item.set_navigation(
                    inverse.name.clone(),
                    NavigationValue::Reference(Some(entity.clone())),
                );
            }
        }

        entity.set_navigation(navigation.name.clone(), related);
    }
}

impl fmt::Debug for FixupQueryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixupQueryBuffer")
            .field("entities", &self.len())
            .finish()
    }
}

// Reference navigation on the target type that mirrors `navigation`.
fn inverse_reference<'a>(
    model: &'a Model,
    owner: &str,
    navigation: &Navigation,
) -> Option<&'a Navigation> {
    model.entity(&navigation.target)?.navigations.iter().find(|n| {
        n.kind == NavigationKind::Reference
            && model.is_assignable(owner, &n.target)
            && n.source_properties == navigation.target_properties
            && n.target_properties == navigation.source_properties
    })
}
