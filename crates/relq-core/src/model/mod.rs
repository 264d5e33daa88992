//! Module: model
//! Responsibility: mapped-model metadata consulted by translation and shaping.
//! Does not own: conventions, migrations, or change tracking.
//! Boundary: a `Model` is immutable once built and shared behind `Arc`.

mod instance;

#[cfg(test)]
mod tests;

use crate::value::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error as ThisError;

// re-exports
pub use instance::{EntityInstance, EntityRef, NavigationValue};

///
/// ModelError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum ModelError {
    #[error("entity type '{0}' is defined more than once")]
    DuplicateEntity(String),

    #[error("entity type '{entity}' derives from unknown type '{base}'")]
    UnknownBaseType { entity: String, base: String },

    #[error("entity type '{0}' has no key and no base type to inherit one from")]
    MissingKey(String),

    #[error("entity type '{entity}' key property '{property}' is not a mapped column")]
    InvalidKey { entity: String, property: String },

    #[error("navigation '{entity}.{navigation}' targets unknown type '{target}'")]
    UnknownNavigationTarget {
        entity: String,
        navigation: String,
        target: String,
    },
}

/// Client-side computation backing a property with no column.
pub type ComputedFn = Arc<dyn Fn(&EntityInstance) -> Value + Send + Sync>;

///
/// PropertyKind
///

#[derive(Clone)]
pub enum PropertyKind {
    Column { column: String },
    Computed(ComputedFn),
}

impl fmt::Debug for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column { column } => f.debug_struct("Column").field("column", column).finish(),
            Self::Computed(_) => f.write_str("Computed"),
        }
    }
}

///
/// Property
///

#[derive(Clone, Debug)]
pub struct Property {
    pub name: String,
    pub kind: PropertyKind,
}

impl Property {
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Column { column } => Some(column),
            PropertyKind::Computed(_) => None,
        }
    }
}

///
/// NavigationKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NavigationKind {
    Reference,
    Collection,
}

///
/// Navigation
///
/// Relationship from the declaring type to `target`, joined on
/// `source_properties[i] == target_properties[i]`.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Navigation {
    pub name: String,
    pub target: String,
    pub kind: NavigationKind,
    pub source_properties: Vec<String>,
    pub target_properties: Vec<String>,
}

///
/// EntityType
///
/// Fully resolved entity type: inherited properties, key, table, and
/// discriminator are already copied down from the hierarchy root.
///

#[derive(Clone, Debug)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    pub base: Option<String>,
    pub is_abstract: bool,
    pub discriminator_property: Option<String>,
    pub discriminator_value: Option<Value>,
    pub properties: Vec<Property>,
    pub key: Vec<String>,
    pub navigations: Vec<Navigation>,
}

impl EntityType {
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Column-mapped properties in declaration order; this is the row shape
    /// an entity projects and the shaper reads.
    pub fn column_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter_map(|p| p.column().map(|c| (p.name.as_str(), c)))
    }

    #[must_use]
    pub fn column_ordinal(&self, property: &str) -> Option<usize> {
        self.column_properties().position(|(name, _)| name == property)
    }
}

///
/// Model
///

#[derive(Clone, Debug, Default)]
pub struct Model {
    entities: BTreeMap<String, EntityType>,
}

impl Model {
    #[must_use]
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values()
    }

    #[must_use]
    pub fn root_of<'a>(&'a self, entity: &'a EntityType) -> &'a EntityType {
        let mut current = entity;
        while let Some(base) = current.base.as_deref().and_then(|b| self.entity(b)) {
            current = base;
        }

        current
    }

    /// True when `entity` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_assignable(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = self.entity(entity);
        while let Some(ty) = current {
            if ty.name == ancestor {
                return true;
            }
            current = ty.base.as_deref().and_then(|b| self.entity(b));
        }

        false
    }

    /// Non-abstract types assignable to `entity`, the type itself first.
    #[must_use]
    pub fn concrete_types(&self, entity: &str) -> Vec<&EntityType> {
        let mut out: Vec<&EntityType> = Vec::new();
        if let Some(ty) = self.entity(entity).filter(|t| !t.is_abstract) {
            out.push(ty);
        }
        out.extend(
            self.entities
                .values()
                .filter(|t| t.name != entity && !t.is_abstract)
                .filter(|t| self.is_assignable(&t.name, entity)),
        );

        out
    }

    /// Column properties of every concrete type assignable to `entity`,
    /// deduplicated by name in first-seen order. This is the row block a
    /// query over `entity` projects and the entity shaper reads.
    #[must_use]
    pub fn hierarchy_columns(&self, entity: &str) -> Vec<(String, String)> {
        let mut types = self.concrete_types(entity);
        if types.is_empty()
            && let Some(ty) = self.entity(entity)
        {
            types.push(ty);
        }

        let mut out: Vec<(String, String)> = Vec::new();
        for ty in types {
            for (name, column) in ty.column_properties() {
                if !out.iter().any(|(n, _)| n == name) {
                    out.push((name.to_string(), column.to_string()));
                }
            }
        }

        out
    }

    /// Resolve the concrete type of a row by its discriminator value.
    #[must_use]
    pub fn type_for_discriminator<'a>(
        &'a self,
        entity: &'a EntityType,
        value: &Value,
    ) -> Option<&'a EntityType> {
        if entity.discriminator_property.is_none() {
            return Some(entity);
        }

        self.concrete_types(&entity.name)
            .into_iter()
            .find(|t| t.discriminator_value.as_ref() == Some(value))
    }
}

///
/// ModelBuilder
///

#[derive(Debug, Default)]
pub struct ModelBuilder {
    entities: Vec<EntityBuilder>,
}

impl ModelBuilder {
    #[must_use]
    pub fn entity(mut self, entity: EntityBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn build(self) -> Result<Model, ModelError> {
        let mut declared: BTreeMap<String, EntityBuilder> = BTreeMap::new();
        for entity in self.entities {
            if declared.contains_key(&entity.name) {
                return Err(ModelError::DuplicateEntity(entity.name));
            }
            declared.insert(entity.name.clone(), entity);
        }

        let mut entities = BTreeMap::new();
        for name in declared.keys() {
            let resolved = resolve_entity(&declared, name)?;
            entities.insert(name.clone(), resolved);
        }

        for entity in entities.values() {
            for navigation in &entity.navigations {
                if !entities.contains_key(&navigation.target) {
                    return Err(ModelError::UnknownNavigationTarget {
                        entity: entity.name.clone(),
                        navigation: navigation.name.clone(),
                        target: navigation.target.clone(),
                    });
                }
            }
        }

        Ok(Model { entities })
    }
}

// Walk from the root down to `name`, inheriting table, key, discriminator,
// properties, and navigations.
fn resolve_entity(
    declared: &BTreeMap<String, EntityBuilder>,
    name: &str,
) -> Result<EntityType, ModelError> {
    let mut chain = Vec::new();
    let mut current = declared.get(name);
    while let Some(entity) = current {
        if chain.len() > declared.len() {
            break;
        }
        chain.push(entity);
        current = match &entity.base {
            Some(base) => Some(declared.get(base).ok_or_else(|| {
                ModelError::UnknownBaseType {
                    entity: entity.name.clone(),
                    base: base.clone(),
                }
            })?),
            None => None,
        };
    }
    chain.reverse();

    let Some(leaf) = chain.last() else {
        return Err(ModelError::MissingKey(name.to_string()));
    };

    let mut resolved = EntityType {
        name: leaf.name.clone(),
        table: String::new(),
        base: leaf.base.clone(),
        is_abstract: leaf.is_abstract,
        discriminator_property: None,
        discriminator_value: leaf.discriminator_value.clone(),
        properties: Vec::new(),
        key: Vec::new(),
        navigations: Vec::new(),
    };

    for entity in &chain {
        if let Some(table) = &entity.table {
            resolved.table.clone_from(table);
        }
        if !entity.key.is_empty() {
            resolved.key.clone_from(&entity.key);
        }
        if entity.discriminator_property.is_some() {
            resolved
                .discriminator_property
                .clone_from(&entity.discriminator_property);
        }
        resolved.properties.extend(entity.properties.iter().cloned());
        resolved.navigations.extend(entity.navigations.iter().cloned());
    }

    if resolved.table.is_empty() {
        resolved.table.clone_from(&resolved.name);
    }
    if resolved.key.is_empty() {
        return Err(ModelError::MissingKey(resolved.name));
    }
    for key in &resolved.key {
        if resolved.property(key).and_then(Property::column).is_none() {
            return Err(ModelError::InvalidKey {
                entity: resolved.name.clone(),
                property: key.clone(),
            });
        }
    }

    Ok(resolved)
}

///
/// EntityBuilder
///

#[derive(Debug, Default)]
pub struct EntityBuilder {
    name: String,
    table: Option<String>,
    base: Option<String>,
    is_abstract: bool,
    discriminator_property: Option<String>,
    discriminator_value: Option<Value>,
    properties: Vec<Property>,
    key: Vec<String>,
    navigations: Vec<Navigation>,
}

impl EntityBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    #[must_use]
    pub const fn is_abstract(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    #[must_use]
    pub fn discriminator(mut self, property: impl Into<String>) -> Self {
        self.discriminator_property = Some(property.into());
        self
    }

    #[must_use]
    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    /// Column-mapped property whose column shares the property name.
    #[must_use]
    pub fn column(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let column = name.clone();
        self.column_named(name, column)
    }

    #[must_use]
    pub fn column_named(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.properties.push(Property {
            name: name.into(),
            kind: PropertyKind::Column {
                column: column.into(),
            },
        });
        self
    }

    #[must_use]
    pub fn computed(
        mut self,
        name: impl Into<String>,
        compute: impl Fn(&EntityInstance) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.properties.push(Property {
            name: name.into(),
            kind: PropertyKind::Computed(Arc::new(compute)),
        });
        self
    }

    #[must_use]
    pub fn key<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = properties.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn reference(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        source_property: impl Into<String>,
        target_property: impl Into<String>,
    ) -> Self {
        self.navigation(
            NavigationKind::Reference,
            name,
            target,
            source_property,
            target_property,
        )
    }

    #[must_use]
    pub fn collection(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        source_property: impl Into<String>,
        target_property: impl Into<String>,
    ) -> Self {
        self.navigation(
            NavigationKind::Collection,
            name,
            target,
            source_property,
            target_property,
        )
    }

    fn navigation(
        mut self,
        kind: NavigationKind,
        name: impl Into<String>,
        target: impl Into<String>,
        source_property: impl Into<String>,
        target_property: impl Into<String>,
    ) -> Self {
        self.navigations.push(Navigation {
            name: name.into(),
            target: target.into(),
            kind,
            source_properties: vec![source_property.into()],
            target_properties: vec![target_property.into()],
        });
        self
    }
}
