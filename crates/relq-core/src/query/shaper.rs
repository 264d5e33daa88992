use crate::{
    error::InternalError,
    exec::{Bindings, EvalHost, ExecutionError, QueryResult, Scope, evaluate},
    model::{EntityInstance, EntityRef, NavigationValue},
    query::{ClientExpr, QuerySourceId, ValueBuffer},
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};

///
/// ReferenceInclude
///
/// Reference navigation loaded from columns LEFT JOINed into the owning
/// row. `source` labels the joined block so its offset follows later
/// joins.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReferenceInclude {
    pub navigation: String,
    pub target_type: String,
    pub source: QuerySourceId,
    pub offset: usize,
}

///
/// Shaper
///
/// Rebuilds one result item from one physical row. Resolved at
/// translation time; offsets are final once compilation finishes.
///

#[derive(Clone, Debug)]
pub enum Shaper {
    Entity {
        query_source: QuerySourceId,
        entity_type: String,
        offset: usize,
        includes: Vec<ReferenceInclude>,
    },
    ValueBuffer {
        query_source: QuerySourceId,
        offset: usize,
    },
    Scalar {
        index: usize,
    },
    Composite {
        outer: Box<Self>,
        inner: Box<Self>,
    },
    Projection {
        query_source: QuerySourceId,
        inner: Box<Self>,
        selector: ClientExpr,
    },
}

impl Shaper {
    #[must_use]
    pub fn composite(outer: Self, inner: Self) -> Self {
        Self::Composite {
            outer: Box::new(outer),
            inner: Box::new(inner),
        }
    }

    /// Shape one row. Scalars yield their value; every other shaper
    /// yields the bindings of the row.
    pub(crate) fn shape(
        &self,
        row: &ValueBuffer,
        host: &dyn EvalHost,
        parent: Option<&Arc<Scope>>,
    ) -> Result<QueryResult, ExecutionError> {
        if let Self::Scalar { index } = self {
            return Ok(QueryResult::Value(row.get(*index).clone()));
        }

        let mut bindings = Bindings::new(row.clone());
        self.bind(row, host, parent, &mut bindings)?;

        Ok(QueryResult::Row(bindings))
    }

    fn bind(
        &self,
        row: &ValueBuffer,
        host: &dyn EvalHost,
        parent: Option<&Arc<Scope>>,
        bindings: &mut Bindings,
    ) -> Result<(), ExecutionError> {
        match self {
            Self::Entity {
                query_source,
                entity_type,
                offset,
                includes,
            } => {
                let entity = materialize_entity(host, &row.with_offset(*offset), entity_type)?;
                if let Some(entity) = &entity {
                    for include in includes {
                        include_reference(host, row, entity, include)?;
                    }
                }
                bindings.bind(
                    *query_source,
                    entity.map_or(QueryResult::NULL, QueryResult::Entity),
                );
            }
            Self::ValueBuffer {
                query_source,
                offset,
            } => bindings.bind(*query_source, QueryResult::Buffer(row.with_offset(*offset))),
            Self::Scalar { .. } => {}
            Self::Composite { outer, inner } => {
                outer.bind(row, host, parent, bindings)?;
                inner.bind(row, host, parent, bindings)?;
            }
            Self::Projection {
                query_source,
                inner,
                selector,
            } => {
                let mut inner_bindings = Bindings::new(row.clone());
                inner.bind(row, host, parent, &mut inner_bindings)?;

                let scope = Scope::for_item(&QueryResult::Row(inner_bindings.clone()), parent);
                let projected = evaluate(selector, &scope, host)?;

                for (source, value) in inner_bindings.sources() {
                    bindings.bind(source, value.clone());
                }
                bindings.bind(*query_source, projected);
            }
        }

        Ok(())
    }

    /// Retarget `from` to `to`. An entity shaper degrades to a raw buffer
    /// when the new source needs no materialization.
    pub fn update_query_source(&mut self, from: QuerySourceId, to: QuerySourceId, materialize: bool) {
        match self {
            Self::Entity {
                query_source,
                offset,
                ..
            } if *query_source == from => {
                if materialize {
                    *query_source = to;
                } else {
                    *self = Self::ValueBuffer {
                        query_source: to,
                        offset: *offset,
                    };
                }
            }
            Self::ValueBuffer { query_source, .. } if *query_source == from => *query_source = to,
            Self::Composite { outer, inner } => {
                outer.update_query_source(from, to, materialize);
                inner.update_query_source(from, to, materialize);
            }
            Self::Projection {
                query_source,
                inner,
                ..
            } => {
                inner.update_query_source(from, to, materialize);
                if *query_source == from {
                    *query_source = to;
                }
            }
            Self::Entity { .. } | Self::ValueBuffer { .. } | Self::Scalar { .. } => {}
        }
    }

    /// Apply final row-block offsets.
    pub fn set_offsets(&mut self, offsets: &BTreeMap<QuerySourceId, usize>) {
        match self {
            Self::Entity {
                query_source,
                offset,
                includes,
                ..
            } => {
                if let Some(o) = offsets.get(query_source) {
                    *offset = *o;
                }
                for include in includes {
                    if let Some(o) = offsets.get(&include.source) {
                        include.offset = *o;
                    }
                }
            }
            Self::ValueBuffer {
                query_source,
                offset,
            } => {
                if let Some(o) = offsets.get(query_source) {
                    *offset = *o;
                }
            }
            Self::Scalar { .. } => {}
            Self::Composite { outer, inner } => {
                outer.set_offsets(offsets);
                inner.set_offsets(offsets);
            }
            Self::Projection { inner, .. } => inner.set_offsets(offsets),
        }
    }

    /// Reference includes of the entity shaper bound to `source`.
    pub fn includes_mut(&mut self, source: QuerySourceId) -> Option<&mut Vec<ReferenceInclude>> {
        match self {
            Self::Entity {
                query_source,
                includes,
                ..
            } if *query_source == source => Some(includes),
            Self::Composite { outer, inner } => match outer.includes_mut(source) {
                Some(found) => Some(found),
                None => inner.includes_mut(source),
            },
            Self::Projection { inner, .. } => inner.includes_mut(source),
            _ => None,
        }
    }

    /// Query sources this shaper binds, outer first.
    #[must_use]
    pub fn query_sources(&self) -> Vec<QuerySourceId> {
        match self {
            Self::Entity { query_source, .. } | Self::ValueBuffer { query_source, .. } => {
                vec![*query_source]
            }
            Self::Scalar { .. } => Vec::new(),
            Self::Composite { outer, inner } => {
                let mut out = outer.query_sources();
                out.extend(inner.query_sources());
                out
            }
            Self::Projection {
                query_source,
                inner,
                ..
            } => {
                let mut out = inner.query_sources();
                out.push(*query_source);
                out
            }
        }
    }

    /// Entity type materialized for `source`, if any.
    #[must_use]
    pub fn entity_type_of(&self, source: QuerySourceId) -> Option<&str> {
        match self {
            Self::Entity {
                query_source,
                entity_type,
                ..
            } if *query_source == source => Some(entity_type),
            Self::Composite { outer, inner } => outer
                .entity_type_of(source)
                .or_else(|| inner.entity_type_of(source)),
            Self::Projection { inner, .. } => inner.entity_type_of(source),
            _ => None,
        }
    }
}

/// Materialize the entity whose row block starts at `buffer`. Rows whose
/// key columns are all null shape to `None`.
pub(crate) fn materialize_entity(
    host: &dyn EvalHost,
    buffer: &ValueBuffer,
    entity_type: &str,
) -> Result<Option<EntityRef>, ExecutionError> {
    let model = host.model();
    let ty = model.entity(entity_type).ok_or_else(|| {
        InternalError::executor_invariant(format!(
            "entity type '{entity_type}' is not part of the model"
        ))
    })?;

    let columns = model.hierarchy_columns(entity_type);
    let read = |property: &str| {
        columns
            .iter()
            .position(|(name, _)| name == property)
            .map_or(Value::Null, |i| buffer.get(i).clone())
    };

    let key: Vec<Value> = ty.key.iter().map(|k| read(k)).collect();
    if key.iter().all(Value::is_null) {
        return Ok(None);
    }

    let concrete = match &ty.discriminator_property {
        Some(discriminator) => {
            let value = read(discriminator);
            model.type_for_discriminator(ty, &value).ok_or_else(|| {
                ExecutionError::invalid_operand(
                    discriminator.clone(),
                    format!("no concrete type of '{entity_type}' has discriminator {value}"),
                )
            })?
        }
        None => ty,
    };

    let mut create = || {
        let mut instance = EntityInstance::new(concrete.name.clone());
        for (i, (name, _)) in columns.iter().enumerate() {
            if concrete.property(name).is_some() {
                instance.values.insert(name.clone(), buffer.get(i).clone());
            }
        }
        instance
    };

    let root = model.root_of(ty).name.clone();

    Ok(Some(host.query_buffer().resolve_entity(&root, key, &mut create)))
}

fn include_reference(
    host: &dyn EvalHost,
    row: &ValueBuffer,
    entity: &EntityRef,
    include: &ReferenceInclude,
) -> Result<(), ExecutionError> {
    let model = host.model();
    let owner = entity.entity_type();
    let navigation = model
        .entity(&owner)
        .and_then(|ty| ty.navigation(&include.navigation))
        .ok_or_else(|| {
            InternalError::executor_invariant(format!(
                "entity type '{owner}' has no navigation '{}'",
                include.navigation
            ))
        })?;

    let related = materialize_entity(host, &row.with_offset(include.offset), &include.target_type)?;
    host.query_buffer()
        .include(model, entity, navigation, NavigationValue::Reference(related));

    Ok(())
}
