//! Module: storage::parameter
//! Responsibility: bind logical parameter placeholders to provider-native parameters.
//! Does not own: the runtime name→value map (owned by the query context).
//! Boundary: `RelationalParameter` is the only way command parameters reach a `DbCommand`.

#[cfg(test)]
mod tests;

use crate::{
    storage::{
        provider::{DbCommand, DbParameter, ParameterDirection},
        type_mapping::{TypeMapping, TypeMappingSource},
    },
    value::Value,
};
use derive_more::{Deref, DerefMut};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error as ThisError;

///
/// ParameterError
///
/// Contract violations raised while binding parameters. Never transient.
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum ParameterError {
    #[error("no value was provided for the required parameter '{name}'")]
    MissingValue { name: String },

    #[error("the value provided for parameter '{name}' must be an array")]
    NotArray { name: String },

    #[error("the value provided for raw parameter '{name}' must be a provider parameter")]
    NotNative { name: String },
}

///
/// ParamValue
///
/// Runtime value bound to a parameter's invariant name.
///

#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Value(Value),
    Array(Vec<Self>),
    Native(Arc<DbParameter>),
}

impl ParamValue {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Value(Value::Null))
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

///
/// ParameterValues
///
/// Name→value map consulted at bind time.
///

#[derive(Clone, Debug, Default, Deref, DerefMut, PartialEq)]
pub struct ParameterValues(BTreeMap<String, ParamValue>);

impl ParameterValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for ParameterValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

///
/// RelationalParameter
///
/// One logical parameter of a relational command. `invariant_name` keys
/// the runtime value; `name` is the placeholder the SQL text references.
///

#[derive(Clone, Debug, PartialEq)]
pub enum RelationalParameter {
    TypeMapped {
        invariant_name: String,
        name: String,
        mapping: TypeMapping,
        nullable: Option<bool>,
    },
    Dynamic {
        invariant_name: String,
        name: String,
    },
    Raw {
        invariant_name: String,
        name: String,
    },
    Composite {
        invariant_name: String,
        parameters: Vec<Self>,
    },
}

impl RelationalParameter {
    pub fn dynamic(invariant_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Dynamic {
            invariant_name: invariant_name.into(),
            name: name.into(),
        }
    }

    pub fn type_mapped(
        invariant_name: impl Into<String>,
        name: impl Into<String>,
        mapping: TypeMapping,
        nullable: Option<bool>,
    ) -> Self {
        Self::TypeMapped {
            invariant_name: invariant_name.into(),
            name: name.into(),
            mapping,
            nullable,
        }
    }

    pub fn raw(invariant_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Raw {
            invariant_name: invariant_name.into(),
            name: name.into(),
        }
    }

    pub fn composite(invariant_name: impl Into<String>, parameters: Vec<Self>) -> Self {
        Self::Composite {
            invariant_name: invariant_name.into(),
            parameters,
        }
    }

    #[must_use]
    pub fn invariant_name(&self) -> &str {
        match self {
            Self::TypeMapped { invariant_name, .. }
            | Self::Dynamic { invariant_name, .. }
            | Self::Raw { invariant_name, .. }
            | Self::Composite { invariant_name, .. } => invariant_name,
        }
    }

    /// Look up this parameter's value by invariant name and attach it.
    pub fn add_db_parameter_from(
        &self,
        command: &mut dyn DbCommand,
        values: &ParameterValues,
        mappings: &dyn TypeMappingSource,
    ) -> Result<(), ParameterError> {
        let value = values
            .get(self.invariant_name())
            .ok_or_else(|| ParameterError::MissingValue {
                name: self.invariant_name().to_string(),
            })?;

        self.add_db_parameter(command, value, mappings)
    }

    /// Create the provider-native parameter(s) for `value` and attach them.
    pub fn add_db_parameter(
        &self,
        command: &mut dyn DbCommand,
        value: &ParamValue,
        mappings: &dyn TypeMappingSource,
    ) -> Result<(), ParameterError> {
        match self {
            Self::TypeMapped {
                name,
                mapping,
                nullable,
                ..
            } => {
                let value = scalar_value(value);
                command.add_parameter(Arc::new(mapping.create_parameter(name, value, *nullable)));
            }

            Self::Dynamic { name, .. } => match value {
                ParamValue::Native(native) => command.add_parameter(Arc::clone(native)),
                ParamValue::Value(Value::Null) => {
                    let parameter = mappings
                        .null_mapping()
                        .create_parameter(name, Value::Null, Some(true));
                    command.add_parameter(Arc::new(parameter));
                }
                other => {
                    let value = scalar_value(other);
                    let parameter = mappings
                        .find_mapping(value.kind())
                        .create_parameter(name, value, None);
                    command.add_parameter(Arc::new(parameter));
                }
            },

            Self::Raw { invariant_name, .. } => {
                let ParamValue::Native(native) = value else {
                    return Err(ParameterError::NotNative {
                        name: invariant_name.clone(),
                    });
                };

                let attached = match native.direction {
                    ParameterDirection::Input => native
                        .try_clone()
                        .map_or_else(|| Arc::clone(native), Arc::new),
                    _ => Arc::clone(native),
                };
                command.add_parameter(attached);
            }

            Self::Composite {
                invariant_name,
                parameters,
            } => {
                let ParamValue::Array(items) = value else {
                    return Err(ParameterError::NotArray {
                        name: invariant_name.clone(),
                    });
                };

                if let Some(missing) = parameters.get(items.len()) {
                    return Err(ParameterError::MissingValue {
                        name: missing.invariant_name().to_string(),
                    });
                }

                for (parameter, item) in parameters.iter().zip(items) {
                    parameter.add_db_parameter(command, item, mappings)?;
                }
            }
        }

        Ok(())
    }
}

// Arrays flatten to a list value; natives contribute their current value.
fn scalar_value(value: &ParamValue) -> Value {
    match value {
        ParamValue::Value(value) => value.clone(),
        ParamValue::Array(items) => Value::List(items.iter().map(scalar_value).collect()),
        ParamValue::Native(native) => native.value.clone(),
    }
}
