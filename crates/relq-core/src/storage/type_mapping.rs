use crate::{
    storage::provider::{DbParameter, DbType},
    value::{Value, ValueKind},
};

///
/// TypeMapping
///
/// Store type plus the facets applied to a provider parameter.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeMapping {
    pub store_type: String,
    pub db_type: Option<DbType>,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

impl TypeMapping {
    pub fn new(store_type: impl Into<String>, db_type: Option<DbType>) -> Self {
        Self {
            store_type: store_type.into(),
            db_type,
            size: None,
            precision: None,
            scale: None,
        }
    }

    #[must_use]
    pub const fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub const fn with_precision_scale(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Build a provider parameter carrying this mapping's facets.
    /// `nullable = None` infers nullability from the value.
    #[must_use]
    pub fn create_parameter(&self, name: &str, value: Value, nullable: Option<bool>) -> DbParameter {
        let nullable = nullable.unwrap_or_else(|| value.is_null());
        let mut parameter = DbParameter::new(name, value);
        parameter.db_type = self.db_type;
        parameter.store_type = Some(self.store_type.clone());
        parameter.nullable = nullable;
        parameter.size = self.size;
        parameter.precision = self.precision;
        parameter.scale = self.scale;

        parameter
    }
}

///
/// TypeMappingSource
///

pub trait TypeMappingSource: Send + Sync {
    fn find_mapping(&self, kind: ValueKind) -> TypeMapping;

    /// Mapping used when a dynamic parameter is bound to null.
    fn null_mapping(&self) -> TypeMapping {
        TypeMapping::new("NULL", None)
    }
}

///
/// DefaultTypeMappingSource
///

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTypeMappingSource;

impl TypeMappingSource for DefaultTypeMappingSource {
    fn find_mapping(&self, kind: ValueKind) -> TypeMapping {
        match kind {
            ValueKind::Null => self.null_mapping(),
            ValueKind::Bool => TypeMapping::new("BOOLEAN", Some(DbType::Boolean)),
            ValueKind::Int => TypeMapping::new("BIGINT", Some(DbType::Int64)),
            ValueKind::Float => TypeMapping::new("DOUBLE PRECISION", Some(DbType::Double)),
            ValueKind::Text => TypeMapping::new("TEXT", Some(DbType::String)),
            ValueKind::Blob => TypeMapping::new("BLOB", Some(DbType::Binary)),
            ValueKind::List => TypeMapping::new("ARRAY", Some(DbType::Object)),
        }
    }
}
