use crate::{storage::RawValue, value::Value};
use std::sync::{Arc, LazyLock};

static EMPTY: LazyLock<Arc<[Value]>> = LazyLock::new(|| Arc::from(Vec::new()));

///
/// ValueBuffer
///
/// Read-only row of values. Offset views share the backing array, so
/// handing one query source its slice of a joined row never copies.
///

#[derive(Clone, Debug)]
pub struct ValueBuffer {
    values: Arc<[Value]>,
    offset: usize,
}

impl ValueBuffer {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: Arc::from(values),
            offset: 0,
        }
    }

    /// The zero-column buffer.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            values: Arc::clone(&EMPTY),
            offset: 0,
        }
    }

    /// Build a buffer from one provider row, normalizing `DbNull`.
    #[must_use]
    pub fn from_raw(row: Vec<RawValue>) -> Self {
        Self::new(row.into_iter().map(RawValue::into_value).collect())
    }

    /// View starting `offset` columns into this view.
    #[must_use]
    pub fn with_offset(&self, offset: usize) -> Self {
        Self {
            values: Arc::clone(&self.values),
            offset: (self.offset + offset).min(self.values.len()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len() - self.offset
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index` relative to this view; out of range reads as null.
    #[must_use]
    pub fn get(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(self.offset + index).unwrap_or(&NULL)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.values[self.offset..]
    }

    /// First `len` columns of this view, cloned.
    #[must_use]
    pub fn prefix(&self, len: usize) -> Vec<Value> {
        self.as_slice().iter().take(len).cloned().collect()
    }

    #[must_use]
    pub fn is_all_null(&self) -> bool {
        self.as_slice().iter().all(Value::is_null)
    }

    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }
}

impl Default for ValueBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for ValueBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}
