//! Namespaced key-value persistence used for the registry and the
//! diagnostics flag.
//!
//! A missing namespace or key is "no data" (`Ok(None)`), never an error.
//! Values are staged by `set_*`/`erase_namespace` and become durable on
//! [`Store::commit`]. [`Store::discard`] drops whatever is staged.

pub mod error;
pub mod file;
pub mod memory;

pub use error::*;
pub use file::FileStore;
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Str(String),
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoredValue::U8(_) => "u8",
            StoredValue::U16(_) => "u16",
            StoredValue::U32(_) => "u32",
            StoredValue::Str(_) => "str",
        }
    }
}

pub trait Store: Send {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError>;

    fn set(&mut self, namespace: &str, key: &str, value: StoredValue) -> Result<(), StoreError>;

    /// Removes every key under `namespace`.
    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    /// Drops staged changes so reads see the last committed state again.
    fn discard(&mut self);

    fn get_u8(&self, namespace: &str, key: &str) -> Result<Option<u8>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::U8(v)) => Ok(Some(v)),
            other => mismatch(namespace, key, "u8", other),
        }
    }

    fn get_u16(&self, namespace: &str, key: &str) -> Result<Option<u16>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::U16(v)) => Ok(Some(v)),
            other => mismatch(namespace, key, "u16", other),
        }
    }

    fn get_u32(&self, namespace: &str, key: &str) -> Result<Option<u32>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::U32(v)) => Ok(Some(v)),
            other => mismatch(namespace, key, "u32", other),
        }
    }

    fn get_str(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(namespace, key)? {
            Some(StoredValue::Str(v)) => Ok(Some(v)),
            other => mismatch(namespace, key, "str", other),
        }
    }

    fn set_u8(&mut self, namespace: &str, key: &str, value: u8) -> Result<(), StoreError> {
        self.set(namespace, key, StoredValue::U8(value))
    }

    fn set_u16(&mut self, namespace: &str, key: &str, value: u16) -> Result<(), StoreError> {
        self.set(namespace, key, StoredValue::U16(value))
    }

    fn set_u32(&mut self, namespace: &str, key: &str, value: u32) -> Result<(), StoreError> {
        self.set(namespace, key, StoredValue::U32(value))
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.set(namespace, key, StoredValue::Str(value.to_string()))
    }
}

fn mismatch<T>(
    namespace: &str,
    key: &str,
    expected: &'static str,
    found: Option<StoredValue>,
) -> Result<Option<T>, StoreError> {
    match found {
        None => Ok(None),
        Some(value) => Err(StoreError::TypeMismatch {
            namespace: namespace.to_string(),
            key: key.to_string(),
            expected,
            found: value.type_name(),
        }),
    }
}

/// Floats are stored as their IEEE-754 bit pattern.
pub fn scale_to_bits(value: f32) -> u32 {
    value.to_bits()
}

pub fn scale_from_bits(bits: u32) -> f32 {
    f32::from_bits(bits)
}
