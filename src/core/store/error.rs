use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Store contents are not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key {namespace}/{key} holds a {found}, expected a {expected}")]
    TypeMismatch {
        namespace: String,
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Key {namespace}/{key} is corrupt: {reason}")]
    Corrupt {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("Store is read-only")]
    ReadOnly,
}
