use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("row not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("duplicate row: {table}/{id}")]
    Duplicate { table: String, id: String },

    #[error("row lock conflict: {table}/{id}")]
    LockConflict { table: String, id: String },

    #[error("transaction no longer active")]
    TxClosed,
}

pub type Result<T> = std::result::Result<T, StoreError>;
