use thiserror::Error;

#[derive(Error, Debug)]
pub enum XbaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header, schema or page failed structural validation.
    #[error("Invalid format: {reason}")]
    Format { reason: String },

    /// Declared lengths disagree with what the stream actually holds.
    #[error("Corrupted data: {reason}")]
    Corruption { reason: String },

    #[error("{what} {index} out of range (max: {max})")]
    Range { what: String, index: i64, max: i64 },

    /// Row/table identity mismatch or incompatible column lists.
    #[error("Invalid state: {reason}")]
    State { reason: String },

    #[error("Not supported: {what}")]
    NotSupported { what: String },

    #[error("Not implemented: {operation}")]
    NotImplemented { operation: String },

    /// Missing encoding or other caller-provided settings.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Column '{name}' not found")]
    ColumnNotFound { name: String },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Serialization/deserialization error: {details}")]
    Serialization { details: String },

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl XbaseError {
    pub(crate) fn format(reason: impl Into<String>) -> Self {
        XbaseError::Format {
            reason: reason.into(),
        }
    }

    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        XbaseError::Corruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn state(reason: impl Into<String>) -> Self {
        XbaseError::State {
            reason: reason.into(),
        }
    }

    pub(crate) fn range(what: impl Into<String>, index: i64, max: i64) -> Self {
        XbaseError::Range {
            what: what.into(),
            index,
            max,
        }
    }

    pub(crate) fn not_implemented(operation: impl Into<String>) -> Self {
        XbaseError::NotImplemented {
            operation: operation.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        XbaseError::Configuration {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, XbaseError>;
