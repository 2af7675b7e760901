//! Error types for the hfa-engine crate.

use thiserror::Error;

/// The primary error type for all operations in this crate.
#[derive(Debug, Error)]
pub enum HfaError {
    /// An error originating from I/O operations.
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    /// The type dictionary text could not be parsed. This is fatal to
    /// opening the container: without a dictionary no entry data can be
    /// interpreted.
    #[error("Dictionary parse failed: {0}")]
    DictionaryParse(String),

    /// An entry or field references a type name absent from the dictionary.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// A field path names a field that does not exist in the type.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// A computed offset or length would read or write past the end of the
    /// available data window. Recoverable per call; the field is treated as
    /// absent.
    #[error("Out of bounds in {context}: need {needed} bytes, have {available}")]
    Bounds {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    /// A write would grow a pointer-field array or string past the space
    /// originally allocated for it. The write fails; prior data is untouched.
    #[error("Cannot extend {context} past end of data: need {needed} bytes, have {available}")]
    WriteCapacity {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    /// A symbolic name was set on an enum field that has no such name in its
    /// table.
    #[error("Unknown enum name {name:?} for field {field:?}")]
    UnknownEnumName { name: String, field: String },

    /// A raster-sample blob carries a sample-type code this engine cannot
    /// handle for the requested operation.
    #[error("Unsupported sample type code: {0}")]
    UnsupportedSampleType(u16),

    /// A numeric value could not be represented in the requested kind, e.g.
    /// a non-finite float requested as an integer.
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// The container is structurally invalid or does not conform to the HFA
    /// format layout.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HfaError>;
