//! Error types for resource operations

use thiserror::Error;

/// Errors that can occur when working with resources
#[derive(Debug, Error)]
pub enum CrdError {
    /// Invalid MAC address format
    #[error("Invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    /// Malformed label selector
    #[error("Invalid label selector '{0}': expected key=value[,key=value]")]
    InvalidSelector(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid field value
    #[error("Invalid value for field '{field}': {message}")]
    InvalidFieldValue { field: String, message: String },
}

/// Result type for resource operations
pub type Result<T> = std::result::Result<T, CrdError>;
