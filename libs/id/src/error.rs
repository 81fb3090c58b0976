//! Error types for ID validation.

use thiserror::Error;

/// Errors that can occur when validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID contains a character reserved by path or state-ID encoding.
    #[error("ID '{id}' contains reserved character '{ch}'")]
    ReservedCharacter { id: String, ch: char },

    /// The ID contains whitespace.
    #[error("ID '{0}' contains whitespace")]
    Whitespace(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}

/// Characters that may not appear in any ID.
pub(crate) const RESERVED: [char; 2] = ['-', '/'];

/// Validate a raw ID string.
pub fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if let Some(ch) = s.chars().find(|c| RESERVED.contains(c)) {
        return Err(IdError::ReservedCharacter {
            id: s.to_string(),
            ch,
        });
    }
    if s.chars().any(char::is_whitespace) {
        return Err(IdError::Whitespace(s.to_string()));
    }
    Ok(())
}
