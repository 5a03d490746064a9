use thiserror::Error;

use crate::DocumentKey;

/// Fatal problems detected before any document is touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Unknown masking strategy '{strategy}' for field '{field}'")]
    UnknownStrategy { field: String, strategy: String },

    #[error("Invalid parameters for strategy '{strategy}' on field '{field}': {reason}")]
    InvalidParams {
        field: String,
        strategy: String,
        reason: String,
    },

    #[error("Invalid field matcher '{0}': {1}")]
    InvalidMatcher(String, String),

    #[error("lowercaseMirror on '{field}' references sibling '{sibling}' which no rule masks")]
    UnmaskedSibling { field: String, sibling: String },

    #[error("Rule dependency cycle involving field '{0}'")]
    DependencyCycle(String),

    #[error("Malformed rule file: {0}")]
    MalformedRules(String),

    #[error("In-situ masking of '{0}' requires explicit confirmation of destructive mode")]
    DestructiveNotConfirmed(String),

    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(String),

    #[error(
        "Checkpoint for run '{run_id}' on '{collection}' was written with a different rule set \
         (expected {expected}, found {found})"
    )]
    RulesChanged {
        run_id: String,
        collection: String,
        expected: String,
        found: String,
    },

    #[error("{0}")]
    Invalid(String),
}

/// A native document (or part of one) has no representation in the value model.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot convert value at '{path}': {reason}")]
pub struct ValueConversionError {
    pub path: String,
    pub reason: String,
}

impl ValueConversionError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A strategy was handed a value it cannot mask. Fails one document, never the batch.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Masking failed for document {} at field '{field}': {reason}", display_key(.key))]
pub struct MaskingError {
    pub key: Option<DocumentKey>,
    pub field: String,
    pub reason: String,
}

impl MaskingError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: None,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn with_key(mut self, key: DocumentKey) -> Self {
        self.key = Some(key);
        self
    }
}

fn display_key(key: &Option<DocumentKey>) -> String {
    match key {
        Some(key) => key.to_string(),
        None => "<unkeyed>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking_error_display() {
        let err = MaskingError::new("Patient.Dob", "expected a date, found string")
            .with_key(DocumentKey::Int(42));
        assert_eq!(
            err.to_string(),
            "Masking failed for document 42 at field 'Patient.Dob': expected a date, found string"
        );

        let unkeyed = MaskingError::new("Dob", "bad");
        assert!(unkeyed.to_string().contains("<unkeyed>"));
    }
}
