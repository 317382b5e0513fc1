//! Validation outcome

use std::fmt;

/// Outcome of validating one value
///
/// Errors keep the order in which they were found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationResult {
    valid: bool,
    errors: Vec<String>,
}

impl ValidationResult {
    pub(crate) fn from_errors(errors: Vec<String>) -> Self {
        ValidationResult {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub(crate) fn no_schema(key: &str) -> Self {
        ValidationResult::from_errors(vec![format!("no schema registered for '{key}'")])
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn into_errors(self) -> Vec<String> {
        self.errors
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            f.write_str("valid")
        } else {
            f.write_str(&self.errors.join("; "))
        }
    }
}
