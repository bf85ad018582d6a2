//! Parsed expression values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An evaluated arithmetic expression.
///
/// `raw` is the input exactly as the caller passed it; `result` is the
/// guest's decimal rendering of its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expression {
    raw: String,
    result: String,
}

impl Expression {
    pub(crate) fn new(raw: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            result: result.into(),
        }
    }

    /// The input exactly as submitted.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The computed value.
    pub fn result(&self) -> &str {
        &self.result
    }

    /// Split into `(raw, result)`.
    pub fn into_parts(self) -> (String, String) {
        (self.raw, self.result)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.raw, self.result)
    }
}
