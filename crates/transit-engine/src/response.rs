//! Response envelope carrying non-fatal warnings.

use serde::Serialize;

/// Operation result plus the warnings to show the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response<T> {
    /// Operation payload.
    #[serde(flatten)]
    pub data: T,

    /// Non-fatal notes about how the request was handled.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl<T> Response<T> {
    /// A response without warnings.
    pub fn new(data: T) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    /// A response with the given warnings.
    pub fn with_warnings(data: T, warnings: Vec<String>) -> Self {
        Self { data, warnings }
    }

    /// Append a warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Drop the warnings.
    pub fn into_data(self) -> T {
        self.data
    }
}
