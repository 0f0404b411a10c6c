//! Language-specific docstring extractors
//!
//! Each language gets its own module with a consistent interface for pulling
//! documented functions out of source code.

mod python;

pub use python::PythonExtractor;

use super::FunctionDoc;
use crate::error::Result;

/// Trait that all docstring extractors must implement
pub trait DocExtractor: Send {
    /// Extract every documented function from source code
    fn extract(&mut self, content: &str, file_path: &std::path::Path) -> Result<Vec<FunctionDoc>>;

    /// Get the file extensions this extractor handles
    fn file_extensions(&self) -> &[&str];

    /// Get the language name
    fn language_name(&self) -> &str;
}
