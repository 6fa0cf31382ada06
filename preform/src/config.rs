use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::macro_table::DEFAULT_RECURSION_LIMIT;

/// Context for include resolution
#[derive(Clone, Debug, Default)]
pub struct IncludeContext {
    /// Files currently being processed, outermost first
    pub include_stack: Vec<String>,
    /// Configured include directories
    pub include_dirs: Vec<PathBuf>,
    /// Directory of the including file, if it came from the filesystem
    pub current_dir: Option<PathBuf>,
}

/// Source text produced by an include resolver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncludeSource {
    /// Name reported by `__FILE__` and used for cycle detection
    pub name: String,
    /// Full text of the included file
    pub content: String,
}

impl IncludeSource {
    /// Create an include source
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Type alias for include resolver function
///
/// Called with the path written in `#include "..."`. Returning `None` makes
/// the include fail with `UnresolvedInclude`.
pub type IncludeResolver = Rc<dyn Fn(&str, &IncludeContext) -> Option<IncludeSource>>;

/// Configuration for a preprocessing run
#[derive(Clone)]
pub struct PreprocessorConfig {
    /// `NAME=VALUE` (or bare `NAME`) entries defined before the first line
    pub defines: Vec<String>,
    /// Directories searched for `#include` targets, in order
    pub include_dirs: Vec<PathBuf>,
    /// Maximum recursion depth for macro expansion
    pub recursion_limit: usize,
    /// Custom include file resolver function, replacing the filesystem search
    pub include_resolver: Option<IncludeResolver>,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            defines: Vec::new(),
            include_dirs: Vec::new(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            include_resolver: None,
        }
    }
}

impl PreprocessorConfig {
    /// Add a `NAME=VALUE` definition
    #[must_use]
    pub fn with_define(mut self, entry: impl Into<String>) -> Self {
        self.defines.push(entry.into());
        self
    }

    /// Append a directory to the include search path
    #[must_use]
    pub fn with_include_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.include_dirs.push(dir.as_ref().to_path_buf());
        self
    }

    /// Override the macro recursion limit
    #[must_use]
    pub const fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Resolve includes with `resolver` instead of the filesystem
    #[must_use]
    pub fn with_include_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, &IncludeContext) -> Option<IncludeSource> + 'static,
    {
        self.include_resolver = Some(Rc::new(resolver));
        self
    }
}
