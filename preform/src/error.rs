use thiserror::Error;

/// What went wrong, independent of where it happened
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Unknown directive, or a directive missing a required operand
    #[error("malformed directive: {0}")]
    MalformedDirective(String),
    /// A macro body references a parameter the call did not supply
    #[error("macro `{name}` references parameter `{param}` missing from the call")]
    UndefinedMacroReference {
        /// Macro being expanded
        name: String,
        /// Parameter without a matching argument
        param: String,
    },
    /// Too many arguments, or an argument list that never closes
    #[error("macro argument mismatch: {0}")]
    MacroArgumentMismatch(String),
    /// Conditional expression outside the supported grammar
    #[error("malformed expression `{expr}`: {reason}")]
    MalformedExpression {
        /// Expression text as written
        expr: String,
        /// Why parsing failed
        reason: String,
    },
    /// Loop header of a `#PFM for` block outside the supported grammar
    #[error("malformed template expression `{expr}`: {reason}")]
    MalformedTemplateExpression {
        /// Loop header as written
        expr: String,
        /// Why parsing failed
        reason: String,
    },
    /// `#include` target not found anywhere on the search path
    #[error("include not found: {0}")]
    UnresolvedInclude(String),
    /// A file includes itself, directly or through other files
    #[error("include cycle detected for `{0}`")]
    IncludeCycle(String),
    /// End of input inside an `#ifdef`/`#ifndef`/`#if` block
    #[error("unterminated conditional block ({0} still open)")]
    UnterminatedConditional(usize),
    /// End of input inside a `#PFM for` block
    #[error("unterminated template block `{0}`")]
    UnterminatedTemplateBlock(String),
    /// Macro rescanning went deeper than the configured limit
    #[error("macro recursion limit of {0} exceeded")]
    RecursionLimitExceeded(usize),
    /// An active `#error` directive
    #[error("#error: {0}")]
    ErrorDirective(String),
    /// I/O error while reading a source or writing output
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during preprocessing, located at a file and line
#[derive(Debug, Error)]
#[error("{file}:{line}: {kind}")]
pub struct PreprocessError {
    /// File being processed when the error occurred
    pub file: String,
    /// Physical line number (1-based)
    pub line: usize,
    /// Underlying error, already part of the message
    pub kind: ErrorKind,
}

impl PreprocessError {
    /// Attach a location to an error kind
    pub fn new(kind: ErrorKind, file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
            kind,
        }
    }

    /// The error kind, without location
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

/// Result of a located preprocessing operation
pub type PreprocessResult<T> = Result<T, PreprocessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location() {
        let err = PreprocessError::new(
            ErrorKind::MalformedDirective("#ifdef without a name".to_string()),
            "src/main.F90",
            12,
        );
        assert_eq!(
            err.to_string(),
            "src/main.F90:12: malformed directive: #ifdef without a name"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let kind: ErrorKind = io.into();
        assert!(matches!(kind, ErrorKind::Io(_)));
    }
}
