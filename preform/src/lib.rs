#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # PreForM-style line preprocessor
//!
//! This library adds C-preprocessor-style macros and conditional compilation
//! to line-oriented source languages, with Fortran as the reference host:
//! `!` starts a comment, `'` and `"` delimit strings and `//` is an operator,
//! so none of them are touched. On top of that a `#PFM for` block generates
//! repeated code from a loop header.
//!
//! ## Features
//!
//! - Object-like, function-like and variadic macros with `#` and `##`
//! - Conditional compilation (`#ifdef`, `#ifndef`, `#if`, `#elif`, `#else`, `#endif`)
//! - `#include "file"` with include directories or a custom resolver
//! - Template blocks (`#PFM for i in range(1,4):` ... `#PFM endfor`)
//! - Builtins `__FILE__`, `__LINE__`, `__DATE__` and `__TIME__`
//!
//! ## Example
//!
//! ```rust
//! use preform::{preprocess_code, PreprocessorConfig};
//!
//! let code = "\
//! #define WP 8
//! #PFM for i in [1, 2]:
//! real(WP) :: x$i
//! #PFM endfor
//! ";
//!
//! let config = PreprocessorConfig::default();
//! let result = preprocess_code(code, &config).unwrap();
//! assert_eq!(result, "real(8) :: x1\nreal(8) :: x2\n");
//! ```

mod config;
mod date_time;
mod directive;
mod engine;
mod error;
mod line_parser;
mod macro_def;
mod macro_table;
mod preprocessor;
mod template;
mod token;

pub use config::{IncludeContext, IncludeResolver, IncludeSource, PreprocessorConfig};
pub use directive::{Action, Directive, Scope, ScopeState};
pub use error::{ErrorKind, PreprocessError, PreprocessResult};
pub use line_parser::LineParser;
pub use macro_def::Macro;
pub use macro_table::{
    BUILTIN_MACROS, DEFAULT_RECURSION_LIMIT, Location, MacroEntry, MacroState, MacroTable,
};
pub use preprocessor::{Preprocessor, STDIN_NAME};
pub use template::TemplateBlock;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Preprocess source text with the given configuration
///
/// # Errors
/// Returns `PreprocessError` if the input has malformed directives or
/// expressions, an include cannot be resolved, or a block is left open.
pub fn preprocess_code<S: AsRef<str>>(
    input: S,
    config: &PreprocessorConfig,
) -> PreprocessResult<String> {
    let mut preprocessor = Preprocessor::with_config(config)?;
    preprocessor.process(input.as_ref())
}

/// Preprocess a file and write the result to another file
///
/// # Errors
/// Returns `PreprocessError` if the input file cannot be read,
/// the output file cannot be written, or if preprocessing fails.
pub fn preprocess_file<P: AsRef<Path>, Q: AsRef<Path>>(
    input_path: P,
    output_path: Q,
    config: &PreprocessorConfig,
) -> PreprocessResult<()> {
    let output_path = output_path.as_ref();
    let output = File::create(output_path).map_err(|e| {
        PreprocessError::new(e.into(), output_path.display().to_string(), 0)
    })?;
    let mut preprocessor = Preprocessor::with_config(config)?;
    preprocessor.process_file(input_path, &mut BufWriter::new(output))
}

/// Preprocess a file and return the result as a string
///
/// # Errors
/// Returns `PreprocessError` if the file cannot be read or if preprocessing fails.
pub fn preprocess_file_to_string<P: AsRef<Path>>(
    input_path: P,
    config: &PreprocessorConfig,
) -> PreprocessResult<String> {
    let mut out = Vec::new();
    let mut preprocessor = Preprocessor::with_config(config)?;
    preprocessor.process_file(input_path, &mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> String {
        preprocess_code(src, &PreprocessorConfig::default()).unwrap()
    }

    #[test]
    fn function_like_macro() {
        let src = "#define ADD(a, b) ((a)+(b))\nz = ADD(1, 2)\n";
        assert_eq!(run(src), "z = ((1)+(2))\n");
    }

    #[test]
    fn conditional_compilation_ifdef() {
        let src = "\
#define DEBUG 1
#ifdef DEBUG
x = 1
#else
x = 0
#endif
";
        assert_eq!(run(src), "x = 1\n");
    }

    #[test]
    fn conditional_compilation_elif() {
        let src = "\
#define LEVEL 2
#if LEVEL == 1
x = 1
#elif LEVEL == 2
x = 2
#else
x = 3
#endif
";
        assert_eq!(run(src), "x = 2\n");
    }

    #[test]
    fn expression_logical() {
        let src = "\
#if (1 && 0) || (0 && 1) || (1 && 1)
x = 1
#endif
";
        assert_eq!(run(src), "x = 1\n");
    }

    #[test]
    fn fortran_syntax_is_left_alone() {
        let src = "\
#define NAME 'world'
print*, 'hello ' // NAME ! NAME in a comment
x = 1.0d0 /= 2.and.y
";
        assert_eq!(
            run(src),
            "print*, 'hello ' // 'world' ! 'world' in a comment\nx = 1.0d0 /= 2.and.y\n"
        );
    }

    #[test]
    fn undef_directive() {
        let src = "#define FOO 1\n#undef FOO\nx = FOO\n";
        assert_eq!(run(src), "x = FOO\n");
    }

    #[test]
    fn variadic_macro() {
        let src = "\
#define VARIADIC_MACRO(...) print*,'Ok,',#__VA_ARGS__,' works also within stringification operator!'
VARIADIC_MACRO(foo,bar)
";
        assert_eq!(
            run(src),
            "print*,'Ok,',\"foo\",\"bar\",' works also within stringification operator!'\n"
        );
    }

    #[test]
    fn token_pasting_in_quotes() {
        let src = "\
#define MYCONCAT(x) print*,'Ok, x ## -operator works!'
MYCONCAT(concatenation)
";
        assert_eq!(run(src), "print*,'Ok, concatenation-operator works!'\n");
    }

    #[test]
    fn stringification() {
        let src = "\
#define MYWARN(COND) if (COND) print*,'Ok, stringification of '//#COND//' works!'
MYWARN(x<2.0)
";
        assert_eq!(
            run(src),
            "if (x<2.0) print*,'Ok, stringification of '//\"x<2.0\"//' works!'\n"
        );
    }

    #[test]
    fn config_include_resolver() {
        let config = PreprocessorConfig::default().with_include_resolver(|path, context| {
            (path == "kinds.inc" && context.include_stack == [STDIN_NAME])
                .then(|| IncludeSource::new(path, "#define WP 8\n"))
        });
        assert_eq!(
            preprocess_code("#include \"kinds.inc\"\nreal(WP) :: x\n", &config).unwrap(),
            "real(8) :: x\n"
        );
    }
}
