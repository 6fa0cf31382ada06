use std::fmt;
use std::rc::Rc;

use crate::engine::PreprocessorEngine;
use crate::token::BodyToken;

/// A preprocessor macro definition
#[derive(Clone, Debug)]
pub struct Macro {
    pub(crate) params: Option<Vec<String>>,
    pub(crate) is_variadic: bool,
    pub(crate) body: Rc<Vec<BodyToken>>,
    source: String,
}

impl Macro {
    pub(crate) fn new(params: Option<Vec<String>>, is_variadic: bool, body: &str) -> Self {
        let tokens = PreprocessorEngine::tokenize_body(body, params.as_deref(), is_variadic);
        Self {
            params,
            is_variadic,
            body: Rc::new(tokens),
            source: body.to_string(),
        }
    }

    /// Whether the macro takes an argument list
    #[must_use]
    pub fn is_function_like(&self) -> bool {
        self.params.is_some()
    }

    /// Whether trailing arguments are collected into `__VA_ARGS__`
    #[must_use]
    pub fn is_variadic(&self) -> bool {
        self.is_variadic
    }

    /// Named parameters, empty for object-like macros
    #[must_use]
    pub fn params(&self) -> &[String] {
        self.params.as_deref().unwrap_or_default()
    }

    /// Replacement text as written in the definition
    #[must_use]
    pub fn body(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Macro {
    /// Renders the parameter list (if any) followed by the body, as in `(a, b) a+b`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(params) = &self.params {
            let mut list = params.join(", ");
            if self.is_variadic {
                if !list.is_empty() {
                    list.push_str(", ");
                }
                list.push_str("...");
            }
            write!(f, "({list})")?;
            if !self.source.is_empty() {
                f.write_str(" ")?;
            }
        }
        f.write_str(&self.source)
    }
}
