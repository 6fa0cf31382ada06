use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::date_time::{format_date, format_time};
use crate::engine::PreprocessorEngine;
use crate::error::ErrorKind;
use crate::macro_def::Macro;
use crate::token::{BodyToken, Token, is_identifier};

/// Read-only macros whose value is computed when they are expanded
pub const BUILTIN_MACROS: [&str; 4] = ["__FILE__", "__LINE__", "__DATE__", "__TIME__"];

/// Default maximum nesting of macro rescans
pub const DEFAULT_RECURSION_LIMIT: usize = 128;

#[derive(Clone, Debug)]
enum MacroSlot {
    Defined(Macro),
    /// Tombstone left by `#undef`
    Undefined,
}

/// Position of the line currently being processed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// File name as given to the driver
    pub file: String,
    /// Physical line number (1-based)
    pub line: usize,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            file: "<stdin>".to_string(),
            line: 1,
        }
    }
}

/// State of a name in the macro table, as reported by [`MacroTable::list`]
#[derive(Clone, Debug)]
pub enum MacroState {
    /// Builtin macro with its value at listing time
    Builtin(String),
    /// User definition
    Defined(Macro),
    /// Explicitly undefined with `#undef`
    Undefined,
}

/// One line of the macro listing
#[derive(Clone, Debug)]
pub struct MacroEntry {
    /// Macro name
    pub name: String,
    /// Current state
    pub state: MacroState,
}

impl fmt::Display for MacroEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            MacroState::Builtin(value) => write!(f, "{} = {value} (builtin)", self.name),
            MacroState::Defined(mac) if mac.is_function_like() => write!(f, "{}{mac}", self.name),
            MacroState::Defined(mac) => write!(f, "{} = {mac}", self.name),
            MacroState::Undefined => write!(f, "{} (undefined)", self.name),
        }
    }
}

/// Macro definitions of one preprocessing run
///
/// Besides user definitions the table answers for the builtins
/// `__FILE__`, `__LINE__`, `__DATE__` and `__TIME__`; the first two follow
/// the [`Location`] the driver sets before each line.
#[derive(Clone, Debug)]
pub struct MacroTable {
    macros: HashMap<String, MacroSlot>,
    location: Location,
    recursion_limit: usize,
}

impl Default for MacroTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            macros: HashMap::new(),
            location: Location::default(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    /// Set the maximum nesting of macro rescans
    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit;
    }

    /// Set the location reported by `__FILE__` and `__LINE__`
    pub fn set_location(&mut self, file: impl Into<String>, line: usize) {
        self.location = Location {
            file: file.into(),
            line,
        };
    }

    /// Location reported by `__FILE__` and `__LINE__`
    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Define a macro from `NAME`, `NAME(a, b)` or `NAME(a, ...)` and a body
    ///
    /// Redefinition replaces the previous definition, and a name that was
    /// undefined can be defined again.
    ///
    /// # Errors
    /// Returns `MalformedDirective` for an invalid left-hand side or a builtin name.
    pub fn define(&mut self, lhs: &str, body: &str) -> Result<(), ErrorKind> {
        let (name, params, is_variadic) = PreprocessorEngine::parse_signature(lhs)?;
        Self::check_not_builtin(&name, "redefine")?;
        debug!(name = %name, body, "define macro");
        self.macros
            .insert(name, MacroSlot::Defined(Macro::new(params, is_variadic, body)));
        Ok(())
    }

    /// Mark a macro as undefined
    ///
    /// The name stays known to the table, so [`MacroTable::is_undef`] holds.
    ///
    /// # Errors
    /// Returns `MalformedDirective` for an invalid or builtin name.
    pub fn undef(&mut self, name: &str) -> Result<(), ErrorKind> {
        let name = name.trim();
        if !is_identifier(name) {
            return Err(ErrorKind::MalformedDirective(format!("invalid macro name `{name}`")));
        }
        Self::check_not_builtin(name, "undefine")?;
        debug!(name, "undefine macro");
        self.macros.insert(name.to_string(), MacroSlot::Undefined);
        Ok(())
    }

    fn check_not_builtin(name: &str, verb: &str) -> Result<(), ErrorKind> {
        if BUILTIN_MACROS.contains(&name) {
            return Err(ErrorKind::MalformedDirective(format!(
                "cannot {verb} builtin macro `{name}`"
            )));
        }
        Ok(())
    }

    /// Whether `name` is currently defined (builtins always are)
    #[must_use]
    pub fn is_def(&self, name: &str) -> bool {
        BUILTIN_MACROS.contains(&name) || matches!(self.macros.get(name), Some(MacroSlot::Defined(_)))
    }

    /// Whether `name` was explicitly undefined
    ///
    /// A name the table has never seen is neither defined nor undefined.
    #[must_use]
    pub fn is_undef(&self, name: &str) -> bool {
        matches!(self.macros.get(name), Some(MacroSlot::Undefined))
    }

    /// Current definition of a user macro
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Macro> {
        match self.macros.get(name) {
            Some(MacroSlot::Defined(mac)) => Some(mac),
            _ => None,
        }
    }

    /// Define macros from `NAME=VALUE` entries, as passed with `-D`
    ///
    /// An entry without `=` defines the name with an empty body.
    ///
    /// # Errors
    /// Returns `MalformedDirective` for the first entry with an invalid name.
    pub fn get_from_cli<I, S>(&mut self, entries: I) -> Result<(), ErrorKind>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            let entry = entry.as_ref();
            let (lhs, body) = entry.split_once('=').unwrap_or((entry, ""));
            self.define(lhs, body)?;
        }
        Ok(())
    }

    /// Every known name with its state, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<MacroEntry> {
        let builtins = BUILTIN_MACROS.iter().filter_map(|name| {
            self.builtin_value(name).map(|value| MacroEntry {
                name: (*name).to_string(),
                state: MacroState::Builtin(value),
            })
        });
        let user = self.macros.iter().map(|(name, slot)| MacroEntry {
            name: name.clone(),
            state: match slot {
                MacroSlot::Defined(mac) => MacroState::Defined(mac.clone()),
                MacroSlot::Undefined => MacroState::Undefined,
            },
        });

        let mut entries: Vec<MacroEntry> = builtins.chain(user).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    fn builtin_value(&self, name: &str) -> Option<String> {
        match name {
            "__FILE__" => Some(format!("\"{}\"", self.location.file)),
            "__LINE__" => Some(self.location.line.to_string()),
            "__DATE__" => Some(format!("\"{}\"", format_date())),
            "__TIME__" => Some(format!("\"{}\"", format_time())),
            _ => None,
        }
    }

    /// Expand every macro occurrence in `text`
    ///
    /// Quoted literals in `text` are left alone. The result of each expansion
    /// is rescanned with the macro itself disabled, so self-referencing
    /// definitions terminate.
    ///
    /// # Errors
    /// Returns an error for bad macro calls or when the recursion limit is hit.
    pub fn expand(&self, text: &str) -> Result<String, ErrorKind> {
        let mut disabled = HashSet::new();
        self.expand_text(text, 0, &mut disabled)
    }

    fn expand_text(
        &self,
        text: &str,
        depth: usize,
        disabled: &mut HashSet<String>,
    ) -> Result<String, ErrorKind> {
        if depth > self.recursion_limit {
            return Err(ErrorKind::RecursionLimitExceeded(self.recursion_limit));
        }

        let tokens = PreprocessorEngine::tokenize_line(text);
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < tokens.len() {
            let Token::Identifier(name) = &tokens[i] else {
                PreprocessorEngine::push_token(&mut out, &tokens[i]);
                i += 1;
                continue;
            };

            if disabled.contains(name) {
                out.push_str(name);
                i += 1;
            } else if let Some(value) = self.builtin_value(name) {
                out.push_str(&value);
                i += 1;
            } else if let Some(mac) = self.get(name) {
                i = self.expand_invocation(name, mac, &tokens, i, depth, disabled, &mut out)?;
            } else {
                out.push_str(name);
                i += 1;
            }
        }
        Ok(out)
    }

    /// Expand the macro named at `tokens[i]`, returning the index after the call
    #[allow(clippy::too_many_arguments)]
    fn expand_invocation(
        &self,
        name: &str,
        mac: &Macro,
        tokens: &[Token],
        i: usize,
        depth: usize,
        disabled: &mut HashSet<String>,
        out: &mut String,
    ) -> Result<usize, ErrorKind> {
        let (args, next) = if mac.is_function_like() {
            let open = PreprocessorEngine::find_next_non_whitespace(tokens, i + 1);
            if tokens.get(open) != Some(&Token::Other('(')) {
                // a function-like name without arguments is plain text
                out.push_str(name);
                return Ok(i + 1);
            }
            PreprocessorEngine::collect_arguments(tokens, open).ok_or_else(|| {
                ErrorKind::MacroArgumentMismatch(format!(
                    "unterminated argument list in call to `{name}`"
                ))
            })?
        } else {
            (Vec::new(), i + 1)
        };

        let substituted = self.substitute(name, mac, args, depth, disabled)?;
        let (substituted, next) = self.pull_trailing_call(substituted, tokens, next, disabled);
        disabled.insert(name.to_string());
        let rescanned = self.expand_text(&substituted, depth + 1, disabled);
        disabled.remove(name);
        out.push_str(&rescanned?);
        Ok(next)
    }

    /// Append the argument list following a call when the replacement ends in
    /// the name of a function-like macro, so `#define G F` makes `G(1)` call `F`
    fn pull_trailing_call(
        &self,
        mut text: String,
        tokens: &[Token],
        next: usize,
        disabled: &HashSet<String>,
    ) -> (String, usize) {
        let trailing = PreprocessorEngine::tokenize_line(&text);
        let calls_macro = match trailing.last() {
            Some(Token::Identifier(callee)) => {
                !disabled.contains(callee)
                    && self.get(callee).is_some_and(Macro::is_function_like)
            }
            _ => false,
        };
        if !calls_macro {
            return (text, next);
        }

        let open = PreprocessorEngine::find_next_non_whitespace(tokens, next);
        if tokens.get(open) != Some(&Token::Other('(')) {
            return (text, next);
        }
        let Some((_, end)) = PreprocessorEngine::collect_arguments(tokens, open) else {
            return (text, next);
        };
        for token in &tokens[next..end] {
            PreprocessorEngine::push_token(&mut text, token);
        }
        (text, end)
    }

    /// Render a macro body with the given call arguments
    fn substitute(
        &self,
        name: &str,
        mac: &Macro,
        mut args: Vec<String>,
        depth: usize,
        disabled: &mut HashSet<String>,
    ) -> Result<String, ErrorKind> {
        let params = mac.params();
        // `F()` passes no arguments rather than one empty argument
        if params.is_empty() && !mac.is_variadic() && args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        if !mac.is_variadic() && args.len() > params.len() {
            return Err(ErrorKind::MacroArgumentMismatch(format!(
                "`{name}` takes {} argument(s), got {}",
                params.len(),
                args.len()
            )));
        }

        let (fixed, trailing) = args.split_at(params.len().min(args.len()));
        let argument = |index: usize| {
            fixed.get(index).ok_or_else(|| ErrorKind::UndefinedMacroReference {
                name: name.to_string(),
                param: params[index].clone(),
            })
        };

        let mut fragments = Vec::with_capacity(mac.body.len());
        for token in mac.body.iter() {
            let fragment = match token {
                BodyToken::Text(text) => text.clone(),
                BodyToken::Paste => {
                    fragments.push(None);
                    continue;
                }
                BodyToken::Param { index, raw: true } => argument(*index)?.clone(),
                BodyToken::Param { index, raw: false } => {
                    self.expand_text(argument(*index)?, depth + 1, disabled)?
                }
                BodyToken::Stringify(index) => format!("\"{}\"", argument(*index)?),
                BodyToken::VaArgs { raw: true } => trailing.join(","),
                BodyToken::VaArgs { raw: false } => {
                    self.expand_text(&trailing.join(","), depth + 1, disabled)?
                }
                BodyToken::StringifyVaArgs => trailing
                    .iter()
                    .map(|arg| format!("\"{arg}\""))
                    .collect::<Vec<_>>()
                    .join(","),
            };
            fragments.push(Some(fragment));
        }
        Ok(PreprocessorEngine::join_fragments(&fragments))
    }

    /// Evaluate a conditional expression such as `defined A && (B > 2 || 1.5 <= C)`
    ///
    /// `defined NAME` and `defined(NAME)` are resolved first, then the
    /// remaining text is macro-expanded and must reduce to numeric literals.
    ///
    /// # Errors
    /// Returns `MalformedExpression` if the expression is outside the grammar.
    pub fn evaluate(&self, expr: &str) -> Result<bool, ErrorKind> {
        let malformed = |reason: String| ErrorKind::MalformedExpression {
            expr: expr.trim().to_string(),
            reason,
        };

        let tokens = PreprocessorEngine::tokenize_line(expr);
        let mut resolved = String::with_capacity(expr.len());
        let mut i = 0;
        while i < tokens.len() {
            if !matches!(&tokens[i], Token::Identifier(word) if word == "defined") {
                PreprocessorEngine::push_token(&mut resolved, &tokens[i]);
                i += 1;
                continue;
            }

            let mut j = PreprocessorEngine::find_next_non_whitespace(&tokens, i + 1);
            let parenthesized = tokens.get(j) == Some(&Token::Other('('));
            if parenthesized {
                j = PreprocessorEngine::find_next_non_whitespace(&tokens, j + 1);
            }
            let Some(Token::Identifier(name)) = tokens.get(j) else {
                return Err(malformed("`defined` must be followed by a macro name".to_string()));
            };
            let defined = self.is_def(name);
            if parenthesized {
                j = PreprocessorEngine::find_next_non_whitespace(&tokens, j + 1);
                if tokens.get(j) != Some(&Token::Other(')')) {
                    return Err(malformed("expected `)` after `defined(NAME`".to_string()));
                }
            }
            resolved.push(if defined { '1' } else { '0' });
            i = j + 1;
        }

        let expanded = self.expand(&resolved)?;
        let expr_tokens = PreprocessorEngine::tokenize_expression(&expanded).map_err(malformed)?;
        PreprocessorEngine::evaluate_expression_tokens(&expr_tokens).map_err(malformed)
    }
}
