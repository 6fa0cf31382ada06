use tracing::{debug, warn};

use crate::engine::PreprocessorEngine;
use crate::error::ErrorKind;
use crate::macro_table::MacroTable;
use crate::template::TemplateBlock;
use crate::token::is_identifier_continue;

/// A recognized directive line, borrowed from the source
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive<'a> {
    /// `#define NAME[(params)] [body]`
    Define(&'a str),
    /// `#undef NAME`
    Undef(&'a str),
    /// `#include "path"`, operand unparsed
    Include(&'a str),
    /// `#ifdef NAME`
    Ifdef(&'a str),
    /// `#ifndef NAME`
    Ifndef(&'a str),
    /// `#if EXPR`
    If(&'a str),
    /// `#elif EXPR`
    Elif(&'a str),
    /// `#else`
    Else,
    /// `#endif`
    Endif,
    /// `#error MSG`
    Error(&'a str),
    /// `#warning MSG`
    Warning(&'a str),
    /// `#PFM for ...:`, with everything after `#PFM`
    PfmFor(&'a str),
    /// `#PFM endfor`
    PfmEndfor,
    /// A lone `#`
    Null,
    /// Any other keyword
    Unknown(&'a str),
}

impl<'a> Directive<'a> {
    /// Recognize a directive line (first non-blank character `#`)
    ///
    /// Returns `None` for ordinary lines. The line must not carry its terminator.
    #[must_use]
    pub fn parse(line: &'a str) -> Option<Self> {
        let after_hash = line.trim_start().strip_prefix('#')?;

        if let Some(rest) = after_hash
            .strip_prefix("PFM")
            .filter(|r| !r.starts_with(is_identifier_continue))
        {
            let command = rest.trim();
            let keyword_end = command
                .find(|c: char| !is_identifier_continue(c))
                .unwrap_or(command.len());
            return Some(match &command[..keyword_end] {
                "endfor" if command[keyword_end..].trim().is_empty() => Self::PfmEndfor,
                "for" if keyword_end < command.len() => Self::PfmFor(rest),
                _ => Self::Unknown(after_hash.trim_end()),
            });
        }

        let body = after_hash.trim_start();
        let keyword_end = body
            .find(|c: char| !is_identifier_continue(c))
            .unwrap_or(body.len());
        let (keyword, rest) = body.split_at(keyword_end);
        let rest = rest.trim();

        Some(match keyword {
            "define" => Self::Define(rest),
            "undef" => Self::Undef(rest),
            "include" => Self::Include(rest),
            "ifdef" => Self::Ifdef(rest),
            "ifndef" => Self::Ifndef(rest),
            "if" => Self::If(rest),
            "elif" => Self::Elif(rest),
            "else" => Self::Else,
            "endif" => Self::Endif,
            "error" => Self::Error(rest),
            "warning" => Self::Warning(rest),
            "" if rest.is_empty() => Self::Null,
            _ => Self::Unknown(body.trim_end()),
        })
    }

    /// Whether this directive belongs to the conditional family
    ///
    /// Only these are looked at inside an inactive region.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            Self::Ifdef(_) | Self::Ifndef(_) | Self::If(_) | Self::Elif(_) | Self::Else | Self::Endif
        )
    }
}

/// What happens to the current physical line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Emit the line after macro expansion
    Print,
    /// Suppress the line
    Omit,
    /// Splice in the file named by [`ScopeState::include_target`]
    Include,
}

/// Kind of the innermost open block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// No block is open
    Normal,
    /// Inside an active conditional branch
    Print,
    /// Inside an inactive conditional branch
    Omit,
    /// Inside a `#PFM for` block
    ForBlock,
}

#[derive(Clone, Copy, Debug)]
struct Frame {
    /// Lines in the current branch are emitted
    active: bool,
    /// Some branch of this block has already been selected
    taken: bool,
    /// The enclosing region is active
    parent_active: bool,
    seen_else: bool,
}

/// Conditional scope of a preprocessing run
///
/// Conditionals form a stack of frames. Within one block the first branch
/// whose test holds is selected; later `#elif` and `#else` branches are
/// skipped.
#[derive(Clone, Debug)]
pub struct ScopeState {
    action: Action,
    frames: Vec<Frame>,
    include_target: Option<String>,
    in_template: bool,
    /// A `#PFM endfor` closed a block and no conditional has run since
    template_closed: bool,
}

impl Default for ScopeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeState {
    /// Fresh state: no open blocks, printing
    #[must_use]
    pub fn new() -> Self {
        Self {
            action: Action::Print,
            frames: Vec::new(),
            include_target: None,
            in_template: false,
            template_closed: false,
        }
    }

    /// Forget all open blocks
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Action decided for the last line
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Kind of the innermost open block
    #[must_use]
    pub fn scope(&self) -> Scope {
        if self.in_template {
            return Scope::ForBlock;
        }
        match self.frames.last() {
            None if self.template_closed => Scope::Print,
            None => Scope::Normal,
            Some(frame) if frame.active => Scope::Print,
            Some(_) => Scope::Omit,
        }
    }

    /// File requested by the last `#include`, while `action` is `Include`
    #[must_use]
    pub fn include_target(&self) -> Option<&str> {
        self.include_target.as_deref()
    }

    /// Number of open conditional blocks
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether lines in the current region are emitted
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.frames.last().is_none_or(|frame| frame.active)
    }

    /// Classify one line (without terminator) and update the state
    ///
    /// Returns the rendered lines when the line closes a template block.
    ///
    /// # Errors
    /// Fails on malformed or stray directives, bad expressions, template
    /// errors and active `#error` directives.
    pub fn apply(
        &mut self,
        line: &str,
        macros: &mut MacroTable,
        template: &mut TemplateBlock,
    ) -> Result<Option<Vec<String>>, ErrorKind> {
        self.action = Action::Omit;
        self.include_target = None;

        let Some(directive) = Directive::parse(line) else {
            if template.is_active() {
                if self.is_active() {
                    template.capture(line);
                }
            } else if self.is_active() {
                self.action = Action::Print;
            }
            return Ok(None);
        };

        if !self.is_active() && !directive.is_conditional() {
            return Ok(None);
        }

        let closes_template = matches!(directive, Directive::PfmEndfor);
        if directive.is_conditional() {
            self.template_closed = false;
        }
        let rendered = self.apply_directive(directive, macros, template);
        self.in_template = template.is_active();
        self.template_closed |= closes_template && rendered.is_ok();
        rendered
    }

    fn apply_directive(
        &mut self,
        directive: Directive<'_>,
        macros: &mut MacroTable,
        template: &mut TemplateBlock,
    ) -> Result<Option<Vec<String>>, ErrorKind> {
        match directive {
            Directive::Define(rest) => {
                let (lhs, body) = PreprocessorEngine::split_define(rest)?;
                macros.define(lhs, body)?;
            }
            Directive::Undef(rest) => macros.undef(Self::operand_name("undef", rest)?)?,
            Directive::Include(rest) => {
                let target = rest
                    .strip_prefix('"')
                    .and_then(|r| r.strip_suffix('"'))
                    .filter(|path| !path.is_empty() && !path.contains('"'))
                    .ok_or_else(|| {
                        ErrorKind::MalformedDirective(format!(
                            "#include expects \"path\", got `{rest}`"
                        ))
                    })?;
                debug!(target, "include requested");
                self.action = Action::Include;
                self.include_target = Some(target.to_string());
            }
            Directive::Ifdef(rest) => {
                let name = Self::operand_name("ifdef", rest)?;
                self.push(|| Ok(macros.is_def(name)))?;
            }
            Directive::Ifndef(rest) => {
                let name = Self::operand_name("ifndef", rest)?;
                self.push(|| Ok(!macros.is_def(name)))?;
            }
            Directive::If(expr) => self.push(|| macros.evaluate(expr))?,
            Directive::Elif(expr) => self.elif(|| macros.evaluate(expr))?,
            Directive::Else => self.else_branch()?,
            Directive::Endif => self.endif()?,
            Directive::Error(message) => return Err(ErrorKind::ErrorDirective(message.to_string())),
            Directive::Warning(message) => {
                let location = macros.location();
                warn!(file = %location.file, line = location.line, "#warning: {message}");
            }
            Directive::PfmFor(expression) => template.open(expression)?,
            Directive::PfmEndfor => {
                if !template.is_active() {
                    return Err(ErrorKind::MalformedDirective(
                        "#PFM endfor without #PFM for".to_string(),
                    ));
                }
                let rendered = template.close_lines()?;
                self.action = Action::Print;
                return Ok(Some(rendered));
            }
            Directive::Null => {}
            Directive::Unknown(text) => {
                return Err(ErrorKind::MalformedDirective(format!(
                    "unknown directive `#{text}`"
                )));
            }
        }
        Ok(None)
    }

    fn operand_name<'a>(directive: &str, rest: &'a str) -> Result<&'a str, ErrorKind> {
        rest.split_whitespace().next().ok_or_else(|| {
            ErrorKind::MalformedDirective(format!("#{directive} requires a macro name"))
        })
    }

    /// Open a block; the test only runs when the enclosing region is active
    fn push(&mut self, test: impl FnOnce() -> Result<bool, ErrorKind>) -> Result<(), ErrorKind> {
        let parent_active = self.is_active();
        let active = parent_active && test()?;
        self.frames.push(Frame {
            active,
            taken: active,
            parent_active,
            seen_else: false,
        });
        Ok(())
    }

    fn top(&mut self, directive: &str) -> Result<&mut Frame, ErrorKind> {
        let frame = self.frames.last_mut().ok_or_else(|| {
            ErrorKind::MalformedDirective(format!("#{directive} without #if"))
        })?;
        if frame.seen_else {
            return Err(ErrorKind::MalformedDirective(format!("#{directive} after #else")));
        }
        Ok(frame)
    }

    fn elif(&mut self, test: impl FnOnce() -> Result<bool, ErrorKind>) -> Result<(), ErrorKind> {
        let frame = self.top("elif")?;
        let eligible = frame.parent_active && !frame.taken;
        let active = eligible && test()?;
        let frame = self.top("elif")?;
        frame.active = active;
        frame.taken |= active;
        Ok(())
    }

    fn else_branch(&mut self) -> Result<(), ErrorKind> {
        let frame = self.top("else")?;
        frame.active = frame.parent_active && !frame.taken;
        frame.taken = true;
        frame.seen_else = true;
        Ok(())
    }

    fn endif(&mut self) -> Result<(), ErrorKind> {
        self.frames
            .pop()
            .map(|_| ())
            .ok_or_else(|| ErrorKind::MalformedDirective("#endif without #if".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        state: ScopeState,
        macros: MacroTable,
        template: TemplateBlock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: ScopeState::new(),
                macros: MacroTable::new(),
                template: TemplateBlock::new(),
            }
        }

        fn apply(&mut self, line: &str) -> Result<Option<Vec<String>>, ErrorKind> {
            self.state.apply(line, &mut self.macros, &mut self.template)
        }

        /// Lines that would be printed, in order
        fn run(&mut self, lines: &[&str]) -> Vec<String> {
            let mut out = Vec::new();
            for line in lines {
                match self.apply(line).unwrap() {
                    Some(rendered) => out.extend(rendered),
                    None if self.state.action() == Action::Print => out.push((*line).to_string()),
                    None => {}
                }
            }
            out
        }
    }

    #[test]
    fn parse_recognizes_directives() {
        assert_eq!(Directive::parse("print*, x"), None);
        assert_eq!(Directive::parse("x = 1 # 2"), None);
        assert_eq!(Directive::parse("#define FOO bar"), Some(Directive::Define("FOO bar")));
        assert_eq!(Directive::parse("  #  ifdef FIRST "), Some(Directive::Ifdef("FIRST")));
        assert_eq!(
            Directive::parse("#elif defined FIRST"),
            Some(Directive::Elif("defined FIRST"))
        );
        assert_eq!(Directive::parse("#else"), Some(Directive::Else));
        assert_eq!(Directive::parse("#endif"), Some(Directive::Endif));
        assert_eq!(
            Directive::parse("#include \"mod.inc\""),
            Some(Directive::Include("\"mod.inc\""))
        );
        assert_eq!(Directive::parse("#"), Some(Directive::Null));
        assert_eq!(Directive::parse("#pragma once"), Some(Directive::Unknown("pragma once")));
        assert_eq!(Directive::parse("#ifdefX"), Some(Directive::Unknown("ifdefX")));
    }

    #[test]
    fn parse_template_directives() {
        assert_eq!(
            Directive::parse("#PFM for i in range(1,4):"),
            Some(Directive::PfmFor(" for i in range(1,4):"))
        );
        assert_eq!(Directive::parse("#PFM endfor "), Some(Directive::PfmEndfor));
        assert_eq!(Directive::parse("#PFM endfor x"), Some(Directive::Unknown("PFM endfor x")));
        assert_eq!(Directive::parse("#PFM"), Some(Directive::Unknown("PFM")));
        assert_eq!(Directive::parse("#PFMX"), Some(Directive::Unknown("PFMX")));
    }

    #[test]
    fn ifdef_scope_transitions() {
        let mut fx = Fixture::new();
        assert_eq!(fx.state.scope(), Scope::Normal);

        fx.apply("#define FIRST").unwrap();
        assert_eq!(fx.state.action(), Action::Omit);
        assert!(fx.macros.is_def("FIRST"));

        fx.apply("#ifdef FIRST").unwrap();
        assert_eq!(fx.state.action(), Action::Omit);
        assert_eq!(fx.state.scope(), Scope::Print);

        fx.apply("print hello").unwrap();
        assert_eq!(fx.state.action(), Action::Print);

        fx.apply("#else").unwrap();
        assert_eq!(fx.state.scope(), Scope::Omit);
        fx.apply("print hello").unwrap();
        assert_eq!(fx.state.action(), Action::Omit);

        fx.apply("#endif").unwrap();
        assert_eq!(fx.state.action(), Action::Omit);
        assert_eq!(fx.state.scope(), Scope::Normal);
    }

    #[test]
    fn ifndef_and_undef() {
        let mut fx = Fixture::new();
        let out = fx.run(&[
            "#ifndef FIRST",
            "a",
            "#endif",
            "#define FIRST",
            "#undef FIRST",
            "#ifndef FIRST",
            "b",
            "#endif",
        ]);
        assert_eq!(out, vec!["a", "b"]);
        assert!(fx.macros.is_undef("FIRST"));
    }

    #[test]
    fn elif_chain_takes_first_match() {
        let mut fx = Fixture::new();
        let out = fx.run(&[
            "#define FIRST",
            "#define SECOND",
            "#ifdef THIRD",
            "third",
            "#elif defined FIRST",
            "first",
            "#elif defined SECOND",
            "second",
            "#else",
            "none",
            "#endif",
        ]);
        assert_eq!(out, vec!["first"]);
    }

    #[test]
    fn nested_blocks_inside_inactive_region() {
        let mut fx = Fixture::new();
        let out = fx.run(&[
            "#ifdef MISSING",
            "#ifndef MISSING",
            "inner",
            "#else",
            "inner-else",
            "#endif",
            "#define LEAK",
            "#if UNKNOWN > 1",
            "#endif",
            "#else",
            "outer-else",
            "#endif",
        ]);
        assert_eq!(out, vec!["outer-else"]);
        assert!(!fx.macros.is_def("LEAK"));
        assert_eq!(fx.state.depth(), 0);
    }

    #[test]
    fn if_expressions() {
        let mut fx = Fixture::new();
        let out = fx.run(&[
            "#define LEVEL 2",
            "#if LEVEL == 1",
            "one",
            "#elif LEVEL == 2 && defined(LEVEL)",
            "two",
            "#endif",
        ]);
        assert_eq!(out, vec!["two"]);

        assert!(matches!(
            fx.apply("#if LEVEL >"),
            Err(ErrorKind::MalformedExpression { .. })
        ));
    }

    #[test]
    fn stray_and_malformed_directives() {
        for line in ["#else", "#endif", "#elif 1", "#PFM endfor", "#ifdef", "#undef ", "#define"] {
            let mut fx = Fixture::new();
            assert!(
                matches!(fx.apply(line), Err(ErrorKind::MalformedDirective(_))),
                "{line}"
            );
        }

        let mut fx = Fixture::new();
        fx.apply("#ifdef X").unwrap();
        fx.apply("#else").unwrap();
        assert!(fx.apply("#else").is_err());
        assert!(fx.apply("#elif 1").is_err());
    }

    #[test]
    fn unknown_directives_only_fail_when_active() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.apply("#pragma once"),
            Err(ErrorKind::MalformedDirective(_))
        ));

        let mut fx = Fixture::new();
        fx.apply("#ifdef MISSING").unwrap();
        assert_eq!(fx.apply("#pragma once").unwrap(), None);
        assert!(fx.apply("#error unreachable").is_ok());
    }

    #[test]
    fn error_directive() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.apply("#error unsupported compiler"),
            Err(ErrorKind::ErrorDirective(ref msg)) if msg == "unsupported compiler"
        ));
        fx.apply("#warning deprecated").unwrap();
        assert_eq!(fx.state.action(), Action::Omit);
    }

    #[test]
    fn include_sets_target() {
        let mut fx = Fixture::new();
        fx.apply("#include \"kinds.inc\"").unwrap();
        assert_eq!(fx.state.action(), Action::Include);
        assert_eq!(fx.state.include_target(), Some("kinds.inc"));

        fx.apply("x = 1").unwrap();
        assert_eq!(fx.state.action(), Action::Print);
        assert_eq!(fx.state.include_target(), None);

        for bad in ["#include kinds.inc", "#include <kinds.inc>", "#include \"\""] {
            assert!(fx.apply(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn template_block_cycle() {
        let mut fx = Fixture::new();
        assert_eq!(fx.apply("#PFM for i in range(1,4):").unwrap(), None);
        assert_eq!(fx.state.action(), Action::Omit);
        assert_eq!(fx.state.scope(), Scope::ForBlock);
        assert!(fx.template.is_active());
        assert_eq!(fx.template.loop_expression(), " for i in range(1,4):");

        fx.apply("  module procedure less_than_type_$i").unwrap();
        assert_eq!(fx.state.action(), Action::Omit);

        let rendered = fx.apply("#PFM endfor ").unwrap().unwrap();
        assert_eq!(fx.state.action(), Action::Print);
        assert_eq!(fx.state.scope(), Scope::Print);
        assert!(!fx.template.is_active());
        assert!(fx.template.loop_expression().is_empty());
        assert!(fx.template.captured_lines().is_empty());
        assert_eq!(
            rendered,
            vec![
                "  module procedure less_than_type_1",
                "  module procedure less_than_type_2",
                "  module procedure less_than_type_3",
            ]
        );
    }

    #[test]
    fn scope_after_endfor_until_next_conditional() {
        let mut fx = Fixture::new();
        fx.run(&["#PFM for i in [1]:", "x$i", "#PFM endfor"]);
        fx.apply("plain").unwrap();
        assert_eq!(fx.state.scope(), Scope::Print);
        assert_eq!(fx.state.action(), Action::Print);

        fx.apply("#ifdef NOPE").unwrap();
        assert_eq!(fx.state.scope(), Scope::Omit);
        fx.apply("#endif").unwrap();
        assert_eq!(fx.state.scope(), Scope::Normal);
    }

    #[test]
    fn template_capture_honors_conditionals() {
        let mut fx = Fixture::new();
        let out = fx.run(&[
            "#PFM for k in [4, 8]:",
            "#ifdef WIDE",
            "wide$k",
            "#else",
            "narrow$k",
            "#endif",
            "#PFM endfor",
        ]);
        assert_eq!(out, vec!["narrow4", "narrow8"]);
    }

    #[test]
    fn nested_template_is_rejected() {
        let mut fx = Fixture::new();
        fx.apply("#PFM for i in [1]:").unwrap();
        assert!(matches!(
            fx.apply("#PFM for j in [2]:"),
            Err(ErrorKind::MalformedDirective(_))
        ));
    }
}
