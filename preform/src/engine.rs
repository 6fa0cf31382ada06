use crate::error::ErrorKind;
use crate::token::{
    BodyToken, ExprToken, Token, is_identifier, is_identifier_continue, is_identifier_start,
};

/// Arguments of a function-like macro call and the index just past its `)`
pub(crate) type MacroArguments = (Vec<String>, usize);

/// Macro name, its parameter list (`None` when object-like) and whether `...` ends it
pub(crate) type MacroSignature = (String, Option<Vec<String>>, bool);

const VA_ARGS: &str = "__VA_ARGS__";

/// Pure preprocessing engine containing stateless logic
///
/// Everything here works on plain strings and token slices so that the
/// stateful parts (macro table, directive machine, driver) stay small.
pub struct PreprocessorEngine;

impl PreprocessorEngine {
    /// Tokenize a line of source code into tokens
    ///
    /// Quoted literals run to the matching quote or to the end of the line.
    /// Backslash is not an escape character in the host language.
    pub(crate) fn tokenize_line(line: &str) -> Vec<Token> {
        let chars: Vec<char> = line.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let ch = chars[i];
            if is_identifier_start(ch) {
                let start = i;
                while i < chars.len() && is_identifier_continue(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Identifier(chars[start..i].iter().collect()));
            } else if ch.is_ascii_digit() {
                let end = Self::scan_number(&chars, i);
                tokens.push(Token::Number(chars[i..end].iter().collect()));
                i = end;
            } else if ch == '"' || ch == '\'' {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != ch {
                    i += 1;
                }
                // closing quote, if any
                i = (i + 1).min(chars.len());
                tokens.push(Token::Quoted(chars[start..i].iter().collect()));
            } else if ch.is_whitespace() {
                let start = i;
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                tokens.push(Token::Whitespace(chars[start..i].iter().collect()));
            } else {
                tokens.push(Token::Other(ch));
                i += 1;
            }
        }
        tokens
    }

    /// Scan a numeric literal starting at `start`, returning the end index
    ///
    /// Accepts `12`, `1.5`, `1.`, `1.5e-3`, `1d0` and kind suffixes like
    /// `8_int64`, but stops before Fortran dot-operators as in `1.and.`.
    fn scan_number(chars: &[char], start: usize) -> usize {
        let at = |k: usize| chars.get(k).copied();
        let mut i = start;
        while at(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        // `1.and.` keeps the dot for the operator; `1.d0` is a literal
        let operator_follows = at(i + 1)
            .is_some_and(|c| c.is_ascii_alphabetic() && !Self::is_exponent_marker(c));
        if at(i) == Some('.') && !operator_follows {
            i += 1;
            while at(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
        }
        if at(i).is_some_and(Self::is_exponent_marker) {
            let digits_at = if matches!(at(i + 1), Some('+' | '-')) { i + 2 } else { i + 1 };
            if at(digits_at).is_some_and(|c| c.is_ascii_digit()) {
                i = digits_at;
                while at(i).is_some_and(|c| c.is_ascii_digit()) {
                    i += 1;
                }
            }
        }
        if at(i) == Some('_') && at(i + 1).is_some_and(is_identifier_continue) {
            i += 1;
            while at(i).is_some_and(is_identifier_continue) {
                i += 1;
            }
        }
        i
    }

    const fn is_exponent_marker(c: char) -> bool {
        matches!(c, 'e' | 'E' | 'd' | 'D')
    }

    /// Convert a token to its string representation
    pub(crate) fn push_token(out: &mut String, token: &Token) {
        match token {
            Token::Identifier(s) | Token::Number(s) | Token::Quoted(s) | Token::Whitespace(s) => {
                out.push_str(s);
            }
            Token::Other(c) => out.push(*c),
        }
    }

    /// Convert tokens back to a string
    #[cfg(test)]
    pub(crate) fn tokens_to_string(tokens: &[Token]) -> String {
        let mut out = String::new();
        for t in tokens {
            Self::push_token(&mut out, t);
        }
        out
    }

    /// Index of the first non-whitespace token at or after `start`
    pub(crate) fn find_next_non_whitespace(tokens: &[Token], start: usize) -> usize {
        let mut j = start;
        while j < tokens.len() && matches!(tokens[j], Token::Whitespace(_)) {
            j += 1;
        }
        j
    }

    /// Collect the arguments of a macro call whose `(` sits at `paren_idx`
    ///
    /// Arguments are split on top-level commas; nested parentheses and quoted
    /// literals are kept intact. Each argument is trimmed. Returns `None` when
    /// the closing parenthesis is missing.
    pub(crate) fn collect_arguments(tokens: &[Token], paren_idx: usize) -> Option<MacroArguments> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut depth = 1usize;

        for (i, token) in tokens.iter().enumerate().skip(paren_idx + 1) {
            match token {
                Token::Other('(') => {
                    depth += 1;
                    current.push('(');
                }
                Token::Other(')') => {
                    depth -= 1;
                    if depth == 0 {
                        args.push(current.trim().to_string());
                        return Some((args, i + 1));
                    }
                    current.push(')');
                }
                Token::Other(',') if depth == 1 => {
                    args.push(current.trim().to_string());
                    current.clear();
                }
                other => Self::push_token(&mut current, other),
            }
        }
        None
    }

    /// Split the operand of `#define` into its left-hand side and body
    ///
    /// A parameter list only belongs to the name when `(` follows it with no
    /// whitespace in between, as in C.
    pub(crate) fn split_define(rest: &str) -> Result<(&str, &str), ErrorKind> {
        let rest = rest.trim_start();
        let name_len = rest
            .char_indices()
            .find(|&(_, c)| !is_identifier_continue(c))
            .map_or(rest.len(), |(i, _)| i);
        if name_len == 0 {
            return Err(ErrorKind::MalformedDirective(format!("#define {rest}")));
        }

        if rest[name_len..].starts_with('(') {
            let Some(close) = rest[name_len..].find(')') else {
                return Err(ErrorKind::MalformedDirective(format!(
                    "unterminated parameter list in `#define {rest}`"
                )));
            };
            let lhs_end = name_len + close + 1;
            Ok((&rest[..lhs_end], rest[lhs_end..].trim()))
        } else {
            Ok((&rest[..name_len], rest[name_len..].trim()))
        }
    }

    /// Parse `NAME`, `NAME(a, b)`, `NAME(...)` or `NAME(a, ...)`
    pub(crate) fn parse_signature(lhs: &str) -> Result<MacroSignature, ErrorKind> {
        let lhs = lhs.trim();
        let malformed = || ErrorKind::MalformedDirective(format!("invalid macro name `{lhs}`"));

        let (name, rest) = match lhs.find('(') {
            Some(open) => (lhs[..open].trim_end(), &lhs[open..]),
            None => (lhs, ""),
        };
        if !is_identifier(name) {
            return Err(malformed());
        }
        if rest.is_empty() {
            return Ok((name.to_string(), None, false));
        }

        let inner = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(malformed)?;
        if inner.trim().is_empty() {
            return Ok((name.to_string(), Some(Vec::new()), false));
        }

        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        let mut params = Vec::with_capacity(parts.len());
        let mut is_variadic = false;
        for (i, part) in parts.iter().enumerate() {
            if *part == "..." && i + 1 == parts.len() {
                is_variadic = true;
            } else if is_identifier(part) && *part != VA_ARGS && !params.iter().any(|p| p == part) {
                params.push((*part).to_string());
            } else {
                return Err(ErrorKind::MalformedDirective(format!(
                    "invalid parameter `{part}` in `{lhs}`"
                )));
            }
        }
        Ok((name.to_string(), Some(params), is_variadic))
    }

    /// Pre-tokenize a macro body once, at definition time
    ///
    /// Parameter names are recognized at identifier boundaries anywhere in
    /// the body, quoted literals included. `#` only stringifies when followed
    /// by a parameter of a function-like macro; `##` always pastes.
    pub(crate) fn tokenize_body(body: &str, params: Option<&[String]>, is_variadic: bool) -> Vec<BodyToken> {
        let chars: Vec<char> = body.chars().collect();
        let mut tokens = Vec::new();
        let mut text = String::new();
        let mut i = 0;

        let lookup = |ident: &str| -> Option<BodyToken> {
            let params = params?;
            if let Some(index) = params.iter().position(|p| p == ident) {
                return Some(BodyToken::Param { index, raw: false });
            }
            (is_variadic && ident == VA_ARGS).then_some(BodyToken::VaArgs { raw: false })
        };
        let flush = |text: &mut String, tokens: &mut Vec<BodyToken>| {
            if !text.is_empty() {
                tokens.push(BodyToken::Text(std::mem::take(text)));
            }
        };

        while i < chars.len() {
            let ch = chars[i];
            if ch == '#' && chars.get(i + 1) == Some(&'#') {
                flush(&mut text, &mut tokens);
                tokens.push(BodyToken::Paste);
                i += 2;
            } else if ch == '#' {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                let start = j;
                while j < chars.len() && is_identifier_continue(chars[j]) {
                    j += 1;
                }
                let ident: String = chars[start..j].iter().collect();
                let stringified = match lookup(&ident) {
                    Some(BodyToken::Param { index, .. }) => Some(BodyToken::Stringify(index)),
                    Some(BodyToken::VaArgs { .. }) => Some(BodyToken::StringifyVaArgs),
                    _ => None,
                };
                if let Some(token) = stringified.filter(|_| is_identifier(&ident)) {
                    flush(&mut text, &mut tokens);
                    tokens.push(token);
                    i = j;
                } else {
                    text.push(ch);
                    i += 1;
                }
            } else if is_identifier_continue(ch) {
                let start = i;
                while i < chars.len() && is_identifier_continue(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match lookup(&word).filter(|_| is_identifier_start(ch)) {
                    Some(token) => {
                        flush(&mut text, &mut tokens);
                        tokens.push(token);
                    }
                    None => text.push_str(&word),
                }
            } else {
                text.push(ch);
                i += 1;
            }
        }
        flush(&mut text, &mut tokens);
        Self::mark_paste_operands(&mut tokens);
        tokens
    }

    /// Operands of `##` are substituted without prior expansion
    fn mark_paste_operands(tokens: &mut [BodyToken]) {
        let is_blank = |t: &BodyToken| matches!(t, BodyToken::Text(s) if s.trim().is_empty());
        let paste_positions: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == BodyToken::Paste)
            .map(|(i, _)| i)
            .collect();

        for pos in paste_positions {
            let before = (0..pos).rev().find(|&k| !is_blank(&tokens[k]));
            let after = (pos + 1..tokens.len()).find(|&k| !is_blank(&tokens[k]));
            for k in before.into_iter().chain(after) {
                match &mut tokens[k] {
                    BodyToken::Param { raw, .. } | BodyToken::VaArgs { raw } => *raw = true,
                    _ => {}
                }
            }
        }
    }

    /// Join rendered body fragments, applying `##`
    ///
    /// `None` stands for a paste joint: trailing whitespace before it and
    /// leading whitespace after it are dropped.
    pub(crate) fn join_fragments(fragments: &[Option<String>]) -> String {
        let mut out = String::new();
        let mut pasting = false;
        for fragment in fragments {
            match fragment {
                None => {
                    out.truncate(out.trim_end().len());
                    pasting = true;
                }
                Some(text) => {
                    let text = if pasting { text.trim_start() } else { text.as_str() };
                    if text.is_empty() {
                        continue;
                    }
                    pasting = false;
                    out.push_str(text);
                }
            }
        }
        out
    }

    /// Tokenize expression string into expression tokens
    pub(crate) fn tokenize_expression(expr: &str) -> Result<Vec<ExprToken>, String> {
        let chars: Vec<char> = expr.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let ch = chars[i];
            let next = chars.get(i + 1).copied();
            let negative_literal = ch == '-'
                && next.is_some_and(|c| c.is_ascii_digit() || c == '.')
                && !matches!(tokens.last(), Some(ExprToken::Number(_) | ExprToken::RParen));
            match ch {
                c if c.is_ascii_digit() || c == '.' || negative_literal => {
                    let start = i;
                    i += 1;
                    while i < chars.len()
                        && (chars[i].is_ascii_digit()
                            || chars[i] == '.'
                            || matches!(chars[i], 'e' | 'E')
                            || (matches!(chars[i], '+' | '-') && matches!(chars[i - 1], 'e' | 'E')))
                    {
                        i += 1;
                    }
                    let literal: String = chars[start..i].iter().collect();
                    let value = literal
                        .parse::<f64>()
                        .map_err(|_| format!("invalid number `{literal}`"))?;
                    tokens.push(ExprToken::Number(value));
                    continue;
                }
                c if is_identifier_start(c) => {
                    let start = i;
                    while i < chars.len() && is_identifier_continue(chars[i]) {
                        i += 1;
                    }
                    tokens.push(ExprToken::Identifier(chars[start..i].iter().collect()));
                    continue;
                }
                '(' => tokens.push(ExprToken::LParen),
                ')' => tokens.push(ExprToken::RParen),
                '=' if next == Some('=') => {
                    tokens.push(ExprToken::Equal);
                    i += 1;
                }
                '!' if next == Some('=') => {
                    tokens.push(ExprToken::NotEqual);
                    i += 1;
                }
                '<' if next == Some('=') => {
                    tokens.push(ExprToken::LessEqual);
                    i += 1;
                }
                '>' if next == Some('=') => {
                    tokens.push(ExprToken::GreaterEqual);
                    i += 1;
                }
                '<' => tokens.push(ExprToken::Less),
                '>' => tokens.push(ExprToken::Greater),
                '&' if next == Some('&') => {
                    tokens.push(ExprToken::And);
                    i += 1;
                }
                '|' if next == Some('|') => {
                    tokens.push(ExprToken::Or);
                    i += 1;
                }
                c if c.is_whitespace() => {}
                c => return Err(format!("unexpected character `{c}`")),
            }
            i += 1;
        }

        Ok(tokens)
    }

    /// Evaluate a conditional expression from tokens
    ///
    /// Grammar, loosest first:
    ///
    /// ```text
    /// or         := and ( "||" and )*
    /// and        := comparison ( "&&" comparison )*
    /// comparison := primary ( ("<" | ">" | "<=" | ">=" | "==" | "!=") primary )?
    /// primary    := NUMBER | "(" or ")"
    /// ```
    ///
    /// `defined` terms must already have been replaced by `1` or `0`.
    pub(crate) fn evaluate_expression_tokens(tokens: &[ExprToken]) -> Result<bool, String> {
        let mut pos = 0;
        let result = Self::parse_or(tokens, &mut pos)?;
        if pos != tokens.len() {
            return Err("unexpected tokens at end of expression".to_string());
        }
        Ok(result != 0.0)
    }

    fn parse_or(tokens: &[ExprToken], pos: &mut usize) -> Result<f64, String> {
        let mut left = Self::parse_and(tokens, pos)?;
        while tokens.get(*pos) == Some(&ExprToken::Or) {
            *pos += 1;
            let right = Self::parse_and(tokens, pos)?;
            left = f64::from(u8::from(left != 0.0 || right != 0.0));
        }
        Ok(left)
    }

    fn parse_and(tokens: &[ExprToken], pos: &mut usize) -> Result<f64, String> {
        let mut left = Self::parse_comparison(tokens, pos)?;
        while tokens.get(*pos) == Some(&ExprToken::And) {
            *pos += 1;
            let right = Self::parse_comparison(tokens, pos)?;
            left = f64::from(u8::from(left != 0.0 && right != 0.0));
        }
        Ok(left)
    }

    fn parse_comparison(tokens: &[ExprToken], pos: &mut usize) -> Result<f64, String> {
        let left = Self::parse_primary(tokens, pos)?;
        let compare: fn(f64, f64) -> bool = match tokens.get(*pos) {
            Some(ExprToken::Equal) => |a, b| a == b,
            Some(ExprToken::NotEqual) => |a, b| a != b,
            Some(ExprToken::Less) => |a, b| a < b,
            Some(ExprToken::LessEqual) => |a, b| a <= b,
            Some(ExprToken::Greater) => |a, b| a > b,
            Some(ExprToken::GreaterEqual) => |a, b| a >= b,
            _ => return Ok(left),
        };
        *pos += 1;
        let right = Self::parse_primary(tokens, pos)?;
        Ok(f64::from(u8::from(compare(left, right))))
    }

    fn parse_primary(tokens: &[ExprToken], pos: &mut usize) -> Result<f64, String> {
        match tokens.get(*pos) {
            None => Err("unexpected end of expression".to_string()),
            Some(ExprToken::Number(val)) => {
                *pos += 1;
                Ok(*val)
            }
            Some(ExprToken::LParen) => {
                *pos += 1;
                let val = Self::parse_or(tokens, pos)?;
                if tokens.get(*pos) != Some(&ExprToken::RParen) {
                    return Err("expected `)`".to_string());
                }
                *pos += 1;
                Ok(val)
            }
            Some(ExprToken::Identifier(ident)) => Err(format!("unknown identifier `{ident}`")),
            Some(other) => Err(format!("unexpected {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> Result<bool, String> {
        let tokens = PreprocessorEngine::tokenize_expression(expr)?;
        PreprocessorEngine::evaluate_expression_tokens(&tokens)
    }

    #[test]
    fn tokenize_keeps_quoted_literals_whole() {
        let tokens = PreprocessorEngine::tokenize_line("print*,'a, (b)' // x");
        assert!(tokens.contains(&Token::Quoted("'a, (b)'".to_string())));
        assert!(tokens.contains(&Token::Identifier("x".to_string())));
        assert_eq!(
            PreprocessorEngine::tokens_to_string(&tokens),
            "print*,'a, (b)' // x"
        );
    }

    #[test]
    fn numbers_stop_before_dot_operators() {
        let tokens = PreprocessorEngine::tokenize_line("1.and.FLAG 2.5e-3 1.0d0 8_int64");
        assert_eq!(tokens[0], Token::Number("1".to_string()));
        assert!(tokens.contains(&Token::Identifier("FLAG".to_string())));
        assert!(tokens.contains(&Token::Number("2.5e-3".to_string())));
        assert!(tokens.contains(&Token::Number("1.0d0".to_string())));
        assert!(tokens.contains(&Token::Number("8_int64".to_string())));
    }

    #[test]
    fn unterminated_quote_runs_to_end_of_line() {
        let tokens = PreprocessorEngine::tokenize_line("x = 'open");
        assert_eq!(tokens.last(), Some(&Token::Quoted("'open".to_string())));
    }

    #[test]
    fn collect_arguments_respects_nesting() {
        let tokens = PreprocessorEngine::tokenize_line("F(a(1, 2), 'x,y', b) tail");
        let (args, end) = PreprocessorEngine::collect_arguments(&tokens, 1).unwrap();
        assert_eq!(args, vec!["a(1, 2)", "'x,y'", "b"]);
        assert_eq!(PreprocessorEngine::tokens_to_string(&tokens[end..]), " tail");
    }

    #[test]
    fn collect_arguments_unterminated() {
        let tokens = PreprocessorEngine::tokenize_line("F(a, b");
        assert!(PreprocessorEngine::collect_arguments(&tokens, 1).is_none());
    }

    #[test]
    fn split_define_forms() {
        assert_eq!(PreprocessorEngine::split_define("FOO").unwrap(), ("FOO", ""));
        assert_eq!(
            PreprocessorEngine::split_define("FOO  bar baz").unwrap(),
            ("FOO", "bar baz")
        );
        assert_eq!(
            PreprocessorEngine::split_define("ADD(a, b) ((a)+(b))").unwrap(),
            ("ADD(a, b)", "((a)+(b))")
        );
        // a space before `(` makes it part of the body
        assert_eq!(
            PreprocessorEngine::split_define("PAREN (x)").unwrap(),
            ("PAREN", "(x)")
        );
        assert!(PreprocessorEngine::split_define("").is_err());
        assert!(PreprocessorEngine::split_define("F(a, b").is_err());
    }

    #[test]
    fn parse_signature_forms() {
        let (name, params, variadic) = PreprocessorEngine::parse_signature("LOG(fmt, ...)").unwrap();
        assert_eq!(name, "LOG");
        assert_eq!(params, Some(vec!["fmt".to_string()]));
        assert!(variadic);

        let (_, params, variadic) = PreprocessorEngine::parse_signature("V(...)").unwrap();
        assert_eq!(params, Some(Vec::new()));
        assert!(variadic);

        let (_, params, _) = PreprocessorEngine::parse_signature("OBJ").unwrap();
        assert!(params.is_none());

        assert!(PreprocessorEngine::parse_signature("1BAD").is_err());
        assert!(PreprocessorEngine::parse_signature("F(a, a)").is_err());
        assert!(PreprocessorEngine::parse_signature("F(..., a)").is_err());
        assert!(PreprocessorEngine::parse_signature("F(a b)").is_err());
    }

    #[test]
    fn body_tokens_for_stringify_and_paste() {
        let params = vec!["x".to_string()];
        let body = PreprocessorEngine::tokenize_body("#x: x ## _t", Some(&params), false);
        assert_eq!(
            body,
            vec![
                BodyToken::Stringify(0),
                BodyToken::Text(": ".to_string()),
                BodyToken::Param { index: 0, raw: true },
                BodyToken::Text(" ".to_string()),
                BodyToken::Paste,
                BodyToken::Text(" _t".to_string()),
            ]
        );
    }

    #[test]
    fn body_params_match_whole_words_only() {
        let params = vec!["x".to_string()];
        let body = PreprocessorEngine::tokenize_body("xx 1x x_1 x", Some(&params), false);
        assert_eq!(
            body,
            vec![
                BodyToken::Text("xx 1x x_1 ".to_string()),
                BodyToken::Param { index: 0, raw: false },
            ]
        );
    }

    #[test]
    fn object_like_body_keeps_hash() {
        let body = PreprocessorEngine::tokenize_body("#x", None, false);
        assert_eq!(body, vec![BodyToken::Text("#x".to_string())]);
    }

    #[test]
    fn join_fragments_pastes() {
        let joined = PreprocessorEngine::join_fragments(&[
            Some("foo ".to_string()),
            None,
            Some("  -suffix".to_string()),
        ]);
        assert_eq!(joined, "foo-suffix");
    }

    #[test]
    fn expression_comparisons() {
        assert_eq!(eval("2 > 1"), Ok(true));
        assert_eq!(eval("2 < 1"), Ok(false));
        assert_eq!(eval("1.5 >= 1.5 && 3 != 4 && 5 == 5.0 && 0.5 <= 1"), Ok(true));
        assert_eq!(eval("-1 < 0"), Ok(true));
        assert_eq!(eval("1e3 == 1000"), Ok(true));
    }

    #[test]
    fn expression_precedence() {
        // && binds tighter than ||
        assert_eq!(eval("1 || 0 && 0"), Ok(true));
        assert_eq!(eval("(1 || 0) && 0"), Ok(false));
        assert_eq!(eval("0"), Ok(false));
        assert_eq!(eval("2"), Ok(true));
    }

    #[test]
    fn expression_errors() {
        assert!(eval("").is_err());
        assert!(eval("1 +").is_err());
        assert!(eval("(1 && 1").is_err());
        assert!(eval("FOO > 1").is_err());
        assert!(eval("1 = 1").is_err());
        assert!(eval("1 2").is_err());
    }
}
