/// Check if a character can start an identifier (letter or underscore)
pub const fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Check if a character can continue an identifier (letter, digit, or underscore)
pub const fn is_identifier_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Check if a whole string is a single identifier
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(is_identifier_start) && chars.all(is_identifier_continue)
}

/// A lexical piece of a source line
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Identifier(String),
    /// Digit-led run such as `2.0`, `1e5` or `8_int64`
    Number(String),
    /// A `'...'` or `"..."` literal, quotes included
    Quoted(String),
    Whitespace(String),
    Other(char),
}

/// A pre-tokenized piece of a macro body
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BodyToken {
    Text(String),
    /// Reference to a fixed parameter; `raw` when it is an operand of `##`
    Param { index: usize, raw: bool },
    /// `#param`
    Stringify(usize),
    /// `__VA_ARGS__`
    VaArgs { raw: bool },
    /// `#__VA_ARGS__`
    StringifyVaArgs,
    /// `##`
    Paste,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ExprToken {
    Number(f64),
    Identifier(String),
    LParen,
    RParen,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}
