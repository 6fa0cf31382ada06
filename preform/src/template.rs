use tracing::debug;

use crate::error::ErrorKind;
use crate::token::{is_identifier, is_identifier_continue};

/// Lines captured between `#PFM for ...:` and `#PFM endfor`
///
/// Blocks do not nest. Closing the block renders the captured lines once per
/// loop value and leaves the accumulator empty again.
#[derive(Clone, Debug, Default)]
pub struct TemplateBlock {
    active: bool,
    loop_expression: String,
    captured_lines: Vec<String>,
}

/// Parsed `for VAR in SOURCE:` header
#[derive(Debug, PartialEq)]
struct LoopHeader {
    variable: String,
    values: Vec<String>,
}

impl TemplateBlock {
    /// Create an inactive block
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a block is open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Loop expression of the open block, as written after `#PFM`
    #[must_use]
    pub fn loop_expression(&self) -> &str {
        &self.loop_expression
    }

    /// Lines captured so far
    #[must_use]
    pub fn captured_lines(&self) -> &[String] {
        &self.captured_lines
    }

    /// Open a block for `loop_expression`
    ///
    /// # Errors
    /// Returns `MalformedDirective` if a block is already open.
    pub fn open(&mut self, loop_expression: &str) -> Result<(), ErrorKind> {
        if self.active {
            return Err(ErrorKind::MalformedDirective(format!(
                "nested `#PFM{loop_expression}` inside `#PFM{}`",
                self.loop_expression
            )));
        }
        debug!(expression = loop_expression.trim(), "open template block");
        self.active = true;
        self.loop_expression = loop_expression.to_string();
        self.captured_lines.clear();
        Ok(())
    }

    /// Append one line, without its terminator
    pub fn capture(&mut self, line: &str) {
        self.captured_lines.push(line.to_string());
    }

    /// Render the block and reset it
    ///
    /// Every rendered line is followed by `\n`.
    ///
    /// # Errors
    /// Returns `MalformedTemplateExpression` if the loop header cannot be parsed.
    pub fn close(&mut self) -> Result<String, ErrorKind> {
        let lines = self.close_lines()?;
        Ok(lines.iter().map(|line| format!("{line}\n")).collect())
    }

    /// Render the block line by line and reset it
    pub(crate) fn close_lines(&mut self) -> Result<Vec<String>, ErrorKind> {
        let expression = std::mem::take(&mut self.loop_expression);
        let captured = std::mem::take(&mut self.captured_lines);
        self.active = false;

        let header = parse_header(&expression)?;
        debug!(
            variable = %header.variable,
            iterations = header.values.len(),
            lines = captured.len(),
            "render template block"
        );

        let mut rendered = Vec::with_capacity(header.values.len() * captured.len());
        for value in &header.values {
            for line in &captured {
                rendered.push(substitute_variable(line, &header.variable, value));
            }
        }
        Ok(rendered)
    }
}

fn parse_header(expression: &str) -> Result<LoopHeader, ErrorKind> {
    let malformed = |reason: &str| ErrorKind::MalformedTemplateExpression {
        expr: expression.trim().to_string(),
        reason: reason.to_string(),
    };

    let text = expression.trim();
    let text = text
        .strip_suffix(':')
        .ok_or_else(|| malformed("expected `:` at the end of the loop header"))?;
    let rest = text
        .strip_prefix("for")
        .filter(|r| r.starts_with(char::is_whitespace))
        .ok_or_else(|| malformed("expected `for VAR in ...`"))?
        .trim_start();

    let (variable, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| malformed("expected `in` after the loop variable"))?;
    if !is_identifier(variable) {
        return Err(malformed("invalid loop variable"));
    }
    let source = rest
        .trim_start()
        .strip_prefix("in")
        .filter(|r| r.starts_with(char::is_whitespace))
        .ok_or_else(|| malformed("expected `in` after the loop variable"))?
        .trim();

    let values = if let Some(items) = source.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        parse_list(items).map_err(|reason| malformed(&reason))?
    } else if let Some(args) = source
        .strip_prefix("range")
        .map(str::trim_start)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.strip_suffix(')'))
    {
        parse_range(args).map_err(|reason| malformed(&reason))?
    } else {
        return Err(malformed("expected a `[...]` list or `range(...)`"));
    };

    Ok(LoopHeader {
        variable: variable.to_string(),
        values,
    })
}

/// Split list items on commas outside quotes
fn split_items(items: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in items.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, ',') => {
                parts.push(items[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    parts.push(items[start..].trim());
    // `[]` and a trailing comma
    if parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    Ok(parts)
}

fn parse_list(items: &str) -> Result<Vec<String>, String> {
    split_items(items)?
        .into_iter()
        .map(|item| {
            let unquoted = ['\'', '"'].iter().find_map(|&q| {
                item.strip_prefix(q).and_then(|s| s.strip_suffix(q))
            });
            let numeric = item.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'))
                && item.parse::<f64>().is_ok();
            match unquoted {
                Some(text) => Ok(text.to_string()),
                None if numeric => Ok(item.to_string()),
                None => Err(format!("unsupported list item `{item}`")),
            }
        })
        .collect()
}

fn parse_range(args: &str) -> Result<Vec<String>, String> {
    let numbers = args
        .split(',')
        .map(|arg| {
            let arg = arg.trim();
            arg.parse::<i64>()
                .map_err(|_| format!("range arguments must be integers, got `{arg}`"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (start, stop, step) = match numbers[..] {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => return Err("range takes one to three arguments".to_string()),
    };
    if step == 0 {
        return Err("range step must not be zero".to_string());
    }

    let mut values = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        values.push(current.to_string());
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(values)
}

/// Replace `$variable` where it is not followed by an identifier character
fn substitute_variable(line: &str, variable: &str, value: &str) -> String {
    let pattern = format!("${variable}");
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = rest.find(&pattern) {
        let after = &rest[pos + pattern.len()..];
        out.push_str(&rest[..pos]);
        if after.starts_with(is_identifier_continue) {
            out.push_str(&pattern);
        } else {
            out.push_str(value);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(expression: &str, lines: &[&str]) -> Result<String, ErrorKind> {
        let mut block = TemplateBlock::new();
        block.open(expression)?;
        for line in lines {
            block.capture(line);
        }
        block.close()
    }

    #[test]
    fn capture_keeps_lines() {
        let mut block = TemplateBlock::new();
        block.open(" for i in [1]:").unwrap();
        block.capture("Foo");
        assert_eq!(block.captured_lines()[0], "Foo");
        assert_eq!(block.loop_expression(), " for i in [1]:");
        assert!(block.is_active());
    }

    #[test]
    fn list_loop() {
        assert_eq!(
            render("for i in [1,2,3]:", &["module procedure foo$i"]).unwrap(),
            "module procedure foo1\nmodule procedure foo2\nmodule procedure foo3\n"
        );
    }

    #[test]
    fn range_loop_resets_block() {
        let mut block = TemplateBlock::new();
        block.open(" for i in range(1,4):").unwrap();
        block.capture("x$i");
        assert_eq!(block.close().unwrap(), "x1\nx2\nx3\n");
        assert!(!block.is_active());
        assert!(block.loop_expression().is_empty());
        assert!(block.captured_lines().is_empty());
    }

    #[test]
    fn range_forms() {
        assert_eq!(render("for k in range(3):", &["$k"]).unwrap(), "0\n1\n2\n");
        assert_eq!(
            render("for k in range(10, 0, -3):", &["$k"]).unwrap(),
            "10\n7\n4\n1\n"
        );
        assert_eq!(render("for k in range(0, 10, 4):", &["$k"]).unwrap(), "0\n4\n8\n");
        assert_eq!(render("for k in range(5, 1):", &["$k"]).unwrap(), "");
    }

    #[test]
    fn string_and_float_items() {
        assert_eq!(
            render(
                "for t in ['real', \"integer\", 2.5]:",
                &["  procedure :: add_$t"]
            )
            .unwrap(),
            "  procedure :: add_real\n  procedure :: add_integer\n  procedure :: add_2.5\n"
        );
        assert_eq!(render("for t in ['a,b']:", &["$t"]).unwrap(), "a,b\n");
        assert_eq!(render("for t in []:", &["$t"]).unwrap(), "");
    }

    #[test]
    fn multiple_lines_render_per_value() {
        assert_eq!(
            render("for i in [1, 2]:", &["a$i", "b$i"]).unwrap(),
            "a1\nb1\na2\nb2\n"
        );
    }

    #[test]
    fn variable_needs_identifier_boundary() {
        assert_eq!(
            render("for i in [7]:", &["$i $ij $i_x $i+1 ($i)"]).unwrap(),
            "7 $ij $i_x 7+1 (7)\n"
        );
    }

    #[test]
    fn nested_open_is_rejected() {
        let mut block = TemplateBlock::new();
        block.open("for i in [1]:").unwrap();
        assert!(matches!(
            block.open("for j in [2]:"),
            Err(ErrorKind::MalformedDirective(_))
        ));
    }

    #[test]
    fn malformed_headers() {
        for expression in [
            "for i in [1,2,3]",
            "for i in range(1, 4, 0):",
            "for i in range(1.5):",
            "for i in range():",
            "for i in range(1, 2, 3, 4):",
            "for i in [foo]:",
            "for i in ['open]:",
            "for 1i in [1]:",
            "foreach i in [1]:",
            "for i over [1]:",
            "for i in items:",
        ] {
            assert!(
                matches!(
                    render(expression, &["$i"]),
                    Err(ErrorKind::MalformedTemplateExpression { .. })
                ),
                "{expression}"
            );
        }
    }

    #[test]
    fn failed_close_still_resets() {
        let mut block = TemplateBlock::new();
        block.open("for i in oops:").unwrap();
        block.capture("x");
        assert!(block.close().is_err());
        assert!(!block.is_active());
        assert!(block.captured_lines().is_empty());
        block.open("for i in [1]:").unwrap();
    }
}
