use tracing::trace;

use crate::directive::{Action, ScopeState};
use crate::error::ErrorKind;
use crate::macro_table::MacroTable;
use crate::template::TemplateBlock;

/// Per-line front end over the macro table, conditional scope and template block
#[derive(Clone, Debug, Default)]
pub struct LineParser {
    macros: MacroTable,
    state: ScopeState,
    template: TemplateBlock,
}

/// Split a line into its content and terminator (`\n`, `\r\n` or nothing)
fn split_terminator(line: &str) -> (&str, &str) {
    let content = line.strip_suffix('\n').map_or(line, |l| l.strip_suffix('\r').unwrap_or(l));
    line.split_at(content.len())
}

impl LineParser {
    /// Create a parser around an existing macro table
    #[must_use]
    pub fn new(macros: MacroTable) -> Self {
        Self {
            macros,
            state: ScopeState::new(),
            template: TemplateBlock::new(),
        }
    }

    /// Macro table
    #[must_use]
    pub fn macros(&self) -> &MacroTable {
        &self.macros
    }

    /// Mutable macro table
    pub fn macros_mut(&mut self) -> &mut MacroTable {
        &mut self.macros
    }

    /// Conditional scope after the last line
    #[must_use]
    pub fn state(&self) -> &ScopeState {
        &self.state
    }

    /// Template block accumulator
    #[must_use]
    pub fn template(&self) -> &TemplateBlock {
        &self.template
    }

    /// Clear conditional scope and template block, keeping the macros
    pub fn reset(&mut self) {
        self.state.reset();
        self.template = TemplateBlock::new();
    }

    /// Set the location reported by `__FILE__` and `__LINE__`
    pub fn set_location(&mut self, file: &str, line: usize) {
        self.macros.set_location(file, line);
    }

    /// Process one physical line, terminator included
    ///
    /// Returns the text to emit, or `None` if the line is suppressed. An
    /// `#include` line also returns `None`; the target is then available from
    /// [`ScopeState::include_target`].
    ///
    /// # Errors
    /// Propagates directive, expansion and template errors.
    pub fn process(&mut self, line: &str) -> Result<Option<String>, ErrorKind> {
        let (content, terminator) = split_terminator(line);

        if let Some(rendered) = self.state.apply(content, &mut self.macros, &mut self.template)? {
            let mut text = String::new();
            for line in rendered {
                text.push_str(&self.macros.expand(&line)?);
                text.push('\n');
            }
            trace!(lines = text.lines().count(), "emit template block");
            return Ok(Some(text));
        }

        match self.state.action() {
            Action::Print => {
                let mut text = self.macros.expand(content)?;
                text.push_str(terminator);
                trace!(line = %text.trim_end(), "emit");
                Ok(Some(text))
            }
            Action::Omit | Action::Include => Ok(None),
        }
    }
}
