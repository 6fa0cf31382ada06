use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::config::{IncludeContext, IncludeResolver, IncludeSource, PreprocessorConfig};
use crate::directive::Action;
use crate::error::{ErrorKind, PreprocessError, PreprocessResult};
use crate::line_parser::LineParser;
use crate::macro_table::{MacroEntry, MacroTable};

/// Name used for sources that do not come from a file
pub const STDIN_NAME: &str = "<stdin>";

/// Name used for errors in command-line definitions
const COMMAND_LINE_NAME: &str = "<command line>";

/// Streams sources through the line parser and splices `#include`d files
///
/// The macro table persists across runs, so definitions made while
/// processing one source are visible to the next. Conditional scope and the
/// template block are reset at the start of every run.
pub struct Preprocessor {
    parser: LineParser,
    include_dirs: Vec<PathBuf>,
    include_resolver: Option<IncludeResolver>,
    include_stack: Vec<String>,
    /// Canonical paths of the files currently being read
    open_files: Vec<PathBuf>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    /// Create a new preprocessor instance
    #[must_use]
    pub fn new() -> Self {
        Self {
            parser: LineParser::new(MacroTable::new()),
            include_dirs: Vec::new(),
            include_resolver: None,
            include_stack: Vec::new(),
            open_files: Vec::new(),
        }
    }

    /// Create a preprocessor with the given configuration
    ///
    /// # Errors
    /// Returns `MalformedDirective` if one of the configured definitions has an
    /// invalid name.
    pub fn with_config(config: &PreprocessorConfig) -> PreprocessResult<Self> {
        let mut pp = Self::new();
        pp.include_dirs.clone_from(&config.include_dirs);
        pp.include_resolver.clone_from(&config.include_resolver);
        let macros = pp.parser.macros_mut();
        macros.set_recursion_limit(config.recursion_limit);
        macros
            .get_from_cli(&config.defines)
            .map_err(|kind| PreprocessError::new(kind, COMMAND_LINE_NAME, 0))?;
        Ok(pp)
    }

    /// Add a custom include resolver function
    #[must_use]
    pub fn with_include_resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &IncludeContext) -> Option<IncludeSource> + 'static,
    {
        self.include_resolver = Some(Rc::new(f));
        self
    }

    /// Set the maximum recursion depth for macro expansion
    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.parser.macros_mut().set_recursion_limit(limit);
    }

    /// Macro table
    #[must_use]
    pub fn macros(&self) -> &MacroTable {
        self.parser.macros()
    }

    /// Mutable macro table, e.g. to define macros before a run
    pub fn macros_mut(&mut self) -> &mut MacroTable {
        self.parser.macros_mut()
    }

    /// Every known macro with its state, sorted by name
    #[must_use]
    pub fn list_macros(&self) -> Vec<MacroEntry> {
        self.parser.macros().list()
    }

    /// Preprocess source text and return the result
    ///
    /// # Errors
    /// Returns `PreprocessError` on the first directive, expansion, include or
    /// template error, or if a block is still open at the end of input.
    pub fn process(&mut self, input: &str) -> PreprocessResult<String> {
        let mut out = Vec::with_capacity(input.len());
        self.process_reader(STDIN_NAME, input.as_bytes(), &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Preprocess a file, writing the result to `sink`
    ///
    /// Includes are first searched next to `path`.
    ///
    /// # Errors
    /// Returns `PreprocessError` if the file cannot be read, the sink cannot be
    /// written or preprocessing fails.
    pub fn process_file<P: AsRef<Path>, W: Write>(
        &mut self,
        path: P,
        sink: &mut W,
    ) -> PreprocessResult<()> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = File::open(path).map_err(|e| PreprocessError::new(e.into(), &name, 0))?;
        self.run(&name, Some(path), BufReader::new(file), sink)
    }

    /// Preprocess text from `reader`, writing the result to `sink`
    ///
    /// `name` is reported by `__FILE__` and in errors; includes are searched
    /// relative to the working directory.
    ///
    /// # Errors
    /// Returns `PreprocessError` if reading or writing fails or preprocessing fails.
    pub fn process_reader<R: BufRead, W: Write>(
        &mut self,
        name: &str,
        reader: R,
        sink: &mut W,
    ) -> PreprocessResult<()> {
        self.run(name, None, reader, sink)
    }

    fn run<R: BufRead, W: Write>(
        &mut self,
        name: &str,
        path: Option<&Path>,
        reader: R,
        sink: &mut W,
    ) -> PreprocessResult<()> {
        self.parser.reset();
        self.include_stack.clear();
        self.open_files.clear();

        let last_line = self.process_source(name, path, reader, sink)?;

        let depth = self.parser.state().depth();
        if depth > 0 {
            return Err(PreprocessError::new(
                ErrorKind::UnterminatedConditional(depth),
                name,
                last_line,
            ));
        }
        let template = self.parser.template();
        if template.is_active() {
            return Err(PreprocessError::new(
                ErrorKind::UnterminatedTemplateBlock(template.loop_expression().trim().to_string()),
                name,
                last_line,
            ));
        }
        sink.flush().map_err(|e| PreprocessError::new(e.into(), name, last_line))
    }

    /// Stream one source into `sink`, returning its number of lines
    ///
    /// `path` is the file the source was read from, if any.
    fn process_source<R: BufRead, W: Write>(
        &mut self,
        name: &str,
        path: Option<&Path>,
        mut reader: R,
        sink: &mut W,
    ) -> PreprocessResult<usize> {
        let dir = path.and_then(Path::parent);
        let real_path = path.and_then(|p| std::fs::canonicalize(p).ok());
        if let Some(real_path) = &real_path {
            self.open_files.push(real_path.clone());
        }
        self.include_stack.push(name.to_string());
        let mut line_no = 0;
        let mut line = String::new();
        // the last text written did not end a line
        let mut open_line = false;

        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| PreprocessError::new(e.into(), name, line_no + 1))?;
            if read == 0 {
                break;
            }
            line_no += 1;

            self.parser.set_location(name, line_no);
            let located = |kind| PreprocessError::new(kind, name, line_no);
            if let Some(text) = self.parser.process(&line).map_err(located)? {
                sink.write_all(text.as_bytes())
                    .map_err(|e| located(e.into()))?;
                open_line = !text.is_empty() && !text.ends_with('\n');
            }

            if self.parser.state().action() == Action::Include {
                let target = self.parser.state().include_target().unwrap_or_default().to_string();
                let (source, source_path) =
                    self.resolve_include(&target, dir).map_err(located)?;
                debug!(from = name, line = line_no, file = %source.name, "include");
                self.process_source(
                    &source.name,
                    source_path.as_deref(),
                    source.content.as_bytes(),
                    sink,
                )?;
                open_line = false;
            }
        }

        // a spliced file ends its last line before the includer continues
        if open_line && self.include_stack.len() > 1 {
            sink.write_all(b"\n")
                .map_err(|e| PreprocessError::new(e.into(), name, line_no))?;
        }
        self.include_stack.pop();
        if real_path.is_some() {
            self.open_files.pop();
        }
        Ok(line_no)
    }

    /// Find the text of an `#include` target, and the file it was read from
    ///
    /// Without a custom resolver the including file's directory is searched
    /// first, then the include directories, then the path as written.
    fn resolve_include(
        &self,
        target: &str,
        dir: Option<&Path>,
    ) -> Result<(IncludeSource, Option<PathBuf>), ErrorKind> {
        let (source, source_path) = if let Some(resolver) = &self.include_resolver {
            let context = IncludeContext {
                include_stack: self.include_stack.clone(),
                include_dirs: self.include_dirs.clone(),
                current_dir: dir.map(Path::to_path_buf),
            };
            let source = resolver(target, &context)
                .ok_or_else(|| ErrorKind::UnresolvedInclude(target.to_string()))?;
            (source, None)
        } else {
            let path = dir
                .map(|d| d.join(target))
                .into_iter()
                .chain(self.include_dirs.iter().map(|d| d.join(target)))
                .chain(std::iter::once(PathBuf::from(target)))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| ErrorKind::UnresolvedInclude(target.to_string()))?;
            if std::fs::canonicalize(&path).is_ok_and(|real| self.open_files.contains(&real)) {
                return Err(ErrorKind::IncludeCycle(path.display().to_string()));
            }
            let content = std::fs::read_to_string(&path)?;
            (IncludeSource::new(path.display().to_string(), content), Some(path))
        };

        if self.include_stack.contains(&source.name) {
            return Err(ErrorKind::IncludeCycle(source.name));
        }
        Ok((source, source_path))
    }
}
