#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # PreForM CLI
//!
//! A command-line interface for the preform line preprocessor.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use preform::{ErrorKind, PreprocessError, Preprocessor, PreprocessorConfig, STDIN_NAME};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Exit codes for different error conditions
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const IO_ERROR: i32 = 2;
    pub const PREPROCESS_ERROR: i32 = 3;
}

/// Command-line interface for the preform preprocessor
#[derive(Parser)]
#[command(
    name = "preform",
    version,
    author,
    about = "A PreForM-style preprocessor for Fortran and other line-oriented sources",
    long_about = "preform expands C-style macros, evaluates conditional compilation directives and renders #PFM for/endfor template blocks.",
    after_help = "EXAMPLES:
  # Preprocess a single file
  $ preform src/lib.F90 -o build/lib.f90

  # Define macros and add include directories
  $ preform src/lib.F90 -D DEBUG -D WP=8 -I include

  # Read from stdin and write to stdout
  $ cat src/lib.F90 | preform - | gfortran -x f95 -c -

  # Show the macro table after the run
  $ preform src/lib.F90 --list-macros -o /dev/null"
)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Input file to preprocess (use '-' for stdin)
    input: PathBuf,

    /// Output file (use '-' for stdout, default: stdout)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Define a macro before processing (NAME or NAME=VALUE)
    #[arg(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
    defines: Vec<String>,

    /// Add directory to include search path
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    include_dirs: Vec<PathBuf>,

    /// Maximum recursion depth for macro expansion
    #[arg(long, default_value_t = preform::DEFAULT_RECURSION_LIMIT)]
    recursion_limit: usize,

    /// Print the macro table to stderr after processing
    #[arg(long)]
    list_macros: bool,

    /// Output preprocessing result in JSON format
    #[arg(long)]
    #[cfg(feature = "json")]
    json: bool,

    /// Enable verbose output with diagnostic information
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Suppress non-error output (quiet mode)
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    quiet: bool,

    /// Show what would happen without actually preprocessing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Force colored output even when not a terminal
    #[arg(long, conflicts_with = "no_color")]
    force_color: bool,
}

impl Cli {
    fn reads_stdin(&self) -> bool {
        is_dash(&self.input)
    }

    fn output_path(&self) -> Option<&Path> {
        self.output.as_deref().filter(|p| !is_dash(p))
    }
}

fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

/// Main application entry point
fn main() {
    let cli = Cli::parse();
    init_color(&cli);
    init_tracing(&cli);

    std::process::exit(match run(&cli) {
        Ok(()) => exit_code::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            determine_exit_code(&e)
        }
    });
}

/// Decide whether stderr gets colors
fn init_color(cli: &Cli) {
    if cli.no_color {
        colored::control::set_override(false);
    } else if cli.force_color {
        colored::control::set_override(true);
    } else if !atty::is(atty::Stream::Stderr) {
        colored::control::set_override(false);
    }
}

/// Install the stderr log subscriber; `RUST_LOG` overrides the flags
fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(colored::control::SHOULD_COLORIZE.should_colorize())
        .init();
}

/// Determine the appropriate exit code based on the error
fn determine_exit_code(error: &anyhow::Error) -> i32 {
    if let Some(err) = error.downcast_ref::<PreprocessError>() {
        match err.kind() {
            ErrorKind::Io(_) => exit_code::IO_ERROR,
            _ => exit_code::PREPROCESS_ERROR,
        }
    } else if error.downcast_ref::<std::io::Error>().is_some() {
        exit_code::IO_ERROR
    } else {
        exit_code::GENERAL_ERROR
    }
}

/// Run the main application logic
fn run(cli: &Cli) -> Result<()> {
    validate_args(cli)?;

    if cli.dry_run {
        show_dry_run_info(cli);
        return Ok(());
    }

    let config = create_config(cli);
    let mut preprocessor = Preprocessor::with_config(&config)?;

    let start_time = Instant::now();
    let mut output = Vec::new();
    let result = if cli.reads_stdin() {
        preprocessor.process_reader(STDIN_NAME, std::io::stdin().lock(), &mut output)
    } else {
        preprocessor.process_file(&cli.input, &mut output)
    };
    result.with_context(|| format!("Failed to preprocess {}", format_input(&cli.input)))?;
    let processing_time = start_time.elapsed();
    let output = String::from_utf8_lossy(&output);

    write_output(cli, &output, &preprocessor, processing_time)?;

    if cli.list_macros {
        for entry in preprocessor.list_macros() {
            eprintln!("{entry}");
        }
    }

    if cli.verbose {
        show_verbose_info(cli, processing_time);
        eprintln!(
            "{} Preprocessed {} -> {}",
            "✓".green(),
            format_input(&cli.input),
            format_output(cli.output_path())
        );
    }

    Ok(())
}

/// Validate command-line arguments
fn validate_args(cli: &Cli) -> Result<()> {
    if let Some(output) = cli.output_path()
        && !cli.reads_stdin()
        && std::fs::canonicalize(output).ok() == std::fs::canonicalize(&cli.input).ok()
    {
        anyhow::bail!("Input and output files cannot be the same: {}", output.display());
    }

    if cli.recursion_limit == 0 {
        anyhow::bail!("Recursion limit must be greater than 0");
    }

    Ok(())
}

/// Show dry run information
fn show_dry_run_info(cli: &Cli) {
    eprintln!(
        "Dry run: would preprocess {} -> {}",
        format_input(&cli.input),
        format_output(cli.output_path())
    );
    eprintln!("Recursion limit: {}", cli.recursion_limit);

    if !cli.defines.is_empty() {
        eprintln!("Definitions:");
        for define in &cli.defines {
            eprintln!("  {define}");
        }
    }

    if !cli.include_dirs.is_empty() {
        eprintln!("Include directories:");
        for dir in &cli.include_dirs {
            eprintln!("  {}", dir.display());
        }
    }

    #[cfg(feature = "json")]
    if cli.json {
        eprintln!("Output format: JSON");
    }
}

/// Create preprocessor configuration from CLI arguments
fn create_config(cli: &Cli) -> PreprocessorConfig {
    let config = cli
        .defines
        .iter()
        .fold(PreprocessorConfig::default(), |config, define| config.with_define(define));
    cli.include_dirs
        .iter()
        .fold(config, |config, dir| config.with_include_dir(dir))
        .with_recursion_limit(cli.recursion_limit)
}

/// Write output to file or stdout
#[cfg_attr(not(feature = "json"), allow(unused_variables))]
fn write_output(
    cli: &Cli,
    content: &str,
    preprocessor: &Preprocessor,
    processing_time: Duration,
) -> Result<()> {
    #[cfg(feature = "json")]
    if cli.json {
        return write_json_output(cli, content, preprocessor, processing_time);
    }

    match cli.output_path() {
        Some(output_path) => std::fs::write(output_path, content).with_context(|| {
            format!("Failed to write to output file: {}", output_path.display())
        })?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(content.as_bytes())
                .and_then(|()| stdout.flush())
                .context("Failed to write to stdout")?;
        }
    }

    Ok(())
}

/// Machine-readable result of a run
#[cfg(feature = "json")]
#[derive(serde::Serialize)]
struct JsonReport<'a> {
    success: bool,
    output: &'a str,
    input_file: String,
    output_file: Option<String>,
    defines: &'a [String],
    include_dirs: Vec<String>,
    macros: Vec<String>,
    processing_time_ms: u128,
}

/// Write JSON output
#[cfg(feature = "json")]
fn write_json_output(
    cli: &Cli,
    content: &str,
    preprocessor: &Preprocessor,
    processing_time: Duration,
) -> Result<()> {
    let report = JsonReport {
        success: true,
        output: content,
        input_file: format_input(&cli.input),
        output_file: cli.output_path().map(|p| p.display().to_string()),
        defines: &cli.defines,
        include_dirs: cli
            .include_dirs
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect(),
        macros: preprocessor
            .list_macros()
            .iter()
            .map(ToString::to_string)
            .collect(),
        processing_time_ms: processing_time.as_millis(),
    };

    let json = serde_json::to_string_pretty(&report)?;
    match cli.output_path() {
        Some(output_path) => std::fs::write(output_path, json + "\n").with_context(|| {
            format!("Failed to write to output file: {}", output_path.display())
        })?,
        None => println!("{json}"),
    }
    Ok(())
}

/// Show verbose information
fn show_verbose_info(cli: &Cli, processing_time: Duration) {
    eprintln!("Recursion limit: {}", cli.recursion_limit);
    eprintln!("Processing time: {processing_time:?}");

    if !cli.include_dirs.is_empty() {
        eprintln!("Include directories ({}):", cli.include_dirs.len());
        for dir in &cli.include_dirs {
            eprintln!("  {}", dir.display());
        }
    }
}

/// Format input path for display
fn format_input(path: &Path) -> String {
    if is_dash(path) {
        "stdin".to_string()
    } else {
        path.display().to_string()
    }
}

/// Format output path for display
fn format_output(path: Option<&Path>) -> String {
    path.map_or_else(|| "stdout".to_string(), |p| p.display().to_string())
}
