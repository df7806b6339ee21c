//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use tunnelrun_runner::PipelineResult;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable results banner
    #[default]
    Plain,
    /// JSON summary on stdout
    Json,
}

/// Machine-readable run summary
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub passed: bool,
    pub incomplete_count: usize,
    pub failed_count: u64,
    pub control_error: Option<String>,
    pub log_directory: String,
}

impl Summary {
    pub fn new(result: &PipelineResult, log_dir: &Path) -> Self {
        Self {
            passed: result.passed(),
            incomplete_count: result.incomplete_count,
            failed_count: result.failed_count,
            control_error: result.control_error.as_ref().map(|e| e.to_string()),
            log_directory: log_dir.display().to_string(),
        }
    }
}

/// One line of the results banner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Heading(String),
    Success(String),
    Warning(String),
    Failure(String),
}

/// Banner lines for a run that got as far as producing counts
pub fn summary_lines(result: &PipelineResult, log_dir: &Path) -> Vec<Line> {
    let mut lines = vec![Line::Heading("RESULTS".to_string())];
    if result.passed() {
        lines.push(Line::Success("Tests passed.".to_string()));
        return lines;
    }
    if result.incomplete_count > 0 {
        lines.push(Line::Warning(format!(
            "{} test process(es) did not complete. See logs in {}",
            result.incomplete_count,
            log_dir.display()
        )));
    }
    if result.failed_count > 0 {
        lines.push(Line::Failure(format!(
            "{} test(s) failed. See logs in {}",
            result.failed_count,
            log_dir.display()
        )));
    }
    lines
}

/// Print the outcome of a run. Control errors go to stderr, counts to stdout.
pub fn print_results(result: &PipelineResult, log_dir: &Path, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let summary = Summary::new(result, log_dir);
            println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
        }
        OutputFormat::Plain => {
            if let Some(err) = &result.control_error {
                print_error(&format!("Run aborted: {}", err));
                return;
            }
            println!();
            for line in summary_lines(result, log_dir) {
                match line {
                    Line::Heading(text) => {
                        println!("{}", text.bold());
                        println!("{}", "=".repeat(text.len()));
                    }
                    Line::Success(text) => print_success(&text),
                    Line::Warning(text) => print_warning(&text),
                    Line::Failure(text) => println!("{} {}", "✗".red(), text),
                }
            }
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}
