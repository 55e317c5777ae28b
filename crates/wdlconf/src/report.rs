use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use wdlconf_core::result::{Status, TestResult};

use crate::RunArgs;

const REPORT_SCHEMA_VERSION: &str = "wdlconf.report@0.1.0";

#[derive(Debug, Default, Clone, Serialize)]
pub struct Summary {
    pub run: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub warnings: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct InvocationInfo {
    pub argv: Vec<String>,
    pub cwd: String,
    pub runner: String,
    pub versions: String,
    pub jobs: usize,
    pub repeat: u32,
    pub config: String,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub schema_version: String,
    pub tool: ToolInfo,
    pub invocation: InvocationInfo,
    pub summary: Summary,
    pub results: Vec<TestResult>,
}

pub fn summarize(results: &[TestResult], elapsed: Duration) -> Summary {
    let mut summary = Summary {
        duration_ms: elapsed.as_millis() as u64,
        ..Summary::default()
    };
    for r in results {
        match r.status {
            Status::Succeeded => summary.succeeded += 1,
            Status::Failed => summary.failed += 1,
            Status::Skipped => summary.skipped += 1,
            Status::Ignored => summary.ignored += 1,
            Status::Warning => summary.warnings += 1,
        }
    }
    summary.run = summary.succeeded + summary.failed + summary.warnings;
    summary
}

/// Render `seconds` the way shell `time` does, e.g. `1m23.456s`.
pub fn format_time(seconds: f64) -> String {
    let minutes = (seconds / 60.0).floor() as u64;
    let rest = seconds - (minutes as f64) * 60.0;
    format!("{minutes}m{rest:.3}s")
}

/// One line per unit in index order, details for the unhappy ones, then the
/// status counts and explicit failing/warning index lists.
pub fn print_human(results: &[TestResult], elapsed: Duration, show_time: bool) {
    for r in results {
        let mut line = format!(
            "{}: {} on {:?} with WDL version {}",
            r.test_index,
            r.status.as_str(),
            r.runner,
            r.version
        );
        if r.repeat > 0 {
            line.push_str(&format!(" (repeat {})", r.repeat));
        }
        println!("{line}");
        if let Some(reason) = &r.reason {
            println!("    REASON: {reason}");
        }
        if let Some(code) = r.return_code {
            println!("    runner exited with code {code}");
        }
        if show_time {
            if let Some(time) = &r.time {
                println!("    TIME: {}", format_time(time.real));
            }
        }
        if let Some(stdout) = &r.stdout {
            if !stdout.is_empty() {
                println!("    stdout:\n{stdout}");
            }
        }
        if let Some(stderr) = &r.stderr {
            if !stderr.is_empty() {
                println!("    stderr:\n{stderr}");
            }
        }
    }

    let summary = summarize(results, elapsed);
    println!(
        "{} tests run, {} succeeded, {} failed, {} skipped, {} ignored, {} warnings ({})",
        summary.run,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.ignored,
        summary.warnings,
        format_time(elapsed.as_secs_f64())
    );
    let failing = indices_with_status(results, Status::Failed);
    if !failing.is_empty() {
        println!("failing tests: {}", failing.join(", "));
    }
    let warned = indices_with_status(results, Status::Warning);
    if !warned.is_empty() {
        println!("tests with warnings: {}", warned.join(", "));
    }
}

fn indices_with_status(results: &[TestResult], status: Status) -> Vec<String> {
    let mut indices: Vec<usize> = results
        .iter()
        .filter(|r| r.status == status)
        .map(|r| r.test_index)
        .collect();
    indices.dedup();
    indices.into_iter().map(|i| i.to_string()).collect()
}

pub fn build_report(args: &RunArgs, results: &[TestResult], elapsed: Duration) -> Report {
    Report {
        schema_version: REPORT_SCHEMA_VERSION.to_string(),
        tool: ToolInfo {
            name: "wdlconf".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        invocation: InvocationInfo {
            argv: std::env::args().collect(),
            cwd: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .display()
                .to_string(),
            runner: args.runner.clone(),
            versions: args.versions.clone(),
            jobs: args.jobs,
            repeat: args.repeat,
            config: args.config.display().to_string(),
        },
        summary: summarize(results, elapsed),
        results: results.to_vec(),
    }
}

pub fn write_report(out_path: &Path, report: &Report) -> Result<()> {
    let json = serde_json::to_string(report).context("serialize report")? + "\n";
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create report dir: {}", parent.display()))?;
        }
    }
    std::fs::write(out_path, json.as_bytes())
        .with_context(|| format!("write report: {}", out_path.display()))?;
    Ok(())
}
