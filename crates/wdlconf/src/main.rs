use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser};

use wdlconf_core::config;

mod orchestrate;
mod report;

#[derive(Parser, Debug)]
#[command(name = "wdlconf")]
#[command(about = "Conformance harness for WDL workflow runners.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run conformance tests against a workflow runner.
    Run(RunArgs),
    /// List the tests in the suite without running anything.
    List(ListArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[arg(long, value_name = "PATH", default_value = "conformance.yaml")]
    config: PathBuf,

    /// Suite directory holding the versioned fixture trees.
    #[arg(long, value_name = "DIR", default_value = ".")]
    suite_dir: PathBuf,

    #[arg(long, value_name = "NAME", default_value = "cromwell")]
    runner: String,

    /// Comma-separated WDL versions to test against.
    #[arg(long, value_name = "CSV", default_value = "1.0")]
    versions: String,

    /// Comma-separated test numbers and ranges, e.g. "1-4,9".
    #[arg(long, value_name = "CSV")]
    numbers: Option<String>,

    /// Comma-separated test ids.
    #[arg(long, value_name = "CSV")]
    id: Option<String>,

    #[arg(long, value_name = "CSV")]
    tags: Option<String>,

    #[arg(long, value_name = "CSV")]
    exclude_numbers: Option<String>,

    #[arg(long, value_name = "CSV")]
    exclude_tags: Option<String>,

    #[arg(long, value_name = "N", default_value_t = 1)]
    jobs: usize,

    /// Run every selected unit this many times.
    #[arg(long, value_name = "N", default_value_t = 1)]
    repeat: u32,

    /// Capture wall-clock time around each runner invocation.
    #[arg(long)]
    time: bool,

    #[arg(long)]
    verbose: bool,

    /// Suppress progress announcements.
    #[arg(long)]
    quiet: bool,

    /// Extra arguments appended to every runner invocation
    /// (whitespace-separated).
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    runner_args: Option<String>,

    /// Write a machine-readable JSON report here.
    #[arg(long, value_name = "PATH")]
    report_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ListArgs {
    #[arg(long, value_name = "PATH", default_value = "conformance.yaml")]
    config: PathBuf,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => orchestrate::run(args),
        Command::List(args) => list_tests(&args),
    }
}

fn list_tests(args: &ListArgs) -> Result<std::process::ExitCode> {
    let tests = config::load_suite(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;
    for (index, test) in tests.iter().enumerate() {
        println!(
            "{index}\t{}\t[{}]\t[{}]\t{}",
            test.id,
            test.versions.join(","),
            test.tags.join(","),
            test.description.replace('\n', "; ")
        );
    }
    Ok(std::process::ExitCode::SUCCESS)
}
