use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use wdlconf_core::config::{self, Selection, TestCase};
use wdlconf_core::deps;
use wdlconf_core::fixtures::FixtureLayout;
use wdlconf_core::result::{Status, TestResult};
use wdlconf_core::runner::RunnerRegistry;
use wdlconf_core::unit::{run_unit, ExecutionUnit, UnitContext};

use crate::report;
use crate::RunArgs;

pub fn run(args: RunArgs) -> Result<std::process::ExitCode> {
    let suite_dir = std::fs::canonicalize(&args.suite_dir)
        .with_context(|| format!("suite dir: {}", args.suite_dir.display()))?;
    // Expected values may anchor absolute paths on ${WDL_DIR}.
    std::env::set_var("WDL_DIR", &suite_dir);

    let mut tests =
        config::load_suite(&args.config).with_context(|| format!("load {}", args.config.display()))?;
    for test in &mut tests {
        for output in &mut test.outputs {
            config::expand_vars(&mut output.value);
        }
    }

    let selection = build_selection(&args)?;
    let selected = config::select_tests(&tests, &selection);
    let versions: Vec<String> = args
        .versions
        .split(',')
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if versions.is_empty() {
        bail!("no WDL versions requested");
    }

    let registry = RunnerRegistry::builtin(&suite_dir.join("build"));
    let adapter = registry.get(&args.runner)?;

    let units = expand_units(&selected, &versions, args.repeat);
    if !args.quiet {
        eprintln!(
            "testing runner {} on WDL versions {} ({} units)",
            args.runner,
            versions.join(","),
            units.len()
        );
    }

    let scratch_dir = scratch_dir()?;
    let layout = FixtureLayout::new(suite_dir.clone());
    let runner_args: Vec<String> = args
        .runner_args
        .as_deref()
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let ctx = UnitContext {
        layout: &layout,
        adapter: &*adapter,
        runner_name: &args.runner,
        work_dir: &suite_dir,
        scratch_dir: &scratch_dir,
        extra_args: &runner_args,
        verbose: args.verbose,
        timed: args.time,
    };

    let started = Instant::now();
    let mut results = run_units(&ctx, &tests, &units, args.jobs, args.quiet);
    let elapsed = started.elapsed();
    let _ = std::fs::remove_dir_all(&scratch_dir);

    for result in &mut results {
        let test = &tests[result.test_index];
        deps::apply_dependency_policy(test, result);
        deps::apply_priority_policy(test, result);
    }
    sort_for_report(&mut results);

    report::print_human(&results, elapsed, args.time);
    if let Some(out_path) = &args.report_out {
        let doc = report::build_report(&args, &results, elapsed);
        report::write_report(out_path, &doc)?;
    }

    let any_failed = results.iter().any(|r| r.status == Status::Failed);
    Ok(if any_failed {
        std::process::ExitCode::from(1)
    } else {
        std::process::ExitCode::SUCCESS
    })
}

fn build_selection(args: &RunArgs) -> Result<Selection> {
    Ok(Selection {
        numbers: args
            .numbers
            .as_deref()
            .map(config::parse_test_indices)
            .transpose()
            .context("--numbers")?,
        ids: args.id.as_deref().map(config::parse_tags),
        tags: args.tags.as_deref().map(config::parse_tags),
        exclude_numbers: args
            .exclude_numbers
            .as_deref()
            .map(config::parse_test_indices)
            .transpose()
            .context("--exclude-numbers")?,
        exclude_tags: args.exclude_tags.as_deref().map(config::parse_tags),
    })
}

/// Expand selected tests x versions x repeats into the schedulable matrix,
/// in deterministic order (execution order is not report order anyway).
fn expand_units(selected: &[usize], versions: &[String], repeat: u32) -> Vec<ExecutionUnit> {
    let mut units = Vec::with_capacity(selected.len() * versions.len() * repeat as usize);
    for &test_index in selected {
        for version in versions {
            for repeat_index in 0..repeat {
                units.push(ExecutionUnit {
                    test_index,
                    version: version.clone(),
                    repeat: repeat_index,
                });
            }
        }
    }
    units
}

/// Bounded worker pool: scoped threads pull unit indices off a shared atomic
/// counter. Each unit's real work is its own child OS process, so timing
/// wraps the child invocation and units never share mutable state beyond the
/// adapter's provisioning lock.
fn run_units(
    ctx: &UnitContext,
    tests: &[TestCase],
    units: &[ExecutionUnit],
    jobs: usize,
    quiet: bool,
) -> Vec<TestResult> {
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<TestResult>> = Mutex::new(Vec::with_capacity(units.len()));
    // Keeps concurrent announcement lines from interleaving.
    let log_lock: Mutex<()> = Mutex::new(());

    std::thread::scope(|scope| {
        let jobs = jobs.clamp(1, units.len().max(1));
        for _ in 0..jobs {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                if idx >= units.len() {
                    return;
                }
                let unit = &units[idx];
                if !quiet {
                    if let Ok(_guard) = log_lock.lock() {
                        announce(tests, unit, ctx.runner_name);
                    }
                }
                let result = run_unit(ctx, tests, unit);
                if let Ok(mut guard) = results.lock() {
                    guard.push(result);
                }
            });
        }
    });

    results.into_inner().unwrap_or_else(|e| e.into_inner())
}

/// Completion order is whatever the pool produced; the report order is a
/// total order on (test index, version, repeat).
fn sort_for_report(results: &mut [TestResult]) {
    results.sort_by(|a, b| {
        (a.test_index, &a.version, a.repeat).cmp(&(b.test_index, &b.version, b.repeat))
    });
}

fn announce(tests: &[TestCase], unit: &ExecutionUnit, runner: &str) {
    let test = &tests[unit.test_index];
    let description = test.description.trim().replace('\n', "; ");
    let mut line = format!(
        "{}: RUNNING on {runner:?} with WDL version {}: {description}",
        unit.test_index, unit.version
    );
    if unit.repeat > 0 {
        line.push_str(&format!(" (repeat {})", unit.repeat));
    }
    eprintln!("{line}");
}

fn scratch_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("wdlconf-{}", std::process::id()));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create scratch dir: {}", dir.display()))?;
    Ok(dir)
}
