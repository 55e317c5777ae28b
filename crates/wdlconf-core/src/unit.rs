use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use crate::compare::compare_outputs;
use crate::config::{JsonInput, Priority, ReturnCodes, TestCase};
use crate::exec::{run_command, run_command_timed, ExecOutput};
use crate::fixtures::FixtureLayout;
use crate::result::{Status, TestResult, Timing};
use crate::runner::{CommandRequest, RunnerAdapter};

/// One schedulable (test, version, repeat) triple.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub test_index: usize,
    pub version: String,
    pub repeat: u32,
}

/// Everything a worker needs to execute a unit. Shared read-only across the
/// pool; the adapter hides its own provisioning lock.
pub struct UnitContext<'a> {
    pub layout: &'a FixtureLayout,
    pub adapter: &'a dyn RunnerAdapter,
    pub runner_name: &'a str,
    pub work_dir: &'a Path,
    pub scratch_dir: &'a Path,
    pub extra_args: &'a [String],
    pub verbose: bool,
    pub timed: bool,
}

/// Execute one unit to a terminal result. Never returns an error: every
/// failure mode inside the unit is folded into a FAILED verdict so nothing
/// crosses the worker boundary as an exception.
pub fn run_unit(ctx: &UnitContext, tests: &[TestCase], unit: &ExecutionUnit) -> TestResult {
    let test = &tests[unit.test_index];
    let mut result = TestResult {
        test_index: unit.test_index,
        id: test.id.clone(),
        description: test.description.clone(),
        version: unit.version.clone(),
        runner: ctx.runner_name.to_string(),
        repeat: unit.repeat,
        status: Status::Succeeded,
        reason: None,
        stdout: None,
        stderr: None,
        return_code: None,
        time: None,
    };

    // Neither short-circuit spawns a process.
    if test.priority == Priority::Ignore {
        result.status = Status::Ignored;
        result.reason = Some("test has priority ignore".to_string());
        return result;
    }
    if !test.versions.iter().any(|v| v == &unit.version) {
        result.status = Status::Skipped;
        result.reason = Some(format!(
            "test only applies to versions: {}",
            test.versions.join(",")
        ));
        return result;
    }

    let mut staged_inputs: Option<PathBuf> = None;
    let results_file = ctx
        .scratch_dir
        .join(format!("results-{}.json", Uuid::new_v4()));

    let outcome = execute(ctx, test, unit, &results_file, &mut staged_inputs);
    match outcome {
        Ok((exec, elapsed)) => {
            result.return_code = Some(exec.code);
            if let Some(elapsed) = elapsed {
                result.time = Some(Timing {
                    real: elapsed.as_secs_f64(),
                });
            }
            match verify(test, &exec, &results_file) {
                Ok(()) => result.status = Status::Succeeded,
                Err(reason) => {
                    result.status = Status::Failed;
                    result.reason = Some(reason);
                }
            }
            if ctx.verbose || result.status == Status::Failed {
                result.stdout = Some(exec.stdout_lossy());
                result.stderr = Some(exec.stderr_lossy());
            } else {
                result.return_code = None;
            }
        }
        Err(reason) => {
            result.status = Status::Failed;
            result.reason = Some(reason);
        }
    }

    let _ = std::fs::remove_file(&results_file);
    if let Some(staged) = staged_inputs {
        let _ = std::fs::remove_file(staged);
    }
    result
}

/// RUNNING phase: resolve fixtures, format the command (adapter provisioning
/// may happen here), spawn the runner. Any error becomes a FAILED reason.
fn execute(
    ctx: &UnitContext,
    test: &TestCase,
    unit: &ExecutionUnit,
    results_file: &Path,
    staged_inputs: &mut Option<PathBuf>,
) -> Result<(ExecOutput, Option<std::time::Duration>), String> {
    let wdl_file = ctx
        .layout
        .resolve(&unit.version, &test.inputs.wdl)
        .map_err(|err| format!("{err:#}"))?;
    let inputs_json = match &test.inputs.json {
        JsonInput::File(name) => ctx
            .layout
            .resolve(&unit.version, name)
            .map_err(|err| format!("{err:#}"))?,
        JsonInput::Inline(obj) => {
            let staged = ctx
                .layout
                .stage_inline_inputs(ctx.scratch_dir, obj)
                .map_err(|err| format!("{err:#}"))?;
            *staged_inputs = Some(staged.clone());
            staged
        }
    };

    let mut extra_args = test.extra_args.clone();
    extra_args.extend(ctx.extra_args.iter().cloned());
    let req = CommandRequest {
        program: wdl_file,
        inputs_json,
        results_file: results_file.to_path_buf(),
        extra_args,
        verbose: ctx.verbose,
    };
    let argv = ctx
        .adapter
        .format_command(&req)
        .map_err(|err| format!("{err:#}"))?;

    if ctx.timed {
        run_command_timed(&argv, ctx.work_dir)
            .map(|(out, dur)| (out, Some(dur)))
            .map_err(|err| format!("{err:#}"))
    } else {
        run_command(&argv, ctx.work_dir)
            .map(|out| (out, None))
            .map_err(|err| format!("{err:#}"))
    }
}

/// VERIFYING phase: expected-failure contract or typed output comparison,
/// then the return-code membership check.
fn verify(test: &TestCase, exec: &ExecOutput, results_file: &Path) -> Result<(), String> {
    if test.expected_fail {
        return verify_failure(test, exec.code);
    }
    verify_outputs(test, exec.code, results_file)?;
    // The exit code contract is checked only once the outputs themselves
    // verified, so a data mismatch is always reported as such.
    if let ReturnCodes::Set(_) = &test.return_codes {
        if !test.return_codes.accepts(exec.code) {
            return Err(format!(
                "exit code {} is not among the expected return codes",
                exec.code
            ));
        }
    }
    Ok(())
}

fn verify_failure(test: &TestCase, code: i32) -> Result<(), String> {
    let failed_as_expected = match &test.return_codes {
        ReturnCodes::Set(_) => test.return_codes.accepts(code),
        ReturnCodes::Any => code != 0,
    };
    if failed_as_expected {
        Ok(())
    } else {
        Err(format!("workflow did not fail (exit code {code})"))
    }
}

fn verify_outputs(test: &TestCase, code: i32, results_file: &Path) -> Result<(), String> {
    if code != 0 {
        return Err(format!("workflow failed to run (exit code {code})"));
    }

    // Some runners never write a results file for output-free workflows;
    // absence means empty outputs, not failure.
    let actual_outputs = match std::fs::read(results_file) {
        Ok(bytes) => {
            let doc: Value = serde_json::from_slice(&bytes).map_err(|err| {
                format!("results file {} is not JSON: {err}", results_file.display())
            })?;
            match doc.get("outputs") {
                Some(Value::Object(map)) => map.clone(),
                Some(other) => {
                    return Err(format!("results file has a non-mapping outputs section: {other}"))
                }
                None => serde_json::Map::new(),
            }
        }
        Err(_) => serde_json::Map::new(),
    };

    let excluded = |name: &str| test.exclude_outputs.iter().any(|e| e.as_str() == name);
    let expected: Vec<_> = test
        .outputs
        .iter()
        .filter(|o| !excluded(&o.name))
        .collect();
    let actual: Vec<_> = actual_outputs
        .iter()
        .filter(|(name, _)| !excluded(name.as_str()))
        .collect();

    if expected.len() != actual.len() {
        return Err(format!(
            "expected {} outputs, runner produced {}",
            expected.len(),
            actual.len()
        ));
    }

    for output in expected {
        let actual_value = actual_outputs
            .get(&output.name)
            .ok_or_else(|| format!("output {:?} missing from results", output.name))?;
        compare_outputs(&output.value, actual_value, &output.ty)
            .map_err(|reason| format!("output {:?}: {reason}", output.name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;

    use super::*;
    use crate::config::{ExpectedOutput, TestInputs};
    use crate::types::parse_type_str;

    static TMP_N: AtomicUsize = AtomicUsize::new(0);

    fn tmp_dir() -> PathBuf {
        let n = TMP_N.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("wdlconf_unit_{}_{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Adapter that ignores the WDL file and runs a fixed shell script;
    /// `{results}` in the script is replaced with the unit's results path.
    #[derive(Debug)]
    struct ScriptRunner {
        script: String,
    }

    impl RunnerAdapter for ScriptRunner {
        fn name(&self) -> &str {
            "script"
        }

        fn format_command(&self, req: &CommandRequest) -> Result<Vec<String>> {
            let script = self
                .script
                .replace("{results}", &req.results_file.display().to_string());
            Ok(vec!["sh".to_string(), "-c".to_string(), script])
        }
    }

    #[derive(Debug)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    impl RunnerAdapter for CountingRunner {
        fn name(&self) -> &str {
            "counting"
        }

        fn format_command(&self, _req: &CommandRequest) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(vec!["true".to_string()])
        }
    }

    fn case(outputs: Vec<ExpectedOutput>) -> TestCase {
        TestCase {
            id: "t".to_string(),
            description: "test".to_string(),
            tags: Vec::new(),
            versions: vec!["1.0".to_string()],
            priority: Priority::Required,
            dependencies: Vec::new(),
            inputs: TestInputs {
                wdl: "wf.wdl".to_string(),
                json: JsonInput::File("wf.json".to_string()),
            },
            outputs,
            expected_fail: false,
            return_codes: ReturnCodes::Any,
            exclude_outputs: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    fn int_output(name: &str, value: i64) -> ExpectedOutput {
        ExpectedOutput {
            name: name.to_string(),
            ty: parse_type_str("Int").unwrap(),
            value: serde_json::json!(value),
        }
    }

    fn run_one(adapter: &dyn RunnerAdapter, test: TestCase, version: &str) -> TestResult {
        let dir = tmp_dir();
        let layout = FixtureLayout::new(dir.clone());
        let ctx = UnitContext {
            layout: &layout,
            adapter,
            runner_name: "script",
            work_dir: &dir,
            scratch_dir: &dir,
            extra_args: &[],
            verbose: false,
            timed: false,
        };
        let unit = ExecutionUnit {
            test_index: 0,
            version: version.to_string(),
            repeat: 0,
        };
        let result = run_unit(&ctx, &[test], &unit);
        let _ = std::fs::remove_dir_all(&dir);
        result
    }

    #[test]
    fn matching_outputs_succeed() {
        let adapter = ScriptRunner {
            script: r#"printf '{"outputs": {"wf.x": 5}}' > {results}"#.to_string(),
        };
        let result = run_one(&adapter, case(vec![int_output("wf.x", 5)]), "1.0");
        assert_eq!(result.status, Status::Succeeded);
        assert!(result.reason.is_none());
        // Quiet successful runs do not keep the captured streams.
        assert!(result.stdout.is_none());
    }

    #[test]
    fn numeric_string_output_is_lenient() {
        let adapter = ScriptRunner {
            script: r#"printf '{"outputs": {"wf.x": "5"}}' > {results}"#.to_string(),
        };
        let result = run_one(&adapter, case(vec![int_output("wf.x", 5)]), "1.0");
        assert_eq!(result.status, Status::Succeeded);
    }

    #[test]
    fn mismatched_output_fails_with_both_values() {
        let adapter = ScriptRunner {
            script: r#"printf '{"outputs": {"wf.x": 6}}' > {results}"#.to_string(),
        };
        let result = run_one(&adapter, case(vec![int_output("wf.x", 5)]), "1.0");
        assert_eq!(result.status, Status::Failed);
        let reason = result.reason.unwrap();
        assert!(reason.contains('5') && reason.contains('6'), "{reason}");
        assert!(result.stderr.is_some());
    }

    #[test]
    fn expected_failure_contract() {
        let mut test = case(Vec::new());
        test.expected_fail = true;

        let fails = ScriptRunner {
            script: "exit 1".to_string(),
        };
        assert_eq!(run_one(&fails, test.clone(), "1.0").status, Status::Succeeded);

        let succeeds = ScriptRunner {
            script: "exit 0".to_string(),
        };
        let result = run_one(&succeeds, test, "1.0");
        assert_eq!(result.status, Status::Failed);
        assert!(result.reason.unwrap().contains("did not fail"));
    }

    #[test]
    fn missing_results_file_means_empty_outputs() {
        let adapter = ScriptRunner {
            script: "exit 0".to_string(),
        };
        assert_eq!(run_one(&adapter, case(Vec::new()), "1.0").status, Status::Succeeded);

        // But declared outputs with no results file is a count mismatch.
        let result = run_one(&adapter, case(vec![int_output("wf.x", 5)]), "1.0");
        assert_eq!(result.status, Status::Failed);
        assert!(result.reason.unwrap().contains("expected 1 outputs"));
    }

    #[test]
    fn return_code_set_is_checked_after_outputs_verify() {
        let adapter = ScriptRunner {
            script: r#"printf '{"outputs": {"wf.x": 5}}' > {results}"#.to_string(),
        };
        let mut test = case(vec![int_output("wf.x", 5)]);
        test.return_codes = ReturnCodes::Set(vec![0]);
        assert_eq!(run_one(&adapter, test.clone(), "1.0").status, Status::Succeeded);

        test.return_codes = ReturnCodes::Set(vec![3]);
        let result = run_one(&adapter, test, "1.0");
        assert_eq!(result.status, Status::Failed);
        assert!(result.reason.unwrap().contains("expected return codes"));
    }

    #[test]
    fn ignored_priority_never_spawns() {
        let adapter = CountingRunner {
            calls: AtomicUsize::new(0),
        };
        let mut test = case(Vec::new());
        test.priority = Priority::Ignore;
        let result = run_one(&adapter, test, "1.0");
        assert_eq!(result.status, Status::Ignored);
        assert_eq!(adapter.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn inapplicable_version_skips() {
        let adapter = CountingRunner {
            calls: AtomicUsize::new(0),
        };
        let result = run_one(&adapter, case(Vec::new()), "1.1");
        assert_eq!(result.status, Status::Skipped);
        assert!(result.reason.unwrap().contains("1.0"));
        assert_eq!(adapter.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unsupported_version_fails_without_crashing() {
        let adapter = CountingRunner {
            calls: AtomicUsize::new(0),
        };
        let mut test = case(Vec::new());
        test.versions.push("9.9".to_string());
        let result = run_one(&adapter, test, "9.9");
        assert_eq!(result.status, Status::Failed);
        assert!(result.reason.unwrap().contains("not supported"));
    }

    #[test]
    fn excluded_outputs_are_filtered_from_both_sides() {
        let adapter = ScriptRunner {
            script: r#"printf '{"outputs": {"wf.x": 5, "wf.skip": 9}}' > {results}"#.to_string(),
        };
        let mut test = case(vec![int_output("wf.x", 5)]);
        test.exclude_outputs.push("wf.skip".to_string());
        assert_eq!(run_one(&adapter, test, "1.0").status, Status::Succeeded);
    }

    #[test]
    fn timed_runs_record_wall_clock() {
        let adapter = ScriptRunner {
            script: "exit 0".to_string(),
        };
        let dir = tmp_dir();
        let layout = FixtureLayout::new(dir.clone());
        let ctx = UnitContext {
            layout: &layout,
            adapter: &adapter,
            runner_name: "script",
            work_dir: &dir,
            scratch_dir: &dir,
            extra_args: &[],
            verbose: false,
            timed: true,
        };
        let unit = ExecutionUnit {
            test_index: 0,
            version: "1.0".to_string(),
            repeat: 0,
        };
        let result = run_unit(&ctx, &[case(Vec::new())], &unit);
        assert!(result.time.is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
