use std::process::{Command, Stdio};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::TestCase;
use crate::result::{Status, TestResult};

/// Dependency names that describe the execution environment rather than a
/// probeable resource; they never affect a verdict.
const IGNORED_DEPENDENCIES: &[&str] = &["docker", "root", "singularity"];

const GPU_OVERRIDE_ENV: &str = "WDL_CONFORMANCE_TESTS_GPU";

/// Downgrade a FAILED result to WARNING when the failure is explained by an
/// unsatisfiable declared dependency. The original failing reason is
/// preserved inside the warning text. Monotonic: nothing here ever turns a
/// non-FAILED result back into FAILED.
pub fn apply_dependency_policy(test: &TestCase, result: &mut TestResult) {
    if result.status != Status::Failed {
        return;
    }
    let stderr = result.stderr.clone().unwrap_or_default();
    let old_reason = result.reason.clone().unwrap_or_default();

    for dep in &test.dependencies {
        match dep.as_str() {
            "gpu" => {
                if !gpu_available() {
                    result.downgrade_to_warning(format!(
                        "a GPU is required but not available on this machine; \
                         run on a GPU host or set {GPU_OVERRIDE_ENV}=true to override.\
                         \nFailing reason:\n{old_reason}"
                    ));
                    return;
                }
            }
            "cpu" => {
                if cpu_signature().is_match(&stderr) {
                    result.downgrade_to_warning(format!(
                        "a WDL task requested more CPU cores than this machine has.\
                         \nFailing reason:\n{old_reason}"
                    ));
                    return;
                }
            }
            "memory" => {
                if memory_signature().is_match(&stderr) {
                    result.downgrade_to_warning(format!(
                        "a WDL task requested more memory than this machine has.\
                         \nFailing reason:\n{old_reason}"
                    ));
                    return;
                }
            }
            "disks" => {
                // Runners raise NotImplementedError for a missing mount
                // point; there is no portable probe for the mounts upfront.
                if stderr.contains("NotImplementedError") {
                    result.downgrade_to_warning(format!(
                        "a disk mount required by the test is not available; \
                         check that the mount points the WDL tasks name exist.\
                         \nFailing reason:\n{old_reason}"
                    ));
                    return;
                }
            }
            other if IGNORED_DEPENDENCIES.contains(&other) => {}
            other => {
                eprintln!("warning: unsupported test dependency {other:?}, ignoring");
            }
        }
    }
}

/// Downgrade for optional-priority tests, applied after dependency policy:
/// an optional test never ends the run FAILED.
pub fn apply_priority_policy(test: &TestCase, result: &mut TestResult) {
    if test.priority == crate::config::Priority::Optional && result.status == Status::Failed {
        let old_reason = result.reason.clone().unwrap_or_default();
        result.downgrade_to_warning(format!(
            "test has priority optional.\nFailing reason:\n{old_reason}"
        ));
    }
}

fn cpu_signature() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"is requesting [0-9.]+ cores, more than the maximum of [0-9.]+ cores")
            .expect("valid literal regex")
    })
}

fn memory_signature() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"is requesting [0-9.]+ bytes of memory, more than the maximum of [0-9.]+ bytes of memory",
        )
        .expect("valid literal regex")
    })
}

/// Whether the host has a usable GPU. The environment override wins; the
/// probes mirror how batch systems detect nvidia and amd devices.
pub fn gpu_available() -> bool {
    if let Ok(raw) = std::env::var(GPU_OVERRIDE_ENV) {
        if let Some(forced) = parse_bool_env(&raw) {
            return forced;
        }
    }
    probe_succeeds(&["nvidia-smi"]) || probe_succeeds(&["amd-smi", "static"])
}

fn probe_succeeds(argv: &[&str]) -> bool {
    let (program, rest) = match argv.split_first() {
        Some(pair) => pair,
        None => return false,
    };
    Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn parse_bool_env(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => Some(true),
        "0" | "false" | "no" | "off" | "n" | "f" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JsonInput, Priority, ReturnCodes, TestInputs};

    fn failed_result(stderr: &str) -> TestResult {
        TestResult {
            test_index: 0,
            id: "t".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            runner: "script".to_string(),
            repeat: 0,
            status: Status::Failed,
            reason: Some("output mismatch".to_string()),
            stdout: None,
            stderr: Some(stderr.to_string()),
            return_code: Some(1),
            time: None,
        }
    }

    fn test_with_deps(deps: &[&str], priority: Priority) -> TestCase {
        TestCase {
            id: "t".to_string(),
            description: String::new(),
            tags: Vec::new(),
            versions: vec!["1.0".to_string()],
            priority,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            inputs: TestInputs {
                wdl: "wf.wdl".to_string(),
                json: JsonInput::File("wf.json".to_string()),
            },
            outputs: Vec::new(),
            expected_fail: false,
            return_codes: ReturnCodes::Any,
            exclude_outputs: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn cpu_failure_signature_downgrades() {
        let test = test_with_deps(&["cpu"], Priority::Required);
        let mut result =
            failed_result("task is requesting 64.0 cores, more than the maximum of 8 cores");
        apply_dependency_policy(&test, &mut result);
        assert_eq!(result.status, Status::Warning);
        let reason = result.reason.unwrap();
        assert!(reason.contains("Failing reason:\noutput mismatch"), "{reason}");
    }

    #[test]
    fn cpu_dependency_without_signature_stays_failed() {
        let test = test_with_deps(&["cpu"], Priority::Required);
        let mut result = failed_result("some unrelated stack trace");
        apply_dependency_policy(&test, &mut result);
        assert_eq!(result.status, Status::Failed);
    }

    #[test]
    fn memory_signature_matches_bytes_form() {
        assert!(memory_signature().is_match(
            "is requesting 9999999999 bytes of memory, more than the maximum of 1024 bytes of memory"
        ));
        assert!(!memory_signature().is_match("is requesting 64.0 cores"));
    }

    #[test]
    fn disks_downgrade_needs_not_implemented_marker() {
        let test = test_with_deps(&["disks"], Priority::Required);
        let mut result = failed_result("raise NotImplementedError(mount)");
        apply_dependency_policy(&test, &mut result);
        assert_eq!(result.status, Status::Warning);
    }

    #[test]
    fn gpu_env_override_is_honored() {
        let test = test_with_deps(&["gpu"], Priority::Required);

        std::env::set_var(GPU_OVERRIDE_ENV, "false");
        let mut result = failed_result("");
        apply_dependency_policy(&test, &mut result);
        assert_eq!(result.status, Status::Warning);

        std::env::set_var(GPU_OVERRIDE_ENV, "true");
        let mut result = failed_result("");
        apply_dependency_policy(&test, &mut result);
        assert_eq!(result.status, Status::Failed);

        std::env::remove_var(GPU_OVERRIDE_ENV);
    }

    #[test]
    fn ignored_dependencies_never_downgrade() {
        let test = test_with_deps(&["docker", "root", "singularity"], Priority::Required);
        let mut result = failed_result("anything");
        apply_dependency_policy(&test, &mut result);
        assert_eq!(result.status, Status::Failed);
    }

    #[test]
    fn succeeded_results_are_untouched() {
        let test = test_with_deps(&["cpu"], Priority::Optional);
        let mut result = failed_result("");
        result.status = Status::Succeeded;
        result.reason = None;
        apply_dependency_policy(&test, &mut result);
        apply_priority_policy(&test, &mut result);
        assert_eq!(result.status, Status::Succeeded);
        assert!(result.reason.is_none());
    }

    #[test]
    fn optional_priority_downgrades_unconditionally() {
        let test = test_with_deps(&[], Priority::Optional);
        let mut result = failed_result("");
        apply_priority_policy(&test, &mut result);
        assert_eq!(result.status, Status::Warning);
        assert!(result.reason.unwrap().contains("priority optional"));
    }

    #[test]
    fn parses_boolean_override_forms() {
        assert_eq!(parse_bool_env("True"), Some(true));
        assert_eq!(parse_bool_env(" 0 "), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }
}
