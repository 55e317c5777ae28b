use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use sha2::{Digest, Sha256};

use crate::util::hex_lower;

/// One request to invoke a runner on a workflow: all paths are resolved and
/// inline inputs are already staged to a file by the caller.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub inputs_json: PathBuf,
    pub results_file: PathBuf,
    pub extra_args: Vec<String>,
    pub verbose: bool,
}

/// Capability for turning a [`CommandRequest`] into an argv vector for one
/// external workflow engine. No shell is involved; the vector is executed
/// directly.
///
/// Implementations are shared across all workers, so any internal state
/// (lazy provisioning) must be guarded.
pub trait RunnerAdapter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn format_command(&self, req: &CommandRequest) -> Result<Vec<String>>;
}

/// Engines that take inputs via `-i` and write a machine-readable results
/// document via `-m` (cromwell, toil-wdl-runner).
#[derive(Debug)]
pub struct CromwellStyle {
    name: String,
    argv_prefix: Vec<String>,
}

impl CromwellStyle {
    pub fn new(name: &str, argv_prefix: &[&str]) -> Self {
        CromwellStyle {
            name: name.to_string(),
            argv_prefix: argv_prefix.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunnerAdapter for CromwellStyle {
    fn name(&self) -> &str {
        &self.name
    }

    fn format_command(&self, req: &CommandRequest) -> Result<Vec<String>> {
        Ok(cromwell_style_argv(&self.argv_prefix, req))
    }
}

fn cromwell_style_argv(prefix: &[String], req: &CommandRequest) -> Vec<String> {
    let mut argv = prefix.to_vec();
    argv.push(req.program.display().to_string());
    argv.push("-i".to_string());
    argv.push(req.inputs_json.display().to_string());
    argv.push("-m".to_string());
    argv.push(req.results_file.display().to_string());
    argv.extend(req.extra_args.iter().cloned());
    argv
}

/// Engines that write results via `-o` and always run with verbose engine
/// logging into a dedicated log directory (miniwdl).
#[derive(Debug)]
pub struct MiniwdlStyle {
    name: String,
    argv_prefix: Vec<String>,
    log_dir: String,
}

impl MiniwdlStyle {
    pub fn new(name: &str, argv_prefix: &[&str]) -> Self {
        MiniwdlStyle {
            name: name.to_string(),
            argv_prefix: argv_prefix.iter().map(|s| s.to_string()).collect(),
            log_dir: "miniwdl-logs".to_string(),
        }
    }
}

impl RunnerAdapter for MiniwdlStyle {
    fn name(&self) -> &str {
        &self.name
    }

    fn format_command(&self, req: &CommandRequest) -> Result<Vec<String>> {
        let mut argv = self.argv_prefix.clone();
        argv.push(req.program.display().to_string());
        argv.push("-i".to_string());
        argv.push(req.inputs_json.display().to_string());
        argv.push("-o".to_string());
        argv.push(req.results_file.display().to_string());
        argv.push("--verbose".to_string());
        argv.extend(req.extra_args.iter().cloned());
        argv.push("-d".to_string());
        argv.push(self.log_dir.clone());
        Ok(argv)
    }
}

/// Pinned fallback release used when no `cromwell` binary is on the PATH.
#[derive(Debug, Clone)]
pub struct CromwellRelease {
    pub url: String,
    /// Verified when present; upstream does not publish checksums for every
    /// release, so a registry built from defaults leaves this unset.
    pub sha256: Option<String>,
}

impl CromwellRelease {
    pub fn pinned_default() -> Self {
        CromwellRelease {
            url: "https://github.com/broadinstitute/cromwell/releases/download/87/cromwell-87.jar"
                .to_string(),
            sha256: None,
        }
    }
}

#[derive(Debug)]
enum ProvisionState {
    Unresolved,
    Ready(Vec<String>),
    Failed(String),
}

/// Cromwell-style adapter with one-time, mutex-guarded lazy provisioning: if
/// no `cromwell` binary is on the search path, the pinned jar is downloaded
/// exactly once and every worker reuses the cached `java -jar` prefix. A
/// failed download is sticky: all later units fail with the same reason
/// instead of re-downloading per unit.
#[derive(Debug)]
pub struct ProvisionedCromwell {
    name: String,
    jar_path: PathBuf,
    release: CromwellRelease,
    state: Mutex<ProvisionState>,
}

impl ProvisionedCromwell {
    pub fn new(jar_path: PathBuf, release: CromwellRelease) -> Self {
        ProvisionedCromwell {
            name: "cromwell".to_string(),
            jar_path,
            release,
            state: Mutex::new(ProvisionState::Unresolved),
        }
    }

    fn resolve_prefix(&self, verbose: bool) -> Result<Vec<String>> {
        if find_on_path("cromwell").is_some() {
            return Ok(vec!["cromwell".to_string()]);
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*state {
            ProvisionState::Ready(prefix) => return Ok(prefix.clone()),
            ProvisionState::Failed(reason) => {
                anyhow::bail!("cromwell provisioning previously failed: {reason}");
            }
            ProvisionState::Unresolved => {}
        }

        if !self.jar_path.is_file() {
            eprintln!("cromwell not seen on the path, downloading a pinned release to run tests...");
            if let Err(err) =
                download_verify(&self.release.url, &self.jar_path, self.release.sha256.as_deref())
            {
                let reason = format!("{err:#}");
                *state = ProvisionState::Failed(reason.clone());
                anyhow::bail!("cromwell provisioning failed: {reason}");
            }
        }

        let mut prefix = vec!["java".to_string()];
        if !verbose {
            prefix.push("-DLOG_LEVEL=OFF".to_string());
        }
        prefix.push("-jar".to_string());
        prefix.push(self.jar_path.display().to_string());
        prefix.push("run".to_string());

        *state = ProvisionState::Ready(prefix.clone());
        Ok(prefix)
    }
}

impl RunnerAdapter for ProvisionedCromwell {
    fn name(&self) -> &str {
        &self.name
    }

    fn format_command(&self, req: &CommandRequest) -> Result<Vec<String>> {
        let prefix = self.resolve_prefix(req.verbose)?;
        Ok(cromwell_style_argv(&prefix, req))
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|cand| cand.is_file())
}

fn download_verify(url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
    let resp = ureq::get(url).call().with_context(|| format!("GET {url}"))?;
    let mut reader = resp.into_body().into_reader();

    let tmp = dest.with_extension("download.tmp");
    if let Some(parent) = tmp.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let mut f = std::fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let n = reader.read(&mut buf).context("read download stream")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        f.write_all(&buf[..n]).context("write download")?;
    }
    f.flush().context("flush download")?;
    drop(f);

    if let Some(expected) = expected_sha256 {
        let actual = hex_lower(&hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            let _ = std::fs::remove_file(&tmp);
            anyhow::bail!("sha256 mismatch for {url}: expected {expected}, got {actual}");
        }
    }

    std::fs::rename(&tmp, dest)
        .with_context(|| format!("move download into place: {}", dest.display()))?;
    Ok(())
}

/// Name-to-adapter map built once at startup and shared by reference with
/// the orchestrator; there is no global registry.
pub struct RunnerRegistry {
    adapters: BTreeMap<String, Arc<dyn RunnerAdapter>>,
}

impl RunnerRegistry {
    pub fn builtin(build_dir: &Path) -> Self {
        let mut adapters: BTreeMap<String, Arc<dyn RunnerAdapter>> = BTreeMap::new();
        adapters.insert(
            "cromwell".to_string(),
            Arc::new(ProvisionedCromwell::new(
                build_dir.join("cromwell.jar"),
                CromwellRelease::pinned_default(),
            )),
        );
        adapters.insert(
            "toil-wdl-runner".to_string(),
            Arc::new(CromwellStyle::new(
                "toil-wdl-runner",
                &["toil-wdl-runner", "--outputDialect", "miniwdl"],
            )),
        );
        adapters.insert(
            "toil-wdl-runner-old".to_string(),
            Arc::new(CromwellStyle::new(
                "toil-wdl-runner-old",
                &["toil-wdl-runner-old"],
            )),
        );
        adapters.insert(
            "miniwdl".to_string(),
            Arc::new(MiniwdlStyle::new("miniwdl", &["miniwdl", "run"])),
        );
        RunnerRegistry { adapters }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RunnerAdapter>> {
        self.adapters.get(name).cloned().with_context(|| {
            format!(
                "unsupported runner: {name} (available: {})",
                self.names().join(", ")
            )
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static TMP_N: AtomicUsize = AtomicUsize::new(0);

    fn req() -> CommandRequest {
        CommandRequest {
            program: PathBuf::from("/work/wf.wdl"),
            inputs_json: PathBuf::from("/work/wf.json"),
            results_file: PathBuf::from("/work/results-abc.json"),
            extra_args: vec!["--extra".to_string()],
            verbose: false,
        }
    }

    #[test]
    fn cromwell_style_uses_i_and_m_flags() {
        let adapter = CromwellStyle::new("toil-wdl-runner", &["toil-wdl-runner"]);
        let argv = adapter.format_command(&req()).unwrap();
        assert_eq!(
            argv,
            [
                "toil-wdl-runner",
                "/work/wf.wdl",
                "-i",
                "/work/wf.json",
                "-m",
                "/work/results-abc.json",
                "--extra",
            ]
        );
    }

    #[test]
    fn miniwdl_style_uses_o_flag_and_log_dir() {
        let adapter = MiniwdlStyle::new("miniwdl", &["miniwdl", "run"]);
        let argv = adapter.format_command(&req()).unwrap();
        assert_eq!(argv[0..2], ["miniwdl", "run"]);
        assert!(argv.contains(&"-o".to_string()));
        assert!(argv.contains(&"--verbose".to_string()));
        assert_eq!(argv[argv.len() - 2..], ["-d", "miniwdl-logs"]);
        assert!(!argv.contains(&"-m".to_string()));
    }

    #[test]
    fn registry_exposes_builtin_runners() {
        let reg = RunnerRegistry::builtin(Path::new("build"));
        assert_eq!(
            reg.names(),
            ["cromwell", "miniwdl", "toil-wdl-runner", "toil-wdl-runner-old"]
        );
        assert!(reg.get("miniwdl").is_ok());
        let err = reg.get("nope").unwrap_err();
        assert!(format!("{err:#}").contains("unsupported runner"));
    }

    #[test]
    fn provisioning_failure_is_sticky() {
        if find_on_path("cromwell").is_some() {
            // A real cromwell on the test host's PATH bypasses provisioning.
            return;
        }
        let pid = std::process::id();
        let n = TMP_N.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("wdlconf_provision_fail_{pid}_{n}"));
        std::fs::create_dir_all(&dir).unwrap();

        // Port 9 (discard) is not listening; the download fails fast.
        let adapter = ProvisionedCromwell::new(
            dir.join("cromwell.jar"),
            CromwellRelease {
                url: "http://127.0.0.1:9/cromwell.jar".to_string(),
                sha256: None,
            },
        );
        let first = adapter.resolve_prefix(false).unwrap_err();
        assert!(
            format!("{first:#}").contains("provisioning failed"),
            "{first:#}"
        );
        // Later units reuse the remembered failure instead of re-downloading.
        let second = adapter.resolve_prefix(false).unwrap_err();
        assert!(
            format!("{second:#}").contains("previously failed"),
            "{second:#}"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn provisioned_cromwell_caches_resolution() {
        let pid = std::process::id();
        let n = TMP_N.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("wdlconf_provision_{pid}_{n}"));
        std::fs::create_dir_all(&dir).unwrap();
        let jar = dir.join("cromwell.jar");
        std::fs::write(&jar, b"jar").unwrap();

        let adapter = ProvisionedCromwell::new(jar.clone(), CromwellRelease::pinned_default());
        let first = adapter.resolve_prefix(false).unwrap();
        if first == ["cromwell"] {
            // A real cromwell on the test host's PATH bypasses provisioning.
            let _ = std::fs::remove_dir_all(&dir);
            return;
        }
        assert_eq!(first[0], "java");
        assert!(first.contains(&"-DLOG_LEVEL=OFF".to_string()));
        assert_eq!(first[first.len() - 1], "run");

        // Cached: deleting the jar must not trigger a new resolution.
        std::fs::remove_file(&jar).unwrap();
        let second = adapter.resolve_prefix(false).unwrap();
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
