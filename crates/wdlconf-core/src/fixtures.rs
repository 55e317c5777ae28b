use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

/// Maps a dialect version to the suite subdirectory holding its translated
/// fixtures. The translation step itself is an external collaborator; this
/// only encodes the directory convention its outputs follow.
pub fn version_directory(version: &str) -> Option<&'static str> {
    match version {
        "draft-2" => Some("draft-2"),
        "1.0" => Some("version_1.0"),
        "1.1" => Some("version_1.1"),
        "1.2" => Some("version_1.2"),
        "development" => Some("version_development"),
        _ => None,
    }
}

/// Resolves test fixtures inside one suite directory.
#[derive(Debug, Clone)]
pub struct FixtureLayout {
    suite_dir: PathBuf,
}

impl FixtureLayout {
    pub fn new(suite_dir: PathBuf) -> Self {
        FixtureLayout { suite_dir }
    }

    pub fn suite_dir(&self) -> &Path {
        &self.suite_dir
    }

    /// Absolute path of a version-specific fixture file. An unrecognized
    /// version is an error the caller folds into a per-unit verdict rather
    /// than a crash.
    pub fn resolve(&self, version: &str, name: &str) -> Result<PathBuf> {
        let dir = version_directory(version)
            .with_context(|| format!("WDL version {version} is not supported"))?;
        Ok(self.suite_dir.join("tests").join(dir).join(name))
    }

    /// Write an inline JSON inputs object to a unique file in `scratch_dir`,
    /// returning its path. Unique names keep concurrent units from
    /// clobbering each other.
    pub fn stage_inline_inputs(&self, scratch_dir: &Path, inputs: &Value) -> Result<PathBuf> {
        let path = scratch_dir.join(format!("inputs-{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(inputs).context("serialize inline inputs")?;
        std::fs::write(&path, body)
            .with_context(|| format!("write inline inputs: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_versions_map_to_directories() {
        assert_eq!(version_directory("draft-2"), Some("draft-2"));
        assert_eq!(version_directory("1.1"), Some("version_1.1"));
        assert_eq!(version_directory("development"), Some("version_development"));
        assert_eq!(version_directory("2.0"), None);
    }

    #[test]
    fn resolve_builds_versioned_paths() {
        let layout = FixtureLayout::new(PathBuf::from("/suite"));
        let p = layout.resolve("1.0", "add.wdl").unwrap();
        assert_eq!(p, PathBuf::from("/suite/tests/version_1.0/add.wdl"));
        let err = layout.resolve("9.9", "add.wdl").unwrap_err();
        assert!(format!("{err:#}").contains("not supported"));
    }

    #[test]
    fn staged_inputs_get_unique_paths() {
        let dir = std::env::temp_dir().join(format!("wdlconf_stage_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let layout = FixtureLayout::new(PathBuf::from("/suite"));
        let inputs = serde_json::json!({"wf.n": 3});
        let a = layout.stage_inline_inputs(&dir, &inputs).unwrap();
        let b = layout.stage_inline_inputs(&dir, &inputs).unwrap();
        assert_ne!(a, b);
        let body: Value = serde_json::from_slice(&std::fs::read(&a).unwrap()).unwrap();
        assert_eq!(body, inputs);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
