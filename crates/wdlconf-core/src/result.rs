use serde::Serialize;

/// Terminal status of one executed (test, version, repeat) unit.
///
/// `Failed` may be downgraded to `Warning` by dependency or priority policy;
/// no other transition is allowed once a status is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Succeeded,
    Failed,
    Skipped,
    Ignored,
    Warning,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Skipped => "SKIPPED",
            Status::Ignored => "IGNORED",
            Status::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Timing {
    /// Wall-clock seconds around the child runner invocation.
    pub real: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub test_index: usize,
    pub id: String,
    pub description: String,
    pub version: String,
    pub runner: String,
    pub repeat: u32,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<Timing>,
}

impl TestResult {
    /// Downgrade a FAILED result to WARNING, preserving the original failure
    /// reason inside the new one. Any other status is left untouched.
    pub fn downgrade_to_warning(&mut self, reason: String) {
        if self.status == Status::Failed {
            self.status = Status::Warning;
            self.reason = Some(reason);
        }
    }
}
