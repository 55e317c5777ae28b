use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::Value;

use crate::types::{parse_type, ValueType};

/// Scheduling priority of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Required,
    Optional,
    Ignore,
}

/// Workflow inputs: a JSON file shipped with the suite, or an inline object
/// staged to a temp file at run time. The configuration declares exactly one.
#[derive(Debug, Clone)]
pub enum JsonInput {
    File(String),
    Inline(Value),
}

#[derive(Debug, Clone)]
pub struct TestInputs {
    pub wdl: String,
    pub json: JsonInput,
}

#[derive(Debug, Clone)]
pub struct ExpectedOutput {
    pub name: String,
    pub ty: ValueType,
    pub value: Value,
}

/// Exit codes the runner is allowed to return. `Any` is the `"*"` wildcard
/// and also the default when the configuration says nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnCodes {
    Any,
    Set(Vec<i32>),
}

impl ReturnCodes {
    pub fn accepts(&self, code: i32) -> bool {
        match self {
            ReturnCodes::Any => true,
            ReturnCodes::Set(codes) => codes.contains(&code),
        }
    }
}

/// One conformance test record, loaded once at startup and read-only from
/// then on; workers only ever hold shared references.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: String,
    pub description: String,
    pub tags: Vec<String>,
    pub versions: Vec<String>,
    pub priority: Priority,
    pub dependencies: Vec<String>,
    pub inputs: TestInputs,
    pub outputs: Vec<ExpectedOutput>,
    pub expected_fail: bool,
    pub return_codes: ReturnCodes,
    pub exclude_outputs: Vec<String>,
    pub extra_args: Vec<String>,
}

/// Load the conformance suite from a YAML (or, by extension, JSON) document:
/// a sequence of test records. Any structural error is fatal and names the
/// offending test index.
pub fn load_suite(path: &Path) -> Result<Vec<TestCase>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read test suite: {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let doc: Value = if is_json {
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {} as JSON", path.display()))?
    } else {
        serde_yaml::from_slice(&bytes)
            .with_context(|| format!("parse {} as YAML", path.display()))?
    };

    let records = doc
        .as_array()
        .with_context(|| format!("{}: expected a top-level sequence of tests", path.display()))?;

    let mut tests = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let test = parse_test(record).with_context(|| format!("test {index}"))?;
        tests.push(test);
    }
    Ok(tests)
}

fn parse_test(record: &Value) -> Result<TestCase> {
    let obj = record.as_object().context("test record is not a mapping")?;

    let id = require_str(record, "id")?.to_string();
    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let tags = string_list(record, "tags")?;
    let versions = string_list(record, "versions")?;
    if versions.is_empty() {
        bail!("test declares no versions");
    }
    let priority = match obj.get("priority").and_then(Value::as_str) {
        None | Some("required") => Priority::Required,
        Some("optional") => Priority::Optional,
        Some("ignore") => Priority::Ignore,
        Some(other) => bail!("unknown priority: {other:?}"),
    };
    let dependencies = string_list(record, "dependencies")?;

    let inputs_val = obj.get("inputs").context("test has no inputs section")?;
    let wdl = require_str(inputs_val, "wdl")
        .context("inputs section")?
        .to_string();
    let json = match inputs_val.get("json") {
        Some(Value::String(path)) => JsonInput::File(path.clone()),
        Some(obj @ Value::Object(_)) => JsonInput::Inline(obj.clone()),
        Some(other) => bail!("inputs.json must be a path or an inline object, got {other}"),
        None => bail!("inputs section has no json field"),
    };

    let mut outputs = Vec::new();
    if let Some(section) = obj.get("outputs") {
        let section = section
            .as_object()
            .context("outputs section is not a mapping")?;
        for (name, decl) in section {
            let ty_val = decl
                .get("type")
                .with_context(|| format!("output {name:?} has no type"))?;
            let ty = parse_type(ty_val).with_context(|| format!("output {name:?}"))?;
            let value = decl
                .get("value")
                .with_context(|| format!("output {name:?} has no value"))?
                .clone();
            outputs.push(ExpectedOutput {
                name: name.clone(),
                ty,
                value,
            });
        }
    }

    let expected_fail = obj.get("fail").and_then(Value::as_bool).unwrap_or(false);
    let return_codes = parse_return_codes(obj.get("return_code"))?;
    let exclude_outputs = string_list(record, "exclude_output")?;
    let extra_args = string_list(record, "args")?;

    Ok(TestCase {
        id,
        description,
        tags,
        versions,
        priority,
        dependencies,
        inputs: TestInputs { wdl, json },
        outputs,
        expected_fail,
        return_codes,
        exclude_outputs,
        extra_args,
    })
}

fn parse_return_codes(val: Option<&Value>) -> Result<ReturnCodes> {
    let as_code = |v: &Value| -> Result<i32> {
        let n = v.as_i64().with_context(|| format!("bad return code: {v}"))?;
        i32::try_from(n).with_context(|| format!("return code out of range: {n}"))
    };
    match val {
        None => Ok(ReturnCodes::Any),
        Some(Value::String(s)) if s == "*" => Ok(ReturnCodes::Any),
        Some(Value::Array(items)) => {
            let codes = items.iter().map(as_code).collect::<Result<Vec<_>>>()?;
            Ok(ReturnCodes::Set(codes))
        }
        Some(v @ Value::Number(_)) => Ok(ReturnCodes::Set(vec![as_code(v)?])),
        Some(other) => bail!("return_code must be an int, a list of ints, or \"*\", got {other}"),
    }
}

fn require_str<'a>(record: &'a Value, key: &str) -> Result<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing or non-string field: {key}"))
}

fn string_list(record: &Value, key: &str) -> Result<Vec<String>> {
    match record.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .with_context(|| format!("{key} entries must be strings, got {v}"))
            })
            .collect(),
        Some(other) => bail!("{key} must be a list, got {other}"),
    }
}

/// Parse a numeric selection argument such as `"1-4,9"` into a set of test
/// indices. Empty segments are ignored.
pub fn parse_test_indices(arg: &str) -> Result<BTreeSet<usize>> {
    let mut indices = BTreeSet::new();
    for piece in arg.split(',').filter(|p| !p.is_empty()) {
        let (start, end) = match piece.split_once('-') {
            Some((a, b)) => (a, b),
            None => (piece, piece),
        };
        let start: usize = start
            .trim()
            .parse()
            .with_context(|| format!("bad test number: {piece:?}"))?;
        let end: usize = end
            .trim()
            .parse()
            .with_context(|| format!("bad test number: {piece:?}"))?;
        indices.extend(start..=end);
    }
    Ok(indices)
}

pub fn parse_tags(arg: &str) -> BTreeSet<String> {
    arg.split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Selection criteria assembled from the command line. `None` means the
/// criterion was not given at all, which is different from an empty set.
#[derive(Debug, Default)]
pub struct Selection {
    pub numbers: Option<BTreeSet<usize>>,
    pub ids: Option<BTreeSet<String>>,
    pub tags: Option<BTreeSet<String>>,
    pub exclude_numbers: Option<BTreeSet<usize>>,
    pub exclude_tags: Option<BTreeSet<String>>,
}

/// Resolve the selection to sorted test indices: union of explicit numbers,
/// ids, and tags, minus exclusions; no positive criteria means every test.
/// A criterion that parsed to an empty set (e.g. `--numbers ""`) counts as
/// not given at all.
pub fn select_tests(tests: &[TestCase], sel: &Selection) -> Vec<usize> {
    let numbers = sel.numbers.as_ref().filter(|s| !s.is_empty());
    let ids = sel.ids.as_ref().filter(|s| !s.is_empty());
    let tags = sel.tags.as_ref().filter(|s| !s.is_empty());
    let no_positive_criteria = numbers.is_none() && ids.is_none() && tags.is_none();

    let mut selected = Vec::new();
    for (index, test) in tests.iter().enumerate() {
        if let Some(excluded) = &sel.exclude_numbers {
            if excluded.contains(&index) {
                continue;
            }
        }
        if let Some(excluded) = &sel.exclude_tags {
            if test.tags.iter().any(|t| excluded.contains(t)) {
                continue;
            }
        }
        let wanted = no_positive_criteria
            || numbers.map(|n| n.contains(&index)).unwrap_or(false)
            || ids.map(|ids| ids.contains(&test.id)).unwrap_or(false)
            || tags
                .map(|tags| test.tags.iter().any(|t| tags.contains(t)))
                .unwrap_or(false);
        if wanted {
            selected.push(index);
        }
    }
    selected
}

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("valid literal regex")
    })
}

/// Expand `${VAR}` and `$VAR` environment references inside every string
/// leaf of an expected value, in place. Unset variables are left verbatim.
/// Workflow engines render `File`-to-`String` conversions as absolute paths,
/// so suites anchor expected strings on `${WDL_DIR}`.
pub fn expand_vars(value: &mut Value) {
    match value {
        Value::String(s) => {
            let expanded = var_pattern().replace_all(s, |caps: &regex::Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or("");
                match std::env::var(name) {
                    Ok(val) => val,
                    Err(_) => caps[0].to_string(),
                }
            });
            if expanded != *s {
                *value = Value::String(expanded.into_owned());
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_vars(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_vars(item);
            }
        }
        _ => {}
    }
}
