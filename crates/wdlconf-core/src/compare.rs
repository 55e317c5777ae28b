use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::types::{TypeKind, ValueType};
use crate::util::sha256_hex;

/// Recursively compare an expected output value against the value a runner
/// produced, directed by the declared type.
///
/// Leniency rules accommodate documented engine behavior: optional types
/// short-circuit on null/null, map entries are compared by position (some
/// engines round-trip non-string keys as decimal strings), and Int/Float
/// leaves accept values serialized in string form when they parse losslessly.
///
/// Returns `Err(reason)` on the first mismatch; reasons embed both the
/// expected and actual values verbatim.
pub fn compare_outputs(expected: &Value, actual: &Value, ty: &ValueType) -> Result<(), String> {
    if ty.optional && expected.is_null() && actual.is_null() {
        return Ok(());
    }

    match &ty.kind {
        TypeKind::Array { item, .. } => compare_arrays(expected, actual, item),
        TypeKind::Map { key, value } => compare_maps(expected, actual, key, value),
        TypeKind::Struct { members } => compare_structs(expected, actual, members),
        TypeKind::Pair { left, right } => compare_pairs(expected, actual, left, right),
        TypeKind::Int => compare_ints(expected, actual),
        TypeKind::Float => compare_floats(expected, actual),
        TypeKind::Boolean => compare_scalars(expected, actual, Value::as_bool, "Boolean"),
        TypeKind::String => compare_scalars(expected, actual, Value::as_str, "String"),
        TypeKind::File => compare_files(expected, actual),
    }
}

fn compare_arrays(expected: &Value, actual: &Value, item: &ValueType) -> Result<(), String> {
    let exp = expected
        .as_array()
        .ok_or_else(|| type_mismatch("Array", expected, actual))?;
    let act = actual
        .as_array()
        .ok_or_else(|| type_mismatch("Array", expected, actual))?;

    if exp.len() != act.len() {
        return Err(format!(
            "array size mismatch: expected {} elements but got {}\nExpected output: {expected}\nActual result was: {actual}",
            exp.len(),
            act.len()
        ));
    }
    for (e, a) in exp.iter().zip(act.iter()) {
        compare_outputs(e, a, item)?;
    }
    Ok(())
}

/// Map entries are matched positionally across both key sequences and both
/// value sequences, never by key lookup: engines that serialize an
/// `Int`-keyed map emit the keys as decimal strings, so lookup by the
/// expected key would spuriously fail.
fn compare_maps(
    expected: &Value,
    actual: &Value,
    key_ty: &ValueType,
    value_ty: &ValueType,
) -> Result<(), String> {
    let exp = expected
        .as_object()
        .ok_or_else(|| type_mismatch("Map", expected, actual))?;
    let act = actual
        .as_object()
        .ok_or_else(|| type_mismatch("Map", expected, actual))?;

    if exp.len() != act.len() {
        return Err(format!(
            "map size mismatch: expected {} entries but got {}\nExpected output: {expected}\nActual result was: {actual}",
            exp.len(),
            act.len()
        ));
    }
    for ((ek, ev), (ak, av)) in exp.iter().zip(act.iter()) {
        compare_outputs(
            &Value::String(ek.clone()),
            &Value::String(ak.clone()),
            key_ty,
        )?;
        compare_outputs(ev, av, value_ty)?;
    }
    Ok(())
}

fn compare_structs(
    expected: &Value,
    actual: &Value,
    members: &[(String, ValueType)],
) -> Result<(), String> {
    let exp = expected
        .as_object()
        .ok_or_else(|| type_mismatch("Struct", expected, actual))?;
    let act = actual
        .as_object()
        .ok_or_else(|| type_mismatch("Struct", expected, actual))?;

    let required = members.iter().filter(|(_, ty)| !ty.optional).count();
    if exp.len() < required {
        return Err(format!(
            "struct has {} expected members but {} are required\nExpected output: {expected}\nActual result was: {actual}",
            exp.len(),
            required
        ));
    }
    if exp.len() > act.len() {
        return Err(format!(
            "struct member count mismatch: expected {} members but got {}\nExpected output: {expected}\nActual result was: {actual}",
            exp.len(),
            act.len()
        ));
    }

    if members.is_empty() {
        // Untyped object: an unordered bag of scalar-equal keys.
        for (name, ev) in exp {
            let av = act
                .get(name)
                .ok_or_else(|| format!("object is missing key {name:?}\nExpected output: {expected}\nActual result was: {actual}"))?;
            if ev != av {
                return Err(format!(
                    "object key {name:?} differs\nExpected output: {ev}\nActual result was: {av}"
                ));
            }
        }
        return Ok(());
    }

    for (name, ev) in exp {
        let Some((_, member_ty)) = members.iter().find(|(n, _)| n == name) else {
            return Err(format!(
                "struct has no declared member {name:?}\nExpected output: {expected}\nActual result was: {actual}"
            ));
        };
        let av = act.get(name).unwrap_or(&Value::Null);
        compare_outputs(ev, av, member_ty)?;
    }
    Ok(())
}

fn compare_pairs(
    expected: &Value,
    actual: &Value,
    left: &ValueType,
    right: &ValueType,
) -> Result<(), String> {
    let exp = expected
        .as_object()
        .ok_or_else(|| type_mismatch("Pair", expected, actual))?;
    let act = actual
        .as_object()
        .ok_or_else(|| type_mismatch("Pair", expected, actual))?;

    if exp.len() != 2 || !exp.contains_key("left") || !exp.contains_key("right") {
        return Err(format!(
            "pair must have exactly the keys \"left\" and \"right\"\nExpected output: {expected}\nActual result was: {actual}"
        ));
    }
    for (key, ty) in [("left", left), ("right", right)] {
        let ev = exp.get(key).unwrap_or(&Value::Null);
        let av = act.get(key).unwrap_or(&Value::Null);
        compare_outputs(ev, av, ty)?;
    }
    Ok(())
}

/// Int leaves accept string-serialized values when they parse losslessly as
/// integers (engines emit numeric map keys as strings).
fn compare_ints(expected: &Value, actual: &Value) -> Result<(), String> {
    let e = value_as_i64(expected).ok_or_else(|| type_mismatch("Int", expected, actual))?;
    let a = value_as_i64(actual).ok_or_else(|| type_mismatch("Int", expected, actual))?;
    if e != a {
        return Err(unequal(expected, actual));
    }
    Ok(())
}

fn compare_floats(expected: &Value, actual: &Value) -> Result<(), String> {
    let e = value_as_f64(expected).ok_or_else(|| type_mismatch("Float", expected, actual))?;
    let a = value_as_f64(actual).ok_or_else(|| type_mismatch("Float", expected, actual))?;
    if e != a {
        return Err(unequal(expected, actual));
    }
    Ok(())
}

fn compare_scalars<'a, T: PartialEq>(
    expected: &'a Value,
    actual: &'a Value,
    extract: fn(&'a Value) -> Option<T>,
    type_name: &str,
) -> Result<(), String> {
    let e = extract(expected).ok_or_else(|| type_mismatch(type_name, expected, actual))?;
    let a = extract(actual).ok_or_else(|| type_mismatch(type_name, expected, actual))?;
    if e != a {
        return Err(unequal(expected, actual));
    }
    Ok(())
}

/// File outputs are verified against the file's content, not its path. The
/// expected descriptor carries either a `regex` the text content must match
/// or a `sha256` content hash (a bare string is shorthand for the hash).
fn compare_files(expected: &Value, actual: &Value) -> Result<(), String> {
    let path_str = actual
        .as_str()
        .ok_or_else(|| type_mismatch("File", expected, actual))?;
    let path = Path::new(path_str);
    if !path.exists() {
        return Err(format!(
            "file {path_str:?} not found\nExpected output: {expected}\nActual result was: {actual}"
        ));
    }
    let contents = std::fs::read(path)
        .map_err(|err| format!("file {path_str:?} cannot be read: {err}"))?;

    if let Some(pattern) = expected.get("regex").and_then(Value::as_str) {
        if pattern.is_empty() {
            return Err(format!("empty regex for file {path_str:?}"));
        }
        let re = Regex::new(pattern)
            .map_err(|err| format!("invalid regex {pattern:?} for file {path_str:?}: {err}"))?;
        let text = String::from_utf8_lossy(&contents);
        if !re.is_match(&text) {
            return Err(format!(
                "file {path_str:?} content does not match regex\nExpected output: {expected}\nActual result was: {actual}"
            ));
        }
        return Ok(());
    }

    let expected_hash = expected
        .get("sha256")
        .and_then(Value::as_str)
        .or_else(|| expected.as_str())
        .ok_or_else(|| {
            format!("file descriptor must carry a sha256 or regex\nExpected output: {expected}")
        })?;
    let actual_hash = sha256_hex(&contents);
    if !actual_hash.eq_ignore_ascii_case(expected_hash.trim()) {
        return Err(format!(
            "file {path_str:?} content hash mismatch\nExpected output: {expected_hash}\nActual result was: {actual_hash}"
        ));
    }
    Ok(())
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn type_mismatch(type_name: &str, expected: &Value, actual: &Value) -> String {
    format!(
        "value does not fit declared type {type_name}\nExpected output: {expected}\nActual result was: {actual}"
    )
}

fn unequal(expected: &Value, actual: &Value) -> String {
    format!("\nExpected output: {expected}\nActual result was: {actual}")
}
