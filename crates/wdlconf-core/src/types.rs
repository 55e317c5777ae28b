use anyhow::{Context, Result};
use serde_json::Value;

/// Declared shape of one expected workflow output.
///
/// The conformance document writes types in WDL surface syntax
/// (`Array[Map[String,Int]]?`, `Pair[Int,String]`, ...) or, for structs and
/// untyped objects, as a mapping from member name to member type. Both forms
/// parse into this closed enum so the comparator can match exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueType {
    pub kind: TypeKind,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Int,
    Float,
    Boolean,
    String,
    File,
    Array {
        item: Box<ValueType>,
        nonempty: bool,
    },
    Map {
        key: Box<ValueType>,
        value: Box<ValueType>,
    },
    Pair {
        left: Box<ValueType>,
        right: Box<ValueType>,
    },
    /// Members in declaration order. An empty member list is the untyped
    /// "object" form, compared as an unordered bag of scalar-equal keys.
    Struct {
        members: Vec<(String, ValueType)>,
    },
}

impl ValueType {
    pub fn required(kind: TypeKind) -> Self {
        ValueType {
            kind,
            optional: false,
        }
    }

    pub fn describe(&self) -> String {
        let base = match &self.kind {
            TypeKind::Int => "Int".to_string(),
            TypeKind::Float => "Float".to_string(),
            TypeKind::Boolean => "Boolean".to_string(),
            TypeKind::String => "String".to_string(),
            TypeKind::File => "File".to_string(),
            TypeKind::Array { item, nonempty } => {
                let plus = if *nonempty { "+" } else { "" };
                format!("Array[{}]{plus}", item.describe())
            }
            TypeKind::Map { key, value } => {
                format!("Map[{},{}]", key.describe(), value.describe())
            }
            TypeKind::Pair { left, right } => {
                format!("Pair[{},{}]", left.describe(), right.describe())
            }
            TypeKind::Struct { members } => {
                if members.is_empty() {
                    "Object".to_string()
                } else {
                    let inner: Vec<String> = members
                        .iter()
                        .map(|(name, ty)| format!("{name}: {}", ty.describe()))
                        .collect();
                    format!("Struct{{{}}}", inner.join(", "))
                }
            }
        };
        if self.optional {
            format!("{base}?")
        } else {
            base
        }
    }
}

/// Parse a type descriptor from the conformance document: either a WDL type
/// string or a mapping describing struct members.
pub fn parse_type(raw: &Value) -> Result<ValueType> {
    match raw {
        Value::String(s) => parse_type_str(s),
        Value::Object(map) => {
            let mut members = Vec::with_capacity(map.len());
            for (name, member_raw) in map {
                let member = parse_type(member_raw)
                    .with_context(|| format!("struct member {name:?}"))?;
                members.push((name.clone(), member));
            }
            Ok(ValueType::required(TypeKind::Struct { members }))
        }
        other => anyhow::bail!("type descriptor must be a string or mapping, got: {other}"),
    }
}

pub fn parse_type_str(s: &str) -> Result<ValueType> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty type string");
    }

    let (base, optional, nonempty) = split_quantifiers(s)?;

    let Some(open) = base.find('[') else {
        let kind = match base {
            "Int" => TypeKind::Int,
            "Float" => TypeKind::Float,
            "Boolean" => TypeKind::Boolean,
            "String" => TypeKind::String,
            "File" => TypeKind::File,
            "Object" => TypeKind::Struct {
                members: Vec::new(),
            },
            other => anyhow::bail!("unknown type: {other:?}"),
        };
        if nonempty {
            anyhow::bail!("'+' quantifier is only valid on Array types: {s:?}");
        }
        return Ok(ValueType { kind, optional });
    };

    if !base.ends_with(']') {
        anyhow::bail!("unbalanced brackets in type: {s:?}");
    }
    let outer = &base[..open];
    let inner = &base[open + 1..base.len() - 1];

    let kind = match outer {
        "Array" => {
            let item = parse_type_str(inner).with_context(|| format!("array item in {s:?}"))?;
            TypeKind::Array {
                item: Box::new(item),
                nonempty,
            }
        }
        "Map" => {
            let (k, v) = split_top_level_pair(inner)
                .with_context(|| format!("Map requires two type parameters: {s:?}"))?;
            TypeKind::Map {
                key: Box::new(parse_type_str(k)?),
                value: Box::new(parse_type_str(v)?),
            }
        }
        "Pair" => {
            let (l, r) = split_top_level_pair(inner)
                .with_context(|| format!("Pair requires two type parameters: {s:?}"))?;
            TypeKind::Pair {
                left: Box::new(parse_type_str(l)?),
                right: Box::new(parse_type_str(r)?),
            }
        }
        other => anyhow::bail!("unknown parameterized type: {other:?}"),
    };

    if nonempty && !matches!(kind, TypeKind::Array { .. }) {
        anyhow::bail!("'+' quantifier is only valid on Array types: {s:?}");
    }

    Ok(ValueType { kind, optional })
}

/// Strip postfix `?` / `+` quantifiers off the outermost type.
fn split_quantifiers(s: &str) -> Result<(&str, bool, bool)> {
    let mut end = s.len();
    let mut optional = false;
    let mut nonempty = false;
    for c in s.chars().rev() {
        match c {
            '?' => optional = true,
            '+' => nonempty = true,
            _ => break,
        }
        end -= c.len_utf8();
    }
    if end == 0 {
        anyhow::bail!("type string is only quantifiers: {s:?}");
    }
    Ok((&s[..end], optional, nonempty))
}

/// Split `K,V` at the single top-level comma, ignoring commas nested inside
/// brackets (`Map[String,Map[String,Int]]`).
fn split_top_level_pair(inner: &str) -> Result<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .context("unbalanced brackets in type parameters")?;
            }
            ',' if depth == 0 => {
                let (left, right) = (&inner[..i], &inner[i + 1..]);
                if left.trim().is_empty() || right.trim().is_empty() {
                    anyhow::bail!("missing type parameter");
                }
                return Ok((left.trim(), right.trim()));
            }
            _ => {}
        }
    }
    anyhow::bail!("expected two comma-separated type parameters, got: {inner:?}")
}
