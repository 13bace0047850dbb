//! Manifest attribute values and the `${function arg}` interpolation engine.
//!
//! Driver configuration blocks in `project.json` are plain JSON, but string
//! values may contain one or more `${...}` placeholders that get expanded
//! against the current project, its dependee, and the environment before a
//! driver ever sees them. This mirrors `attribute.c` in the original
//! implementation, generalized from its fixed set of C-specific functions to
//! whatever a driver registers.

use std::collections::BTreeMap;

use crate::paths::{EnvPaths, LocateKind};
use crate::project::{Project, ProjectId};

/// A resolved attribute value, after JSON parsing and interpolation.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Vec<AttrValue>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Str(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            AttrValue::Num(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Converts a parsed JSON value into an `AttrValue` tree, without
    /// running interpolation (strings are copied verbatim).
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => AttrValue::Bool(*b),
            serde_json::Value::Number(n) => AttrValue::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => AttrValue::Str(s.clone()),
            serde_json::Value::Array(a) => AttrValue::Array(a.iter().map(AttrValue::from_json).collect()),
            serde_json::Value::Object(_) | serde_json::Value::Null => AttrValue::Str(String::new()),
        }
    }
}

/// Everything the interpolator needs to resolve a placeholder: the project
/// the attribute belongs to, the "current" driver id asking for it, and
/// environment paths for `locate`.
pub struct InterpContext<'a> {
    pub project: &'a Project,
    /// The dependee project, when resolving an attribute contributed via
    /// `dependee` configuration (the `$` indirect-id function resolves
    /// against this instead of `project`).
    pub dependee: Option<&'a Project>,
    pub driver_id: &'a str,
    pub paths: &'a mut EnvPaths,
}

/// Expands every `${...}` placeholder in `input`, returning an error string
/// describing the first unresolvable function call, if any.
pub fn interpolate(input: &str, ctx: &mut InterpContext) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| format!("unterminated placeholder in '{input}'"))?;
        let expr = &after[..end];
        out.push_str(&eval_placeholder(expr, ctx)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_placeholder(expr: &str, ctx: &mut InterpContext) -> Result<String, String> {
    let expr = expr.trim();

    // `$` on its own (or as a function's subject) means "the dependee of the
    // current project" rather than the current project itself.
    if let Some(rest) = expr.strip_prefix('$') {
        let subject = ctx.dependee.unwrap_or(ctx.project);
        return eval_function(rest.trim(), subject, ctx.driver_id, ctx.paths);
    }

    eval_function(expr, ctx.project, ctx.driver_id, ctx.paths)
}

fn eval_function(expr: &str, subject: &Project, driver_id: &str, paths: &mut EnvPaths) -> Result<String, String> {
    let mut parts = expr.splitn(2, char::is_whitespace);
    let func = parts.next().unwrap_or("").trim();
    let arg = parts.next().unwrap_or("").trim();

    match func {
        "id" => Ok(resolve_id_form(subject.id.dotted(), arg)),
        "locate" => {
            let kind = parse_locate_kind(arg).unwrap_or(LocateKind::Meta);
            Ok(paths
                .locate(subject.id.dotted(), kind)
                .map(|p| p.display().to_string())
                .unwrap_or_default())
        }
        "os" | "target" => Ok(bool_str(os_matches(arg))),
        "language" | "lang" => Ok(bool_str(language_matches(subject.language.as_deref(), arg))),
        "config" | "cfg" => Ok(bool_str(paths.config.eq_ignore_ascii_case(arg))),
        "driver-attr" => Ok(subject
            .drivers
            .iter()
            .find(|d| d.driver_id == driver_id)
            .and_then(|d| d.attrs.get(arg))
            .and_then(AttrValue::as_str)
            .map(str::to_string)
            .unwrap_or_default()),
        other => Err(format!("unknown attribute function '{other}'")),
    }
}

fn resolve_id_form(id: &str, arg: &str) -> String {
    let pid = match ProjectId::parse(id) {
        Ok(p) => p,
        Err(_) => return id.to_string(),
    };
    match arg {
        "base" => pid.base().to_string(),
        "upper" => pid.upper(),
        "dash" => pid.dashed(),
        "underscore" | "" => pid.underscored(),
        "camelcase" | "camel" => pid.camel_case(),
        "pascalcase" | "pascal" => pid.pascal_case(),
        _ => pid.dotted().to_string(),
    }
}

fn parse_locate_kind(name: &str) -> Option<LocateKind> {
    Some(match name {
        "meta" => LocateKind::Meta,
        "include" => LocateKind::Include,
        "etc" => LocateKind::Etc,
        "lib" => LocateKind::Lib,
        "staticlib" | "static_lib" => LocateKind::StaticLib,
        "app" => LocateKind::App,
        "binary" | "any" => LocateKind::AnyBinary,
        "source" | "src" => LocateKind::Source,
        "devsource" | "dev_source" => LocateKind::DevSource,
        "template" => LocateKind::Template,
        _ => return None,
    })
}

/// `${os linux}`/`${target windows}`: true if `arg` (or one of its
/// `|`-separated alternatives) matches the current platform string or
/// one of the conventional board/exact aliases.
fn os_matches(arg: &str) -> bool {
    let current = std::env::consts::OS;
    arg.split('|').map(str::trim).any(|candidate| {
        candidate.eq_ignore_ascii_case(current)
            || (candidate.eq_ignore_ascii_case("unix") && current != "windows")
            || (candidate.eq_ignore_ascii_case("posix") && current != "windows")
    })
}

/// `${language c++}`, with `cpp` accepted as an alias for `c++`.
fn language_matches(project_lang: Option<&str>, arg: &str) -> bool {
    let normalize = |s: &str| if s.eq_ignore_ascii_case("cpp") { "c++".to_string() } else { s.to_lowercase() };
    match project_lang {
        Some(lang) => arg.split('|').map(str::trim).any(|c| normalize(c) == normalize(lang)),
        None => false,
    }
}

fn bool_str(b: bool) -> String {
    if b { "true".to_string() } else { "false".to_string() }
}

/// Merges a JSON conditional block (`{"$if <cond>": {...}, ...}` style
/// sub-objects keyed `"1"`/`"true"` or `"0"`/`"false"`) into `base`,
/// matching `attribute.c`'s condition-block folding: truthy blocks get
/// merged key-by-key, falsy blocks are dropped entirely.
pub fn merge_conditional_blocks(
    base: &mut BTreeMap<String, serde_json::Value>,
    condition: bool,
    block: &serde_json::Map<String, serde_json::Value>,
) {
    if !condition {
        return;
    }
    for (k, v) in block {
        match (base.get_mut(k), v) {
            (Some(serde_json::Value::Array(existing)), serde_json::Value::Array(incoming)) => {
                existing.extend(incoming.clone());
            }
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Does `key` look like a condition toggle (`"1"`, `"0"`, `"true"`,
/// `"false"`) rather than a literal attribute name?
pub fn is_condition_key(key: &str) -> bool {
    matches!(key, "1" | "0" | "true" | "false")
}

/// Recursively runs [`interpolate`] over every string leaf of a JSON value.
pub fn interpolate_value(value: &serde_json::Value, ctx: &mut InterpContext) -> Result<serde_json::Value, String> {
    match value {
        serde_json::Value::String(s) => Ok(serde_json::Value::String(interpolate(s, ctx)?)),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, ctx)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, ctx)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves one driver's raw manifest config block: interpolates every key
/// and string value, and folds any conditional sub-block (a key that itself
/// interpolates to `"1"`/`"true"`/`"0"`/`"false"`) into the result according
/// to its condition. Returns the merged JSON object alongside its typed
/// `AttrValue` form.
pub fn resolve_driver_config(
    raw: &serde_json::Value,
    ctx: &mut InterpContext,
) -> Result<(serde_json::Value, BTreeMap<String, AttrValue>), String> {
    let mut merged: BTreeMap<String, serde_json::Value> = BTreeMap::new();

    if let serde_json::Value::Object(map) = raw {
        for (key, value) in map {
            let resolved_key = interpolate(key, ctx)?;
            if is_condition_key(&resolved_key) {
                let condition = matches!(resolved_key.as_str(), "1" | "true");
                if let serde_json::Value::Object(block) = value {
                    let resolved_block = match interpolate_value(&serde_json::Value::Object(block.clone()), ctx)? {
                        serde_json::Value::Object(m) => m,
                        _ => unreachable!("interpolate_value preserves Object variant"),
                    };
                    merge_conditional_blocks(&mut merged, condition, &resolved_block);
                }
                continue;
            }
            merged.insert(key.clone(), interpolate_value(value, ctx)?);
        }
    }

    let attrs = merged.iter().map(|(k, v)| (k.clone(), AttrValue::from_json(v))).collect();
    let merged_value = serde_json::Value::Object(merged.into_iter().collect());
    Ok((merged_value, attrs))
}
