//! Mapping compiler and previewer.
//!
//! Rules are normalized (trimmed paths, lowercase transforms, sorted by target
//! then source) before hashing, so logically equal specs hash identically.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use super::types::*;

static PATH_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\[\d+\])*(\.[A-Za-z_][A-Za-z0-9_]*(\[\d+\])*)*$").ok()
});

fn is_valid_path(path: &str) -> bool {
    PATH_PATTERN.as_ref().is_some_and(|re| re.is_match(path))
}

pub const TRANSFORMS: &[&str] = &["trim", "lowercase", "uppercase", "to_string", "to_number"];

/// SHA-256 over the canonical JSON form of `value`.
///
/// `serde_json` maps are ordered by key, which makes the encoding stable.
pub fn canonical_hash<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

pub fn compile(spec: &MappingSpec) -> CompileReport {
    let mut issues = Vec::new();
    let mut normalized = spec.clone();
    normalized.spec_id = spec.spec_id.trim().to_string();
    normalized.provider_id = spec.provider_id.trim().to_string();
    normalized.source_object = spec.source_object.trim().to_string();
    normalized.target_model = spec.target_model.trim().to_string();
    normalized.schema_ref = spec.schema_ref.trim().to_string();

    for (field, value) in [
        ("spec_id", &normalized.spec_id),
        ("provider_id", &normalized.provider_id),
        ("source_object", &normalized.source_object),
        ("target_model", &normalized.target_model),
    ] {
        if value.is_empty() {
            issues.push(ValidationIssue::error(
                "missing_field",
                format!("{} is required", field),
                Some(field.to_string()),
            ));
        }
    }
    if normalized.schema_ref.is_empty() {
        issues.push(ValidationIssue::warning(
            "missing_schema_ref",
            "schema_ref is empty; drift detection is disabled for this spec",
            Some("schema_ref".to_string()),
        ));
    }

    let mut rules: Vec<MappingRule> = spec.rules.iter().map(normalize_rule).collect();
    rules.sort_by(|a, b| {
        a.target_path
            .cmp(&b.target_path)
            .then_with(|| a.source_path.cmp(&b.source_path))
    });
    if rules.is_empty() {
        issues.push(ValidationIssue::error(
            "empty_rules",
            "mapping requires at least one rule",
            Some("rules".to_string()),
        ));
    }

    let mut targets = BTreeSet::new();
    for (index, rule) in rules.iter().enumerate() {
        let field = |name: &str| Some(format!("rules[{}].{}", index, name));
        for (name, path) in [("source_path", &rule.source_path), ("target_path", &rule.target_path)] {
            if path.is_empty() {
                issues.push(ValidationIssue::error(
                    "missing_path",
                    format!("{} is required", name),
                    field(name),
                ));
            } else if !is_valid_path(path) {
                issues.push(ValidationIssue::error(
                    "invalid_path",
                    format!("'{}' is not a valid field path", path),
                    field(name),
                ));
            }
        }
        if !rule.target_path.is_empty() && !targets.insert(rule.target_path.clone()) {
            issues.push(ValidationIssue::error(
                "duplicate_target",
                format!("target '{}' is mapped more than once", rule.target_path),
                field("target_path"),
            ));
        }
        if let Some(transform) = &rule.transform
            && !TRANSFORMS.contains(&transform.as_str())
        {
            issues.push(ValidationIssue::error(
                "unknown_transform",
                format!("unknown transform '{}'", transform),
                field("transform"),
            ));
        }
    }

    normalized.rules = rules.clone();
    let deterministic_hash = canonical_hash(&json!({
        "spec_id": normalized.spec_id,
        "version": normalized.version,
        "source_object": normalized.source_object,
        "target_model": normalized.target_model,
        "schema_ref": normalized.schema_ref,
        "rules": rules,
    }));

    CompileReport {
        compiled: CompiledMapping {
            spec_id: normalized.spec_id.clone(),
            version: normalized.version,
            source_object: normalized.source_object.clone(),
            target_model: normalized.target_model.clone(),
            rules,
            deterministic_hash,
        },
        normalized_spec: normalized,
        issues,
    }
}

fn normalize_rule(rule: &MappingRule) -> MappingRule {
    MappingRule {
        source_path: rule.source_path.trim().to_string(),
        target_path: rule.target_path.trim().to_string(),
        transform: rule
            .transform
            .as_deref()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty()),
        required: rule.required,
        default: rule.default.clone(),
    }
}

/// Apply a compiled mapping to sample records.
pub fn preview(report: &CompileReport, samples: &[Value]) -> PreviewReport {
    let mut issues: Vec<ValidationIssue> = report.issues.clone();
    let mut summary = PreviewSummary {
        total: samples.len(),
        ..PreviewSummary::default()
    };
    let mut records = Vec::with_capacity(samples.len());

    if report.has_errors() {
        summary.failed = samples.len();
    } else {
        for (index, sample) in samples.iter().enumerate() {
            match apply(&report.compiled, sample) {
                Ok(record) => {
                    summary.mapped += 1;
                    records.push(record);
                }
                Err(mut record_issues) => {
                    summary.failed += 1;
                    for issue in &mut record_issues {
                        issue.field = issue
                            .field
                            .take()
                            .map(|f| format!("records[{}].{}", index, f));
                    }
                    issues.extend(record_issues);
                }
            }
        }
    }

    PreviewReport {
        records,
        report: summary,
        issues,
        deterministic_hash: report.compiled.deterministic_hash.clone(),
        generated_at: Utc::now(),
    }
}

/// Map one record; returns the per-record issues on failure.
pub fn apply(compiled: &CompiledMapping, record: &Value) -> Result<Value, Vec<ValidationIssue>> {
    let mut output = Value::Object(Map::new());
    let mut issues = Vec::new();
    for rule in &compiled.rules {
        let value = lookup(record, &rule.source_path)
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| rule.default.clone());
        match value {
            Some(value) => match transform(value, rule.transform.as_deref()) {
                Some(value) => assign(&mut output, &rule.target_path, value),
                None => issues.push(ValidationIssue::error(
                    "transform_failed",
                    format!(
                        "transform '{}' failed for '{}'",
                        rule.transform.as_deref().unwrap_or_default(),
                        rule.source_path
                    ),
                    Some(rule.source_path.clone()),
                )),
            },
            None if rule.required => issues.push(ValidationIssue::error(
                "missing_required",
                format!("required field '{}' is missing", rule.source_path),
                Some(rule.source_path.clone()),
            )),
            None => {}
        }
    }
    if issues.is_empty() {
        Ok(output)
    } else {
        Err(issues)
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    for part in path.split('.') {
        let (key, rest) = part.split_once('[').map_or((part, ""), |(k, r)| (k, r));
        out.push(Segment::Key(key));
        for index in rest.split('[') {
            if let Ok(i) = index.trim_end_matches(']').parse() {
                out.push(Segment::Index(i));
            }
        }
    }
    out
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path)
        .into_iter()
        .try_fold(value, |current, segment| match segment {
            Segment::Key(key) => current.get(key),
            Segment::Index(i) => current.get(i),
        })
}

/// Set `path` in `target`, creating intermediate objects. Index segments
/// are treated as object keys on the output side.
fn assign(target: &mut Value, path: &str, value: Value) {
    let keys: Vec<String> = segments(path)
        .into_iter()
        .map(|s| match s {
            Segment::Key(k) => k.to_string(),
            Segment::Index(i) => i.to_string(),
        })
        .collect();
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut current = target;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

fn transform(value: Value, name: Option<&str>) -> Option<Value> {
    let as_text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match name {
        None => Some(value),
        Some("trim") => Some(Value::String(as_text(&value).trim().to_string())),
        Some("lowercase") => Some(Value::String(as_text(&value).to_lowercase())),
        Some("uppercase") => Some(Value::String(as_text(&value).to_uppercase())),
        Some("to_string") => Some(Value::String(as_text(&value))),
        Some("to_number") => match value {
            Value::Number(_) => Some(value),
            other => as_text(&other)
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
        },
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeRef;

    fn rule(source: &str, target: &str) -> MappingRule {
        MappingRule {
            source_path: source.into(),
            target_path: target.into(),
            transform: None,
            required: false,
            default: None,
        }
    }

    fn spec(rules: Vec<MappingRule>) -> MappingSpec {
        MappingSpec {
            id: String::new(),
            spec_id: "issues".into(),
            provider_id: "github".into(),
            scope: ScopeRef::org("o1"),
            name: "Issues".into(),
            description: String::new(),
            source_object: "issue".into(),
            target_model: "task".into(),
            schema_ref: "github.issue.v1".into(),
            version: 1,
            status: MappingStatus::Draft,
            rules,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            published_at: None,
        }
    }

    #[test]
    fn hash_ignores_rule_order_and_whitespace() {
        let a = compile(&spec(vec![rule("title", "name"), rule("user.login", "owner")]));
        let b = compile(&spec(vec![rule(" user.login ", "owner"), rule("title", "name ")]));
        assert!(a.issues.is_empty());
        assert_eq!(a.compiled.deterministic_hash, b.compiled.deterministic_hash);
        assert_eq!(a.compiled.rules[0].target_path, "name");
    }

    #[test]
    fn reports_invalid_paths_and_duplicates() {
        let mut bad = rule("labels[0].name", "tags");
        bad.transform = Some("explode".into());
        let report = compile(&spec(vec![bad, rule("9bad", "tags"), rule("", "x")]));
        let codes: Vec<_> = report.issues.iter().map(|i| i.code.as_str()).collect();
        assert!(codes.contains(&"invalid_path"));
        assert!(codes.contains(&"duplicate_target"));
        assert!(codes.contains(&"unknown_transform"));
        assert!(codes.contains(&"missing_path"));
        assert!(report.has_errors());
    }

    #[test]
    fn preview_maps_nested_fields() {
        let mut title = rule("title", "task.name");
        title.transform = Some("uppercase".into());
        let mut state = rule("state", "task.status");
        state.required = true;
        let report = compile(&spec(vec![title, state, rule("labels[1]", "task.tag")]));

        let preview = preview(
            &report,
            &[
                json!({"title": "fix", "state": "open", "labels": ["a", "b"]}),
                json!({"title": "missing state"}),
            ],
        );
        assert_eq!(preview.report.mapped, 1);
        assert_eq!(preview.report.failed, 1);
        assert_eq!(
            preview.records[0],
            json!({"task": {"name": "FIX", "status": "open", "tag": "b"}})
        );
        assert_eq!(preview.issues[0].code, "missing_required");
        assert_eq!(preview.issues[0].field.as_deref(), Some("records[1].state"));
    }
}
