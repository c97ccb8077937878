//! Agreement validation.
//!
//! Evaluates a node's output against its agreement rules. Required-rule
//! failures gate node completion (agents regenerate with a correction
//! preamble); optional failures are informational.

use crate::workflow::AgreementRule;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Result for a single rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    pub name: String,
    pub kind: String,
    pub required: bool,
    pub passed: bool,
}

/// Aggregate validation report.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub results: Vec<RuleResult>,
    pub failed_required: Vec<String>,
}

impl ValidationReport {
    /// True when no required rule failed.
    pub fn passed(&self) -> bool {
        self.failed_required.is_empty()
    }
}

fn embedded_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)(\{.*\})|(\[.*\])").expect("embedded json pattern"))
}

/// Extract a JSON value embedded anywhere in `output`.
fn extract_json(output: &str) -> Option<Value> {
    if let Some(found) = embedded_json().find(output) {
        if let Ok(value) = serde_json::from_str(found.as_str()) {
            return Some(value);
        }
    }
    serde_json::from_str(output).ok()
}

/// Validate `output` against all rules.
pub fn validate(output: &str, rules: &[AgreementRule]) -> ValidationReport {
    let mut report = ValidationReport::default();
    for rule in rules {
        let passed = check_rule(output, rule);
        if !passed && rule.required {
            report.failed_required.push(rule.name.clone());
        }
        report.results.push(RuleResult {
            name: rule.name.clone(),
            kind: rule.kind.clone(),
            required: rule.required,
            passed,
        });
    }
    report
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn check_rule(output: &str, rule: &AgreementRule) -> bool {
    let output_lower = output.to_lowercase();
    match rule.kind.as_str() {
        "contains" => output_lower.contains(&value_as_string(&rule.value).to_lowercase()),
        "not_contains" => !output_lower.contains(&value_as_string(&rule.value).to_lowercase()),
        "min_words" => {
            let min = rule.value.as_u64().unwrap_or(0) as usize;
            output.split_whitespace().count() >= min
        }
        "max_words" => {
            let max = rule.value.as_u64().unwrap_or(u64::MAX) as usize;
            output.split_whitespace().count() <= max
        }
        "regex" => match Regex::new(&value_as_string(&rule.value)) {
            Ok(re) => re.is_match(output),
            Err(_) => false,
        },
        "json" => extract_json(output)
            .map(|v| v.is_object() || v.is_array())
            .unwrap_or(false),
        "schema" => {
            let Some(data) = extract_json(output) else {
                return false;
            };
            let Some(object) = data.as_object() else {
                return false;
            };
            match &rule.value {
                Value::Array(keys) => keys
                    .iter()
                    .filter_map(Value::as_str)
                    .all(|k| object.contains_key(k)),
                Value::Object(map) => map.keys().all(|k| object.contains_key(k)),
                _ => true,
            }
        }
        // Unknown rule kinds pass by default.
        _ => true,
    }
}
