//! Rule set load/save helpers with schema validation.
//!
//! Rules live in `.overseer/rules.json` so operators can add a new prompt
//! pattern without touching code. The document is validated against the
//! bundled v1 schema, then each pattern is compiled; a rule that fails to
//! compile fails the load (bad patterns must not silently disappear).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::rules::{Rule, RuleSpec};

pub const RULES_SCHEMA: &str = include_str!("../../schemas/rules/v1.schema.json");

/// Load and validate a rule set from disk (schema + pattern compilation).
///
/// A missing file yields an empty rule set: interventions are opt-in.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read rules {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse rules {}", path.display()))?;
    validate_schema(&value)?;
    let specs: Vec<RuleSpec> = serde_json::from_value(value)
        .with_context(|| format!("deserialize rules {}", path.display()))?;
    compile_rules(specs)
}

/// Write a rule set to disk with stable formatting.
pub fn write_rules(path: &Path, specs: &[RuleSpec]) -> Result<()> {
    let value = serde_json::to_value(specs).context("serialize rules")?;
    validate_schema(&value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create rules dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(&value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write rules {}", path.display()))
}

/// Compile specs, reporting every bad pattern and duplicate id at once.
pub fn compile_rules(specs: Vec<RuleSpec>) -> Result<Vec<Rule>> {
    let mut errors = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut rules = Vec::with_capacity(specs.len());
    for spec in specs {
        if !seen.insert(spec.id.clone()) {
            errors.push(format!("duplicate rule id '{}'", spec.id));
            continue;
        }
        let id = spec.id.clone();
        match Rule::compile(spec) {
            Ok(rule) => rules.push(rule),
            Err(err) => errors.push(format!("rule '{id}': invalid pattern: {err}")),
        }
    }
    if errors.is_empty() {
        Ok(rules)
    } else {
        Err(anyhow!("rule set invalid: {}", errors.join("; ")))
    }
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(RULES_SCHEMA).context("parse bundled rules schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "rules schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
