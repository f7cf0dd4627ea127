//! Intervention rules and their evaluation order.
//!
//! Rules are data, not code: free-text terminal prompts from the controlled
//! program (setup questions, confirmation dialogs) are matched by pattern, so
//! new prompt text only requires a new rule. Evaluation is deterministic:
//! descending priority, ties broken by registration order, at most one firing
//! per evaluated chunk, and a per-rule cooldown window.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Corrective action attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleAction {
    /// Inject bytes into the session (e.g. answer a y/n prompt).
    Send { input: String },
    /// Send the interrupt control sequence.
    Interrupt,
    /// Force-terminate the session.
    Terminate,
}

/// On-disk rule representation (see `schemas/rules/v1.schema.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    /// Regex evaluated against the rolling output window.
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_cooldown_ms() -> u64 {
    5_000
}

/// A compiled rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct Rule {
    pub spec: RuleSpec,
    pub pattern: Regex,
}

impl Rule {
    pub fn compile(spec: RuleSpec) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&spec.pattern)?;
        Ok(Self { spec, pattern })
    }
}

/// Why a matching rule did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The rule's cooldown window has not elapsed.
    Cooldown,
    /// A higher-priority rule already fired for this chunk.
    LowerPriority,
}

/// A rule that matched the window during one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub matched: String,
}

/// Outcome of evaluating all rules against the current window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanDecision {
    /// The single firing for this chunk, if any.
    pub fired: Option<(RuleMatch, RuleAction)>,
    /// Matches that were recorded but not acted on.
    pub suppressed: Vec<(RuleMatch, SuppressReason)>,
}

/// Per-session rule evaluator with cooldown state.
///
/// Rules are stored in evaluation order (descending priority; stable sort
/// keeps registration order for ties). `last_fired_ms` is engine-owned
/// state; one engine per session, so the cooldown window is per session.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    last_fired_ms: HashMap<String, i64>,
}

impl RuleEngine {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.spec.priority));
        Self {
            rules,
            last_fired_ms: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the window at `now_ms`.
    ///
    /// The first rule (in evaluation order) whose pattern matches and whose
    /// cooldown has elapsed fires; every other match is suppressed. Firing
    /// records `now_ms` as the rule's last firing time.
    pub fn evaluate(&mut self, window: &str, now_ms: i64) -> ScanDecision {
        let mut decision = ScanDecision::default();
        for rule in &self.rules {
            let Some(found) = rule.pattern.find(window) else {
                continue;
            };
            let matched = RuleMatch {
                rule_id: rule.spec.id.clone(),
                matched: found.as_str().to_string(),
            };
            let cooling = self
                .last_fired_ms
                .get(&rule.spec.id)
                .is_some_and(|last| now_ms - last < rule.spec.cooldown_ms as i64);
            if cooling {
                decision.suppressed.push((matched, SuppressReason::Cooldown));
            } else if decision.fired.is_some() {
                decision
                    .suppressed
                    .push((matched, SuppressReason::LowerPriority));
            } else {
                self.last_fired_ms.insert(rule.spec.id.clone(), now_ms);
                decision.fired = Some((matched, rule.spec.action.clone()));
            }
        }
        decision
    }
}
