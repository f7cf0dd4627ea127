//! Child-prompt builder for decomposition.
//!
//! When a submitted task fans out, each child receives a prompt rendered from
//! a bundled template rather than ad-hoc string concatenation, so the wording
//! can evolve without touching decomposition control flow.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::task::DecompositionPattern;

const SUBTASK_TEMPLATE: &str = include_str!("prompts/subtask.md");
const FOLLOWUP_TEMPLATE: &str = include_str!("prompts/followup.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("subtask", SUBTASK_TEMPLATE)
            .expect("subtask template should be valid");
        env.add_template("followup", FOLLOWUP_TEMPLATE)
            .expect("followup template should be valid");
        Self { env }
    }

    /// Render the prompt for child `index` (1-based) of a decomposition.
    pub fn render_child(
        &self,
        pattern: DecompositionPattern,
        parent_prompt: &str,
        index: u32,
        fan_out: u32,
        max_depth_reached: bool,
        previous_summary: Option<&str>,
    ) -> Result<String> {
        let name = match pattern {
            DecompositionPattern::Sequential => "followup",
            _ => "subtask",
        };
        let template = self.env.get_template(name)?;
        let rendered = template.render(context! {
            parent_prompt => parent_prompt.trim(),
            index => index,
            fan_out => fan_out,
            max_depth_reached => max_depth_reached,
            previous_summary => previous_summary.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Labels for the decomposition actions a task has not tried yet.
    pub fn untried_actions(pattern: DecompositionPattern, fan_out: u32) -> Vec<String> {
        match pattern {
            DecompositionPattern::None => Vec::new(),
            _ => (1..=fan_out)
                .map(|i| format!("{}:{i}", pattern_name(pattern)))
                .collect(),
        }
    }
}

fn pattern_name(pattern: DecompositionPattern) -> &'static str {
    match pattern {
        DecompositionPattern::None => "none",
        DecompositionPattern::Decompose => "decompose",
        DecompositionPattern::Parallel => "parallel",
        DecompositionPattern::Sequential => "sequential",
        DecompositionPattern::Recursive => "recursive",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_prompt_names_part_and_goal() {
        let engine = PromptEngine::new();
        let rendered = engine
            .render_child(
                DecompositionPattern::Parallel,
                "create calculator",
                2,
                3,
                false,
                None,
            )
            .expect("render");
        assert!(rendered.contains("Subtask 2 of 3"));
        assert!(rendered.contains("create calculator"));
        assert!(!rendered.contains("Do not split"));
    }

    #[test]
    fn max_depth_disables_further_splitting() {
        let engine = PromptEngine::new();
        let rendered = engine
            .render_child(
                DecompositionPattern::Recursive,
                "create calculator",
                1,
                2,
                true,
                None,
            )
            .expect("render");
        assert!(rendered.contains("Do not split"));
    }

    #[test]
    fn sequential_children_see_previous_summary() {
        let engine = PromptEngine::new();
        let rendered = engine
            .render_child(
                DecompositionPattern::Sequential,
                "create calculator",
                2,
                2,
                false,
                Some("step 1 wrote calc.py"),
            )
            .expect("render");
        assert!(rendered.contains("step 1 wrote calc.py"));
        assert!(rendered.contains("Step 2 of 2"));
    }

    #[test]
    fn untried_actions_match_fan_out() {
        let actions = PromptEngine::untried_actions(DecompositionPattern::Decompose, 3);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], "decompose:1");
        assert!(PromptEngine::untried_actions(DecompositionPattern::None, 3).is_empty());
    }
}
