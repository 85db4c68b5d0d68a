//! Prompt rendering for each agent role.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};

const IMPLEMENTATION_TEMPLATE: &str = include_str!("prompts/implementation.md");
const VALIDATION_TEMPLATE: &str = include_str!("prompts/validation.md");
const CROSS_VALIDATION_TEMPLATE: &str = include_str!("prompts/cross_validation.md");
const TASKS_VALIDATION_TEMPLATE: &str = include_str!("prompts/tasks_validation.md");
const FINAL_PLAN_TEMPLATE: &str = include_str!("prompts/final_plan.md");

/// Inputs for the implementation prompt.
#[derive(Debug, Clone, Default)]
pub struct ImplementationInputs<'a> {
    pub iteration: u32,
    pub feedback: Option<&'a str>,
    /// Set when learnings are enabled.
    pub learnings_file: Option<&'a Path>,
    /// Current contents of the learnings file.
    pub learnings: Option<&'a str>,
}

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
        for (name, source) in [
            ("implementation", IMPLEMENTATION_TEMPLATE),
            ("validation", VALIDATION_TEMPLATE),
            ("cross_validation", CROSS_VALIDATION_TEMPLATE),
            ("tasks_validation", TASKS_VALIDATION_TEMPLATE),
            ("final_plan", FINAL_PLAN_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled prompt templates should be valid");
        }
        Self { env }
    }

    pub fn implementation(&self, tasks_file: &Path, input: &ImplementationInputs<'_>) -> Result<String> {
        let template = self.env.get_template("implementation")?;
        Ok(template.render(context! {
            tasks_file => tasks_file.display().to_string(),
            iteration => input.iteration,
            feedback => non_empty(input.feedback),
            learnings_enabled => input.learnings_file.is_some(),
            learnings_file => input.learnings_file.map(|p| p.display().to_string()),
            learnings => non_empty(input.learnings),
        })?)
    }

    pub fn validation(&self, tasks_file: &Path, iteration: u32, implementation_output: &Path) -> Result<String> {
        let template = self.env.get_template("validation")?;
        Ok(template.render(context! {
            tasks_file => tasks_file.display().to_string(),
            iteration => iteration,
            implementation_output => implementation_output.display().to_string(),
        })?)
    }

    pub fn cross_validation(
        &self,
        tasks_file: &Path,
        implementation_output: &Path,
        validation_output: &Path,
    ) -> Result<String> {
        let template = self.env.get_template("cross_validation")?;
        Ok(template.render(context! {
            tasks_file => tasks_file.display().to_string(),
            implementation_output => implementation_output.display().to_string(),
            validation_output => validation_output.display().to_string(),
        })?)
    }

    pub fn tasks_validation(&self, tasks_file: &Path, plan_file: &Path) -> Result<String> {
        let template = self.env.get_template("tasks_validation")?;
        Ok(template.render(context! {
            tasks_file => tasks_file.display().to_string(),
            plan_file => plan_file.display().to_string(),
        })?)
    }

    pub fn final_plan(&self, tasks_file: &Path, plan_file: &Path) -> Result<String> {
        let template = self.env.get_template("final_plan")?;
        Ok(template.render(context! {
            tasks_file => tasks_file.display().to_string(),
            plan_file => plan_file.display().to_string(),
        })?)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
