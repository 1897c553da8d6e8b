//! Markdown artifacts rendered from the templates under `templates/`.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

const AGENT_CONTEXT_TEMPLATE: &str = include_str!("../../templates/agent_context.md");
const CAPSULE_TEMPLATE: &str = include_str!("../../templates/capsule.md");
const PR_BODY_TEMPLATE: &str = include_str!("../../templates/pr_body.md");
const VALIDATION_TEMPLATE: &str = include_str!("../../templates/validation.md");

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("agent_context", AGENT_CONTEXT_TEMPLATE)
        .expect("agent context template should be valid");
    env.add_template("capsule", CAPSULE_TEMPLATE)
        .expect("capsule template should be valid");
    env.add_template("pr_body", PR_BODY_TEMPLATE)
        .expect("pr body template should be valid");
    env.add_template("validation", VALIDATION_TEMPLATE)
        .expect("validation template should be valid");
    env
});

/// Render template `name` with `ctx`. Output is not redacted; callers write it
/// through a redacting writer.
pub fn render<S: Serialize>(name: &str, ctx: S) -> Result<String> {
    let template = TEMPLATES
        .get_template(name)
        .with_context(|| format!("load template {name}"))?;
    template
        .render(ctx)
        .with_context(|| format!("render template {name}"))
}
