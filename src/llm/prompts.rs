use crate::llm::LlmError;
use minijinja::{Environment, Value};
use std::sync::LazyLock;
use tracing::debug;

pub const CLASSIFY: &str = "classify.txt";
pub const ELICIT_INPUTS: &str = "elicit_inputs.txt";
pub const GENERATE_SQL: &str = "generate_sql.txt";
pub const EXPLAIN_QUERY: &str = "explain_query.txt";
pub const VALIDATE_RESULT: &str = "validate_result.txt";
pub const EXPLAIN_ERROR: &str = "explain_error.txt";
pub const IDENTIFY_ENTITIES: &str = "identify_entities.txt";

static PROMPTS: LazyLock<Environment<'static>> = LazyLock::new(init_prompts);

fn init_prompts() -> Environment<'static> {
    let mut env = Environment::new();

    // .txt names keep autoescape off
    for (name, source) in [
        (CLASSIFY, include_str!("../../templates/prompts/classify.txt")),
        (ELICIT_INPUTS, include_str!("../../templates/prompts/elicit_inputs.txt")),
        (GENERATE_SQL, include_str!("../../templates/prompts/generate_sql.txt")),
        (EXPLAIN_QUERY, include_str!("../../templates/prompts/explain_query.txt")),
        (VALIDATE_RESULT, include_str!("../../templates/prompts/validate_result.txt")),
        (EXPLAIN_ERROR, include_str!("../../templates/prompts/explain_error.txt")),
        (IDENTIFY_ENTITIES, include_str!("../../templates/prompts/identify_entities.txt")),
    ] {
        env.add_template(name, source)
            .expect("Failed to add prompt template");
    }

    env
}

pub fn render(name: &str, ctx: Value) -> Result<String, LlmError> {
    let prompt = PROMPTS
        .get_template(name)
        .and_then(|tmpl| tmpl.render(ctx))
        .map_err(|e| LlmError::PromptError(format!("{name}: {e}")))?;
    debug!("Rendered prompt {}:\n{}", name, prompt);
    Ok(prompt)
}
