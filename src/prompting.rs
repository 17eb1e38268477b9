use minijinja::{context, Environment};

const SUPPORT_AGENT_TEMPLATE: &str = include_str!("prompts/support_agent.j2");
const SEARCH_INTERPRETER_TEMPLATE: &str = include_str!("prompts/search_interpreter.j2");
const SEARCH_USER_TEMPLATE: &str = include_str!("prompts/search_user.j2");

pub const ENHANCE_RESPONSE_PROMPT: &str = "You are a helpful assistant that improves customer support responses to be more empathetic and solution-oriented but keeping the operator's text meaning.";

pub const IMAGE_EXTRACTION_PROMPT: &str = "You turn images into text. If it is a photo of a document, transcribe the text. If not, describe in detail.";
pub const PDF_EXTRACTION_PROMPT: &str = "You transform PDF documents into text.";
pub const HTML_EXTRACTION_PROMPT: &str = "You transform HTML documents into markdown.";

pub struct AgentInstructionsContext<'a> {
    pub organization_name: &'a str,
}

pub struct SearchUserContext<'a> {
    pub query: &'a str,
    pub context_text: &'a str,
}

pub(crate) fn render_template(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    env.get_template(name).ok()?.render(ctx).ok()
}

pub fn render_agent_instructions(ctx: &AgentInstructionsContext<'_>) -> String {
    render_template(
        "support_agent",
        SUPPORT_AGENT_TEMPLATE,
        context! { organization_name => ctx.organization_name.trim() },
    )
    .unwrap_or_else(|| {
        "You are a helpful customer support assistant. Help the user with their inquiries in a friendly and professional manner.".to_string()
    })
}

pub fn render_search_interpreter_prompt() -> String {
    render_template(
        "search_interpreter",
        SEARCH_INTERPRETER_TEMPLATE,
        context! {},
    )
    .unwrap_or_else(|| SEARCH_INTERPRETER_TEMPLATE.to_string())
}

pub fn render_search_user_prompt(ctx: &SearchUserContext<'_>) -> String {
    render_template(
        "search_user",
        SEARCH_USER_TEMPLATE,
        context! { query => ctx.query, context_text => ctx.context_text },
    )
    .unwrap_or_else(|| {
        format!(
            "User asked: \"{}\"\n\nSearch results:{}",
            ctx.query, ctx.context_text
        )
    })
}

pub fn text_extraction_instruction(mime_type: &str) -> String {
    format!("Extract all the text from this {mime_type} document and convert it to markdown.")
}
