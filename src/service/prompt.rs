//! Prompt construction.

/// Template used when a request does not bring its own.
pub const DEFAULT_TEMPLATE: &str = "Question: {question}\n\nAnswer:";

/// Render `template` (or [`DEFAULT_TEMPLATE`]) with the question substituted
/// for every `{question}` placeholder. Other braces are left untouched.
pub fn build_prompt(template: Option<&str>, question: &str) -> String {
    template
        .unwrap_or(DEFAULT_TEMPLATE)
        .replace("{question}", question)
}
