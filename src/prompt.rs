//! Handlebars rendering for the simulated user and judge prompts.

use handlebars::{no_escape, Handlebars, RenderError};
use once_cell::sync::Lazy;
use serde::Serialize;

// Prompts are plain text, so HTML escaping is off.
static PROMPTS: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(no_escape);
    registry
});

pub fn render<T: Serialize>(template: &str, data: &T) -> Result<String, RenderError> {
    PROMPTS.render_template(template, data)
}

/// `- item` lines, or `empty` when there is nothing to list.
pub fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_without_html_escaping() {
        let text = render("Q: {{query}}", &json!({"query": "is 5 < 6 & \"true\"?"})).unwrap();
        assert_eq!(text, "Q: is 5 < 6 & \"true\"?");
    }

    #[test]
    fn bullet_list_falls_back_when_empty() {
        assert_eq!(bullet_list(&[], "None specified"), "None specified");
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(bullet_list(&items, "x"), "- a\n- b");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exact", 5), "exact");
    }
}
