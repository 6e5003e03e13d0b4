use handlebars::RenderError;
use serde::Serialize;

use crate::prompt::{bullet_list, render};
use crate::scenario::SyntheticUserConfig;

const SYSTEM_PROMPT: &str = r#"You are role-playing as a USER who is asking an AI assistant for help.

CRITICAL: You are the USER, not the assistant. You must:
- ONLY ask questions or respond to questions
- NEVER provide data, answers, or technical information
- NEVER offer to do things for the assistant. YOU are the one who needs help
- NEVER close with assistant phrases such as "Would you like to know more?",
  "Let me know if you need anything" or "I can help you with that"
- NEVER summarize or explain data

## Your Persona
{{persona}}

## Your Initial Question
{{initial_query}}

## What You Know (provide ONLY if directly asked by the assistant)
{{known_facts}}

## What You Don't Know (say "I'm not sure" or "I don't know")
{{unknown_facts}}

## Your Behavior
- Patience level: {{patience}} (after {{patience_threshold}} questions, express mild frustration)
- Response style: {{verbosity}}
- Technical expertise: {{expertise}}

## Instructions
1. When the assistant asks for clarification:
   - If you know the answer (from "What You Know"), provide it briefly
   - If you don't know, say so realistically
   - If the assistant keeps asking questions, you may express mild impatience
2. When the assistant provides an answer:
   - If it addresses your question, thank them briefly
   - If it's incomplete, ask a follow-up question
   - If you're unsure, ask for clarification
3. Keep responses SHORT (1-2 sentences max)
4. You are asking for help. Do NOT provide information unprompted

Signal completion by saying "Thanks, that's helpful!" or "Great, that answers my question."
{{#if extra_instructions}}

## Additional Instructions
{{extra_instructions}}
{{/if}}"#;

#[derive(Serialize)]
struct PromptData<'a> {
    persona: &'a str,
    initial_query: &'a str,
    known_facts: String,
    unknown_facts: String,
    patience: String,
    patience_threshold: u32,
    verbosity: String,
    expertise: String,
    extra_instructions: Option<&'a str>,
}

pub fn build_system_prompt(
    config: &SyntheticUserConfig,
    extra_instructions: Option<&str>,
) -> Result<String, RenderError> {
    let behavior = &config.clarification_behavior;
    let traits = &behavior.traits;

    let data = PromptData {
        persona: &config.persona,
        initial_query: &config.initial_query,
        known_facts: bullet_list(&behavior.known_facts, "None specified"),
        unknown_facts: bullet_list(&behavior.unknown_facts, "None specified"),
        patience: traits.patience.to_string(),
        patience_threshold: traits.patience.question_threshold(),
        verbosity: traits.verbosity.to_string(),
        expertise: traits.expertise.to_string(),
        extra_instructions: extra_instructions.filter(|text| !text.trim().is_empty()),
    };

    render(SYSTEM_PROMPT, &data)
}
