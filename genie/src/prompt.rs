use crate::demonstrations::DemonstrationBank;
use crate::request::{GenerationRequest, RequestError};
use minijinja::{context, Environment};
use thiserror::Error;

#[allow(unused_imports)]
use tracing::{info, debug};

const TEMPLATE_KEY: &str = "story_prompt";

// Gemma instruct turns, preceded by one worked example
const PROMPT_TEMPLATE: &str = "{{ bos_token }}\n<EXAMPLE_START>\n{{ demonstration }}\n<EXAMPLE_END>\n\n\
<start_of_turn>user\n**INSTRUCTIONS:** {{ instructions }}\n**STORY IDEA:** {{ idea }}<end_of_turn>\n\
<start_of_turn>model\n";

pub const BOS_TOKEN: &str = "<bos>";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("failed to render prompt template: {0}")]
    Template(#[from] minijinja::Error),
}

/// Turns a request into the text handed to the model.
pub trait PromptBuilder: Send + Sync {
    fn compose(&self, request: &GenerationRequest) -> Result<String, PromptError>;
}

pub struct PromptComposer {
    bank: DemonstrationBank,
    env: Environment<'static>,
}

impl std::fmt::Debug for PromptComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptComposer").field("bank", &self.bank).finish()
    }
}

impl PromptComposer {
    pub fn new(bank: DemonstrationBank) -> Result<Self, PromptError> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template(TEMPLATE_KEY, PROMPT_TEMPLATE)?;
        Ok(PromptComposer { bank, env })
    }
}

impl PromptBuilder for PromptComposer {
    fn compose(&self, request: &GenerationRequest) -> Result<String, PromptError> {
        request.validate()?;

        let demonstration = self.bank.select(&request.language, request.genre);
        debug!(demonstration = demonstration.key, "Selected few-shot demonstration");

        let template = self.env.get_template(TEMPLATE_KEY)?;
        let rendered = template.render(context! {
            bos_token => BOS_TOKEN,
            demonstration => demonstration.transcript,
            instructions => instructions(request),
            idea => story_idea(request),
        })?;

        Ok(rendered)
    }
}

fn instructions(request: &GenerationRequest) -> String {
    format!(
        "You are a professional author and master storyteller. Your task is to write {} \
         in the **{}** genre, strictly maintaining a **{}** tone. \
         The final story must be entirely in **{}**. \
         Do not include any titles, introductory phrases, or concluding remarks like 'The End'. \
         Begin immediately with the story's first sentence.",
        request.length.phrase(),
        request.genre.as_str().to_uppercase(),
        title_case(&request.tone().as_str().replace('_', " ")),
        request.language.display_name(),
    )
}

fn story_idea(request: &GenerationRequest) -> String {
    let mut idea = format!("Write the story based on this central plot idea: '{}'", request.prompt);

    if let Some(characters) = request.characters.as_ref().filter(|c| !c.is_empty()) {
        idea.push_str(&format!("\n- Main Characters: {}", characters.join(", ")));
    }
    if let Some(setting) = request.setting.as_deref().filter(|s| !s.is_empty()) {
        idea.push_str(&format!("\n- Setting: {}", setting));
    }

    idea
}

/// Uppercases the first letter of every alphabetic run and lowercases the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}
