//! Model card generation
//!
//! Templates use `$name` / `${name}` placeholders and `$$` for a literal
//! dollar sign. Every placeholder must be known; a typo in the template fails
//! the run instead of shipping a half-rendered card.

use crate::error::{IoContext, Result, TrainError};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const DEFAULT_TEMPLATE: &str = include_str!("../templates/hugging-face-readme-template.md");

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:(\$)|([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\})")
        .expect("placeholder pattern is valid")
});

/// Values describing the trained LoRA
#[derive(Debug, Clone)]
pub struct ModelCard<'a> {
    pub repo_id: Option<&'a str>,
    pub job_name: &'a str,
    pub trigger_word: Option<&'a str>,
    pub steps: usize,
    pub learning_rate: f64,
    pub lora_rank: usize,
    pub pretrained_lora_url: Option<&'a str>,
}

/// "user/my-cool-lora" becomes "My Cool Lora"
pub fn title_from_repo_id(repo_id: &str) -> String {
    match repo_id.split('/').nth(1) {
        Some(name) => name
            .replace('-', " ")
            .split(' ')
            .map(title_case_word)
            .collect::<Vec<_>>()
            .join(" "),
        None => repo_id.to_string(),
    }
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

impl ModelCard<'_> {
    pub fn variables(&self) -> HashMap<&'static str, String> {
        let training_mode = if self.pretrained_lora_url.is_some() {
            "Fine-tuned from pre-trained LoRA"
        } else {
            "Trained from scratch"
        };

        let mut details = format!(
            "- Training mode: {}\n- Steps: {}\n- Learning rate: {}\n- LoRA rank: {}",
            training_mode, self.steps, self.learning_rate, self.lora_rank
        );
        if let Some(url) = self.pretrained_lora_url {
            details.push_str(&format!("\n- Pre-trained LoRA source: {}", url));
        }

        let repo_id = self.repo_id.unwrap_or(self.job_name);
        let trigger = self.trigger_word.unwrap_or_default();

        let mut vars = HashMap::new();
        vars.insert("repo_id", repo_id.to_string());
        vars.insert("title", title_from_repo_id(repo_id));
        vars.insert("trigger_word", trigger.to_string());
        vars.insert(
            "trigger_section",
            if trigger.is_empty() {
                String::new()
            } else {
                format!(
                    "\n## Trigger words\n\nYou should use `{}` to trigger the image generation.\n",
                    trigger
                )
            },
        );
        vars.insert(
            "instance_prompt",
            if trigger.is_empty() {
                String::new()
            } else {
                format!("instance_prompt: {}", trigger)
            },
        );
        vars.insert("training_details", format!("\n## Training details\n\n{}\n", details));
        vars
    }
}

/// Substitute every placeholder in `template`
pub fn render_template(template: &str, vars: &HashMap<&'static str, String>) -> Result<String> {
    let mut unknown = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }
        let name = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                unknown.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    if let Some(name) = unknown {
        return Err(TrainError::runtime(format!(
            "README template references unknown placeholder ${}",
            name
        )));
    }
    Ok(rendered.into_owned())
}

/// Render the model card into `dest`, reading the template from `template_path` when present
pub fn write_readme(card: &ModelCard<'_>, template_path: &Path, dest: &Path) -> Result<()> {
    let template = if template_path.exists() {
        fs::read_to_string(template_path).at(template_path)?
    } else {
        warn!(
            "README template {} not found, using built-in template",
            template_path.display()
        );
        DEFAULT_TEMPLATE.to_string()
    };

    let rendered = render_template(&template, &card.variables())?;
    fs::write(dest, rendered).at(dest)?;
    info!("Wrote model card to {}", dest.display());
    Ok(())
}
