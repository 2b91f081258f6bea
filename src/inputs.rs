//! User-facing parameters of a single training run

use crate::error::{Result, TrainError};
use std::path::PathBuf;

pub const SUPPORTED_OPTIMIZERS: &[&str] = &[
    "prodigy",
    "adam8bit",
    "adamw8bit",
    "lion8bit",
    "adam",
    "adamw",
    "lion",
    "adagrad",
    "adafactor",
];

pub const MIN_STEPS: usize = 3;
pub const MAX_STEPS: usize = 6000;
pub const MAX_LORA_RANK: usize = 128;

/// Scalar parameters supplied by the caller for one run
#[derive(Debug, Clone)]
pub struct TrainingInputs {
    pub input_images: Option<PathBuf>,
    pub trigger_word: String,
    pub autocaption: bool,
    pub autocaption_prefix: Option<String>,
    pub autocaption_suffix: Option<String>,
    pub steps: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub resolution: String,
    pub lora_rank: usize,
    pub caption_dropout_rate: f32,
    pub optimizer: String,
    pub cache_latents_to_disk: bool,
    pub layers_to_optimize_regex: Option<String>,
    pub gradient_checkpointing: bool,
    pub hf_repo_id: Option<String>,
    pub hf_token: Option<String>,
    pub tracking_api_key: Option<String>,
    pub tracking_project: Option<String>,
    pub tracking_run: Option<String>,
    pub tracking_entity: Option<String>,
    pub tracking_sample_interval: usize,
    pub tracking_sample_prompts: Option<String>,
    pub tracking_save_interval: usize,
    pub skip_training_and_use_pretrained_hf_lora_url: Option<String>,
    pub pretrained_lora_url: Option<String>,
    pub keep_optimizer_for_resume: bool,
}

impl Default for TrainingInputs {
    fn default() -> Self {
        Self {
            input_images: None,
            trigger_word: "TOK".to_string(),
            autocaption: true,
            autocaption_prefix: None,
            autocaption_suffix: None,
            steps: 1000,
            learning_rate: 4e-4,
            batch_size: 1,
            resolution: "512,768,1024".to_string(),
            lora_rank: 16,
            caption_dropout_rate: 0.05,
            optimizer: "adamw8bit".to_string(),
            cache_latents_to_disk: false,
            layers_to_optimize_regex: None,
            gradient_checkpointing: false,
            hf_repo_id: None,
            hf_token: None,
            tracking_api_key: None,
            tracking_project: None,
            tracking_run: None,
            tracking_entity: None,
            tracking_sample_interval: 100,
            tracking_sample_prompts: None,
            tracking_save_interval: 100,
            skip_training_and_use_pretrained_hf_lora_url: None,
            pretrained_lora_url: None,
            keep_optimizer_for_resume: false,
        }
    }
}

impl TrainingInputs {
    /// Check every parameter before anything touches the filesystem or network.
    ///
    /// The pretrained/skip conflict is checked first so it fails before any
    /// download regardless of which mode would otherwise run.
    pub fn validate(&self) -> Result<()> {
        if self.pretrained_lora_url.is_some()
            && self.skip_training_and_use_pretrained_hf_lora_url.is_some()
        {
            return Err(TrainError::invalid(
                "pretrained_lora_url and skip_training_and_use_pretrained_hf_lora_url cannot be used together",
            ));
        }

        if self.is_skip_training() {
            return Ok(());
        }

        if self.input_images.is_none() {
            return Err(TrainError::invalid("input_images must be provided"));
        }
        if !(MIN_STEPS..=MAX_STEPS).contains(&self.steps) {
            return Err(TrainError::invalid(format!(
                "steps must be between {} and {}, got {}",
                MIN_STEPS, MAX_STEPS, self.steps
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(TrainError::invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(TrainError::invalid("batch_size must be at least 1"));
        }
        if !(1..=MAX_LORA_RANK).contains(&self.lora_rank) {
            return Err(TrainError::invalid(format!(
                "lora_rank must be between 1 and {}, got {}",
                MAX_LORA_RANK, self.lora_rank
            )));
        }
        if !(0.0..=1.0).contains(&self.caption_dropout_rate) {
            return Err(TrainError::invalid(format!(
                "caption_dropout_rate must be between 0 and 1, got {}",
                self.caption_dropout_rate
            )));
        }
        if !SUPPORTED_OPTIMIZERS.contains(&self.optimizer.as_str()) {
            return Err(TrainError::invalid(format!(
                "Unsupported optimizer '{}'. Supports: {}",
                self.optimizer,
                SUPPORTED_OPTIMIZERS.join(", ")
            )));
        }
        if self.tracking_sample_interval == 0 || self.tracking_save_interval == 0 {
            return Err(TrainError::invalid(
                "tracking sample and save intervals must be at least 1",
            ));
        }
        self.resolutions()?;

        Ok(())
    }

    pub fn is_skip_training(&self) -> bool {
        self.skip_training_and_use_pretrained_hf_lora_url.is_some()
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_api_key.is_some()
    }

    pub fn resolutions(&self) -> Result<Vec<usize>> {
        parse_resolutions(&self.resolution)
    }

    pub fn sample_prompts(&self) -> Vec<String> {
        self.tracking_sample_prompts
            .as_deref()
            .map(parse_sample_prompts)
            .unwrap_or_default()
    }

    /// Trigger word, or `None` when the caller cleared it. Only the empty
    /// string clears it; whitespace is passed through as given.
    pub fn trigger(&self) -> Option<&str> {
        (!self.trigger_word.is_empty()).then_some(self.trigger_word.as_str())
    }
}

pub fn parse_resolutions(resolution: &str) -> Result<Vec<usize>> {
    let resolutions = resolution
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .ok()
                .filter(|&res| res > 0)
                .ok_or_else(|| {
                    TrainError::invalid(format!(
                        "Invalid resolution '{}': expected comma separated positive integers",
                        resolution
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(resolutions)
}

pub fn parse_sample_prompts(prompts: &str) -> Vec<String> {
    prompts
        .lines()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn training_inputs() -> TrainingInputs {
        TrainingInputs {
            input_images: Some(PathBuf::from("images.zip")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let inputs = training_inputs();
        inputs.validate().unwrap();
        assert_eq!(inputs.resolutions().unwrap(), vec![512, 768, 1024]);
        assert_eq!(inputs.trigger(), Some("TOK"));
        assert!(inputs.pretrained_lora_url.is_none());
        assert!(!inputs.keep_optimizer_for_resume);
    }

    #[test]
    fn test_conflicting_urls_rejected_first() {
        // No input images either, but the conflict is what gets reported
        let inputs = TrainingInputs {
            pretrained_lora_url: Some("https://huggingface.co/a/b/resolve/main/lora.safetensors".into()),
            skip_training_and_use_pretrained_hf_lora_url: Some(
                "https://huggingface.co/c/d/resolve/main/lora.safetensors".into(),
            ),
            ..Default::default()
        };
        let err = inputs.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("cannot be used together"));
    }

    #[test]
    fn test_missing_images() {
        let err = TrainingInputs::default().validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "input_images must be provided");
    }

    #[test]
    fn test_skip_mode_needs_no_images() {
        let inputs = TrainingInputs {
            skip_training_and_use_pretrained_hf_lora_url: Some("anything".into()),
            ..Default::default()
        };
        inputs.validate().unwrap();
    }

    #[test]
    fn test_range_checks() {
        let cases = [
            TrainingInputs { steps: 2, ..training_inputs() },
            TrainingInputs { steps: 6001, ..training_inputs() },
            TrainingInputs { lora_rank: 0, ..training_inputs() },
            TrainingInputs { lora_rank: 129, ..training_inputs() },
            TrainingInputs { caption_dropout_rate: 1.5, ..training_inputs() },
            TrainingInputs { batch_size: 0, ..training_inputs() },
            TrainingInputs { learning_rate: 0.0, ..training_inputs() },
            TrainingInputs { optimizer: "sgd".into(), ..training_inputs() },
            TrainingInputs { tracking_save_interval: 0, ..training_inputs() },
            TrainingInputs { resolution: "512,abc".into(), ..training_inputs() },
        ];
        for inputs in cases {
            let err = inputs.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{:?}", inputs);
        }
    }

    #[test]
    fn test_sample_prompts_trimmed() {
        let inputs = TrainingInputs {
            tracking_sample_prompts: Some("  a photo of TOK \n\nTOK on a beach\n".into()),
            ..training_inputs()
        };
        assert_eq!(inputs.sample_prompts(), vec!["a photo of TOK", "TOK on a beach"]);
    }

    #[test]
    fn test_empty_trigger() {
        let inputs = TrainingInputs { trigger_word: String::new(), ..training_inputs() };
        assert_eq!(inputs.trigger(), None);

        let spaced = TrainingInputs { trigger_word: " TOK ".into(), ..training_inputs() };
        assert_eq!(spaced.trigger(), Some(" TOK "));
        let blank = TrainingInputs { trigger_word: "  ".into(), ..training_inputs() };
        assert_eq!(blank.trigger(), Some("  "));
    }
}
