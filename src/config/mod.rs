//! ai-toolkit job file
//!
//! Typed mirror of the YAML document the external trainer consumes. Field
//! names follow the trainer's keys exactly; optional keys are omitted from the
//! output when unset.

pub mod builder;

pub use builder::{build_job_config, BuildContext, MemoryDecision, LOW_MEMORY_THRESHOLD_BYTES};

use crate::error::{IoContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigData {
    pub name: String,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    #[serde(rename = "type")]
    pub process_type: String,
    pub training_folder: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_word: Option<String>,
    pub network: NetworkConfig,
    pub save: SaveConfig,
    pub datasets: Vec<DatasetConfig>,
    pub train: TrainConfig,
    pub model: ModelConfig,
    pub sample: SampleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub type_: String,
    pub linear: usize,
    pub linear_alpha: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_kwargs: Option<NetworkKwargs>,
}

/// Extra network construction arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkKwargs {
    /// LoRA file used to initialize the network instead of random weights
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretrained_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_if_contains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveConfig {
    pub dtype: String,
    pub save_every: usize,
    pub max_step_saves_to_keep: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetConfig {
    pub folder_path: String,
    pub caption_ext: String,
    pub caption_dropout_rate: f32,
    pub shuffle_tokens: bool,
    pub cache_latents_to_disk: bool,
    pub cache_latents: bool,
    pub resolution: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub steps: usize,
    pub gradient_accumulation_steps: usize,
    pub train_unet: bool,
    pub train_text_encoder: bool,
    pub content_or_style: String,
    pub gradient_checkpointing: bool,
    pub noise_scheduler: String,
    pub optimizer: String,
    pub lr: f64,
    pub ema_config: EmaConfig,
    pub dtype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmaConfig {
    pub use_ema: bool,
    pub ema_decay: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub name_or_path: String,
    pub is_flux: bool,
    pub quantize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleConfig {
    pub sampler: String,
    pub sample_every: usize,
    pub width: usize,
    pub height: usize,
    pub prompts: Vec<String>,
    pub neg: String,
    pub seed: u64,
    pub walk_seed: bool,
    pub guidance_scale: f32,
    pub sample_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaConfig {
    pub name: String,
    pub version: String,
}

impl Config {
    /// The single trainer process of the job
    pub fn process(&self) -> &ProcessConfig {
        &self.config.process[0]
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        fs::write(path, self.to_yaml()?).at(path)
    }
}

/// Read back a job file written by [`Config::save`]
#[cfg(test)]
pub(crate) fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path).at(path)?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    Ok(config)
}
