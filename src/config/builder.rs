//! Assemble the trainer job file from run parameters

use super::{
    Config, ConfigData, DatasetConfig, EmaConfig, MetaConfig, ModelConfig, NetworkConfig,
    NetworkKwargs, ProcessConfig, SampleConfig, SaveConfig, TrainConfig,
};
use crate::error::Result;
use crate::inputs::TrainingInputs;
use crate::settings::Settings;
use log::info;
use std::path::PathBuf;

/// GPUs below this total memory train with checkpointing and a quantized base model
pub const LOW_MEMORY_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024 * 1024;

const HIGH_RESOLUTION_THRESHOLD: usize = 1024;

/// Facts gathered at run time that the builder cannot derive from inputs
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Total memory of the training GPU, `None` when it could not be detected
    pub gpu_memory_bytes: Option<u64>,
    pub pretrained_lora_path: Option<PathBuf>,
    pub layers_to_optimize: Option<Vec<String>>,
}

/// Why memory-saving mode ended up the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryDecision {
    Requested,
    LowGpuMemory,
    LargeBatch,
    HighResolution,
    NotNeeded,
}

impl MemoryDecision {
    pub fn gradient_checkpointing(&self) -> bool {
        !matches!(self, MemoryDecision::NotNeeded)
    }

    pub fn quantize(&self) -> bool {
        matches!(self, MemoryDecision::LowGpuMemory)
    }
}

pub fn decide_memory_mode(
    requested: bool,
    gpu_memory_bytes: Option<u64>,
    batch_size: usize,
    resolutions: &[usize],
) -> MemoryDecision {
    if requested {
        return MemoryDecision::Requested;
    }

    let low_memory = gpu_memory_bytes.map_or(true, |bytes| bytes < LOW_MEMORY_THRESHOLD_BYTES);
    if low_memory {
        info!("Turning gradient checkpointing on and quantizing base model, GPU has less than 100 GB of memory");
        MemoryDecision::LowGpuMemory
    } else if batch_size > 1 {
        info!("Turning gradient checkpointing on automatically for batch size > 1");
        MemoryDecision::LargeBatch
    } else if resolutions.iter().max().copied().unwrap_or(0) > HIGH_RESOLUTION_THRESHOLD {
        info!("Turning gradient checkpointing on; training resolution greater than 1024x1024");
        MemoryDecision::HighResolution
    } else {
        MemoryDecision::NotNeeded
    }
}

/// Build the job file for one run. Pure apart from logging.
pub fn build_job_config(
    inputs: &TrainingInputs,
    settings: &Settings,
    ctx: &BuildContext,
) -> Result<(Config, MemoryDecision)> {
    let resolutions = inputs.resolutions()?;
    let sample_prompts = inputs.sample_prompts();
    let memory = decide_memory_mode(
        inputs.gradient_checkpointing,
        ctx.gpu_memory_bytes,
        inputs.batch_size,
        &resolutions,
    );

    let tracking = inputs.tracking_enabled();
    let never = inputs.steps + 1;
    let save_every = if tracking { inputs.tracking_save_interval } else { never };
    let sample_every = if tracking && !sample_prompts.is_empty() {
        inputs.tracking_sample_interval
    } else {
        never
    };

    let network_kwargs = if ctx.pretrained_lora_path.is_some() || ctx.layers_to_optimize.is_some() {
        Some(NetworkKwargs {
            pretrained_path: ctx
                .pretrained_lora_path
                .as_ref()
                .map(|p| p.display().to_string()),
            only_if_contains: ctx.layers_to_optimize.clone(),
        })
    } else {
        None
    };
    if let Some(path) = &ctx.pretrained_lora_path {
        info!("Initializing network from pretrained LoRA: {}", path.display());
    }

    let process = ProcessConfig {
        process_type: "sd_trainer".to_string(),
        training_folder: settings.output_dir.display().to_string(),
        device: settings.device.clone(),
        trigger_word: inputs.trigger().map(str::to_string),
        network: NetworkConfig {
            type_: "lora".to_string(),
            linear: inputs.lora_rank,
            linear_alpha: inputs.lora_rank,
            network_kwargs,
        },
        save: SaveConfig {
            dtype: "float16".to_string(),
            save_every,
            max_step_saves_to_keep: 1,
        },
        datasets: vec![DatasetConfig {
            folder_path: settings.input_dir.display().to_string(),
            caption_ext: "txt".to_string(),
            caption_dropout_rate: inputs.caption_dropout_rate,
            shuffle_tokens: false,
            cache_latents_to_disk: inputs.cache_latents_to_disk,
            cache_latents: true,
            resolution: resolutions,
        }],
        train: TrainConfig {
            batch_size: inputs.batch_size,
            steps: inputs.steps,
            gradient_accumulation_steps: 1,
            train_unet: true,
            train_text_encoder: false,
            content_or_style: "balanced".to_string(),
            gradient_checkpointing: memory.gradient_checkpointing(),
            noise_scheduler: "flowmatch".to_string(),
            optimizer: inputs.optimizer.clone(),
            lr: inputs.learning_rate,
            ema_config: EmaConfig {
                use_ema: true,
                ema_decay: 0.99,
            },
            dtype: "bf16".to_string(),
        },
        model: ModelConfig {
            name_or_path: settings.weights_path.display().to_string(),
            is_flux: true,
            quantize: memory.quantize(),
        },
        sample: SampleConfig {
            sampler: "flowmatch".to_string(),
            sample_every,
            width: 1024,
            height: 1024,
            prompts: sample_prompts,
            neg: String::new(),
            seed: 42,
            walk_seed: true,
            guidance_scale: 3.5,
            sample_steps: 28,
        },
    };

    let config = Config {
        job: "extension".to_string(),
        config: ConfigData {
            name: settings.job_name.clone(),
            process: vec![process],
        },
        meta: Some(MetaConfig {
            name: "[name]".to_string(),
            version: "1.0".to_string(),
        }),
    };

    Ok((config, memory))
}
