//! End-to-end training run
//!
//! [`train`] sequences one run: validation, clean slate, downloads, dataset
//! preparation, the trainer subprocess, post-processing and publishing. The
//! external programs sit behind the traits bundled in [`Services`].

use crate::artifacts::{archive_job_dir, finalize_job_dir};
use crate::caption::{Captioner, CommandCaptioner};
use crate::config::{build_job_config, BuildContext};
use crate::dataset::{all_images_are_captioned, extract_zip, summarize};
use crate::download::{
    download_huggingface_lora, download_pretrained_lora_for_training, download_weights,
    validate_hf_lora_url, Downloader, PgetDownloader, PRETRAINED_URL_EXAMPLE,
};
use crate::error::{IoContext, Result, TrainError};
use crate::hardware::{format_gb, resolve_gpu_memory};
use crate::inputs::TrainingInputs;
use crate::layers::match_layers_to_optimize;
use crate::publish::HubPublisher;
use crate::readme::{write_readme, ModelCard};
use crate::runner::{JobRunner, ToolkitRunner};
use crate::settings::Settings;
use crate::tracking::{HttpTracker, RunInfo, RunObserver, Tracker};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;

pub type TrackerFactory = Box<dyn Fn(&TrainingInputs, &Settings) -> Result<Box<dyn Tracker>>>;

/// External collaborators of a run
pub struct Services {
    pub downloader: Box<dyn Downloader>,
    pub captioner: Box<dyn Captioner>,
    pub runner: Box<dyn JobRunner>,
    pub tracker_factory: TrackerFactory,
}

impl Services {
    /// The real programs and services named in `settings`
    pub fn from_settings(settings: &Settings) -> Self {
        let endpoint = settings.tracking.endpoint.clone();
        Self {
            downloader: Box::new(PgetDownloader::new(settings.download_program.clone())),
            captioner: Box::new(CommandCaptioner::new(settings.captioner.clone())),
            runner: Box::new(ToolkitRunner::new(settings.trainer.clone())),
            tracker_factory: Box::new(move |inputs, settings| {
                let api_key = inputs.tracking_api_key.as_deref().unwrap_or_default();
                let run = RunInfo::from_inputs(inputs, settings);
                let tracker: Box<dyn Tracker> = Box::new(HttpTracker::start(&endpoint, api_key, &run)?);
                Ok(tracker)
            }),
        }
    }
}

/// Result of a run: the tar holding the trained weights
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutput {
    pub weights: PathBuf,
}

/// Remove leftovers of previous runs
pub fn clean_up(settings: &Settings) -> Result<()> {
    for dir in [&settings.input_dir, &settings.output_dir] {
        if dir.exists() {
            fs::remove_dir_all(dir).at(dir)?;
        }
    }
    Ok(())
}

fn build_context(
    inputs: &TrainingInputs,
    settings: &Settings,
    pretrained_lora_path: Option<PathBuf>,
) -> Result<BuildContext> {
    let layers_to_optimize = inputs
        .layers_to_optimize_regex
        .as_deref()
        .map(match_layers_to_optimize)
        .transpose()?;
    if let Some(layers) = &layers_to_optimize {
        info!("Optimizing {} layers", layers.len());
    }

    let gpu_memory_bytes = resolve_gpu_memory(settings.gpu_memory_gb);
    match gpu_memory_bytes {
        Some(bytes) => info!("GPU memory: {}", format_gb(bytes)),
        None => warn!("Could not detect GPU memory"),
    }

    Ok(BuildContext {
        gpu_memory_bytes,
        pretrained_lora_path,
        layers_to_optimize,
    })
}

/// Validate inputs and render the job file without touching disk or network
pub fn render_config(inputs: &TrainingInputs, settings: &Settings) -> Result<String> {
    inputs.validate()?;
    if inputs.is_skip_training() {
        return Err(TrainError::invalid(
            "skip_training_and_use_pretrained_hf_lora_url runs do not produce a job file",
        ));
    }

    let pretrained = match &inputs.pretrained_lora_url {
        Some(url) => {
            validate_hf_lora_url(url, PRETRAINED_URL_EXAMPLE)?;
            Some(settings.pretrained_lora_path())
        }
        None => None,
    };

    let ctx = build_context(inputs, settings, pretrained)?;
    let (config, _) = build_job_config(inputs, settings, &ctx)?;
    config.to_yaml()
}

/// Run one training job
pub fn train(inputs: &TrainingInputs, mut settings: Settings, services: &Services) -> Result<TrainingOutput> {
    inputs.validate()?;
    settings.absolutize().at(".")?;
    clean_up(&settings)?;

    if let Some(url) = &inputs.skip_training_and_use_pretrained_hf_lora_url {
        info!("Skipping training, packaging LoRA from {}", url);
        let weights = download_huggingface_lora(url, &settings, services.downloader.as_ref())?;
        return Ok(TrainingOutput { weights });
    }

    let pretrained = match &inputs.pretrained_lora_url {
        Some(url) => {
            info!("Fine-tuning from pretrained LoRA: {}", url);
            let (path, summary) =
                download_pretrained_lora_for_training(url, &settings, services.downloader.as_ref())?;
            match summary.rank() {
                Some(rank) if rank != inputs.lora_rank => warn!(
                    "Pretrained LoRA has rank {} but lora_rank is {}; the trainer uses lora_rank",
                    rank, inputs.lora_rank
                ),
                Some(_) => {}
                None => warn!("Could not infer the rank of the pretrained LoRA"),
            }
            Some(path)
        }
        None => {
            info!("Training new LoRA from scratch");
            None
        }
    };

    let ctx = build_context(inputs, &settings, pretrained)?;
    let (config, memory) = build_job_config(inputs, &settings, &ctx)?;
    info!(
        "Memory mode: {:?} (gradient checkpointing: {}, quantize: {})",
        memory,
        memory.gradient_checkpointing(),
        memory.quantize()
    );

    let tracker = if inputs.tracking_enabled() {
        match (services.tracker_factory)(inputs, &settings) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                warn!("Experiment tracking disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    download_weights(&settings, services.downloader.as_ref())?;

    let images = inputs
        .input_images
        .as_deref()
        .ok_or_else(|| TrainError::invalid("input_images must be provided"))?;
    extract_zip(images, &settings.input_dir)?;

    if !inputs.autocaption {
        info!("Autocaption disabled");
    } else if all_images_are_captioned(&settings.input_dir)? {
        info!("All images already have captions, skipping autocaption");
    } else {
        services.captioner.caption_images(
            &settings.input_dir,
            inputs.autocaption_prefix.as_deref(),
            inputs.autocaption_suffix.as_deref(),
        )?;
    }

    let min_resolution = inputs.resolutions()?.into_iter().min().unwrap_or_default();
    summarize(&settings.input_dir, min_resolution)?;

    let mut observer = RunObserver::new(&settings, config.process().train.steps, tracker);
    services.runner.run(&config, &settings, &mut observer)?;
    observer.finish();

    let run = finalize_job_dir(&settings, inputs.keep_optimizer_for_resume)?;

    let card = ModelCard {
        repo_id: inputs.hf_repo_id.as_deref(),
        job_name: &settings.job_name,
        trigger_word: inputs.trigger(),
        steps: inputs.steps,
        learning_rate: inputs.learning_rate,
        lora_rank: inputs.lora_rank,
        pretrained_lora_url: inputs.pretrained_lora_url.as_deref(),
    };
    write_readme(&card, &settings.readme_template, &settings.job_dir().join("README.md"))?;

    let weights = archive_job_dir(&settings)?;

    info!("Training complete");
    info!(
        "  Mode: {}",
        if inputs.pretrained_lora_url.is_some() { "fine-tuned from pretrained LoRA" } else { "from scratch" }
    );
    info!("  Steps: {}", inputs.steps);
    info!("  LoRA size: {:.2} MB", run.lora_size_mb());
    info!("  Captions included: {}", run.captions_copied);
    if run.optimizer_kept {
        info!("  Optimizer state kept for resuming");
    }

    if let (Some(repo_id), Some(token)) = (&inputs.hf_repo_id, &inputs.hf_token) {
        let published = HubPublisher::new(&settings.hub_api_base, repo_id, token)
            .and_then(|publisher| publisher.publish_dir(&settings.job_dir()));
        match published {
            Ok(result) => info!(
                "Uploaded {} files to {}",
                result.files_uploaded, result.repo_url
            ),
            Err(e) => warn!("Upload to HuggingFace failed: {}", e),
        }
    }

    Ok(TrainingOutput { weights })
}
