use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fluxtrain::layers::{available_layers_to_optimize, match_layers_to_optimize};
use fluxtrain::{load_settings, render_config, train, Services, Settings, TrainingInputs};
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a FLUX.1-dev LoRA with ai-toolkit", long_about = None)]
struct Cli {
    /// Run settings YAML (paths, external programs, service endpoints)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full training job
    Train(TrainArgs),
    /// Validate parameters and print the trainer job file
    RenderConfig(TrainArgs),
    /// List the layers a LoRA can target
    Layers {
        /// Only list layers matching this regex
        #[arg(long)]
        regex: Option<String>,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Zip file of training images, optionally with same-name .txt captions
    #[arg(long)]
    input_images: Option<PathBuf>,

    /// Word that triggers the concept; pass an empty string for none
    #[arg(long, default_value = "TOK")]
    trigger_word: String,

    /// Caption images that have no .txt file
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    autocaption: bool,

    #[arg(long)]
    autocaption_prefix: Option<String>,

    #[arg(long)]
    autocaption_suffix: Option<String>,

    /// Training steps (3-6000)
    #[arg(long, default_value_t = 1000)]
    steps: usize,

    #[arg(long, default_value_t = 4e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Comma separated training resolutions
    #[arg(long, default_value = "512,768,1024")]
    resolution: String,

    /// LoRA rank (1-128)
    #[arg(long, default_value_t = 16)]
    lora_rank: usize,

    #[arg(long, default_value_t = 0.05)]
    caption_dropout_rate: f32,

    #[arg(long, default_value = "adamw8bit")]
    optimizer: String,

    #[arg(long)]
    cache_latents_to_disk: bool,

    /// Train only layers matching this regex
    #[arg(long)]
    layers_to_optimize_regex: Option<String>,

    #[arg(long)]
    gradient_checkpointing: bool,

    /// HuggingFace repo (owner/name) to upload the result to
    #[arg(long)]
    hf_repo_id: Option<String>,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Enables experiment tracking
    #[arg(long, env = "TRACKING_API_KEY", hide_env_values = true)]
    tracking_api_key: Option<String>,

    #[arg(long)]
    tracking_project: Option<String>,

    #[arg(long)]
    tracking_run: Option<String>,

    #[arg(long)]
    tracking_entity: Option<String>,

    #[arg(long, default_value_t = 100)]
    tracking_sample_interval: usize,

    /// Newline separated prompts for tracked samples
    #[arg(long)]
    tracking_sample_prompts: Option<String>,

    #[arg(long, default_value_t = 100)]
    tracking_save_interval: usize,

    /// Package this HuggingFace LoRA instead of training
    #[arg(long)]
    skip_training_and_use_pretrained_hf_lora_url: Option<String>,

    /// Resume training from this HuggingFace LoRA
    #[arg(long)]
    pretrained_lora_url: Option<String>,

    /// Keep optimizer.pt in the output for a later resume
    #[arg(long)]
    keep_optimizer_for_resume: bool,
}

impl From<TrainArgs> for TrainingInputs {
    fn from(args: TrainArgs) -> Self {
        TrainingInputs {
            input_images: args.input_images,
            trigger_word: args.trigger_word,
            autocaption: args.autocaption,
            autocaption_prefix: args.autocaption_prefix,
            autocaption_suffix: args.autocaption_suffix,
            steps: args.steps,
            learning_rate: args.learning_rate,
            batch_size: args.batch_size,
            resolution: args.resolution,
            lora_rank: args.lora_rank,
            caption_dropout_rate: args.caption_dropout_rate,
            optimizer: args.optimizer,
            cache_latents_to_disk: args.cache_latents_to_disk,
            layers_to_optimize_regex: args.layers_to_optimize_regex,
            gradient_checkpointing: args.gradient_checkpointing,
            hf_repo_id: args.hf_repo_id,
            hf_token: args.hf_token,
            tracking_api_key: args.tracking_api_key,
            tracking_project: args.tracking_project,
            tracking_run: args.tracking_run,
            tracking_entity: args.tracking_entity,
            tracking_sample_interval: args.tracking_sample_interval,
            tracking_sample_prompts: args.tracking_sample_prompts,
            tracking_save_interval: args.tracking_save_interval,
            skip_training_and_use_pretrained_hf_lora_url: args
                .skip_training_and_use_pretrained_hf_lora_url,
            pretrained_lora_url: args.pretrained_lora_url,
            keep_optimizer_for_resume: args.keep_optimizer_for_resume,
        }
    }
}

fn main() -> Result<()> {
    fluxtrain::logging::init_logger();

    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };

    match cli.command {
        Command::Train(args) => {
            let inputs = TrainingInputs::from(args);
            let services = Services::from_settings(&settings);
            let output = train(&inputs, settings, &services)?;
            info!("Weights written to {}", output.weights.display());
        }
        Command::RenderConfig(args) => {
            let yaml = render_config(&TrainingInputs::from(args), &settings)?;
            print!("{}", yaml);
        }
        Command::Layers { regex } => {
            let layers = match regex {
                Some(pattern) => match_layers_to_optimize(&pattern)?,
                None => available_layers_to_optimize().to_vec(),
            };
            for layer in layers {
                println!("{}", layer);
            }
        }
    }

    Ok(())
}
