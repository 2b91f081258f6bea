//! Run environment settings
//!
//! Everything that is not a training hyperparameter: where the base weights
//! live, which external programs to invoke and where the job writes its files.
//! All keys are optional in the YAML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_JOB_NAME: &str = "flux_train_replicate";
pub const FINAL_LORA_NAME: &str = "lora.safetensors";
pub const OPTIMIZER_STATE_NAME: &str = "optimizer.pt";

/// External program invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
        }
    }

    /// Build a `std::process::Command` with the configured args and working dir
    pub fn command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Experiment tracking service location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub endpoint: String,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub job_name: String,
    pub weights_path: PathBuf,
    pub weights_url: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_path: PathBuf,
    pub readme_template: PathBuf,
    pub download_program: String,
    pub trainer: CommandSpec,
    pub captioner: CommandSpec,
    pub tracking: TrackingSettings,
    pub hub_api_base: String,
    /// Skips `nvidia-smi` detection when set
    pub gpu_memory_gb: Option<f64>,
    pub device: String,
}

impl Default for Settings {
    fn default() -> Self {
        let mut trainer = CommandSpec::new("python", &["run.py"]);
        trainer.working_dir = Some(PathBuf::from("ai-toolkit"));

        Self {
            job_name: DEFAULT_JOB_NAME.to_string(),
            weights_path: PathBuf::from("./FLUX.1-dev"),
            weights_url: "https://weights.replicate.delivery/default/black-forest-labs/FLUX.1-dev/files.tar"
                .to_string(),
            input_dir: PathBuf::from("input_images"),
            output_dir: PathBuf::from("output"),
            archive_path: PathBuf::from("/tmp/trained_model.tar"),
            readme_template: PathBuf::from("hugging-face-readme-template.md"),
            download_program: "pget".to_string(),
            trainer,
            captioner: CommandSpec::new("python", &["caption.py"]),
            tracking: TrackingSettings::default(),
            hub_api_base: "https://huggingface.co/api".to_string(),
            gpu_memory_gb: None,
            device: "cuda:0".to_string(),
        }
    }
}

impl Settings {
    /// Settings rooted at `root`: relative working paths are joined onto it
    pub fn rooted_at(root: &Path) -> Self {
        let defaults = Self::default();
        Self {
            weights_path: root.join("FLUX.1-dev"),
            input_dir: root.join(&defaults.input_dir),
            output_dir: root.join(&defaults.output_dir),
            archive_path: root.join("trained_model.tar"),
            readme_template: root.join(&defaults.readme_template),
            ..defaults
        }
    }

    /// Resolve working paths against the current directory. The trainer runs
    /// in its own working dir, so paths written into the job file must be absolute.
    pub fn absolutize(&mut self) -> std::io::Result<()> {
        self.weights_path = std::path::absolute(&self.weights_path)?;
        self.input_dir = std::path::absolute(&self.input_dir)?;
        self.output_dir = std::path::absolute(&self.output_dir)?;
        self.archive_path = std::path::absolute(&self.archive_path)?;
        Ok(())
    }

    pub fn job_dir(&self) -> PathBuf {
        self.output_dir.join(&self.job_name)
    }

    /// Checkpoint name the trainer writes at the end of the run
    pub fn trainer_lora_path(&self) -> PathBuf {
        self.job_dir().join(format!("{}.safetensors", self.job_name))
    }

    pub fn final_lora_path(&self) -> PathBuf {
        self.job_dir().join(FINAL_LORA_NAME)
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.job_dir().join("samples")
    }

    pub fn captions_dir(&self) -> PathBuf {
        self.job_dir().join("captions")
    }

    pub fn pretrained_lora_path(&self) -> PathBuf {
        self.input_dir
            .join("pretrained_lora")
            .join("pretrained_lora.safetensors")
    }

    /// Archive entries are named relative to this directory
    pub fn archive_base(&self) -> PathBuf {
        self.output_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn job_config_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.yaml", self.job_name))
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let settings_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    let settings: Settings = serde_yaml::from_str(&settings_str)
        .with_context(|| format!("Failed to parse YAML settings: {}", path.display()))?;

    Ok(settings)
}
