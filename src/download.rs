//! Asset downloads through an external download utility
//!
//! URLs are validated before anything runs, downloads land at fixed paths
//! derived from [`Settings`], and a download only counts when the expected
//! file exists afterwards.

use crate::artifacts::archive_paths;
use crate::error::{IoContext, Result, TrainError};
use crate::lora_file::{inspect_lora, LoraSummary};
use crate::settings::Settings;
use log::info;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

pub const HF_HOST_PREFIX: &str = "https://huggingface.co";
pub const LORA_EXTENSION: &str = ".safetensors";

pub const PRETRAINED_URL_EXAMPLE: &str =
    "https://huggingface.co/user/model/resolve/main/lora.safetensors";
pub const SKIP_TRAINING_URL_EXAMPLE: &str =
    "https://huggingface.co/fofr/flux-80s-cyberpunk/resolve/main/lora.safetensors";

/// Fetches remote files to local paths
pub trait Downloader {
    /// Download `url` to the file `dest`
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;

    /// Download a tarball from `url` and unpack it into `dir`
    fn fetch_and_extract(&self, url: &str, dir: &Path) -> Result<()>;
}

/// Shells out to `pget`
#[derive(Debug, Clone)]
pub struct PgetDownloader {
    program: String,
}

impl PgetDownloader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&OsStr]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| TrainError::runtime(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(TrainError::runtime(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Default for PgetDownloader {
    fn default() -> Self {
        Self::new("pget")
    }
}

impl Downloader for PgetDownloader {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        self.run(&[OsStr::new("-f"), OsStr::new(url), dest.as_os_str()])
    }

    fn fetch_and_extract(&self, url: &str, dir: &Path) -> Result<()> {
        self.run(&[OsStr::new("-xf"), OsStr::new(url), dir.as_os_str()])
    }
}

/// Accept only HuggingFace download URLs of safetensors files
pub fn validate_hf_lora_url(url: &str, example: &str) -> Result<()> {
    if !url.starts_with(HF_HOST_PREFIX) || !url.contains(LORA_EXTENSION) {
        return Err(TrainError::invalid(format!(
            "Invalid URL. Use a HuggingFace download URL like {}",
            example
        )));
    }
    Ok(())
}

/// Fetch `url` to `dest` and make sure a usable LoRA file came out of it
fn fetch_lora(
    what: &str,
    url: &str,
    dest: &Path,
    downloader: &dyn Downloader,
) -> Result<LoraSummary> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }

    info!("Downloading {} to {}", url, dest.display());
    downloader.fetch(url, dest)?;

    if !dest.exists() {
        return Err(TrainError::runtime(format!(
            "Failed to download {} to {}",
            what,
            dest.display()
        )));
    }
    inspect_lora(dest)
}

/// Download a LoRA to resume training from. Returns its fixed local path.
pub fn download_pretrained_lora_for_training(
    url: &str,
    settings: &Settings,
    downloader: &dyn Downloader,
) -> Result<(PathBuf, LoraSummary)> {
    validate_hf_lora_url(url, PRETRAINED_URL_EXAMPLE)?;

    let path = settings.pretrained_lora_path();
    let summary = fetch_lora("pretrained LoRA", url, &path, downloader)?;

    info!(
        "Successfully downloaded pretrained LoRA ({} bytes, {} tensors)",
        summary.size_bytes, summary.tensor_count
    );
    Ok((path, summary))
}

/// Skip-training mode: fetch a finished LoRA and package it as the run output
pub fn download_huggingface_lora(
    url: &str,
    settings: &Settings,
    downloader: &dyn Downloader,
) -> Result<PathBuf> {
    validate_hf_lora_url(url, SKIP_TRAINING_URL_EXAMPLE)?;

    let lora_path = settings.final_lora_path();
    fetch_lora("LoRA", url, &lora_path, downloader)?;
    archive_paths(&settings.archive_path, &settings.archive_base(), &[lora_path])?;

    Ok(settings.archive_path.clone())
}

/// Fetch the base model unless it is already on disk
pub fn download_weights(settings: &Settings, downloader: &dyn Downloader) -> Result<()> {
    if settings.weights_path.exists() {
        return Ok(());
    }

    let parent = settings
        .weights_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let start = Instant::now();
    downloader.fetch_and_extract(&settings.weights_url, parent)?;
    info!(
        "Downloaded base weights in {:.1} seconds",
        start.elapsed().as_secs_f64()
    );

    if !settings.weights_path.exists() {
        return Err(TrainError::runtime(format!(
            "Base weights missing after download: {}",
            settings.weights_path.display()
        )));
    }
    Ok(())
}
