//! Post-processing of the trainer's output directory
//!
//! Turns whatever the trainer left in the job directory into the published
//! layout: one `lora.safetensors`, optional optimizer state, the captions used
//! for training, and an uncompressed tar of the whole directory.

use crate::error::{IoContext, Result, TrainError};
use crate::settings::{Settings, FINAL_LORA_NAME, OPTIMIZER_STATE_NAME};
use log::info;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// What post-processing left behind
#[derive(Debug, Clone)]
pub struct FinalizedRun {
    pub lora_path: PathBuf,
    pub lora_size_bytes: u64,
    pub optimizer_kept: bool,
    pub captions_copied: usize,
}

impl FinalizedRun {
    pub fn lora_size_mb(&self) -> f64 {
        self.lora_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Files directly inside `dir` with the given extension, sorted by name
pub fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if path.is_file() && has_extension(&path, ext) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Rename the final checkpoint and drop intermediate outputs
pub fn finalize_job_dir(settings: &Settings, keep_optimizer: bool) -> Result<FinalizedRun> {
    let job_dir = settings.job_dir();
    let trainer_lora = settings.trainer_lora_path();
    let lora_path = settings.final_lora_path();

    if !trainer_lora.exists() {
        return Err(TrainError::runtime(format!(
            "Trainer finished without writing {}",
            trainer_lora.display()
        )));
    }
    fs::rename(&trainer_lora, &lora_path).at(&trainer_lora)?;

    let samples_dir = settings.samples_dir();
    if samples_dir.exists() {
        fs::remove_dir_all(&samples_dir).at(&samples_dir)?;
    }

    // Intermediate step saves
    for path in files_with_extension(&job_dir, "safetensors")? {
        if path.file_name().map_or(false, |n| n != FINAL_LORA_NAME) {
            fs::remove_file(&path).at(&path)?;
        }
    }

    let optimizer_file = job_dir.join(OPTIMIZER_STATE_NAME);
    let mut optimizer_kept = false;
    if optimizer_file.exists() {
        if keep_optimizer {
            info!("Keeping {} for resuming training later", optimizer_file.display());
            optimizer_kept = true;
        } else {
            info!("Removing {} to save space", optimizer_file.display());
            fs::remove_file(&optimizer_file).at(&optimizer_file)?;
        }
    }

    let captions_copied = copy_captions(&settings.input_dir, &settings.captions_dir())?;

    let lora_size_bytes = fs::metadata(&lora_path).at(&lora_path)?.len();
    Ok(FinalizedRun {
        lora_path,
        lora_size_bytes,
        optimizer_kept,
        captions_copied,
    })
}

/// Copy `*.txt` captions from the dataset dir so they ship with the weights
pub fn copy_captions(input_dir: &Path, captions_dir: &Path) -> Result<usize> {
    fs::create_dir_all(captions_dir).at(captions_dir)?;
    if !input_dir.exists() {
        return Ok(0);
    }

    let captions = files_with_extension(input_dir, "txt")?;
    for caption in &captions {
        if let Some(name) = caption.file_name() {
            let dest = captions_dir.join(name);
            fs::copy(caption, &dest).at(&dest)?;
        }
    }
    Ok(captions.len())
}

/// Write an uncompressed tar holding `paths`, named relative to `base`
pub fn archive_paths(archive: &Path, base: &Path, paths: &[PathBuf]) -> Result<()> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }

    let file = File::create(archive).at(archive)?;
    let mut tar = tar::Builder::new(file);
    for path in paths {
        let name = path.strip_prefix(base).unwrap_or(path);
        if path.is_dir() {
            tar.append_dir_all(name, path).at(path)?;
        } else {
            tar.append_path_with_name(path, name).at(path)?;
        }
    }
    tar.into_inner().at(archive)?;

    info!("Wrote archive {}", archive.display());
    Ok(())
}

/// Package the job directory into the run's output archive
pub fn archive_job_dir(settings: &Settings) -> Result<PathBuf> {
    archive_paths(
        &settings.archive_path,
        &settings.archive_base(),
        &[settings.job_dir()],
    )?;
    Ok(settings.archive_path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn job_dir_with_outputs(settings: &Settings) {
        let job_dir = settings.job_dir();
        fs::create_dir_all(settings.samples_dir()).unwrap();
        fs::write(settings.samples_dir().join("1700000000__000000100_0.jpg"), b"jpg").unwrap();
        fs::write(settings.trainer_lora_path(), b"final").unwrap();
        fs::write(job_dir.join("flux_train_replicate_000000500.safetensors"), b"step").unwrap();
        fs::write(job_dir.join(OPTIMIZER_STATE_NAME), b"state").unwrap();
        fs::write(job_dir.join("config.yaml"), b"job: extension").unwrap();

        fs::create_dir_all(&settings.input_dir).unwrap();
        fs::write(settings.input_dir.join("a.jpg"), b"img").unwrap();
        fs::write(settings.input_dir.join("a.txt"), b"a photo of TOK").unwrap();
        fs::write(settings.input_dir.join("b.txt"), b"TOK smiling").unwrap();
    }

    fn archive_entries(path: &Path) -> BTreeSet<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_finalize_prunes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        job_dir_with_outputs(&settings);

        let run = finalize_job_dir(&settings, false).unwrap();
        let job_dir = settings.job_dir();

        assert_eq!(run.lora_path, job_dir.join("lora.safetensors"));
        assert_eq!(run.lora_size_bytes, 5);
        assert!(!run.optimizer_kept);
        assert_eq!(run.captions_copied, 2);
        assert!(!settings.samples_dir().exists());
        assert!(!job_dir.join(OPTIMIZER_STATE_NAME).exists());
        assert_eq!(
            files_with_extension(&job_dir, "safetensors").unwrap(),
            vec![job_dir.join("lora.safetensors")]
        );
        assert!(settings.captions_dir().join("b.txt").exists());
    }

    #[test]
    fn test_keep_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        job_dir_with_outputs(&settings);

        let run = finalize_job_dir(&settings, true).unwrap();
        assert!(run.optimizer_kept);
        assert!(settings.job_dir().join(OPTIMIZER_STATE_NAME).exists());
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        fs::create_dir_all(settings.job_dir()).unwrap();

        let err = finalize_job_dir(&settings, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RuntimeFailure);
    }

    #[test]
    fn test_archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        job_dir_with_outputs(&settings);
        finalize_job_dir(&settings, false).unwrap();

        let archive = archive_job_dir(&settings).unwrap();
        let entries = archive_entries(&archive);
        assert!(entries.contains("output/flux_train_replicate/lora.safetensors"));
        assert!(entries.contains("output/flux_train_replicate/captions/a.txt"));
        assert!(!entries.iter().any(|e| e.contains("samples")));
    }
}
