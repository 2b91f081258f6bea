//! Automatic captioning through an external captioning command

use crate::dataset::{caption_path, uncaptioned_images};
use crate::error::{IoContext, Result, TrainError};
use crate::settings::CommandSpec;
use log::info;
use std::fs;
use std::path::Path;

/// Produces `.txt` captions next to images that have none
pub trait Captioner {
    /// Caption every uncaptioned image in `dir`. Returns how many were written.
    fn caption_images(&self, dir: &Path, prefix: Option<&str>, suffix: Option<&str>) -> Result<usize>;
}

/// Join the captioning context around a generated caption
pub fn compose_caption(prefix: Option<&str>, caption: &str, suffix: Option<&str>) -> String {
    format!(
        "{}{}{}",
        prefix.unwrap_or_default(),
        caption.trim(),
        suffix.unwrap_or_default()
    )
}

/// Runs the configured program once per image; the caption is its stdout
#[derive(Debug, Clone)]
pub struct CommandCaptioner {
    command: CommandSpec,
}

impl CommandCaptioner {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }

    fn caption_one(&self, image: &Path, prefix: Option<&str>, suffix: Option<&str>) -> Result<String> {
        let mut cmd = self.command.command();
        cmd.arg(image);
        if let Some(prefix) = prefix {
            cmd.arg("--prefix").arg(prefix);
        }
        if let Some(suffix) = suffix {
            cmd.arg("--suffix").arg(suffix);
        }

        let output = cmd.output().map_err(|e| {
            TrainError::runtime(format!("Failed to run captioner {}: {}", self.command.program, e))
        })?;
        if !output.status.success() {
            return Err(TrainError::runtime(format!(
                "Captioner exited with {} for {}: {}",
                output.status,
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let caption = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if caption.is_empty() {
            return Err(TrainError::runtime(format!(
                "Captioner produced no caption for {}",
                image.display()
            )));
        }
        Ok(caption)
    }
}

impl Captioner for CommandCaptioner {
    fn caption_images(&self, dir: &Path, prefix: Option<&str>, suffix: Option<&str>) -> Result<usize> {
        let images = uncaptioned_images(dir)?;
        info!("Captioning {} images with {}", images.len(), self.command.program);

        for image in &images {
            let caption = compose_caption(prefix, &self.caption_one(image, prefix, suffix)?, suffix);
            let dest = caption_path(image);
            fs::write(&dest, &caption).at(&dest)?;
            info!("{}: {}", image.display(), caption);
        }
        Ok(images.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_caption() {
        assert_eq!(
            compose_caption(Some("a photo of TOK, "), " a man in a hat \n", Some(" in the style of TOK")),
            "a photo of TOK, a man in a hat in the style of TOK"
        );
        assert_eq!(compose_caption(None, "a cat", None), "a cat");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_captioner_writes_missing_captions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("b.jpg"), b"x").unwrap();
        fs::write(dir.path().join("b.txt"), b"existing caption").unwrap();

        // `sh -c 'echo ...' sh <image>`: prints a fixed caption for any image
        let captioner = CommandCaptioner::new(CommandSpec::new("sh", &["-c", "echo a red bicycle", "sh"]));
        let written = captioner.caption_images(dir.path(), Some("TOK, "), None).unwrap();

        assert_eq!(written, 1);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "TOK, a red bicycle");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "existing caption");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_captioner_failure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();

        let captioner = CommandCaptioner::new(CommandSpec::new("sh", &["-c", "exit 3", "sh"]));
        let err = captioner.caption_images(dir.path(), None, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RuntimeFailure);
    }
}
