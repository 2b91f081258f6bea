//! Training image acquisition
//!
//! Unpacks the user's zip into the dataset directory and reports what the
//! trainer will see: images at the top level, each optionally paired with a
//! same-stem `.txt` caption.

use crate::error::{IoContext, Result, TrainError};
use log::{info, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
pub const CAPTION_EXTENSION: &str = "txt";

fn is_metadata_entry(name: &str) -> bool {
    name.starts_with("__MACOSX/") || name.starts_with("._")
}

/// Extract `archive` into `dir`, skipping macOS resource-fork entries
pub fn extract_zip(archive: &Path, dir: &Path) -> Result<usize> {
    let file = match File::open(archive) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TrainError::invalid(format!(
                "input_images not found: {}",
                archive.display()
            )));
        }
        Err(e) => return Err(TrainError::io(archive, e)),
    };
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|_| TrainError::invalid("input_images must be a zip file"))?;

    fs::create_dir_all(dir).at(dir)?;
    let mut extracted = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if is_metadata_entry(entry.name()) {
            continue;
        }

        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping zip entry outside the dataset dir: {}", entry.name());
            continue;
        };
        let dest = dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&dest).at(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let mut out = File::create(&dest).at(&dest)?;
        io::copy(&mut entry, &mut out).at(&dest)?;
        extracted += 1;
    }

    info!("Extracted {} files from zip to {}", extracted, dir.display());
    Ok(extracted)
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn caption_path(image: &Path) -> PathBuf {
    image.with_extension(CAPTION_EXTENSION)
}

/// Images directly inside `dir`, sorted by name
pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

pub fn uncaptioned_images(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(scan_images(dir)?
        .into_iter()
        .filter(|image| !caption_path(image).exists())
        .collect())
}

pub fn all_images_are_captioned(dir: &Path) -> Result<bool> {
    Ok(uncaptioned_images(dir)?.is_empty())
}

/// Dataset statistics logged before training
#[derive(Debug, Clone, Default)]
pub struct DatasetSummary {
    pub images: usize,
    pub captioned: usize,
    /// Smallest and largest short side seen, in pixels
    pub short_side_range: Option<(u32, u32)>,
    pub unreadable: Vec<PathBuf>,
    pub undersized: Vec<PathBuf>,
}

/// Read image headers and compare against the smallest training resolution
pub fn summarize(dir: &Path, min_resolution: usize) -> Result<DatasetSummary> {
    let mut summary = DatasetSummary::default();

    for image in scan_images(dir)? {
        summary.images += 1;
        if caption_path(&image).exists() {
            summary.captioned += 1;
        }

        match image::image_dimensions(&image) {
            Ok((width, height)) => {
                let short = width.min(height);
                summary.short_side_range = Some(match summary.short_side_range {
                    Some((lo, hi)) => (lo.min(short), hi.max(short)),
                    None => (short, short),
                });
                if (short as usize) < min_resolution {
                    summary.undersized.push(image);
                }
            }
            Err(e) => {
                warn!("Could not read {}: {}", image.display(), e);
                summary.unreadable.push(image);
            }
        }
    }

    info!("Dataset loaded:");
    info!("  Images: {} ({} captioned)", summary.images, summary.captioned);
    if let Some((lo, hi)) = summary.short_side_range {
        info!("  Short side: {}px - {}px", lo, hi);
    }
    if !summary.undersized.is_empty() {
        warn!(
            "{} images are smaller than {}px and will be upscaled",
            summary.undersized.len(),
            min_resolution
        );
    }
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::path::Path;
    use zip::write::SimpleFileOptions;

    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    pub fn write_png(path: &Path, width: u32, height: u32) {
        image::RgbImage::from_pixel(width, height, image::Rgb([120, 80, 200]))
            .save(path)
            .unwrap();
    }
}
