//! Inspect LoRA safetensors files without loading tensors

use crate::error::{IoContext, Result, TrainError};
use safetensors::tensor::Metadata;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Little-endian u64 header length at the start of every safetensors file
const HEADER_LEN_BYTES: u64 = 8;
const MAX_HEADER_BYTES: u64 = 100_000_000;

/// Summary of a LoRA checkpoint header
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSummary {
    pub size_bytes: u64,
    pub tensor_count: usize,
    /// Distinct ranks found on down-projection tensors
    pub ranks: BTreeSet<usize>,
}

impl LoraSummary {
    /// The rank when every adapter agrees on one
    pub fn rank(&self) -> Option<usize> {
        if self.ranks.len() == 1 {
            self.ranks.iter().next().copied()
        } else {
            None
        }
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

fn is_down_projection(name: &str) -> bool {
    name.ends_with("lora_A.weight")
        || name.ends_with("lora_down.weight")
        || name.ends_with(".lora_A")
}

/// Parse the header of a LoRA file. Only the JSON header is read; empty,
/// truncated or malformed files are runtime failures.
pub fn inspect_lora(path: &Path) -> Result<LoraSummary> {
    let mut file = File::open(path).at(path)?;
    let size_bytes = file.metadata().at(path)?.len();
    if size_bytes == 0 {
        return Err(TrainError::runtime(format!(
            "LoRA file is empty: {}",
            path.display()
        )));
    }

    let invalid = |reason: String| {
        TrainError::runtime(format!(
            "Not a valid safetensors file: {} ({})",
            path.display(),
            reason
        ))
    };

    if size_bytes < HEADER_LEN_BYTES {
        return Err(invalid(format!("only {} bytes", size_bytes)));
    }
    let mut len_bytes = [0u8; HEADER_LEN_BYTES as usize];
    file.read_exact(&mut len_bytes).at(path)?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_BYTES || header_len > size_bytes - HEADER_LEN_BYTES {
        return Err(invalid(format!(
            "header of {} bytes in a {} byte file",
            header_len, size_bytes
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header).at(path)?;
    let text = std::str::from_utf8(&header).map_err(|e| invalid(e.to_string()))?;
    let metadata: Metadata =
        serde_json::from_str(text.trim_end()).map_err(|e| invalid(e.to_string()))?;

    let tensors = metadata.tensors();
    let data_end = tensors
        .values()
        .map(|info| info.data_offsets.1 as u64)
        .max()
        .unwrap_or(0);
    if HEADER_LEN_BYTES + header_len + data_end != size_bytes {
        return Err(invalid(format!(
            "tensor data ends at byte {} of a {} byte file",
            HEADER_LEN_BYTES + header_len + data_end,
            size_bytes
        )));
    }

    let mut ranks = BTreeSet::new();
    for (name, info) in &tensors {
        // Down projections are [rank, in_features]
        if is_down_projection(name) {
            if let Some(&rank) = info.shape.first() {
                ranks.insert(rank);
            }
        }
    }

    Ok(LoraSummary {
        size_bytes,
        tensor_count: tensors.len(),
        ranks,
    })
}
