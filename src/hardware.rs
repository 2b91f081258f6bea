//! GPU memory detection

use log::{debug, warn};
use std::process::Command;

const MIB: u64 = 1024 * 1024;

/// Total memory of GPU 0 in bytes, queried through `nvidia-smi`
pub fn gpu_total_memory() -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let info = String::from_utf8_lossy(&output.stdout);
            let total = parse_memory_total(&info);
            if total.is_none() {
                warn!("Could not parse nvidia-smi output: {}", info.trim());
            }
            total
        }
        Ok(output) => {
            warn!("nvidia-smi exited with {}", output.status);
            None
        }
        Err(e) => {
            debug!("nvidia-smi not available: {}", e);
            None
        }
    }
}

/// First line of `memory.total` output is MiB for GPU 0
fn parse_memory_total(info: &str) -> Option<u64> {
    info.lines()
        .next()
        .and_then(|line| line.trim().parse::<u64>().ok())
        .map(|mib| mib * MIB)
}

/// Resolve GPU memory, preferring an explicit override in gigabytes
pub fn resolve_gpu_memory(override_gb: Option<f64>) -> Option<u64> {
    match override_gb {
        Some(gb) => Some((gb * 1024.0 * 1024.0 * 1024.0) as u64),
        None => gpu_total_memory(),
    }
}

pub fn format_gb(bytes: u64) -> String {
    format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}
