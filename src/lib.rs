pub mod artifacts;
pub mod caption;
pub mod config;
pub mod dataset;
pub mod download;
pub mod error;
pub mod hardware;
pub mod inputs;
pub mod job;
pub mod layers;
pub mod lora_file;
pub mod publish;
pub mod readme;
pub mod runner;
pub mod settings;
pub mod tracking;

// Re-export common types
pub use config::{build_job_config, BuildContext, Config, MemoryDecision, ProcessConfig};
pub use error::{ErrorKind, Result, TrainError};
pub use inputs::TrainingInputs;
pub use job::{render_config, train, Services, TrainingOutput};
pub use settings::{load_settings, Settings};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped logger at Info, overridable through `RUST_LOG`
    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
