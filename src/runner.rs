//! Training execution through the external trainer

use crate::config::Config;
use crate::error::{IoContext, Result, TrainError};
use crate::settings::{CommandSpec, Settings};
use crate::tracking::{Progress, RunObserver};
use log::{debug, info};
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::Stdio;
use std::sync::mpsc;
use std::thread;

/// Runs one training job to completion
pub trait JobRunner {
    fn run(&self, config: &Config, settings: &Settings, observer: &mut RunObserver) -> Result<()>;
}

/// Drives ai-toolkit: writes the job file and runs `<trainer> <job.yaml>`
#[derive(Debug, Clone)]
pub struct ToolkitRunner {
    command: CommandSpec,
}

impl ToolkitRunner {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward `reader` to `tx` one line at a time. Progress bars redraw with
/// `\r`, so carriage returns end a line too.
fn drain<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    let mut line = Vec::new();
    for byte in BufReader::new(reader).bytes() {
        let Ok(byte) = byte else { break };
        if byte == b'\n' || byte == b'\r' {
            if !line.is_empty() {
                let text = String::from_utf8_lossy(&line).into_owned();
                if tx.send((stream, text)).is_err() {
                    return;
                }
                line.clear();
            }
        } else {
            line.push(byte);
        }
    }
    if !line.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&line).into_owned()));
    }
}

/// Step display: a progress bar when enabled, plain logging otherwise
struct StepDisplay {
    #[cfg(feature = "progress-bar")]
    bar: indicatif::ProgressBar,
}

impl StepDisplay {
    fn new(total_steps: usize) -> Self {
        #[cfg(feature = "progress-bar")]
        {
            let bar = indicatif::ProgressBar::new(total_steps as u64);
            if let Ok(style) = indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} steps {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            Self { bar }
        }
        #[cfg(not(feature = "progress-bar"))]
        {
            info!("Training for {} steps", total_steps);
            Self {}
        }
    }

    fn progress(&self, progress: &Progress) {
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_length(progress.total as u64);
            self.bar.set_position(progress.step as u64);
            if let Some(loss) = progress.values.get("loss") {
                self.bar.set_message(format!("loss: {:.4}", loss));
            }
        }
        #[cfg(not(feature = "progress-bar"))]
        debug!("Step {}/{} {:?}", progress.step, progress.total, progress.values);
    }

    fn line(&self, stream: Stream, line: &str) {
        let log_line = || match stream {
            Stream::Stdout => info!("{}", line),
            Stream::Stderr => info!("[trainer] {}", line),
        };
        #[cfg(feature = "progress-bar")]
        self.bar.suspend(log_line);
        #[cfg(not(feature = "progress-bar"))]
        log_line();
    }

    fn finish(&self) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish_and_clear();
    }
}

impl ToolkitRunner {
    fn spawn_and_follow(&self, job_file: &Path, total_steps: usize, observer: &mut RunObserver) -> Result<()> {
        let mut cmd = self.command.command();
        cmd.arg(job_file).stdout(Stdio::piped()).stderr(Stdio::piped());

        info!("Starting trainer: {} {}", self.command.program, job_file.display());
        let mut child = cmd.spawn().map_err(|e| {
            TrainError::runtime(format!("Failed to start trainer {}: {}", self.command.program, e))
        })?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || drain(stdout, Stream::Stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || drain(stderr, Stream::Stderr, tx)));
        }
        drop(tx);

        let display = StepDisplay::new(total_steps);
        for (stream, line) in rx {
            match observer.observe_line(&line) {
                Some(progress) => display.progress(&progress),
                None => display.line(stream, &line),
            }
        }
        display.finish();

        for reader in readers {
            let _ = reader.join();
        }
        let status = child.wait().at(job_file)?;
        if !status.success() {
            return Err(TrainError::runtime(format!(
                "Trainer exited with {} after step {}",
                status,
                observer.step()
            )));
        }
        Ok(())
    }
}

impl JobRunner for ToolkitRunner {
    fn run(&self, config: &Config, settings: &Settings, observer: &mut RunObserver) -> Result<()> {
        let job_file = settings.job_config_path();
        config.save(&job_file)?;
        debug!("Wrote job file {}", job_file.display());

        self.spawn_and_follow(&job_file, config.process().train.steps, observer)?;
        info!("Trainer finished at step {}", observer.step());
        Ok(())
    }
}
