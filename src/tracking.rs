//! Experiment tracking
//!
//! The trainer runs as a subprocess, so tracking is driven from the outside:
//! [`RunObserver`] reads the trainer's progress output and watches the job
//! directory for new samples and checkpoints, forwarding both to a [`Tracker`].
//! Tracking never fails a run; tracker errors are logged and dropped.

use crate::error::{IoContext, Result, TrainError};
use crate::inputs::TrainingInputs;
use crate::settings::Settings;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

static STEP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)/(\d+)\s*\[").expect("step pattern is valid"));

static METRIC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(loss|lr):\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)")
        .expect("metric pattern is valid")
});

static SAMPLE_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d+)\.jpg$").expect("sample pattern is valid"));

/// Receives metrics and files from a training run
pub trait Tracker {
    fn log_loss(&mut self, step: usize, values: &BTreeMap<String, f64>) -> Result<()>;
    fn log_samples(&mut self, step: usize, paths: &[PathBuf]) -> Result<()>;
    fn save_weights(&mut self, path: &Path) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Identity and hyperparameters of a tracked run
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub project: String,
    pub entity: Option<String>,
    pub name: Option<String>,
    pub config: serde_json::Value,
    pub sample_prompts: Vec<String>,
}

impl RunInfo {
    pub fn from_inputs(inputs: &TrainingInputs, settings: &Settings) -> Self {
        let config = json!({
            "trigger_word": inputs.trigger(),
            "autocaption": inputs.autocaption,
            "autocaption_prefix": inputs.autocaption_prefix,
            "autocaption_suffix": inputs.autocaption_suffix,
            "steps": inputs.steps,
            "learning_rate": inputs.learning_rate,
            "batch_size": inputs.batch_size,
            "resolution": inputs.resolution,
            "lora_rank": inputs.lora_rank,
            "caption_dropout_rate": inputs.caption_dropout_rate,
            "optimizer": inputs.optimizer,
            "pretrained_lora_url": inputs.pretrained_lora_url,
            "is_fine_tuning_mode": inputs.pretrained_lora_url.is_some(),
            "keep_optimizer_for_resume": inputs.keep_optimizer_for_resume,
        });

        Self {
            project: inputs
                .tracking_project
                .clone()
                .unwrap_or_else(|| settings.job_name.clone()),
            entity: inputs.tracking_entity.clone(),
            name: inputs.tracking_run.clone(),
            config,
            sample_prompts: inputs.sample_prompts(),
        }
    }
}

/// Tracker speaking JSON and multipart uploads to an HTTP tracking service
pub struct HttpTracker {
    client: reqwest::blocking::Client,
    run_url: String,
    api_key: String,
    sample_prompts: Vec<String>,
}

impl HttpTracker {
    /// Register the run with the service at `endpoint`
    pub fn start(endpoint: &str, api_key: &str, run: &RunInfo) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("fluxtrain/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let run_id = run.name.clone().unwrap_or_else(|| {
            format!("{}-{}", run.project, chrono::Local::now().format("%Y%m%d-%H%M%S"))
        });
        let tracker = Self {
            client,
            run_url: format!("{}/runs/{}", endpoint.trim_end_matches('/'), run_id),
            api_key: api_key.to_string(),
            sample_prompts: run.sample_prompts.clone(),
        };

        tracker.post_event(&json!({
            "type": "start",
            "project": run.project,
            "entity": run.entity,
            "name": run_id,
            "config": run.config,
            "sample_prompts": run.sample_prompts,
        }))?;
        info!("Tracking run at {}", tracker.run_url);
        Ok(tracker)
    }

    fn post_event(&self, event: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/events", self.run_url))
            .bearer_auth(&self.api_key)
            .json(event)
            .send()?;
        check_status(response)
    }

    fn upload(&self, kind: &str, path: &Path, fields: &[(&str, String)]) -> Result<()> {
        let mut form = reqwest::blocking::multipart::Form::new().text("kind", kind.to_string());
        for (name, value) in fields {
            form = form.text(name.to_string(), value.clone());
        }
        let form = form.file("file", path).at(path)?;

        let response = self
            .client
            .post(format!("{}/files", self.run_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()?;
        check_status(response)
    }
}

fn check_status(response: reqwest::blocking::Response) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().unwrap_or_default();
    Err(TrainError::runtime(format!(
        "Tracking service returned HTTP {}: {}",
        status, body
    )))
}

/// Prompt a sample image was generated from. The trainer names samples
/// `<timestamp>__<step>_<prompt index>.jpg`.
pub fn prompt_for_sample<'a>(path: &Path, prompts: &'a [String]) -> Option<&'a str> {
    let name = path.file_name()?.to_str()?;
    let index: usize = SAMPLE_INDEX.captures(name)?.get(1)?.as_str().parse().ok()?;
    prompts.get(index).map(String::as_str)
}

impl Tracker for HttpTracker {
    fn log_loss(&mut self, step: usize, values: &BTreeMap<String, f64>) -> Result<()> {
        self.post_event(&json!({ "type": "loss", "step": step, "values": values }))
    }

    fn log_samples(&mut self, step: usize, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let mut fields = vec![("step", step.to_string())];
            if let Some(prompt) = prompt_for_sample(path, &self.sample_prompts) {
                fields.push(("caption", prompt.to_string()));
            }
            self.upload("sample", path, &fields)?;
        }
        Ok(())
    }

    fn save_weights(&mut self, path: &Path) -> Result<()> {
        info!("Saving weights to tracker: {}", path.display());
        self.upload("weights", path, &[])
    }

    fn finish(&mut self) -> Result<()> {
        self.post_event(&json!({ "type": "finish" }))
    }
}

/// One parsed trainer progress line
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub step: usize,
    pub total: usize,
    pub values: BTreeMap<String, f64>,
}

/// Parse a progress bar line like `name:  10%|#   | 100/1000 [01:23<12:34, lr: 4e-04 loss: 3.5e-01]`
pub fn parse_progress(line: &str) -> Option<Progress> {
    let caps = STEP_PATTERN.captures(line)?;
    let step = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;

    let values = METRIC_PATTERN
        .captures_iter(line)
        .filter_map(|c| Some((c[1].to_string(), c[2].parse::<f64>().ok()?)))
        .collect();

    Some(Progress { step, total, values })
}

/// Turns trainer output and job-dir changes into tracker calls
pub struct RunObserver {
    tracker: Option<Box<dyn Tracker>>,
    job_name: String,
    total_steps: usize,
    job_dir: PathBuf,
    samples_dir: PathBuf,
    final_lora: PathBuf,
    step: usize,
    seen_samples: BTreeSet<PathBuf>,
    seen_checkpoints: HashMap<PathBuf, SystemTime>,
}

impl RunObserver {
    /// Observer for a job training `total_steps` steps
    pub fn new(settings: &Settings, total_steps: usize, tracker: Option<Box<dyn Tracker>>) -> Self {
        Self {
            tracker,
            job_name: settings.job_name.clone(),
            total_steps,
            job_dir: settings.job_dir(),
            samples_dir: settings.samples_dir(),
            final_lora: settings.trainer_lora_path(),
            step: 0,
            seen_samples: BTreeSet::new(),
            seen_checkpoints: HashMap::new(),
        }
    }

    /// Observer that only follows progress
    pub fn untracked(settings: &Settings, total_steps: usize) -> Self {
        Self::new(settings, total_steps, None)
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Whether a bar tracks training rather than latent caching or sampling.
    /// The trainer labels its bar with the job name.
    fn is_training_bar(&self, line: &str, progress: &Progress) -> bool {
        progress.total == self.total_steps
            || line
                .trim_start()
                .strip_prefix(self.job_name.as_str())
                .map_or(false, |rest| rest.starts_with(':'))
    }

    /// Feed one line of trainer output. Returns the parsed progress of the
    /// training bar; other bars and plain output give `None`.
    pub fn observe_line(&mut self, line: &str) -> Option<Progress> {
        let progress = parse_progress(line)?;
        if !self.is_training_bar(line, &progress) {
            debug!("Ignoring progress of {}/{}: not the training bar", progress.step, progress.total);
            return None;
        }
        if progress.step <= self.step && self.step != 0 {
            return Some(progress);
        }

        self.step = progress.step;
        if !progress.values.is_empty() {
            let step = self.step;
            self.with_tracker("log loss", |t| t.log_loss(step, &progress.values));
        }
        self.poll_outputs();
        Some(progress)
    }

    /// Report samples and checkpoints that appeared since the last poll
    pub fn poll_outputs(&mut self) {
        if self.tracker.is_none() {
            return;
        }

        let new_samples = self.new_samples();
        if !new_samples.is_empty() {
            let step = self.step;
            self.with_tracker("log samples", |t| t.log_samples(step, &new_samples));
        }

        if let Some(checkpoint) = self.changed_checkpoint() {
            self.with_tracker("save weights", |t| t.save_weights(&checkpoint));
        }
    }

    /// Last poll, then close the tracked run
    pub fn finish(&mut self) {
        self.poll_outputs();
        self.with_tracker("finish run", |t| t.finish());
    }

    fn with_tracker(&mut self, action: &str, f: impl FnOnce(&mut dyn Tracker) -> Result<()>) {
        if let Some(tracker) = self.tracker.as_mut() {
            if let Err(e) = f(tracker.as_mut()) {
                warn!("Tracker failed to {}: {}", action, e);
            }
        }
    }

    fn new_samples(&mut self) -> Vec<PathBuf> {
        let all = match list_files(&self.samples_dir, "jpg") {
            Ok(files) => files,
            Err(e) => {
                debug!("No samples yet: {}", e);
                return Vec::new();
            }
        };
        let new: Vec<PathBuf> = all
            .iter()
            .filter(|p| !self.seen_samples.contains(*p))
            .cloned()
            .collect();
        self.seen_samples.extend(all);
        new
    }

    /// The checkpoint to upload when any `*.safetensors` was written since the
    /// last poll: the final checkpoint if present, else the newest step save
    fn changed_checkpoint(&mut self) -> Option<PathBuf> {
        let files = list_files(&self.job_dir, "safetensors").ok()?;
        let mut changed = false;
        for file in &files {
            let modified = fs::metadata(file).and_then(|m| m.modified()).ok()?;
            if self.seen_checkpoints.insert(file.clone(), modified) != Some(modified) {
                changed = true;
            }
        }

        if !changed {
            return None;
        }
        if self.final_lora.exists() {
            Some(self.final_lora.clone())
        } else {
            files.last().cloned()
        }
    }
}

fn list_files(dir: &Path, ext: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == ext) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingTracker;
    use super::*;
    use crate::error::ErrorKind;
    use mockito::Matcher;

    fn run_info() -> RunInfo {
        RunInfo {
            project: "flux".to_string(),
            entity: Some("team".to_string()),
            name: Some("run-1".to_string()),
            config: json!({ "steps": 1000 }),
            sample_prompts: vec!["TOK on a beach".to_string()],
        }
    }

    #[test]
    fn test_parse_progress_line() {
        let line = "flux_train_replicate:  10%|#         | 100/1000 [01:23<12:34,  1.19it/s, lr: 4.0e-04 loss: 3.512e-01]";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.step, 100);
        assert_eq!(progress.total, 1000);
        assert_eq!(progress.values["loss"], 0.3512);
        assert_eq!(progress.values["lr"], 0.0004);

        assert!(parse_progress("Loading transformer").is_none());
        assert_eq!(parse_progress("  0%|          | 0/1000 [00:00<?, ?it/s]").unwrap().values.len(), 0);
    }

    #[test]
    fn test_prompt_for_sample() {
        let prompts = vec!["TOK on a beach".to_string(), "TOK in snow".to_string()];
        assert_eq!(
            prompt_for_sample(Path::new("1724000000__000000100_1.jpg"), &prompts),
            Some("TOK in snow")
        );
        assert_eq!(prompt_for_sample(Path::new("1724000000__000000100_5.jpg"), &prompts), None);
    }

    #[test]
    fn test_run_info_defaults_project_to_job_name() {
        let inputs = TrainingInputs {
            pretrained_lora_url: Some("https://huggingface.co/a/b/resolve/main/x.safetensors".into()),
            ..Default::default()
        };
        let info = RunInfo::from_inputs(&inputs, &Settings::default());
        assert_eq!(info.project, "flux_train_replicate");
        assert_eq!(info.config["is_fine_tuning_mode"], true);
        assert_eq!(info.config["steps"], 1000);
    }

    #[test]
    fn test_observer_forwards_progress_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        fs::create_dir_all(settings.samples_dir()).unwrap();

        let tracker = RecordingTracker::default();
        let calls = tracker.calls.clone();
        let mut observer = RunObserver::new(&settings, 1000, Some(Box::new(tracker)));

        assert!(observer.observe_line("Loading model").is_none());
        observer.observe_line(" 5%| | 50/1000 [00:10<03:10, lr: 4e-04 loss: 0.5]");
        // Repeated redraw of the same step is not logged again
        observer.observe_line(" 5%| | 50/1000 [00:10<03:10, lr: 4e-04 loss: 0.5]");

        fs::write(settings.samples_dir().join("1__000000100_0.jpg"), b"jpg").unwrap();
        fs::write(
            settings.job_dir().join("flux_train_replicate_000000100.safetensors"),
            b"step",
        )
        .unwrap();
        observer.observe_line("10%| | 100/1000 [00:20<03:00, lr: 4e-04 loss: 0.25]");
        observer.finish();

        assert_eq!(
            *calls.borrow(),
            vec![
                "loss 50 0.5",
                "loss 100 0.25",
                "sample 100 1__000000100_0.jpg",
                "weights flux_train_replicate_000000100.safetensors",
                "finish",
            ]
        );
        assert_eq!(observer.step(), 100);
    }

    #[test]
    fn test_observer_prefers_final_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        fs::create_dir_all(settings.job_dir()).unwrap();
        fs::write(settings.job_dir().join("flux_train_replicate_000000999.safetensors"), b"a").unwrap();
        fs::write(settings.trainer_lora_path(), b"final").unwrap();

        let tracker = RecordingTracker::default();
        let calls = tracker.calls.clone();
        let mut observer = RunObserver::new(&settings, 1000, Some(Box::new(tracker)));
        observer.finish();

        assert_eq!(
            *calls.borrow(),
            vec!["weights flux_train_replicate.safetensors", "finish"]
        );
    }

    #[test]
    fn test_untracked_observer_still_counts_steps() {
        let mut observer = RunObserver::untracked(&Settings::default(), 10);
        observer.observe_line("3/10 [00:01<00:02]");
        observer.finish();
        assert_eq!(observer.step(), 3);
    }

    #[test]
    fn test_caching_and_sampling_bars_do_not_advance_training() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());

        let tracker = RecordingTracker::default();
        let calls = tracker.calls.clone();
        let mut observer = RunObserver::new(&settings, 1000, Some(Box::new(tracker)));

        assert!(observer
            .observe_line("Caching latents to disk: 100%|##########| 20/20 [00:05<00:00,  3.91it/s]")
            .is_none());
        assert_eq!(observer.step(), 0);

        let first = observer
            .observe_line("flux_train_replicate:   0%|   | 5/1000 [00:04<13:02, lr: 4.0e-04 loss: 5.0e-01]")
            .unwrap();
        assert_eq!(first.total, 1000);
        assert!(observer
            .observe_line("Generating Images: 100%|##########| 2/2 [00:09<00:00,  4.50s/it]")
            .is_none());
        observer.observe_line("flux_train_replicate:   2%|   | 19/1000 [00:15<12:50, lr: 4.0e-04 loss: 4.0e-01]");

        assert_eq!(*calls.borrow(), vec!["loss 5 0.5", "loss 19 0.4"]);
        assert_eq!(observer.step(), 19);
    }

    #[test]
    fn test_bar_labelled_with_job_name_counts_regardless_of_total() {
        let mut observer = RunObserver::untracked(&Settings::default(), 1000);
        let progress = observer
            .observe_line("flux_train_replicate:  50%|#####     | 600/1200 [05:00<05:00, loss: 0.2]")
            .unwrap();
        assert_eq!(progress.total, 1200);
        assert_eq!(observer.step(), 600);

        assert!(observer.observe_line("flux_train_replicate_v2: 1/3 [00:01<00:02]").is_none());
    }

    #[test]
    fn test_http_tracker_posts_authorized_events() {
        let mut server = mockito::Server::new();
        let start = server
            .mock("POST", "/runs/run-1/events")
            .match_header("authorization", "Bearer tracking-key")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "type": "start",
                "project": "flux",
                "entity": "team",
                "name": "run-1",
                "config": { "steps": 1000 },
            })))
            .with_status(200)
            .create();
        let loss = server
            .mock("POST", "/runs/run-1/events")
            .match_header("authorization", "Bearer tracking-key")
            .match_body(Matcher::Json(json!({
                "type": "loss",
                "step": 50,
                "values": { "loss": 0.5, "lr": 0.0004 },
            })))
            .with_status(200)
            .create();
        let finish = server
            .mock("POST", "/runs/run-1/events")
            .match_body(Matcher::Json(json!({ "type": "finish" })))
            .with_status(204)
            .create();

        let mut tracker = HttpTracker::start(&format!("{}/", server.url()), "tracking-key", &run_info()).unwrap();
        let values = BTreeMap::from([("loss".to_string(), 0.5), ("lr".to_string(), 0.0004)]);
        tracker.log_loss(50, &values).unwrap();
        tracker.finish().unwrap();

        start.assert();
        loss.assert();
        finish.assert();
    }

    #[test]
    fn test_http_tracker_uploads_samples_as_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let sample = dir.path().join("1724000000__000000100_0.jpg");
        fs::write(&sample, b"jpg bytes").unwrap();

        let mut server = mockito::Server::new();
        server.mock("POST", "/runs/run-1/events").with_status(200).create();
        let upload = server
            .mock("POST", "/runs/run-1/files")
            .match_header("authorization", "Bearer tracking-key")
            .match_header("content-type", Matcher::Regex("^multipart/form-data; boundary=".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="kind"\s+sample"#.to_string()),
                Matcher::Regex(r#"name="step"\s+100"#.to_string()),
                Matcher::Regex(r#"name="caption"\s+TOK on a beach"#.to_string()),
                Matcher::Regex(r#"name="file"; filename="1724000000__000000100_0.jpg""#.to_string()),
                Matcher::Regex("jpg bytes".to_string()),
            ]))
            .with_status(201)
            .create();

        let mut tracker = HttpTracker::start(&server.url(), "tracking-key", &run_info()).unwrap();
        tracker.log_samples(100, &[sample]).unwrap();
        upload.assert();
    }

    #[test]
    fn test_http_tracker_surfaces_error_status() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/runs/run-1/events")
            .with_status(401)
            .with_body("invalid api key")
            .create();

        let err = HttpTracker::start(&server.url(), "wrong", &run_info()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
        assert!(err.to_string().contains("HTTP 401"), "{}", err);
        assert!(err.to_string().contains("invalid api key"), "{}", err);

        let mut server = mockito::Server::new();
        server
            .mock("POST", "/runs/run-1/events")
            .match_body(Matcher::PartialJson(json!({ "type": "start" })))
            .with_status(200)
            .create();
        server.mock("POST", "/runs/run-1/files").with_status(503).create();

        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("flux_train_replicate.safetensors");
        fs::write(&weights, b"lora").unwrap();
        let mut tracker = HttpTracker::start(&server.url(), "key", &run_info()).unwrap();
        let err = tracker.save_weights(&weights).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    }
}
