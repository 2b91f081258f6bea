//! HuggingFace Hub upload of a finished job directory
//!
//! Uses the Hub REST API directly:
//! `POST {api}/repos/create` then `PUT {api}/models/{repo_id}/upload/main/{path}`
//! for each file.

use crate::error::{IoContext, Result, TrainError};
use log::info;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories that stay out of the published repo
const EXCLUDED_DIRS: &[&str] = &["captions"];

#[derive(Debug, Clone, PartialEq)]
pub struct PublishResult {
    pub repo_url: String,
    pub files_uploaded: usize,
}

pub struct HubPublisher {
    client: reqwest::blocking::Client,
    api_base: String,
    repo_id: String,
    token: String,
}

/// Accept `owner/name` repo ids
pub fn validate_repo_id(repo_id: &str) -> Result<()> {
    let mut parts = repo_id.split('/');
    let valid = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
    );
    if !valid {
        return Err(TrainError::invalid(format!(
            "Invalid HuggingFace repo id '{}': expected owner/name",
            repo_id
        )));
    }
    Ok(())
}

/// Files to upload from `dir` paired with their path in the repo
pub fn repo_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir).sort_by_file_name().into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry.depth() == 1
            && EXCLUDED_DIRS.iter().any(|d| entry.file_name() == *d))
    });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            match e.into_io_error() {
                Some(io) => TrainError::io(path, io),
                None => TrainError::runtime(format!("Failed to walk {}", path.display())),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let in_repo = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), in_repo));
    }
    Ok(files)
}

impl HubPublisher {
    pub fn new(api_base: &str, repo_id: &str, token: &str) -> Result<Self> {
        validate_repo_id(repo_id)?;

        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("fluxtrain/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo_id: repo_id.to_string(),
            token: token.to_string(),
        })
    }

    /// Create the public model repo. An existing repo is fine.
    pub fn create_repo(&self) -> Result<String> {
        let (owner, name) = self.repo_id.split_once('/').unwrap_or(("", self.repo_id.as_str()));
        let mut body = serde_json::json!({
            "name": name,
            "type": "model",
            "private": false,
        });
        if !owner.is_empty() {
            body["organization"] = serde_json::Value::String(owner.to_string());
        }

        let response = self
            .client
            .post(format!("{}/repos/create", self.api_base))
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;

        // 409 = already exists
        if response.status().is_success() || response.status().as_u16() == 409 {
            Ok(format!("https://huggingface.co/{}", self.repo_id))
        } else {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            Err(TrainError::runtime(format!(
                "Failed to create repo {}: HTTP {}: {}",
                self.repo_id, status, body
            )))
        }
    }

    pub fn upload_file(&self, local_path: &Path, path_in_repo: &str) -> Result<()> {
        let content = std::fs::read(local_path).at(local_path)?;
        let response = self
            .client
            .put(format!(
                "{}/models/{}/upload/main/{}",
                self.api_base, self.repo_id, path_in_repo
            ))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            Err(TrainError::runtime(format!(
                "Failed to upload {}: HTTP {}: {}",
                path_in_repo, status, body
            )))
        }
    }

    /// Create the repo and upload every publishable file under `dir`
    pub fn publish_dir(&self, dir: &Path) -> Result<PublishResult> {
        let repo_url = self.create_repo()?;
        let files = repo_files(dir)?;

        for (local, in_repo) in &files {
            info!("Uploading {}", in_repo);
            self.upload_file(local, in_repo)?;
        }

        Ok(PublishResult {
            repo_url,
            files_uploaded: files.len(),
        })
    }
}

impl std::fmt::Debug for HubPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubPublisher")
            .field("api_base", &self.api_base)
            .field("repo_id", &self.repo_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;

    #[test]
    fn test_validate_repo_id() {
        validate_repo_id("lucataco/flux-dev-lora").unwrap();
        for bad in ["", "no-slash", "/name", "owner/", "a/b/c"] {
            assert_eq!(validate_repo_id(bad).unwrap_err().kind(), ErrorKind::InvalidArgument, "{}", bad);
        }
    }

    #[test]
    fn test_repo_files_skip_captions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("captions")).unwrap();
        fs::create_dir_all(dir.path().join("extra")).unwrap();
        fs::write(dir.path().join("captions/a.txt"), b"caption").unwrap();
        fs::write(dir.path().join("lora.safetensors"), b"lora").unwrap();
        fs::write(dir.path().join("README.md"), b"# card").unwrap();
        fs::write(dir.path().join("extra/config.yaml"), b"job: x").unwrap();

        let names: Vec<String> = repo_files(dir.path()).unwrap().into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["README.md", "extra/config.yaml", "lora.safetensors"]);
    }

    #[test]
    fn test_publisher_rejects_bad_repo_before_network() {
        let err = HubPublisher::new("https://huggingface.co/api", "nope", "token").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_publish_dir_accepts_existing_repo() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("captions")).unwrap();
        fs::write(dir.path().join("captions/a.txt"), b"caption").unwrap();
        fs::write(dir.path().join("lora.safetensors"), b"lora bytes").unwrap();

        let mut server = mockito::Server::new();
        let create = server
            .mock("POST", "/repos/create")
            .match_header("authorization", "Bearer hf_token")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "name": "flux-lora",
                "type": "model",
                "private": false,
                "organization": "owner",
            })))
            .with_status(409)
            .with_body("You already created this model repo")
            .create();
        let upload = server
            .mock("PUT", "/models/owner/flux-lora/upload/main/lora.safetensors")
            .match_header("authorization", "Bearer hf_token")
            .match_header("content-type", "application/octet-stream")
            .match_body("lora bytes")
            .with_status(200)
            .create();

        let publisher = HubPublisher::new(&server.url(), "owner/flux-lora", "hf_token").unwrap();
        let result = publisher.publish_dir(dir.path()).unwrap();

        assert_eq!(result.repo_url, "https://huggingface.co/owner/flux-lora");
        assert_eq!(result.files_uploaded, 1);
        create.assert();
        upload.assert();
    }

    #[test]
    fn test_publish_failures_are_runtime_failures() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lora.safetensors"), b"lora").unwrap();

        let mut server = mockito::Server::new();
        server.mock("POST", "/repos/create").with_status(201).create();
        server
            .mock("PUT", "/models/owner/flux-lora/upload/main/lora.safetensors")
            .with_status(500)
            .with_body("storage unavailable")
            .create();

        let publisher = HubPublisher::new(&server.url(), "owner/flux-lora", "hf_token").unwrap();
        let err = publisher.publish_dir(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
        assert!(err.to_string().contains("HTTP 500"), "{}", err);
        assert!(err.to_string().contains("storage unavailable"), "{}", err);

        let mut server = mockito::Server::new();
        server.mock("POST", "/repos/create").with_status(401).create();
        let publisher = HubPublisher::new(&server.url(), "owner/flux-lora", "bad").unwrap();
        let err = publisher.create_repo().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
        assert!(err.to_string().starts_with("Failed to create repo owner/flux-lora"), "{}", err);
    }
}
