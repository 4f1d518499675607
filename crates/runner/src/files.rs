use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const UPLOAD_PATH: &str = "/api/v1/file/upload";

/// A file produced by a run, held in memory so it outlives the scratch dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Diffs a directory tree against a snapshot taken before the run.
#[derive(Debug)]
pub struct FileCollector {
    root: PathBuf,
    ignored: &'static [&'static str],
    before: BTreeSet<PathBuf>,
}

impl FileCollector {
    pub fn start(root: &Path, ignored: &'static [&'static str]) -> io::Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            ignored,
            before: walk(root, ignored)?,
        })
    }

    pub fn collect(self) -> io::Result<Vec<CollectedFile>> {
        let mut files = Vec::new();
        for path in walk(&self.root, self.ignored)? {
            if self.before.contains(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            files.push(CollectedFile {
                name,
                contents: std::fs::read(&path)?,
            });
        }
        Ok(files)
    }
}

/// Regular files under `root`, skipping `ignored` top-level directories.
fn walk(root: &Path, ignored: &[&str]) -> io::Result<BTreeSet<PathBuf>> {
    let mut found = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                let skip = dir == root
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| ignored.contains(&name));
                if !skip {
                    pending.push(path);
                }
            } else {
                found.insert(path);
            }
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(default)]
    pub extension: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("file service answered {0}, expected 201")]
    UnexpectedStatus(StatusCode),
}

/// Client for the file service that publishes produced files.
pub struct Uploader {
    client: reqwest::Client,
    endpoint: String,
}

impl Uploader {
    pub fn new(base_url: &str) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: upload_endpoint(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn upload(
        &self,
        files: &[CollectedFile],
        request_id: Option<&str>,
    ) -> Result<Vec<UploadedFile>, UploadError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = files.len(), request_id, "uploading files");
        let form = files
            .iter()
            .enumerate()
            .fold(Form::new(), |form, (index, file)| {
                let part = Part::bytes(file.contents.clone()).file_name(file.name.clone());
                form.part(format!("file-{index}"), part)
            });

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(request_id) = request_id {
            request = request.header("x-request-id", request_id);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(UploadError::UnexpectedStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}

fn upload_endpoint(base_url: &str) -> String {
    format!("{}{UPLOAD_PATH}", base_url.trim_end_matches('/'))
}
