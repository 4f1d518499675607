use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Java,
    Python,
    CSharp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::Java,
        Language::Python,
        Language::CSharp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Java => "java",
            Self::Python => "python",
            Self::CSharp => "csharp",
        }
    }

    /// Suffix used for per-language environment overrides, e.g. `WORKER_COUNT_PYTHON`.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Self::JavaScript => "JAVASCRIPT",
            Self::Java => "JAVA",
            Self::Python => "PYTHON",
            Self::CSharp => "CSHARP",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Language::ALL
            .into_iter()
            .find(|language| language.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownLanguage(value.to_owned()))
    }
}

/// Worker identity. Also the correlation id of its job and the suffix of its job queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for WorkerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn job_queue_name(worker_id: &WorkerId) -> String {
    format!("job-queue-{worker_id}")
}

/// Shared reply queue for one pool. Unique per process so replicas never share replies.
pub fn reply_queue_name(language: Language) -> String {
    format!("reply-queue-{language}-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl JobMessage {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub extension: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

impl From<runner::UploadedFile> for FileRef {
    fn from(file: runner::UploadedFile) -> Self {
        Self {
            file_name: file.file_name,
            extension: file.extension,
            public_url: file.public_url,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<FileRef>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<FileRef>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parses_case_insensitively() {
        assert_eq!("Python".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" csharp ".parse::<Language>(), Ok(Language::CSharp));
        assert_eq!(
            "cobol".parse::<Language>(),
            Err(UnknownLanguage("cobol".to_owned()))
        );
    }

    #[test]
    fn language_serializes_lowercase() {
        let value = serde_json::to_value(Language::JavaScript).unwrap();
        assert_eq!(value, serde_json::json!("javascript"));
    }

    #[test]
    fn job_message_uses_camel_case_and_skips_missing_fields() {
        let mut job = JobMessage::new("print(1)");
        job.request_id = Some("req-1".to_owned());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "code": "print(1)", "requestId": "req-1" })
        );
    }

    #[test]
    fn result_message_tolerates_missing_and_null_fields() {
        let result: ResultMessage =
            serde_json::from_str(r#"{"success":true,"output":"hi","files":null}"#).unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hi");
        assert!(result.error.is_empty());
        assert!(result.files.is_empty());
    }

    #[test]
    fn file_ref_keeps_wire_names() {
        let file: FileRef = serde_json::from_str(
            r#"{"fileName":"shot.png","extension":".png","publicURL":"/f/shot.png?sig=1"}"#,
        )
        .unwrap();
        assert_eq!(file.file_name, "shot.png");
        assert_eq!(file.public_url, "/f/shot.png?sig=1");
    }

    #[test]
    fn queue_names_derive_from_identity() {
        let id = WorkerId::from("0f3a");
        assert_eq!(job_queue_name(&id), "job-queue-0f3a");
        assert!(reply_queue_name(Language::Java).starts_with("reply-queue-java-"));
        assert_ne!(WorkerId::generate(), WorkerId::generate());
    }
}
