use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UploadStatus;

/// One attempt to push a local file to the CDN. Records are only ever
/// appended; a later success does not rewrite an earlier failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub content_hash: String,
    pub content_length: u64,
    pub uploaded_at: DateTime<Utc>,
    pub cdn_url: Option<String>,
    pub status: UploadStatus,
    pub remote_file_id: Option<String>,
    pub project_name: String,
    pub error_message: Option<String>,
}

impl UploadRecord {
    pub fn succeeded(
        local_path: &Path,
        remote_path: &str,
        content_hash: &str,
        content_length: u64,
        cdn_url: Option<String>,
        remote_file_id: Option<String>,
        project_name: &str,
    ) -> Self {
        UploadRecord {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            content_hash: content_hash.to_string(),
            content_length,
            uploaded_at: Utc::now(),
            cdn_url,
            status: UploadStatus::Uploaded,
            remote_file_id,
            project_name: project_name.to_string(),
            error_message: None,
        }
    }

    pub fn failed(
        local_path: &Path,
        remote_path: &str,
        content_hash: &str,
        content_length: u64,
        project_name: &str,
        error_message: impl Into<String>,
    ) -> Self {
        UploadRecord {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            content_hash: content_hash.to_string(),
            content_length,
            uploaded_at: Utc::now(),
            cdn_url: None,
            status: UploadStatus::Failed,
            remote_file_id: None,
            project_name: project_name.to_string(),
            error_message: Some(error_message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Uploaded
    }
}
