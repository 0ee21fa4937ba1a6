use serde::{Deserialize, Serialize};

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod models;
pub mod transfer;
pub mod watcher;

pub use error::{Result, SyncError};

pub trait StrConversion {
    fn from_str(value: &str) -> Self;
    fn as_str(&self) -> &'static str;
}

/// Transfer status of a tracked resource.
///
/// Parsing is case-insensitive and never fails: strings this crate does not
/// know become [`ResourceStatus::Unknown`], which is neither downloadable nor
/// uploadable.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
#[serde(from = "String", into = "String")]
pub enum ResourceStatus {
    #[default]
    Unset,
    OnServer,
    Downloading,
    Downloaded,
    EmptyFile,
    Corrupted,
    SizeMismatch,
    Error,
    Missing,
    HashError,
    Ready,
    Queued,
    Uploading,
    Uploaded,
    UploadFailed,
    Outdated,
    Unknown,
}

impl ResourceStatus {
    /// Whether a resource in this status belongs in the next download pass.
    pub fn is_downloadable(&self) -> bool {
        matches!(
            self,
            Self::Unset
                | Self::OnServer
                | Self::Missing
                | Self::Error
                | Self::SizeMismatch
                | Self::Corrupted
                | Self::EmptyFile
                | Self::HashError
                | Self::Ready
        )
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.as_str())
    }
}

impl StrConversion for ResourceStatus {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Self::Unset,
            "on server" => Self::OnServer,
            "downloading" => Self::Downloading,
            "downloaded" => Self::Downloaded,
            "empty file" => Self::EmptyFile,
            "corrupted" => Self::Corrupted,
            "size mismatch" => Self::SizeMismatch,
            "error" => Self::Error,
            "missing" => Self::Missing,
            "hash error" => Self::HashError,
            "ready" => Self::Ready,
            "queued" => Self::Queued,
            "uploading" => Self::Uploading,
            "uploaded" => Self::Uploaded,
            "upload failed" => Self::UploadFailed,
            "outdated" => Self::Outdated,
            _ => Self::Unknown,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::OnServer => "On Server",
            Self::Downloading => "Downloading",
            Self::Downloaded => "Downloaded",
            Self::EmptyFile => "Empty File",
            Self::Corrupted => "Corrupted",
            Self::SizeMismatch => "Size Mismatch",
            Self::Error => "Error",
            Self::Missing => "Missing",
            Self::HashError => "Hash ERROR",
            Self::Ready => "Ready",
            Self::Queued => "Queued",
            Self::Uploading => "Uploading",
            Self::Uploaded => "Uploaded",
            Self::UploadFailed => "Upload Failed",
            Self::Outdated => "Outdated",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<String> for ResourceStatus {
    fn from(value: String) -> Self {
        <Self as StrConversion>::from_str(&value)
    }
}

impl From<ResourceStatus> for String {
    fn from(value: ResourceStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Whether a raw status string (as shown to users or stored by other tools)
/// marks a resource as needing download.
pub fn is_downloadable_status(status: &str) -> bool {
    <ResourceStatus as StrConversion>::from_str(status).is_downloadable()
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum UploadStatus {
    Uploaded,
    Failed,
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.as_str())
    }
}

impl StrConversion for UploadStatus {
    fn from_str(value: &str) -> Self {
        match value {
            "Uploaded" => Self::Uploaded,
            _ => Self::Failed,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "Uploaded",
            Self::Failed => "Failed",
        }
    }
}
