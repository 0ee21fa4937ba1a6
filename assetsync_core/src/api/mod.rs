use serde::{Deserialize, Serialize};

pub mod client;

pub use client::ApiClient;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Hash, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AssetId(pub i64);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Hash, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Hash, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Hash, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl std::fmt::Display for AssetId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

// Users
#[derive(Serialize, Deserialize, Debug)]
pub struct UserResponse {
    pub id: UserId,
}

/// Envelope used by every list endpoint.
#[derive(Serialize, Deserialize, Debug)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub result: Vec<T>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BranchSummary {
    pub id: BranchId,
    pub name: String,
}

// Assets
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssetSummary {
    pub id: AssetId,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub name: String,
    #[serde(default)]
    pub path: Vec<AssetId>,
    #[serde(default)]
    pub parent: Option<AssetId>,
    #[serde(default)]
    pub file: Option<AssetFile>,
}

impl AssetSummary {
    pub fn is_folder(&self) -> bool {
        self.asset_type == "folder"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AssetFile {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}
