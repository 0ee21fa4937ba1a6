use std::{
    env::var,
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    api::ApiClient,
    manifest::sync::DEFAULT_PAGE_SIZE,
    transfer::retry::RetryPolicy,
    Result, SyncError,
};

pub const CONFIG_FILE_NAME: &str = "assetsync.toml";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_B2_API_URL: &str = "https://api.backblazeb2.com";
pub const LEDGER_FILE_NAME: &str = "upload_history.db";

/// `assetsync.toml` as written by users. Every field is optional so the
/// environment can fill the gaps.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SyncConfigFile {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub project_name: Option<String>,
    pub branch_name: Option<String>,
    pub projects_root: Option<PathBuf>,
    pub page_size: Option<usize>,
    pub download_concurrency: Option<usize>,
    pub upload_concurrency: Option<usize>,
    pub processing_concurrency: Option<usize>,
    pub ledger_path: Option<PathBuf>,
    pub retry: Option<RetryConfigFile>,
    pub cdn: Option<CdnConfigFile>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RetryConfigFile {
    pub file_attempts: Option<u32>,
    pub file_delay_ms: Option<u64>,
    pub batch_attempts: Option<u32>,
    pub batch_delay_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CdnConfigFile {
    pub api_url: Option<String>,
    pub key_id: Option<String>,
    pub application_key: Option<String>,
    pub bucket_id: Option<String>,
    pub bucket_name: Option<String>,
    pub cdn_base_url: Option<String>,
    pub skip_existing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CdnConfig {
    pub api_url: String,
    pub key_id: String,
    pub application_key: String,
    pub bucket_id: String,
    pub bucket_name: String,
    pub cdn_base_url: Option<String>,
    pub skip_existing: bool,
}

/// Resolved settings, passed by value into the services that need them.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub project_name: Option<String>,
    pub branch_name: String,
    pub projects_root: PathBuf,
    pub page_size: usize,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    pub processing_concurrency: usize,
    pub ledger_path: PathBuf,
    pub file_retry: RetryPolicy,
    pub batch_retry: RetryPolicy,
    pub cdn: Option<CdnConfig>,
}

impl SyncConfig {
    /// Reads `assetsync.toml` (or the file named by `ASSETSYNC_CONFIG_PATH`)
    /// and applies environment overrides. A missing file is fine as long as
    /// the environment supplies what is required.
    pub fn load() -> Result<Self> {
        let path = var("ASSETSYNC_CONFIG_PATH").unwrap_or(CONFIG_FILE_NAME.to_string());
        let file = read_config_file(Path::new(&path))?;
        Self::from_sources(file.unwrap_or_default(), |key| var(key).ok())
    }

    /// Merges a parsed file with an environment lookup; the environment wins.
    pub fn from_sources(file: SyncConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let projects_root = env("ASSETSYNC_PROJECTS_ROOT")
            .map(PathBuf::from)
            .or(file.projects_root)
            .ok_or_else(|| SyncError::Config("projects_root is not set".to_string()))?;
        let ledger_path = file
            .ledger_path
            .unwrap_or_else(|| projects_root.join(LEDGER_FILE_NAME));

        let retry = file.retry.unwrap_or_default();
        let file_retry = policy(
            RetryPolicy::file_transfer(),
            retry.file_attempts,
            retry.file_delay_ms,
        );
        let batch_retry = policy(RetryPolicy::batch(), retry.batch_attempts, retry.batch_delay_ms);

        let cdn = match file.cdn {
            Some(cdn) => Some(cdn_config(cdn, &env)?),
            None => match (env("ASSETSYNC_CDN_KEY_ID"), env("ASSETSYNC_CDN_APPLICATION_KEY")) {
                (Some(_), Some(_)) => Some(cdn_config(CdnConfigFile::default(), &env)?),
                _ => None,
            },
        };

        let config = SyncConfig {
            api_url: env("ASSETSYNC_API_URL").or(file.api_url),
            api_key: env("ASSETSYNC_API_KEY").or(file.api_key),
            username: file.username,
            project_name: file.project_name,
            branch_name: file.branch_name.unwrap_or(DEFAULT_BRANCH.to_string()),
            projects_root,
            page_size: file.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            download_concurrency: file.download_concurrency.unwrap_or(16),
            upload_concurrency: file.upload_concurrency.unwrap_or(8),
            processing_concurrency: file.processing_concurrency.unwrap_or(4),
            ledger_path,
            file_retry,
            batch_retry,
            cdn,
        };
        config.validate()?;
        debug!("Loaded configuration: projects root {}", config.projects_root.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.projects_root.as_os_str().is_empty() {
            return Err(SyncError::Config("projects_root is empty".to_string()));
        }
        if let Some(api_url) = &self.api_url {
            url::Url::parse(api_url)
                .map_err(|err| SyncError::Config(format!("api_url {:?} is invalid: {}", api_url, err)))?;
        }
        for (name, value) in [
            ("page_size", self.page_size),
            ("download_concurrency", self.download_concurrency),
            ("upload_concurrency", self.upload_concurrency),
            ("processing_concurrency", self.processing_concurrency),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// An API client built from `api_url` and `api_key`, both of which are
    /// required for anything that talks to the project-hosting API.
    pub fn api_client(&self) -> Result<ApiClient> {
        let api_url = self
            .api_url
            .as_deref()
            .ok_or_else(|| SyncError::Config("api_url is not set".to_string()))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SyncError::Config("api_key is not set".to_string()))?;
        ApiClient::new(api_url, api_key)
    }

    /// The API base URL without the key, for work that only needs to
    /// rebuild download URLs.
    pub fn require_api_url(&self) -> Result<&str> {
        self.api_url
            .as_deref()
            .map(|x| x.trim_end_matches('/'))
            .ok_or_else(|| SyncError::Config("api_url is not set".to_string()))
    }

    pub fn require_project(&self) -> Result<&str> {
        self.project_name
            .as_deref()
            .ok_or_else(|| SyncError::Config("project_name is not set".to_string()))
    }

    pub fn require_cdn(&self) -> Result<&CdnConfig> {
        self.cdn
            .as_ref()
            .ok_or_else(|| SyncError::Config("the [cdn] section is not set".to_string()))
    }
}

fn read_config_file(path: &Path) -> Result<Option<SyncConfigFile>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    toml::from_str(&text)
        .map(Some)
        .map_err(|err| SyncError::Config(format!("{} is invalid: {}", path.display(), err)))
}

fn policy(default: RetryPolicy, attempts: Option<u32>, delay_ms: Option<u64>) -> RetryPolicy {
    RetryPolicy {
        max_attempts: attempts.unwrap_or(default.max_attempts).max(1),
        base_delay: delay_ms.map(Duration::from_millis).unwrap_or(default.base_delay),
        backoff: default.backoff,
    }
}

fn cdn_config(file: CdnConfigFile, env: &impl Fn(&str) -> Option<String>) -> Result<CdnConfig> {
    let required = |value: Option<String>, name: &str| {
        value
            .filter(|x| !x.trim().is_empty())
            .ok_or_else(|| SyncError::Config(format!("cdn.{} is not set", name)))
    };
    Ok(CdnConfig {
        api_url: file.api_url.unwrap_or(DEFAULT_B2_API_URL.to_string()),
        key_id: required(env("ASSETSYNC_CDN_KEY_ID").or(file.key_id), "key_id")?,
        application_key: required(
            env("ASSETSYNC_CDN_APPLICATION_KEY").or(file.application_key),
            "application_key",
        )?,
        bucket_id: required(file.bucket_id, "bucket_id")?,
        bucket_name: required(file.bucket_name, "bucket_name")?,
        cdn_base_url: file.cdn_base_url.map(|x| x.trim_end_matches('/').to_string()),
        skip_existing: file.skip_existing.unwrap_or(false),
    })
}
