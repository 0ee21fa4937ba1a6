use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::TryStreamExt;
use log::{debug, info, warn};
use reqwest::header::{self, HeaderValue};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::{io::ReaderStream, sync::CancellationToken};

use super::{
    hashing::{sha256_file, CHUNK_SIZE},
    pool::{PoolUpdate, TransferPool},
    retry::{retry, RetryPolicy},
};
use crate::{
    api::client::check_status,
    config::CdnConfig,
    events::{EventBus, SyncEvent},
    Result, SyncError,
};

/// Receives the upload percentage of a single file.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CdnUploadResult {
    pub success: bool,
    pub file_id: Option<String>,
    pub cdn_url: Option<String>,
    pub content_hash: String,
    pub content_length: u64,
    pub error_message: Option<String>,
    pub skipped: bool,
}

impl CdnUploadResult {
    pub fn failed(content_hash: String, content_length: u64, error_message: impl Into<String>) -> Self {
        CdnUploadResult {
            success: false,
            content_hash,
            content_length,
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }
}

/// Object storage the upload side publishes to.
///
/// Failures are reported inside [`CdnUploadResult`] rather than as errors so
/// that one file never aborts a batch.
pub trait CdnStore: Send + Sync + 'static {
    fn authorize(&self) -> impl Future<Output = Result<()>> + Send;

    fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressSink>,
        ct: &CancellationToken,
    ) -> impl Future<Output = CdnUploadResult> + Send;

    /// Removes every stored version of `remote_path`. `false` when nothing
    /// was deleted.
    fn delete_file(&self, remote_path: &str) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct CdnBatchResult {
    pub results: Vec<(PathBuf, String, CdnUploadResult)>,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CdnBatchResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Uploads `(local, remote)` pairs with at most `width` transfers in flight,
/// publishing per-file and aggregate progress.
pub async fn upload_batch<S: CdnStore>(
    store: Arc<S>,
    pairs: Vec<(PathBuf, String)>,
    width: usize,
    events: &EventBus,
    ct: &CancellationToken,
) -> CdnBatchResult {
    let total = pairs.len();
    let jobs = pairs
        .into_iter()
        .map(|(local, remote)| ((local.clone(), remote.clone()), (local, remote)))
        .collect::<Vec<_>>();

    let worker_events = events.clone();
    let worker_ct = ct.clone();
    let mut updates = TransferPool::new(width).spawn(jobs, ct, move |(local, remote): (PathBuf, String)| {
        let store = store.clone();
        let events = worker_events.clone();
        let ct = worker_ct.clone();
        async move {
            let sink_path = local.clone();
            let sink: ProgressSink = Arc::new(move |percent| {
                events.publish(SyncEvent::UploadProgress {
                    path: sink_path.clone(),
                    percent,
                })
            });
            store.upload_file(&local, &remote, Some(sink), &ct).await
        }
    });

    let mut batch = CdnBatchResult::default();
    while let Some(update) = updates.recv().await {
        if let PoolUpdate::Finished((local, remote), result) = update {
            match (result.success, result.skipped) {
                (true, true) => batch.skipped += 1,
                (true, false) => batch.uploaded += 1,
                (false, _) => {
                    warn!(
                        "Failed to upload {}: {}",
                        local.display(),
                        result.error_message.as_deref().unwrap_or("unknown error")
                    );
                    batch.failed += 1
                }
            }
            batch.results.push((local, remote, result));
            events.publish(SyncEvent::BatchProgress {
                completed: batch.results.len(),
                total,
            });
        }
    }
    batch
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct B2Authorization {
    authorization_token: String,
    api_url: String,
    download_url: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct B2File {
    file_id: String,
    file_name: String,
    #[serde(default)]
    file_info: HashMap<String, String>,
}

#[derive(Deserialize, Debug)]
struct FileList {
    files: Vec<B2File>,
}

/// Backblaze B2 native API client.
pub struct B2Client {
    client: reqwest::Client,
    config: CdnConfig,
    auth: Mutex<Option<B2Authorization>>,
    retry: RetryPolicy,
}

impl B2Client {
    pub fn new(config: CdnConfig) -> Self {
        B2Client {
            client: reqwest::Client::new(),
            config,
            auth: Mutex::new(None),
            retry: RetryPolicy::file_transfer(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn authorization(&self) -> Result<B2Authorization> {
        let mut auth = self.auth.lock().await;
        if let Some(auth) = auth.as_ref() {
            return Ok(auth.clone());
        }
        let response = self
            .client
            .get(format!("{}/b2api/v2/b2_authorize_account", self.config.api_url))
            .basic_auth(&self.config.key_id, Some(&self.config.application_key))
            .send()
            .await?;
        let fresh: B2Authorization = check_status(response)?.json().await?;
        info!("Authorized with B2 bucket {}", self.config.bucket_name);
        *auth = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops `stale` from the cache and authorizes again, unless another
    /// transfer already replaced it.
    async fn reauthorize(&self, stale: &B2Authorization) -> Result<B2Authorization> {
        {
            let mut auth = self.auth.lock().await;
            match auth.as_ref() {
                Some(current) if current.authorization_token != stale.authorization_token => {
                    return Ok(current.clone());
                }
                _ => *auth = None,
            }
        }
        warn!("B2 authorization was rejected, authorizing again");
        self.authorization().await
    }

    async fn call<T: DeserializeOwned>(&self, auth: &B2Authorization, operation: &str, body: Value) -> Result<T> {
        let response = self
            .client
            .post(format!("{}/b2api/v2/{}", auth.api_url, operation))
            .header(header::AUTHORIZATION, token_header(&auth.authorization_token)?)
            .json(&body)
            .send()
            .await?;
        Ok(check_status(response)?.json().await?)
    }

    fn cdn_url(&self, auth: &B2Authorization, remote_path: &str) -> String {
        match &self.config.cdn_base_url {
            Some(base) => format!("{}/{}", base, remote_path),
            None => format!(
                "{}/file/{}/{}",
                auth.download_url, self.config.bucket_name, remote_path
            ),
        }
    }

    async fn existing(&self, auth: &B2Authorization, remote_path: &str) -> Result<Option<B2File>> {
        let list: FileList = self
            .call(
                auth,
                "b2_list_file_names",
                json!({
                    "bucketId": self.config.bucket_id,
                    "startFileName": remote_path,
                    "prefix": remote_path,
                    "maxFileCount": 1,
                }),
            )
            .await?;
        Ok(list.files.into_iter().find(|x| x.file_name == remote_path))
    }

    async fn upload_retrying(
        &self,
        auth: &B2Authorization,
        local_path: &Path,
        remote_path: &str,
        content_hash: &str,
        content_length: u64,
        progress: &Option<ProgressSink>,
        ct: &CancellationToken,
    ) -> Result<B2File> {
        retry(&self.retry, ct, |_| {
            self.upload_once(
                auth,
                local_path,
                remote_path,
                content_hash,
                content_length,
                progress.clone(),
                ct,
            )
        })
        .await
    }

    async fn upload_once(
        &self,
        auth: &B2Authorization,
        local_path: &Path,
        remote_path: &str,
        content_hash: &str,
        content_length: u64,
        progress: Option<ProgressSink>,
        ct: &CancellationToken,
    ) -> Result<B2File> {
        // upload URLs are single-use per attempt
        let target: UploadTarget = self
            .call(auth, "b2_get_upload_url", json!({ "bucketId": self.config.bucket_id }))
            .await?;

        let file = tokio::fs::File::open(local_path).await?;
        let mut sent: u64 = 0;
        let mut last_percent = 0u8;
        let body = ReaderStream::with_capacity(file, CHUNK_SIZE).inspect_ok(move |chunk| {
            sent += chunk.len() as u64;
            let percent = match content_length {
                0 => 100,
                total => (sent.saturating_mul(100) / total).min(100) as u8,
            };
            if percent != last_percent {
                last_percent = percent;
                if let Some(progress) = &progress {
                    progress(percent);
                }
            }
        });
        let file_name: String = url::form_urlencoded::byte_serialize(remote_path.as_bytes()).collect();

        let request = self
            .client
            .post(&target.upload_url)
            .header(header::AUTHORIZATION, token_header(&target.authorization_token)?)
            .header("X-Bz-File-Name", file_name)
            .header(header::CONTENT_TYPE, "b2/x-auto")
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .header("X-Bz-Content-Sha1", "do_not_verify")
            .header("X-Bz-Info-src_sha256", content_hash)
            .body(reqwest::Body::wrap_stream(body));

        let response = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(SyncError::Cancelled),
            response = request.send() => response?,
        };
        Ok(check_status(response)?.json().await?)
    }

    async fn delete_versions(&self, auth: &B2Authorization, remote_path: &str) -> Result<bool> {
        let versions: FileList = self
            .call(
                auth,
                "b2_list_file_versions",
                json!({
                    "bucketId": self.config.bucket_id,
                    "startFileName": remote_path,
                    "prefix": remote_path,
                    "maxFileCount": 100,
                }),
            )
            .await?;
        let mut deleted = 0;
        for version in versions.files.into_iter().filter(|x| x.file_name == remote_path) {
            let _: Value = self
                .call(
                    auth,
                    "b2_delete_file_version",
                    json!({ "fileName": version.file_name, "fileId": version.file_id }),
                )
                .await?;
            deleted += 1;
        }
        info!("Deleted {} versions of {}", deleted, remote_path);
        Ok(deleted > 0)
    }
}

impl CdnStore for B2Client {
    fn authorize(&self) -> impl Future<Output = Result<()>> + Send {
        async move { self.authorization().await.map(|_| ()) }
    }

    fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressSink>,
        ct: &CancellationToken,
    ) -> impl Future<Output = CdnUploadResult> + Send {
        async move {
            let (content_hash, content_length) = match hash_and_length(local_path).await {
                Ok(x) => x,
                Err(err) => return CdnUploadResult::failed(String::new(), 0, err.to_string()),
            };
            let mut auth = match self.authorization().await {
                Ok(auth) => auth,
                Err(err) => return CdnUploadResult::failed(content_hash, content_length, err.to_string()),
            };

            if self.config.skip_existing {
                match self.existing(&auth, remote_path).await {
                    Ok(Some(file)) if file.file_info.get("src_sha256") == Some(&content_hash) => {
                        debug!("{} already stored with the same content", remote_path);
                        return CdnUploadResult {
                            success: true,
                            file_id: Some(file.file_id),
                            cdn_url: Some(self.cdn_url(&auth, remote_path)),
                            content_hash,
                            content_length,
                            error_message: None,
                            skipped: true,
                        };
                    }
                    Ok(_) => {}
                    Err(err) => warn!("Could not check for existing {}: {}", remote_path, err),
                }
            }

            let mut uploaded = self
                .upload_retrying(&auth, local_path, remote_path, &content_hash, content_length, &progress, ct)
                .await;
            if matches!(uploaded, Err(SyncError::Unauthorized)) {
                uploaded = match self.reauthorize(&auth).await {
                    Ok(fresh) => {
                        auth = fresh;
                        self.upload_retrying(&auth, local_path, remote_path, &content_hash, content_length, &progress, ct)
                            .await
                    }
                    Err(err) => Err(err),
                };
            }
            match uploaded {
                Ok(file) => {
                    debug!("Uploaded {} as {}", local_path.display(), file.file_name);
                    CdnUploadResult {
                        success: true,
                        file_id: Some(file.file_id),
                        cdn_url: Some(self.cdn_url(&auth, remote_path)),
                        content_hash,
                        content_length,
                        error_message: None,
                        skipped: false,
                    }
                }
                Err(err) => CdnUploadResult::failed(content_hash, content_length, err.to_string()),
            }
        }
    }

    fn delete_file(&self, remote_path: &str) -> impl Future<Output = bool> + Send {
        async move {
            let deleted = match self.authorization().await {
                Ok(auth) => match self.delete_versions(&auth, remote_path).await {
                    Err(SyncError::Unauthorized) => match self.reauthorize(&auth).await {
                        Ok(fresh) => self.delete_versions(&fresh, remote_path).await,
                        Err(err) => Err(err),
                    },
                    other => other,
                },
                Err(err) => Err(err),
            };
            deleted.unwrap_or_else(|err| {
                warn!("Failed to delete {}: {}", remote_path, err);
                false
            })
        }
    }
}

fn token_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(token)
        .map_err(|_| SyncError::Config("B2 returned an unusable authorization token".to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

async fn hash_and_length(path: &Path) -> std::io::Result<(String, u64)> {
    let length = tokio::fs::metadata(path).await?.len();
    let hash = sha256_file(path).await?;
    Ok((hash, length))
}
