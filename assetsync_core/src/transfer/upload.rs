use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{
    cdn::{upload_batch, CdnStore, CdnUploadResult, ProgressSink},
    hashing::sha256_file,
    ledger::TransferStateStore,
};
use crate::{
    events::{EventBus, SyncEvent},
    models::{extension_of, Resource, UploadRecord},
    Result, ResourceStatus, SyncError,
};

/// Extensions picked up when exporting a whole directory.
pub const EXPORT_EXTENSIONS: [&str; 8] = [".ktx2", ".png", ".jpg", ".jpeg", ".glb", ".gltf", ".bin", ".json"];

pub const ALREADY_UPLOADED: &str = "Already uploaded (hash match)";

/// Folder under the project (and model) prefix a file type is stored in.
pub fn remote_subfolder(file_name: &str) -> &'static str {
    match extension_of(file_name).as_str() {
        ".ktx2" | ".png" | ".jpg" | ".jpeg" => "textures",
        ".glb" | ".gltf" => "models",
        ".json" => "materials",
        _ => "assets",
    }
}

/// `{project}/[{model}/]{subfolder}/{file}`
pub fn build_remote_path(project_name: &str, model_name: Option<&str>, file_name: &str) -> String {
    let subfolder = remote_subfolder(file_name);
    match model_name.filter(|x| !x.is_empty()) {
        Some(model) => format!("{}/{}/{}/{}", project_name, model, subfolder, file_name),
        None => format!("{}/{}/{}", project_name, subfolder, file_name),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadOutcome {
    pub success: bool,
    pub remote_path: String,
    pub cdn_url: Option<String>,
    pub content_hash: Option<String>,
    pub error: Option<String>,
    pub message: Option<String>,
    pub skipped: bool,
}

impl UploadOutcome {
    fn failed(remote_path: String, content_hash: Option<String>, error: impl Into<String>) -> Self {
        UploadOutcome {
            success: false,
            remote_path,
            content_hash,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn skipped(remote_path: String, content_hash: String, cdn_url: Option<String>) -> Self {
        UploadOutcome {
            success: true,
            remote_path,
            cdn_url,
            content_hash: Some(content_hash),
            message: Some(ALREADY_UPLOADED.to_string()),
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub uploaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub success: bool,
}

impl BatchOutcome {
    fn count(&mut self, success: bool, skipped: bool) {
        match (success, skipped) {
            (true, true) => self.skipped_count += 1,
            (true, false) => self.uploaded_count += 1,
            (false, _) => self.failed_count += 1,
        }
        self.success = self.failed_count == 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportOutcome {
    pub total: usize,
    pub uploaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub success: bool,
}

/// Publishes processed artifacts to the CDN, skipping content that is
/// already there according to the resource itself or the ledger.
pub struct UploadCoordinator<S> {
    store: Arc<S>,
    ledger: Option<TransferStateStore>,
    events: EventBus,
    upload_concurrency: usize,
}

impl<S: CdnStore> UploadCoordinator<S> {
    pub fn new(store: S, events: EventBus) -> Self {
        UploadCoordinator {
            store: Arc::new(store),
            ledger: None,
            events,
            upload_concurrency: 8,
        }
    }

    pub fn with_ledger(mut self, ledger: TransferStateStore) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_concurrency(mut self, upload_concurrency: usize) -> Self {
        self.upload_concurrency = upload_concurrency.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> Option<&TransferStateStore> {
        self.ledger.as_ref()
    }

    pub async fn upload_resource(
        &self,
        resource: &mut Resource,
        project_name: &str,
        model_name: Option<&str>,
        ct: &CancellationToken,
    ) -> Result<UploadOutcome> {
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let Some(path) = resource.path.clone().filter(|x| x.is_file()) else {
            return Ok(UploadOutcome::failed(
                String::new(),
                None,
                format!("{} has no local file", resource.name),
            ));
        };
        let file_name = path
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|| resource.file_name());
        let remote_path = build_remote_path(project_name, model_name, &file_name);

        let content_hash = match sha256_file(&path).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!("Could not hash {}: {}", path.display(), err);
                self.events
                    .status_changed(resource.set_status(ResourceStatus::UploadFailed));
                return Ok(UploadOutcome::failed(remote_path, None, err.to_string()));
            }
        };

        if !resource.requires_upload(&content_hash) {
            debug!("{} unchanged since last upload", path.display());
            self.events.status_changed(resource.set_status(ResourceStatus::Uploaded));
            return Ok(UploadOutcome::skipped(
                remote_path,
                content_hash,
                resource.remote_url.clone(),
            ));
        }
        if let Some(record) = self.ledger_hit(&path, &content_hash).await {
            debug!("{} found in the upload ledger", path.display());
            resource.mark_uploaded(content_hash.clone(), record.cdn_url, record.uploaded_at);
            self.events.status_changed(resource.set_status(ResourceStatus::Uploaded));
            return Ok(UploadOutcome::skipped(
                remote_path,
                content_hash,
                resource.remote_url.clone(),
            ));
        }

        resource.upload_progress = 0;
        self.events.status_changed(resource.set_status(ResourceStatus::Uploading));
        let sink_path = path.clone();
        let events = self.events.clone();
        let sink: ProgressSink = Arc::new(move |percent| {
            events.publish(SyncEvent::UploadProgress {
                path: sink_path.clone(),
                percent,
            })
        });
        let result = self
            .store
            .upload_file(&path, &remote_path, Some(sink), ct)
            .await;
        self.record(&path, &remote_path, &content_hash, &result, project_name)
            .await;

        if result.success {
            info!("Uploaded {} to {}", resource.name, remote_path);
            resource.mark_uploaded(content_hash.clone(), result.cdn_url.clone(), Utc::now());
            self.events.status_changed(resource.set_status(ResourceStatus::Uploaded));
            return Ok(UploadOutcome {
                success: true,
                remote_path,
                cdn_url: result.cdn_url,
                content_hash: Some(content_hash),
                skipped: result.skipped,
                ..Default::default()
            });
        }

        self.events
            .status_changed(resource.set_status(ResourceStatus::UploadFailed));
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let error = result
            .error_message
            .unwrap_or_else(|| "upload failed".to_string());
        warn!("Failed to upload {}: {}", resource.name, error);
        Ok(UploadOutcome::failed(remote_path, Some(content_hash), error))
    }

    /// Queues every resource whose local file changed since its last upload,
    /// then uploads them one by one. Unchanged resources keep their status
    /// and are counted as skipped.
    pub async fn upload_resources(
        &self,
        resources: &mut [Resource],
        project_name: &str,
        model_name: Option<&str>,
        ct: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let mut unchanged = 0;
        let mut queued = Vec::new();
        for (index, resource) in resources.iter().enumerate() {
            if !resource.file_exists() || resource.status == ResourceStatus::Uploading {
                continue;
            }
            let unchanged_hash = match resource.path.as_deref() {
                Some(path) => sha256_file(path)
                    .await
                    .is_ok_and(|hash| !resource.requires_upload(&hash)),
                None => false,
            };
            match unchanged_hash {
                true => unchanged += 1,
                false => queued.push(index),
            }
        }
        for &index in &queued {
            let resource = &mut resources[index];
            self.events.status_changed(resource.set_status(ResourceStatus::Queued));
        }
        info!(
            "Queued {} resources for upload ({} unchanged)",
            queued.len(),
            unchanged
        );

        let mut outcome = BatchOutcome {
            skipped_count: unchanged,
            success: true,
            ..Default::default()
        };
        for (completed, &index) in queued.iter().enumerate() {
            if ct.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let result = self
                .upload_resource(&mut resources[index], project_name, model_name, ct)
                .await?;
            outcome.count(result.success, result.skipped);
            self.events.publish(SyncEvent::BatchProgress {
                completed: completed + 1,
                total: queued.len(),
            });
        }
        info!(
            "Upload finished: {} uploaded, {} skipped, {} failed",
            outcome.uploaded_count, outcome.skipped_count, outcome.failed_count
        );
        Ok(outcome)
    }

    /// Brings upload bookkeeping of in-memory resources back from the
    /// ledger. Returns how many resources were restored.
    pub async fn restore_from_ledger(&self, resources: &mut [Resource]) -> usize {
        let Some(ledger) = &self.ledger else {
            return 0;
        };
        let mut restored = 0;
        for resource in resources.iter_mut() {
            let Some(path) = resource.path.clone() else {
                continue;
            };
            match ledger.get_last_uploaded(&path).await {
                Ok(Some(record)) => {
                    resource.uploaded_hash = Some(record.content_hash);
                    resource.remote_url = record.cdn_url;
                    resource.last_uploaded_at = Some(record.uploaded_at);
                    restored += 1;
                }
                Ok(None) => {}
                Err(err) => warn!("Ledger lookup for {} failed: {}", path.display(), err),
            }
        }
        debug!("Restored upload state of {} resources", restored);
        restored
    }

    /// Uploads every exportable file under `directory` to
    /// `{project}/{relative path}`.
    pub async fn export_directory(
        &self,
        directory: &Path,
        project_name: &str,
        ct: &CancellationToken,
    ) -> Result<ExportOutcome> {
        let files = WalkDir::new(directory)
            .into_iter()
            .filter_map(|x| x.ok())
            .filter(|x| x.file_type().is_file())
            .filter(|x| is_exportable(x.path()))
            .filter_map(|x| {
                let remote = remote_export_path(directory, x.path(), project_name)?;
                Some((x.into_path(), remote))
            })
            .collect::<Vec<_>>();

        let mut outcome = ExportOutcome {
            total: files.len(),
            ..Default::default()
        };
        let mut pairs = Vec::with_capacity(files.len());
        for (local, remote) in files {
            if ct.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.already_exported(&local).await {
                outcome.skipped_count += 1;
                continue;
            }
            pairs.push((local, remote));
        }
        info!(
            "Exporting {} files from {} ({} unchanged)",
            pairs.len(),
            directory.display(),
            outcome.skipped_count
        );

        let batch = upload_batch(
            self.store.clone(),
            pairs,
            self.upload_concurrency,
            &self.events,
            ct,
        )
        .await;
        for (local, remote, result) in &batch.results {
            self.record(local, remote, &result.content_hash, result, project_name)
                .await;
        }
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        outcome.uploaded_count = batch.uploaded;
        outcome.skipped_count += batch.skipped;
        outcome.failed_count = batch.failed;
        outcome.success = batch.failed == 0;
        Ok(outcome)
    }

    /// The ledger's latest successful upload of the path, when it carried
    /// exactly this content. Lookup failures count as a miss.
    async fn ledger_hit(&self, path: &Path, content_hash: &str) -> Option<UploadRecord> {
        let ledger = self.ledger.as_ref()?;
        match ledger.get_last_uploaded(path).await {
            Ok(record) => record.filter(|x| x.content_hash.eq_ignore_ascii_case(content_hash)),
            Err(err) => {
                warn!(
                    "Ledger check for {} failed, assuming upload is needed: {}",
                    path.display(),
                    err
                );
                None
            }
        }
    }

    async fn already_exported(&self, path: &Path) -> bool {
        if self.ledger.is_none() {
            return false;
        }
        match sha256_file(path).await {
            Ok(hash) => self.ledger_hit(path, &hash).await.is_some(),
            Err(err) => {
                warn!("Could not hash {}: {}", path.display(), err);
                false
            }
        }
    }

    async fn record(
        &self,
        local: &Path,
        remote: &str,
        content_hash: &str,
        result: &CdnUploadResult,
        project_name: &str,
    ) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let record = if result.success {
            UploadRecord::succeeded(
                local,
                remote,
                content_hash,
                result.content_length,
                result.cdn_url.clone(),
                result.file_id.clone(),
                project_name,
            )
        } else {
            UploadRecord::failed(
                local,
                remote,
                content_hash,
                result.content_length,
                project_name,
                result.error_message.clone().unwrap_or_default(),
            )
        };
        if let Err(err) = ledger.save_upload(&record).await {
            warn!("Could not record upload of {}: {}", local.display(), err);
        }
    }
}

fn is_exportable(path: &Path) -> bool {
    let extension = path
        .file_name()
        .map(|x| extension_of(&x.to_string_lossy()))
        .unwrap_or_default();
    EXPORT_EXTENSIONS.contains(&extension.as_str())
}

fn remote_export_path(directory: &Path, path: &Path, project_name: &str) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(directory).ok()?.to_path_buf();
    let segments = relative
        .components()
        .map(|x| x.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    match segments.is_empty() {
        true => None,
        false => Some(format!("{}/{}", project_name, segments.join("/"))),
    }
}
