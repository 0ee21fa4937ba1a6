use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    hashing::{matches_declared_hash, DigestKind, CHUNK_SIZE},
    pool::{PoolUpdate, TransferPool},
    retry::{retry, sleep_or_cancel, RetryPolicy},
};
use crate::{
    api::{client::check_status, AssetId},
    events::{EventBus, SyncEvent},
    manifest::FolderPaths,
    models::Resource,
    Result, ResourceStatus, SyncError,
};

/// Declared sizes are trusted within this many percent.
const SIZE_TOLERANCE_PERCENT: u64 = 5;

/// A response body on its way to disk.
pub struct FetchedBody {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Source of asset bytes. Implemented over HTTP by [`HttpFetcher`].
pub trait AssetFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str, api_key: &str) -> impl Future<Output = Result<FetchedBody>> + Send;
}

#[derive(Clone, Debug, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpFetcher { client }
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str, api_key: &str) -> impl Future<Output = Result<FetchedBody>> + Send {
        let request = self.client.get(url).bearer_auth(api_key);
        async move {
            let response = check_status(request.send().await?)?;
            let content_length = response.content_length();
            let stream = response.bytes_stream().map_err(SyncError::from).boxed();
            Ok(FetchedBody {
                content_length,
                stream,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub api_key: String,
    pub project_name: String,
    pub projects_root: PathBuf,
    pub folder_paths: FolderPaths,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchResult {
    pub fn nothing_to_do() -> Self {
        BatchResult {
            succeeded: 0,
            failed: 0,
            total: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

struct DownloadJob {
    index: usize,
    id: AssetId,
    url: String,
    path: PathBuf,
    size: Option<u64>,
    hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Verdict {
    status: ResourceStatus,
    observed_size: u64,
}

/// Brings the working folder in line with the manifest.
///
/// Each pass sends the outstanding resources through a bounded pool; files
/// that fail or come out damaged are picked up again by the next pass.
/// Only the coordinator writes to the resources, workers report back over
/// the pool's channel.
pub struct DownloadCoordinator<F> {
    fetcher: Arc<F>,
    pool: TransferPool,
    file_retry: RetryPolicy,
    batch_retry: RetryPolicy,
    events: EventBus,
}

impl<F: AssetFetcher> DownloadCoordinator<F> {
    pub fn new(fetcher: F, concurrency: usize, events: EventBus) -> Self {
        DownloadCoordinator {
            fetcher: Arc::new(fetcher),
            pool: TransferPool::new(concurrency),
            file_retry: RetryPolicy::file_transfer(),
            batch_retry: RetryPolicy::batch(),
            events,
        }
    }

    pub fn with_retry(mut self, file_retry: RetryPolicy, batch_retry: RetryPolicy) -> Self {
        self.file_retry = file_retry;
        self.batch_retry = batch_retry;
        self
    }

    pub async fn download_assets(
        &self,
        resources: &mut [Resource],
        request: &DownloadRequest,
        ct: &CancellationToken,
    ) -> Result<BatchResult> {
        let targets = resources
            .iter()
            .enumerate()
            .filter(|(_, x)| x.requires_download())
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        if targets.is_empty() {
            info!("All assets are up to date");
            return Ok(BatchResult::nothing_to_do());
        }
        for &index in &targets {
            resources[index].resolve_path(
                &request.projects_root,
                &request.project_name,
                &request.folder_paths,
            );
        }

        let api_key: Arc<str> = Arc::from(request.api_key.as_str());
        let max_passes = self.batch_retry.max_attempts.max(1);
        let mut remaining = targets.clone();
        for pass in 1..=max_passes {
            if ct.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            info!(
                "Download pass {}/{}: {} of {} assets",
                pass,
                max_passes,
                remaining.len(),
                targets.len()
            );
            self.run_pass(resources, &remaining, &api_key, ct).await?;

            remaining.retain(|&index| resources[index].requires_download());
            if remaining.is_empty() {
                break;
            }
            if pass < max_passes {
                let delay = self.batch_retry.delay_for(pass);
                warn!("{} assets still pending, retrying in {:?}", remaining.len(), delay);
                sleep_or_cancel(delay, ct).await?;
            }
        }

        let succeeded = targets
            .iter()
            .filter(|&&index| resources[index].status == ResourceStatus::Downloaded)
            .count();
        let result = BatchResult {
            succeeded,
            failed: targets.len() - succeeded,
            total: targets.len(),
        };
        info!(
            "Downloaded {}/{} assets ({} failed)",
            result.succeeded, result.total, result.failed
        );
        Ok(result)
    }

    async fn run_pass(
        &self,
        resources: &mut [Resource],
        indices: &[usize],
        api_key: &Arc<str>,
        ct: &CancellationToken,
    ) -> Result<()> {
        let mut jobs = Vec::with_capacity(indices.len());
        for &index in indices {
            let resource = &mut resources[index];
            if let (Some(url), Some(path)) = (resource.url.clone(), resource.path.clone()) {
                resource.download_progress = 0;
                let job = DownloadJob {
                    index,
                    id: resource.id,
                    url,
                    path,
                    size: resource.size,
                    hash: resource.hash.clone(),
                };
                jobs.push((index, job));
            } else {
                warn!("Asset {} ({}) has no download URL", resource.id, resource.name);
                self.events.status_changed(resource.set_status(ResourceStatus::Error));
            }
        }
        let total = jobs.len();

        let fetcher = self.fetcher.clone();
        let events = self.events.clone();
        let file_retry = self.file_retry;
        let api_key = api_key.clone();
        let worker_ct = ct.clone();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, u8)>();
        let mut updates = self.pool.spawn(jobs, ct, move |job: DownloadJob| {
            let fetcher = fetcher.clone();
            let events = events.clone();
            let api_key = api_key.clone();
            let progress = progress_tx.clone();
            let ct = worker_ct.clone();
            async move {
                let reporter = Reporter {
                    events: &events,
                    progress: &progress,
                };
                download_one(fetcher.as_ref(), &job, &api_key, &file_retry, reporter, &ct).await
            }
        });

        let mut completed = 0;
        loop {
            // progress is sent before the job finishes, so draining it first
            // keeps a late percent from overwriting the final one
            let update = tokio::select! {
                biased;
                Some((index, percent)) = progress_rx.recv() => {
                    resources[index].download_progress = percent;
                    continue;
                }
                update = updates.recv() => update,
            };
            let Some(update) = update else {
                break;
            };
            match update {
                PoolUpdate::Started(index) => {
                    let resource = &mut resources[index];
                    self.events
                        .status_changed(resource.set_status(ResourceStatus::Downloading));
                }
                PoolUpdate::Finished(index, result) => {
                    completed += 1;
                    let resource = &mut resources[index];
                    let status = match result {
                        Ok(verdict) => {
                            if resource.size.is_none() {
                                resource.size = Some(verdict.observed_size);
                            }
                            if verdict.status == ResourceStatus::Downloaded {
                                resource.download_progress = 100;
                            } else {
                                warn!("{} finished as {}", resource.name, verdict.status);
                            }
                            verdict.status
                        }
                        Err(SyncError::Cancelled) => ResourceStatus::Error,
                        Err(err) => {
                            warn!("Failed to download {}: {}", resource.name, err);
                            ResourceStatus::Error
                        }
                    };
                    self.events.status_changed(resource.set_status(status));
                    self.events.publish(SyncEvent::BatchProgress { completed, total });
                }
            }
        }

        for &index in indices {
            let resource = &mut resources[index];
            if resource.status == ResourceStatus::Downloading {
                self.events.status_changed(resource.set_status(ResourceStatus::Error));
            }
        }
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Checks files already in the working folder against the manifest so
    /// that only missing or damaged ones are downloaded. Resources without a
    /// local file go back to `On Server`, or `Missing` if they were
    /// downloaded before.
    pub async fn scan_local(
        &self,
        resources: &mut [Resource],
        request: &DownloadRequest,
        ct: &CancellationToken,
    ) -> Result<()> {
        let mut jobs = Vec::new();
        for (index, resource) in resources.iter_mut().enumerate() {
            resource.resolve_path(&request.projects_root, &request.project_name, &request.folder_paths);
            let Some(path) = resource.path.clone() else {
                continue;
            };
            if !path.is_file() {
                let status = match resource.status {
                    ResourceStatus::Downloaded => ResourceStatus::Missing,
                    ResourceStatus::Unset => ResourceStatus::OnServer,
                    status => status,
                };
                self.events.status_changed(resource.set_status(status));
                continue;
            }
            jobs.push((index, (path, resource.size, resource.hash.clone())));
        }
        debug!("Verifying {} local files", jobs.len());

        let results = self
            .pool
            .run(jobs, ct, |(path, size, hash): (PathBuf, Option<u64>, Option<String>)| async move {
                let observed_size = tokio::fs::metadata(&path).await?.len();
                classify(&path, observed_size, size, hash.as_deref(), ResourceStatus::HashError).await
            })
            .await;
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        for (index, result) in results {
            let resource = &mut resources[index];
            let status = match result {
                Ok(verdict) => verdict.status,
                Err(err) => {
                    warn!("Could not verify {}: {}", resource.name, err);
                    ResourceStatus::Error
                }
            };
            self.events.status_changed(resource.set_status(status));
        }
        Ok(())
    }
}

/// Where a worker sends byte progress: the event bus for observers and the
/// coordinator for the resource itself.
#[derive(Clone, Copy)]
struct Reporter<'a> {
    events: &'a EventBus,
    progress: &'a mpsc::UnboundedSender<(usize, u8)>,
}

impl Reporter<'_> {
    fn report(&self, job: &DownloadJob, percent: u8) {
        let _ = self.progress.send((job.index, percent));
        self.events.publish(SyncEvent::DownloadProgress { id: job.id, percent });
    }
}

async fn download_one<F: AssetFetcher>(
    fetcher: &F,
    job: &DownloadJob,
    api_key: &str,
    file_retry: &RetryPolicy,
    reporter: Reporter<'_>,
    ct: &CancellationToken,
) -> Result<Verdict> {
    let written = retry(file_retry, ct, |_| fetch_to_file(fetcher, job, api_key, reporter, ct)).await;
    let written = match written {
        Ok(written) => written,
        Err(err) => {
            if let Err(remove) = tokio::fs::remove_file(&job.path).await {
                debug!("No partial file to clean up at {}: {}", job.path.display(), remove);
            }
            return Err(err);
        }
    };
    Ok(classify(
        &job.path,
        written,
        job.size,
        job.hash.as_deref(),
        ResourceStatus::Corrupted,
    )
    .await?)
}

async fn fetch_to_file<F: AssetFetcher>(
    fetcher: &F,
    job: &DownloadJob,
    api_key: &str,
    reporter: Reporter<'_>,
    ct: &CancellationToken,
) -> Result<u64> {
    let body = fetcher.fetch(&job.url, api_key).await?;
    if let Some(parent) = job.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let total = body.content_length.or(job.size).filter(|x| *x > 0);
    let mut file = tokio::fs::File::create(&job.path).await?;
    let mut stream = body.stream;
    let mut written: u64 = 0;
    let mut last_percent = 0u8;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(SyncError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk?;
        for part in chunk.chunks(CHUNK_SIZE) {
            file.write_all(part).await?;
        }
        written += chunk.len() as u64;

        if let Some(total) = total {
            let percent = (written.saturating_mul(100) / total).min(100) as u8;
            if percent != last_percent {
                last_percent = percent;
                reporter.report(job, percent);
            }
        }
    }
    file.flush().await?;
    Ok(written)
}

/// Integrity verdict for a file on disk. A declared digest of a known shape
/// decides alone; otherwise the declared size must match within tolerance.
async fn classify(
    path: &Path,
    observed_size: u64,
    declared_size: Option<u64>,
    declared_hash: Option<&str>,
    hash_mismatch: ResourceStatus,
) -> std::io::Result<Verdict> {
    let status = if observed_size == 0 {
        ResourceStatus::EmptyFile
    } else if let Some(hash) = declared_hash.filter(|x| DigestKind::detect(x).is_some()) {
        if matches_declared_hash(path, hash).await? {
            ResourceStatus::Downloaded
        } else {
            hash_mismatch
        }
    } else {
        match declared_size.filter(|x| *x > 0) {
            Some(declared) if !within_tolerance(observed_size, declared) => ResourceStatus::SizeMismatch,
            _ => ResourceStatus::Downloaded,
        }
    };
    Ok(Verdict {
        status,
        observed_size,
    })
}

fn within_tolerance(observed: u64, declared: u64) -> bool {
    observed.abs_diff(declared).saturating_mul(100) <= declared.saturating_mul(SIZE_TOLERANCE_PERCENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::ResourceKind, models::TextureInfo, transfer::hashing::sha256_bytes};
    use futures_util::stream;
    use std::{
        collections::HashMap,
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tempfile::tempdir;

    /// Serves canned bodies by URL; URLs without a body fail with a
    /// retryable I/O error.
    #[derive(Default)]
    struct FakeFetcher {
        bodies: HashMap<String, Vec<u8>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl FakeFetcher {
        fn serve(mut self, url: &str, body: &[u8]) -> Self {
            self.bodies.insert(url.to_string(), body.to_vec());
            self
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    impl AssetFetcher for FakeFetcher {
        fn fetch(&self, url: &str, _api_key: &str) -> impl Future<Output = Result<FetchedBody>> + Send {
            *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            let body = self.bodies.get(url).cloned();
            async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                let body = body.ok_or_else(|| {
                    SyncError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
                })?;
                let content_length = Some(body.len() as u64);
                let chunks = body
                    .chunks(3)
                    .map(|x| Ok(Bytes::copy_from_slice(x)))
                    .collect::<Vec<_>>();
                Ok(FetchedBody {
                    content_length,
                    stream: stream::iter(chunks).boxed(),
                })
            }
        }
    }

    fn texture(id: i64, url: &str) -> Resource {
        let mut resource = Resource::new(
            AssetId(id),
            format!("tex{}", id),
            ResourceKind::Texture(TextureInfo::default()),
        );
        resource.extension = ".png".to_string();
        resource.url = Some(url.to_string());
        resource.status = ResourceStatus::OnServer;
        resource
    }

    fn request(root: &Path) -> DownloadRequest {
        DownloadRequest {
            api_key: "secret".to_string(),
            project_name: "Racer".to_string(),
            projects_root: root.to_path_buf(),
            folder_paths: FolderPaths::default(),
        }
    }

    fn fast_coordinator(fetcher: FakeFetcher, width: usize) -> DownloadCoordinator<FakeFetcher> {
        DownloadCoordinator::new(fetcher, width, EventBus::default()).with_retry(
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            RetryPolicy::exponential(3, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn should_return_nothing_to_do_for_downloaded_set() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = fast_coordinator(FakeFetcher::default(), 2);
        let mut resources = vec![texture(1, "u1")];
        resources[0].status = ResourceStatus::Downloaded;

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(result, BatchResult::nothing_to_do());
        assert!(result.success());
        Ok(())
    }

    #[tokio::test]
    async fn should_download_and_verify_declared_hash() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let body = b"texture bytes".repeat(100);
        let coordinator = fast_coordinator(FakeFetcher::default().serve("u1", &body).serve("u2", b"tampered"), 2);
        let mut resources = vec![texture(1, "u1"), texture(2, "u2")];
        resources[0].hash = Some(sha256_bytes(&body));
        resources[1].hash = Some(sha256_bytes(b"original"));

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        let path = dir.path().join("Racer").join("assets").join("tex1.png");
        assert_eq!(resources[0].status, ResourceStatus::Downloaded);
        assert_eq!(resources[0].path.as_deref(), Some(path.as_path()));
        assert_eq!(resources[0].download_progress, 100);
        assert_eq!(std::fs::read(&path)?, body);
        assert_eq!(resources[1].status, ResourceStatus::Corrupted);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert!(!result.success());
        Ok(())
    }

    #[tokio::test]
    async fn should_stop_after_three_passes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = fast_coordinator(FakeFetcher::default(), 2);
        let mut resources = vec![texture(1, "dead1"), texture(2, "dead2")];

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(result.failed, result.total);
        assert_eq!(result.total, 2);
        // 3 passes of 2 local attempts each
        assert_eq!(coordinator.fetcher.calls("dead1"), 6);
        assert!(resources.iter().all(|x| x.status == ResourceStatus::Error));
        Ok(())
    }

    /// Declares twice the bytes it sends.
    struct TruncatingFetcher;

    impl AssetFetcher for TruncatingFetcher {
        fn fetch(&self, _url: &str, _api_key: &str) -> impl Future<Output = Result<FetchedBody>> + Send {
            async {
                let chunks = (0..10).map(|_| Ok(Bytes::from_static(&[7u8; 10]))).collect::<Vec<_>>();
                Ok(FetchedBody {
                    content_length: Some(200),
                    stream: stream::iter(chunks).boxed(),
                })
            }
        }
    }

    #[tokio::test]
    async fn should_track_byte_progress_on_the_resource() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = DownloadCoordinator::new(TruncatingFetcher, 1, EventBus::default()).with_retry(
            RetryPolicy::fixed(1, Duration::from_millis(1)),
            RetryPolicy::exponential(1, Duration::from_millis(1)),
        );
        let mut resources = vec![texture(1, "u1")];
        resources[0].size = Some(200);

        coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(resources[0].status, ResourceStatus::SizeMismatch);
        assert_eq!(resources[0].download_progress, 50);
        Ok(())
    }

    #[tokio::test]
    async fn should_isolate_a_single_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut fetcher = FakeFetcher::default();
        for id in 1..=5 {
            fetcher = fetcher.serve(&format!("u{}", id), b"payload");
        }
        let coordinator = fast_coordinator(fetcher, 3);
        let mut resources = (1..=5).map(|x| texture(x, &format!("u{}", x))).collect::<Vec<_>>();
        resources.push(texture(6, "broken"));

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(result.succeeded, 5);
        assert_eq!(result.failed, 1);
        assert_eq!(resources[5].status, ResourceStatus::Error);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_respect_download_concurrency() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut fetcher = FakeFetcher {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        for id in 0..12 {
            fetcher = fetcher.serve(&format!("u{}", id), b"payload");
        }
        let coordinator = fast_coordinator(fetcher, 3);
        let mut resources = (0..12).map(|x| texture(x, &format!("u{}", x))).collect::<Vec<_>>();

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(result.succeeded, 12);
        assert!(coordinator.fetcher.peak.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[tokio::test]
    async fn should_classify_empty_and_size_mismatch() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = fast_coordinator(
            FakeFetcher::default()
                .serve("empty", b"")
                .serve("short", &[1u8; 90])
                .serve("close", &[1u8; 97])
                .serve("unknown", &[1u8; 7]),
            2,
        );
        let mut resources = vec![
            texture(1, "empty"),
            texture(2, "short"),
            texture(3, "close"),
            texture(4, "unknown"),
        ];
        resources[1].size = Some(100);
        resources[2].size = Some(100);

        coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(resources[0].status, ResourceStatus::EmptyFile);
        assert_eq!(resources[1].status, ResourceStatus::SizeMismatch);
        assert_eq!(resources[2].status, ResourceStatus::Downloaded);
        assert_eq!(resources[3].status, ResourceStatus::Downloaded);
        assert_eq!(resources[3].size, Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn should_emit_each_status_transition_once() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = fast_coordinator(FakeFetcher::default().serve("u1", b"payload"), 1);
        let mut events = coordinator.events.subscribe();
        let mut resources = vec![texture(1, "u1")];

        coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::StatusChanged(change) = event {
                transitions.push((change.from, change.to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (ResourceStatus::OnServer, ResourceStatus::Downloading),
                (ResourceStatus::Downloading, ResourceStatus::Downloaded),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn should_return_cancelled_without_retrying() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = fast_coordinator(FakeFetcher::default().serve("u1", b"payload"), 1);
        let mut resources = vec![texture(1, "u1")];
        let ct = CancellationToken::new();
        ct.cancel();

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &ct)
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(coordinator.fetcher.calls("u1"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn should_verify_local_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = fast_coordinator(FakeFetcher::default(), 2);
        let assets = dir.path().join("Racer").join("assets");
        std::fs::create_dir_all(&assets)?;
        std::fs::write(assets.join("tex1.png"), b"good")?;
        std::fs::write(assets.join("tex2.png"), b"bad")?;
        let mut resources = vec![texture(1, "u1"), texture(2, "u2"), texture(3, "u3"), texture(4, "u4")];
        resources[0].hash = Some(sha256_bytes(b"good"));
        resources[1].hash = Some(sha256_bytes(b"expected"));
        resources[3].status = ResourceStatus::Downloaded;

        coordinator
            .scan_local(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        assert_eq!(resources[0].status, ResourceStatus::Downloaded);
        assert_eq!(resources[1].status, ResourceStatus::HashError);
        assert_eq!(resources[2].status, ResourceStatus::OnServer);
        assert_eq!(resources[3].status, ResourceStatus::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn should_stream_through_http_fetcher() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files/tex1.png")
            .match_header("authorization", "Bearer secret")
            .with_body(vec![7u8; 20_000])
            .create_async()
            .await;
        let dir = tempdir()?;
        let coordinator = DownloadCoordinator::new(HttpFetcher::new(), 2, EventBus::default());
        let mut progress = coordinator.events.subscribe();
        let mut resources = vec![texture(1, &format!("{}/files/tex1.png", server.url()))];
        resources[0].size = Some(20_000);

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        mock.assert_async().await;
        assert_eq!(result.succeeded, 1);
        let mut percents = Vec::new();
        while let Ok(event) = progress.try_recv() {
            if let SyncEvent::DownloadProgress { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|x| x[0] < x[1]));
        Ok(())
    }

    #[tokio::test]
    async fn should_not_retry_unauthorized_downloads() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files/tex1.png")
            .with_status(401)
            .expect(3)
            .create_async()
            .await;
        let dir = tempdir()?;
        let coordinator = DownloadCoordinator::new(HttpFetcher::new(), 1, EventBus::default()).with_retry(
            RetryPolicy::fixed(5, Duration::from_millis(1)),
            RetryPolicy::exponential(3, Duration::from_millis(1)),
        );
        let mut resources = vec![texture(1, &format!("{}/files/tex1.png", server.url()))];

        let result = coordinator
            .download_assets(&mut resources, &request(dir.path()), &CancellationToken::new())
            .await?;

        // one request per batch pass, no local retries
        mock.assert_async().await;
        assert_eq!(result.failed, 1);
        Ok(())
    }
}
