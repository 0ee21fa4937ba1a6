use std::{io, path::Path};

use futures_util::{pin_mut, stream, Stream, TryStreamExt};
use log::{info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{store, FolderPaths, Manifest};
use crate::{
    api::{ApiClient, AssetId, BranchId, BranchSummary, ProjectId, ProjectSummary},
    models::{Resource, ResourceKind},
    transfer::pool::TransferPool,
    Result, SyncError,
};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Outcome of comparing the remote manifest with the cached one. The fresh
/// manifest is handed back so callers can persist it without refetching.
#[derive(Debug, Clone)]
pub struct ManifestCheck {
    pub changed: bool,
    pub fresh: Manifest,
}

/// Fetches manifests and turns them into tracked resources.
#[derive(Clone, Debug)]
pub struct ManifestSync {
    api: ApiClient,
    page_size: usize,
    processing: TransferPool,
}

impl ManifestSync {
    pub fn new(api: ApiClient, page_size: usize, processing_concurrency: usize) -> Self {
        ManifestSync {
            api,
            page_size: page_size.max(1),
            processing: TransferPool::new(processing_concurrency),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Lazily pages through the asset listing until a page comes back
    /// shorter than the page size. A dropped stream cannot be resumed; the
    /// next call starts again from the first page.
    pub fn fetch_manifest<'a>(
        &'a self,
        project_id: ProjectId,
        branch_id: &'a BranchId,
    ) -> impl Stream<Item = Result<Value>> + 'a {
        let api = &self.api;
        let limit = self.page_size;
        stream::try_unfold(Some(0usize), move |skip| async move {
            let Some(skip) = skip else {
                return Ok(None);
            };
            let page = api.assets_page(project_id, branch_id, skip, limit).await?;
            let next = if page.len() < limit {
                None
            } else {
                Some(skip + page.len())
            };
            let entries = stream::iter(page.into_iter().map(Ok::<Value, SyncError>));
            Ok::<_, SyncError>(Some((entries, next)))
        })
        .try_flatten()
    }

    pub async fn collect_manifest(
        &self,
        project_id: ProjectId,
        branch_id: &BranchId,
        ct: &CancellationToken,
    ) -> Result<Manifest> {
        let assets = self.fetch_manifest(project_id, branch_id);
        pin_mut!(assets);
        let mut collected = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(SyncError::Cancelled),
                next = assets.try_next() => next?,
            };
            match next {
                Some(asset) => collected.push(asset),
                None => break,
            }
        }
        info!("Fetched {} assets for project {}", collected.len(), project_id);
        Ok(Manifest::new(collected))
    }

    /// Whether the remote manifest differs from the one cached at
    /// `cache_path`. A missing or unreadable cache counts as changed.
    pub async fn has_updates(
        &self,
        cache_path: &Path,
        project_id: ProjectId,
        branch_id: &BranchId,
        ct: &CancellationToken,
    ) -> Result<ManifestCheck> {
        let cached = match store::load(cache_path).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!("Ignoring unreadable manifest cache {}: {}", cache_path.display(), err);
                None
            }
        };
        let fresh = self.collect_manifest(project_id, branch_id, ct).await?;
        let changed = match &cached {
            Some(cached) => cached.content_hash() != fresh.content_hash(),
            None => true,
        };
        Ok(ManifestCheck { changed, fresh })
    }

    pub async fn find_project(&self, username: &str, project_name: &str) -> Result<ProjectSummary> {
        let user_id = self.api.user_id(username).await?;
        let projects = self.api.projects(user_id).await?;
        pick_by_name(projects, project_name, |x| &x.name)
            .ok_or_else(|| SyncError::NotFound(format!("project {}", project_name)))
    }

    pub async fn find_branch(&self, project_id: ProjectId, branch_name: &str) -> Result<BranchSummary> {
        let branches = self.api.branches(project_id).await?;
        pick_by_name(branches, branch_name, |x| &x.name)
            .ok_or_else(|| SyncError::NotFound(format!("branch {}", branch_name)))
    }

    /// Resolves folders and builds a resource per tracked asset, with local
    /// paths already resolved. Runs on the processing gate.
    pub async fn build_resources(
        &self,
        manifest: &Manifest,
        project_name: &str,
        projects_root: &Path,
    ) -> Result<(Vec<Resource>, FolderPaths)> {
        let _permit = self.processing.permit().await?;
        let manifest = manifest.clone();
        let api_url = self.api.base_url().to_string();
        let project_name = project_name.to_string();
        let projects_root = projects_root.to_path_buf();

        tokio::task::spawn_blocking(move || manifest.resources(&api_url, &project_name, &projects_root))
        .await
        .map_err(|err| SyncError::Io(io::Error::other(err)))
    }

    /// Fills in the texture references of every material from its asset
    /// detail. A failed lookup leaves that material untouched.
    pub async fn fetch_material_textures(
        &self,
        resources: &mut [Resource],
        ct: &CancellationToken,
    ) -> Result<()> {
        let jobs = resources
            .iter()
            .enumerate()
            .filter(|(_, x)| matches!(x.kind, ResourceKind::Material(_)))
            .map(|(index, x)| (index, x.id))
            .collect::<Vec<_>>();
        let api = self.api.clone();
        let results = self
            .processing
            .run(jobs, ct, move |id| {
                let api = api.clone();
                async move { api.asset_detail(id).await.map(|x| texture_ids(&x)) }
            })
            .await;
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        for (index, result) in results {
            match (result, &mut resources[index].kind) {
                (Ok(ids), ResourceKind::Material(info)) => info.texture_ids = ids,
                (Err(err), _) => warn!("Material {} detail lookup failed: {}", resources[index].id, err),
                _ => {}
            }
        }
        Ok(())
    }
}

fn pick_by_name<T>(items: Vec<T>, name: &str, name_of: impl Fn(&T) -> &String) -> Option<T> {
    let exact = items.iter().position(|x| name_of(x) == name);
    let index = exact.or_else(|| {
        items
            .iter()
            .position(|x| name_of(x).eq_ignore_ascii_case(name))
    })?;
    items.into_iter().nth(index)
}

/// Texture asset ids referenced by a material's `*Map` slots.
fn texture_ids(detail: &Value) -> Vec<AssetId> {
    let mut ids = detail
        .get("data")
        .and_then(Value::as_object)
        .map(|data| {
            data.iter()
                .filter(|(key, _)| key.ends_with("Map"))
                .filter_map(|(_, value)| value.as_i64())
                .map(AssetId)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    ids.sort();
    ids.dedup();
    ids
}
