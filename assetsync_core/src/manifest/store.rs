use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::debug;

use super::Manifest;
use crate::Result;

pub const MANIFEST_FILE_NAME: &str = "assets_list.json";

/// `{projects_root}/{project_name}/assets_list.json`
pub fn cache_path(projects_root: &Path, project_name: &str) -> PathBuf {
    projects_root.join(project_name).join(MANIFEST_FILE_NAME)
}

/// Loads a cached manifest; a missing file is `Ok(None)`.
pub async fn load(path: &Path) -> Result<Option<Manifest>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let manifest: Manifest = serde_json::from_str(&text)?;
    debug!("Loaded {} cached assets from {}", manifest.len(), path.display());
    Ok(Some(manifest))
}

/// Writes the manifest as indented JSON, replacing the previous cache only
/// once the new one is fully written.
pub async fn save(path: &Path, manifest: &Manifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_json::to_string_pretty(manifest)?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, text.as_bytes()).await?;
    tokio::fs::rename(&temp_path, path).await?;
    debug!("Saved {} assets to {}", manifest.len(), path.display());
    Ok(())
}
