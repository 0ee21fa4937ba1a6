use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    api::{AssetId, AssetSummary},
    manifest::folders::{sanitize_segment, FolderPaths},
    ResourceStatus,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TextureInfo {
    pub resolution: Option<(u32, u32)>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ModelInfo {
    pub lod_count: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MaterialInfo {
    pub texture_ids: Vec<AssetId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceKind {
    Texture(TextureInfo),
    Model(ModelInfo),
    Material(MaterialInfo),
}

impl ResourceKind {
    /// Kind for an API asset type; `None` for folders and asset types the
    /// pipeline does not track (scripts, audio, ...).
    pub fn for_asset_type(asset_type: &str) -> Option<Self> {
        match asset_type {
            "texture" => Some(Self::Texture(TextureInfo::default())),
            "model" | "container" | "scene" => Some(Self::Model(ModelInfo::default())),
            "material" => Some(Self::Material(MaterialInfo::default())),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Texture(_) => "texture",
            Self::Model(_) => "model",
            Self::Material(_) => "material",
        }
    }
}

/// A transition reported to observers. Only produced when the status value
/// really changed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub id: AssetId,
    pub from: ResourceStatus,
    pub to: ResourceStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: AssetId,
    pub name: String,
    pub kind: ResourceKind,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub extension: String,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub parent: Option<AssetId>,
    pub status: ResourceStatus,
    pub download_progress: u8,
    pub upload_progress: u8,
    pub uploaded_hash: Option<String>,
    pub remote_url: Option<String>,
    pub last_uploaded_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(id: AssetId, name: impl Into<String>, kind: ResourceKind) -> Self {
        Resource {
            id,
            name: name.into(),
            kind,
            path: None,
            url: None,
            extension: String::new(),
            size: None,
            hash: None,
            parent: None,
            status: ResourceStatus::Unset,
            download_progress: 0,
            upload_progress: 0,
            uploaded_hash: None,
            remote_url: None,
            last_uploaded_at: None,
        }
    }

    /// Builds a resource from a manifest entry.
    ///
    /// Materials carry no file of their own: their fetch URL is the asset
    /// detail endpoint and the mirrored file is that JSON document.
    pub fn from_summary(summary: &AssetSummary, api_url: &str) -> Option<Self> {
        let kind = ResourceKind::for_asset_type(&summary.asset_type)?;
        let mut resource = Resource::new(summary.id, summary.name.clone(), kind);
        resource.parent = summary.parent;
        resource.status = ResourceStatus::OnServer;

        if matches!(resource.kind, ResourceKind::Material(_)) {
            resource.extension = ".json".to_string();
            resource.url = Some(format!(
                "{}/assets/{}",
                api_url.trim_end_matches('/'),
                summary.id
            ));
            return Some(resource);
        }

        if let Some(file) = &summary.file {
            let file_name = file.filename.as_deref().unwrap_or(&summary.name);
            resource.extension = extension_of(file_name);
            resource.size = file.size;
            resource.hash = file.hash.clone().filter(|x| !x.is_empty());
            resource.url = file.url.as_deref().and_then(|x| absolute_url(api_url, x));
        } else {
            resource.extension = extension_of(&summary.name);
        }
        Some(resource)
    }

    pub fn requires_download(&self) -> bool {
        self.status.is_downloadable()
    }

    /// Whether content with `current_hash` still has to be pushed. The caller
    /// is responsible for checking that the file exists.
    pub fn requires_upload(&self, current_hash: &str) -> bool {
        match self.uploaded_hash.as_deref() {
            Some(uploaded) if !uploaded.is_empty() => !uploaded.eq_ignore_ascii_case(current_hash),
            _ => true,
        }
    }

    pub fn file_exists(&self) -> bool {
        self.path.as_deref().is_some_and(Path::is_file)
    }

    pub fn set_status(&mut self, status: ResourceStatus) -> Option<StatusChange> {
        if self.status == status {
            return None;
        }
        let change = StatusChange {
            id: self.id,
            from: self.status,
            to: status,
        };
        self.status = status;
        Some(change)
    }

    /// File name used on disk: the asset name, sanitized, with the extension
    /// appended when the name does not already end with it.
    pub fn file_name(&self) -> String {
        let name = sanitize_segment(&self.name);
        let name = if name.is_empty() {
            self.id.to_string()
        } else {
            name
        };
        if self.extension.is_empty()
            || name
                .to_ascii_lowercase()
                .ends_with(&self.extension.to_ascii_lowercase())
        {
            name
        } else {
            format!("{}{}", name, self.extension)
        }
    }

    /// Sets `path` to `{projects_root}/{project_name}/assets/{folder}/{file}`
    /// unless it is already set.
    pub fn resolve_path(
        &mut self,
        projects_root: &Path,
        project_name: &str,
        folder_paths: &FolderPaths,
    ) {
        if self.path.is_none() {
            let mut path = projects_root.join(project_name).join("assets");
            if let Some(folder) = self.parent.and_then(|x| folder_paths.get(x)) {
                for segment in folder.split('/').filter(|x| !x.is_empty()) {
                    path.push(segment);
                }
            }
            path.push(self.file_name());
            self.path = Some(path);
        }
    }

    pub fn mark_uploaded(&mut self, hash: String, remote_url: Option<String>, at: DateTime<Utc>) {
        self.uploaded_hash = Some(hash);
        self.remote_url = remote_url;
        self.last_uploaded_at = Some(at);
        self.upload_progress = 100;
    }
}

/// Lowercased extension with its leading dot, or an empty string.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|x| x.to_str())
        .map(|x| format!(".{}", x.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn absolute_url(api_url: &str, url: &str) -> Option<String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(url.to_string());
    }
    url::Url::parse(api_url)
        .and_then(|base| base.join(url))
        .map(|x| x.to_string())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AssetFile;

    fn summary(id: i64, asset_type: &str, name: &str) -> AssetSummary {
        AssetSummary {
            id: AssetId(id),
            asset_type: asset_type.to_string(),
            name: name.to_string(),
            path: vec![],
            parent: Some(AssetId(1)),
            file: Some(AssetFile {
                size: Some(2048),
                hash: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
                filename: Some(name.to_string()),
                url: Some(format!("/api/assets/{}/file/{}", id, name)),
            }),
        }
    }

    #[test]
    fn should_build_texture_from_summary() {
        let resource =
            Resource::from_summary(&summary(10, "texture", "Brick.PNG"), "https://example.com/api")
                .unwrap();

        assert!(matches!(resource.kind, ResourceKind::Texture(_)));
        assert_eq!(resource.extension, ".png");
        assert_eq!(resource.size, Some(2048));
        assert_eq!(resource.status, ResourceStatus::OnServer);
        assert_eq!(
            resource.url.as_deref(),
            Some("https://example.com/api/assets/10/file/Brick.PNG")
        );
        assert_eq!(resource.file_name(), "Brick.PNG");
    }

    #[test]
    fn should_point_materials_at_detail_endpoint() {
        let mut entry = summary(11, "material", "Wood");
        entry.file = None;
        let resource = Resource::from_summary(&entry, "https://example.com/api/").unwrap();

        assert!(matches!(resource.kind, ResourceKind::Material(_)));
        assert_eq!(resource.url.as_deref(), Some("https://example.com/api/assets/11"));
        assert_eq!(resource.file_name(), "Wood.json");
        assert_eq!(resource.hash, None);
    }

    #[test]
    fn should_skip_untracked_asset_types() {
        assert!(Resource::from_summary(&summary(1, "folder", "textures"), "https://x").is_none());
        assert!(Resource::from_summary(&summary(2, "script", "a.js"), "https://x").is_none());
    }

    #[test]
    fn should_report_status_change_once() {
        let mut resource = Resource::new(AssetId(3), "a.glb", ResourceKind::Model(ModelInfo::default()));

        let change = resource.set_status(ResourceStatus::Downloading);
        assert_eq!(
            change,
            Some(StatusChange {
                id: AssetId(3),
                from: ResourceStatus::Unset,
                to: ResourceStatus::Downloading
            })
        );
        assert_eq!(resource.set_status(ResourceStatus::Downloading), None);
    }

    #[test]
    fn should_compare_uploaded_hash() {
        let mut resource =
            Resource::new(AssetId(4), "a.ktx2", ResourceKind::Texture(TextureInfo::default()));
        assert!(resource.requires_upload("abc"));

        resource.uploaded_hash = Some(String::new());
        assert!(resource.requires_upload("abc"));

        resource.uploaded_hash = Some("ABC".to_string());
        assert!(!resource.requires_upload("abc"));
        assert!(resource.requires_upload("abd"));
    }

    #[test]
    fn should_resolve_path_under_project_assets() {
        let mut folder_paths = FolderPaths::default();
        folder_paths.insert(AssetId(1), "env/rocks".to_string());
        let mut resource =
            Resource::new(AssetId(5), "granite", ResourceKind::Texture(TextureInfo::default()));
        resource.extension = ".png".to_string();
        resource.parent = Some(AssetId(1));

        resource.resolve_path(Path::new("/projects"), "Racer", &folder_paths);
        let expected = PathBuf::from("/projects/Racer/assets/env/rocks/granite.png");
        assert_eq!(resource.path.as_ref(), Some(&expected));

        // already resolved paths are left alone
        resource.resolve_path(Path::new("/elsewhere"), "Racer", &FolderPaths::default());
        assert_eq!(resource.path, Some(expected));
    }
}
