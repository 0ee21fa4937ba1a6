//! The authoritative asset list of a project branch, as fetched from the API
//! and cached on disk.
//!
//! Change detection is a digest comparison over a canonical serialization:
//! entries are ordered by asset id and object keys are sorted before
//! hashing, so the API returning the same assets in a different order is not
//! an update while any field change is.

use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{api::AssetSummary, models::Resource, transfer::hashing::sha256_bytes};

pub mod folders;
pub mod store;
pub mod sync;

pub use folders::FolderPaths;
pub use sync::{ManifestCheck, ManifestSync};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Manifest {
    pub assets: Vec<Value>,
}

impl Manifest {
    pub fn new(assets: Vec<Value>) -> Self {
        Manifest { assets }
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Typed view of the entries. Entries that do not parse are skipped.
    pub fn summaries(&self) -> Vec<AssetSummary> {
        self.assets
            .iter()
            .filter_map(|x| match serde_json::from_value::<AssetSummary>(x.clone()) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    warn!("Skipping malformed manifest entry: {}", err);
                    None
                }
            })
            .collect()
    }

    /// A resource per tracked asset with its local path resolved under
    /// `{projects_root}/{project_name}/assets`. Download URLs are made
    /// absolute against `api_url`.
    pub fn resources(&self, api_url: &str, project_name: &str, projects_root: &Path) -> (Vec<Resource>, FolderPaths) {
        let summaries = self.summaries();
        let folder_paths = FolderPaths::resolve(&summaries);
        let resources = summaries
            .iter()
            .filter_map(|x| Resource::from_summary(x, api_url))
            .map(|mut resource| {
                resource.resolve_path(projects_root, project_name, &folder_paths);
                resource
            })
            .collect::<Vec<_>>();
        (resources, folder_paths)
    }

    pub fn content_hash(&self) -> String {
        sha256_bytes(&self.canonical_bytes())
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut entries: Vec<&Value> = self.assets.iter().collect();
        // stable: entries without an id keep their relative order, last
        entries.sort_by_key(|x| match x.get("id").and_then(Value::as_i64) {
            Some(id) => (0, id),
            None => (1, 0),
        });
        let canonical = Value::Array(entries.into_iter().map(canonicalize).collect());
        canonical.to_string().into_bytes()
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&object[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AssetId;
    use serde_json::json;

    fn asset(id: i64, name: &str) -> Value {
        json!({"id": id, "type": "texture", "name": name, "file": {"size": 10, "hash": "h"}})
    }

    #[test]
    fn should_ignore_entry_order() {
        let first = Manifest::new(vec![asset(1, "a"), asset(2, "b")]);
        let second = Manifest::new(vec![asset(2, "b"), asset(1, "a")]);

        assert_eq!(first.content_hash(), second.content_hash());
    }

    #[test]
    fn should_ignore_key_order() -> Result<(), serde_json::Error> {
        let first: Value = serde_json::from_str(r#"{"id": 1, "name": "a", "type": "texture"}"#)?;
        let second: Value = serde_json::from_str(r#"{"type": "texture", "name": "a", "id": 1}"#)?;

        assert_eq!(
            Manifest::new(vec![first]).content_hash(),
            Manifest::new(vec![second]).content_hash()
        );
        Ok(())
    }

    #[test]
    fn should_detect_field_changes() {
        let first = Manifest::new(vec![asset(1, "a"), asset(2, "b")]);
        let second = Manifest::new(vec![asset(1, "a"), asset(2, "renamed")]);

        assert_ne!(first.content_hash(), second.content_hash());
    }

    #[test]
    fn should_detect_added_entries() {
        let first = Manifest::new(vec![asset(1, "a")]);
        let second = Manifest::new(vec![asset(1, "a"), asset(2, "b")]);

        assert_ne!(first.content_hash(), second.content_hash());
    }

    #[test]
    fn should_resolve_resources_under_their_folders() {
        let manifest = Manifest::new(vec![
            json!({"id": 1, "type": "folder", "name": "env"}),
            json!({"id": 2, "type": "texture", "name": "sky.png", "parent": 1}),
            json!({"id": 3, "type": "shader", "name": "glow"}),
        ]);

        let (resources, folder_paths) = manifest.resources("https://example.com/api", "Racer", Path::new("/w"));

        assert_eq!(folder_paths.get(AssetId(1)), Some("env"));
        assert_eq!(resources.len(), 1);
        assert_eq!(
            resources[0].path.as_deref(),
            Some(Path::new("/w/Racer/assets/env/sky.png"))
        );
    }

    #[test]
    fn should_skip_malformed_summaries() {
        let manifest = Manifest::new(vec![asset(1, "a"), json!({"name": "no id"})]);
        assert_eq!(manifest.summaries().len(), 1);
    }
}
