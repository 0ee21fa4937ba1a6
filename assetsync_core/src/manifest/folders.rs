use std::collections::{BTreeMap, HashMap, HashSet};

use crate::api::{AssetId, AssetSummary};

/// Folder id to sanitized, `/`-separated path relative to the project's
/// `assets` directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderPaths(HashMap<AssetId, String>);

impl FolderPaths {
    /// Resolves every folder entry of a manifest. Deterministic for a given
    /// manifest; cycles and dangling parents end the chain at that link.
    pub fn resolve(entries: &[AssetSummary]) -> Self {
        let folders: BTreeMap<AssetId, (&str, Option<AssetId>)> = entries
            .iter()
            .filter(|x| x.is_folder())
            .map(|x| (x.id, (x.name.as_str(), x.parent)))
            .collect();

        let mut memo = HashMap::with_capacity(folders.len());
        let mut visiting = HashSet::new();
        for id in folders.keys() {
            resolve_folder(*id, &folders, &mut memo, &mut visiting);
        }
        FolderPaths(memo)
    }

    pub fn get(&self, id: AssetId) -> Option<&str> {
        self.0.get(&id).map(String::as_str)
    }

    pub fn insert(&mut self, id: AssetId, path: String) {
        self.0.insert(id, path);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn resolve_folder(
    id: AssetId,
    folders: &BTreeMap<AssetId, (&str, Option<AssetId>)>,
    memo: &mut HashMap<AssetId, String>,
    visiting: &mut HashSet<AssetId>,
) -> String {
    if let Some(path) = memo.get(&id) {
        return path.clone();
    }
    let Some((name, parent)) = folders.get(&id) else {
        return String::new();
    };
    if !visiting.insert(id) {
        return String::new();
    }

    let parent_path = match parent {
        Some(parent) if *parent != id => resolve_folder(*parent, folders, memo, visiting),
        _ => String::new(),
    };
    visiting.remove(&id);

    let name = sanitize_segment(name);
    let path = match (parent_path.is_empty(), name.is_empty()) {
        (true, _) => name,
        (false, true) => parent_path,
        (false, false) => format!("{}/{}", parent_path, name),
    };
    memo.insert(id, path.clone());
    path
}

/// Makes a folder or file name safe for every desktop filesystem.
pub fn sanitize_segment(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|x| match x {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            x if x.is_control() => '_',
            x => x,
        })
        .collect();
    let trimmed = replaced.trim().trim_end_matches('.').trim_end();
    match trimmed {
        "" if !name.trim().is_empty() => "_".to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: i64, name: &str, parent: Option<i64>) -> AssetSummary {
        AssetSummary {
            id: AssetId(id),
            asset_type: "folder".to_string(),
            name: name.to_string(),
            path: vec![],
            parent: parent.map(AssetId),
            file: None,
        }
    }

    #[test]
    fn should_resolve_nested_folders() {
        let paths = FolderPaths::resolve(&[
            folder(3, "rocks", Some(2)),
            folder(1, "env", None),
            folder(2, "nature", Some(1)),
        ]);

        assert_eq!(paths.get(AssetId(1)), Some("env"));
        assert_eq!(paths.get(AssetId(2)), Some("env/nature"));
        assert_eq!(paths.get(AssetId(3)), Some("env/nature/rocks"));
    }

    #[test]
    fn should_terminate_on_cycles_and_self_references() {
        let paths = FolderPaths::resolve(&[
            folder(1, "a", Some(2)),
            folder(2, "b", Some(1)),
            folder(3, "self", Some(3)),
        ]);

        assert_eq!(paths.len(), 3);
        assert_eq!(paths.get(AssetId(3)), Some("self"));
        // resolution starts from the lowest id, which closes the loop at 1
        assert_eq!(paths.get(AssetId(2)), Some("b"));
        assert_eq!(paths.get(AssetId(1)), Some("b/a"));
    }

    #[test]
    fn should_treat_unknown_parent_as_root() {
        let paths = FolderPaths::resolve(&[folder(5, "orphans", Some(99))]);
        assert_eq!(paths.get(AssetId(5)), Some("orphans"));
    }

    #[test]
    fn should_be_idempotent() {
        let entries = [folder(1, "env", None), folder(2, "sky:box", Some(1))];
        assert_eq!(FolderPaths::resolve(&entries), FolderPaths::resolve(&entries));
        assert_eq!(FolderPaths::resolve(&entries).get(AssetId(2)), Some("env/sky_box"));
    }

    #[test]
    fn should_sanitize_segments() {
        assert_eq!(sanitize_segment("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_segment(" spaced. "), "spaced");
        assert_eq!(sanitize_segment("what?*"), "what__");
        assert_eq!(sanitize_segment("..."), "_");
        assert_eq!(sanitize_segment(""), "");
    }
}
