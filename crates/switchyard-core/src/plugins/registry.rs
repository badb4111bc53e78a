//! Plugin manifest discovery.
//!
//! Scans the configured plugin directories (max 2 levels deep) for
//! `plugin.yaml`, `plugin.yml` or `plugin.json`. Manifests are immutable once
//! loaded; `reload` swaps the whole map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::models::PluginManifest;

const MANIFEST_FILENAMES: &[&str] = &["plugin.yaml", "plugin.yml", "plugin.json"];

const MAX_SCAN_DEPTH: usize = 2;

/// In-memory registry of discovered plugin manifests.
pub struct PluginRegistry {
    dirs: Vec<PathBuf>,
    manifests: RwLock<HashMap<String, Arc<PluginManifest>>>,
}

impl PluginRegistry {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            manifests: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry and load it immediately.
    pub fn load(dirs: Vec<PathBuf>) -> Self {
        let registry = Self::new(dirs);
        registry.reload();
        registry
    }

    /// Rescan every plugin directory and replace the registry contents.
    pub fn reload(&self) -> usize {
        let mut discovered = HashMap::new();
        for dir in &self.dirs {
            if dir.is_dir() {
                discover_manifests(dir, &mut discovered, 0);
            }
        }

        let count = discovered.len();
        if let Ok(mut manifests) = self.manifests.write() {
            *manifests = discovered;
        }
        tracing::info!("[PluginRegistry] Discovered {} plugin manifest(s)", count);
        count
    }

    /// Register a manifest directly, replacing any manifest with the same id.
    pub fn insert(&self, manifest: PluginManifest) {
        if let Ok(mut manifests) = self.manifests.write() {
            manifests.insert(manifest.id.clone(), Arc::new(manifest));
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginManifest>> {
        self.manifests.read().ok().and_then(|m| m.get(id).cloned())
    }

    /// All manifests, sorted by id.
    pub fn list(&self) -> Vec<Arc<PluginManifest>> {
        let mut list: Vec<_> = self
            .manifests
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a: &Arc<PluginManifest>, b| a.id.cmp(&b.id));
        list
    }

    pub fn len(&self) -> usize {
        self.manifests.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn discover_manifests(dir: &Path, out: &mut HashMap<String, Arc<PluginManifest>>, depth: usize) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            discover_manifests(&path, out, depth + 1);
            continue;
        }
        let is_manifest = path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| MANIFEST_FILENAMES.contains(&f))
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }

        match PluginManifest::from_file(&path) {
            Ok(manifest) => {
                if out.contains_key(&manifest.id) {
                    tracing::warn!(
                        "[PluginRegistry] Duplicate plugin id '{}' at {}, keeping the first",
                        manifest.id,
                        path.display()
                    );
                    continue;
                }
                tracing::debug!(
                    "[PluginRegistry] Loaded plugin '{}' v{}",
                    manifest.id,
                    manifest.version
                );
                out.insert(manifest.id.clone(), Arc::new(manifest));
            }
            Err(e) => {
                tracing::warn!("[PluginRegistry] Skipping manifest {}: {}", path.display(), e);
            }
        }
    }
}
