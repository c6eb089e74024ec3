//! Discovers tagbox manifests on disk and registers them as tagbox rows.

use std::path::{Path, PathBuf};

use crate::db::Database;
use crate::error::Result;

use super::manifest::TagboxManifest;

/// Parse every `*.toml` file in `dir`, sorted by file name.
///
/// Bad manifests are logged and skipped; a missing directory yields nothing.
pub fn load_manifests(dir: &Path) -> Vec<(PathBuf, TagboxManifest)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("[TAGBOX] Cannot read manifest dir {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        match TagboxManifest::from_file(&path) {
            Ok(manifest) => manifests.push((path, manifest)),
            Err(e) => log::error!("[TAGBOX] Skipping manifest {}: {}", path.display(), e),
        }
    }
    manifests
}

/// Register every valid manifest in `dir`. Returns the ids of the registered
/// tagboxes in manifest order.
pub fn register_manifests(db: &Database, dir: &Path) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for (path, manifest) in load_manifests(dir) {
        let (name, settings, regexes) = manifest.into_registration();
        let id = db.upsert_tagbox(&name, &settings, &regexes)?;
        log::info!(
            "[TAGBOX] Registered '{}' (id={}, kind={}) from {}",
            name,
            id,
            settings.kind,
            path.display()
        );
        ids.push(id);
    }
    Ok(ids)
}
