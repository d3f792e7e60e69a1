use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "WORKFLOW_ASSET_DIR";

/// Directory holding the worker's SQLite database and other local state.
///
/// Resolution order: `WORKFLOW_ASSET_DIR`, then `dev_assets/` at the
/// workspace root for debug builds, then the platform data directory.
pub fn asset_dir() -> PathBuf {
    let path = if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("ai", "pcg", "workflow-worker")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".workflow-worker"))
    };

    if !path.exists() {
        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::warn!("Failed to create asset directory {}: {}", path.display(), e);
        }
    }

    path
}

pub fn database_path() -> PathBuf {
    asset_dir().join("db.sqlite")
}
