//! Persistence of the store contents as a JSON state file

use super::StoreData;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Load store contents from disk
///
/// Returns empty contents if the file doesn't exist.
pub fn load_state(path: &Path) -> Result<StoreData> {
    if !path.exists() {
        return Ok(StoreData::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;

    serde_json::from_str(&content)
        .map_err(|e| Error::Store(format!("failed to parse {}: {e}", path.display())))
}

/// Save store contents to disk
///
/// Writes to a sibling temporary file first so a crash never leaves a
/// truncated state file behind.
pub fn save_state(path: &Path, data: &StoreData) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Store(format!("failed to create {}: {e}", dir.display())))?;
    }

    let content = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Store(format!("failed to write {}: {e}", path.display())))?;

    Ok(())
}
