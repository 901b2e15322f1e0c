use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use serde_json::Value;

use crate::error::SyncError;

/// Writes `value` as pretty JSON via a sibling tmp file and an atomic rename.
pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    let mut content =
        serde_json::to_vec_pretty(value).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    content.push(b'\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Reads a JSON document, collapsing any failure (missing, unreadable,
/// malformed) to `None`.
pub fn read_json_lenient(path: &Utf8Path) -> Option<Value> {
    let content = fs::read_to_string(path.as_std_path()).ok()?;
    serde_json::from_str(&content).ok()
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
