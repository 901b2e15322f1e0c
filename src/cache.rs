use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::fs_util::{now_epoch, read_json_lenient, write_json_atomic};
use crate::hash::taxon_digest;

/// Ids per shard directory, bounding directory fan-out.
const SHARD_SPAN: i64 = 10_000;

/// File cache of taxon payloads, one `<id>.json` / `<id>.meta.json` pair per
/// taxon, sharded by id range. A pair with a non-200 status and no payload
/// is a negative marker: the id was asked for and the service did not return
/// it, so it is not asked for again while the entry is fresh.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub taxon_id: i64,
    pub status: u16,
    pub fetched_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl CacheStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), SyncError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    fn shard_dir(&self, taxon_id: i64) -> Utf8PathBuf {
        self.root.join(format!("{:04}", taxon_id / SHARD_SPAN))
    }

    pub fn payload_path(&self, taxon_id: i64) -> Utf8PathBuf {
        self.shard_dir(taxon_id).join(format!("{taxon_id}.json"))
    }

    pub fn meta_path(&self, taxon_id: i64) -> Utf8PathBuf {
        self.shard_dir(taxon_id).join(format!("{taxon_id}.meta.json"))
    }

    /// Records a fetch attempt. A 200 with a payload stores the payload and
    /// its content digest (returned); any other status drops an existing
    /// payload and leaves a negative marker.
    pub fn put(
        &self,
        taxon_id: i64,
        status: u16,
        payload: Option<&Value>,
    ) -> Result<Option<String>, SyncError> {
        let mut meta = CacheMeta {
            taxon_id,
            status,
            fetched_at: now_epoch(),
            sha256: None,
        };

        match payload {
            Some(payload) if status == 200 => {
                meta.sha256 = Some(taxon_digest(payload));
                write_json_atomic(&self.payload_path(taxon_id), payload)?;
            }
            _ => {
                let payload_path = self.payload_path(taxon_id);
                if payload_path.as_std_path().exists() {
                    fs::remove_file(payload_path.as_std_path())
                        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                }
            }
        }

        write_json_atomic(&self.meta_path(taxon_id), &meta)?;
        Ok(meta.sha256)
    }

    /// Returns the cached payload if the entry is a fresh 200. Never-fetched,
    /// stale, negative and corrupt entries all collapse to `None`.
    pub fn get(&self, taxon_id: i64, ttl_seconds: u64) -> Option<Value> {
        let meta = self.meta(taxon_id)?;
        if meta.status != 200 || needs_refresh(&meta, ttl_seconds) {
            return None;
        }
        read_json_lenient(&self.payload_path(taxon_id))
    }

    /// Stored content digest of a cached 200 entry, if present.
    pub fn digest(&self, taxon_id: i64) -> Option<String> {
        self.meta(taxon_id).and_then(|meta| meta.sha256)
    }

    pub fn has_meta(&self, taxon_id: i64) -> bool {
        self.meta_path(taxon_id).as_std_path().exists()
    }

    fn meta(&self, taxon_id: i64) -> Option<CacheMeta> {
        let value = read_json_lenient(&self.meta_path(taxon_id))?;
        serde_json::from_value(value).ok()
    }

    /// Ids that need a remote fetch: no entry, unreadable entry, TTL expiry,
    /// or a 200 entry whose payload file is gone. Fresh negative markers are
    /// not re-selected. Output preserves input order.
    pub fn select_stale(&self, ids: &[i64], ttl_seconds: u64) -> Vec<i64> {
        ids.iter()
            .copied()
            .filter(|&id| match self.meta(id) {
                None => true,
                Some(meta) => {
                    needs_refresh(&meta, ttl_seconds)
                        || (meta.status == 200 && !self.payload_path(id).as_std_path().exists())
                }
            })
            .collect()
    }
}

fn needs_refresh(meta: &CacheMeta, ttl_seconds: u64) -> bool {
    if meta.fetched_at <= 0 {
        return true;
    }
    if ttl_seconds == 0 {
        return false;
    }
    now_epoch() - meta.fetched_at >= ttl_seconds as i64
}
