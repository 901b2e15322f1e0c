use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::fs_util::{now_epoch, read_json_lenient, write_json_atomic};
use crate::taxon::SpeciesRow;

/// Fingerprint of the upstream hierarchy as of the last completed run.
/// Matching fingerprints let a run terminate before any fetch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRevision {
    pub root_id: i64,
    pub child_count: usize,
    pub source_hash: String,
    pub updated_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenSnapshot<'a> {
    root_id: i64,
    child_ids: &'a [i64],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeciesIdsSnapshot<'a> {
    root_id: i64,
    species_taxon_ids: &'a [i64],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeciesTableSnapshot<'a> {
    root_id: i64,
    species: &'a [SpeciesRow],
}

/// The flat JSON exports written next to the cache: child-id list, species-id
/// list, species display table and the source-revision marker. Every document
/// opens with `rootId`.
#[derive(Debug, Clone)]
pub struct Snapshots {
    children_path: Utf8PathBuf,
    species_ids_path: Utf8PathBuf,
    species_table_path: Utf8PathBuf,
    source_revision_path: Utf8PathBuf,
}

impl Snapshots {
    pub fn new(data_root: &Utf8Path) -> Self {
        Self {
            children_path: data_root.join("children_ids.json"),
            species_ids_path: data_root.join("species_ids.json"),
            species_table_path: data_root.join("species_table.json"),
            source_revision_path: data_root.join("source_revision.json"),
        }
    }

    pub fn children_path(&self) -> &Utf8Path {
        &self.children_path
    }

    pub fn species_ids_path(&self) -> &Utf8Path {
        &self.species_ids_path
    }

    pub fn species_table_path(&self) -> &Utf8Path {
        &self.species_table_path
    }

    pub fn source_revision_path(&self) -> &Utf8Path {
        &self.source_revision_path
    }

    pub fn write_children(&self, root_id: i64, child_ids: &[i64]) -> Result<(), SyncError> {
        write_json_atomic(&self.children_path, &ChildrenSnapshot { root_id, child_ids })
    }

    pub fn write_species_ids(&self, root_id: i64, species_ids: &[i64]) -> Result<(), SyncError> {
        write_json_atomic(
            &self.species_ids_path,
            &SpeciesIdsSnapshot {
                root_id,
                species_taxon_ids: species_ids,
            },
        )
    }

    pub fn write_species_table(
        &self,
        root_id: i64,
        species: &[SpeciesRow],
    ) -> Result<(), SyncError> {
        write_json_atomic(
            &self.species_table_path,
            &SpeciesTableSnapshot { root_id, species },
        )
    }

    /// Previous revision, or `None` when the marker is missing or unreadable
    /// (either way the run proceeds as if the source had changed).
    pub fn load_source_revision(&self) -> Option<SourceRevision> {
        let value = read_json_lenient(&self.source_revision_path)?;
        serde_json::from_value(value).ok()
    }

    pub fn write_source_revision(
        &self,
        root_id: i64,
        child_count: usize,
        source_hash: &str,
    ) -> Result<(), SyncError> {
        write_json_atomic(
            &self.source_revision_path,
            &SourceRevision {
                root_id,
                child_count,
                source_hash: source_hash.to_string(),
                updated_at: now_epoch(),
            },
        )
    }
}
