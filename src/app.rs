use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::db::{ChangeKind, TaxaDb};
use crate::dyntaxa::{TaxonService, extract_child_ids, resolve_root_id};
use crate::error::SyncError;
use crate::hash::{source_hash, taxon_digest};
use crate::snapshot::Snapshots;
use crate::taxon::{SpeciesRow, TaxonRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Refresh cache, rebuild lists, reconcile the database.
    Full,
    /// Refresh the cache and stop.
    CacheOnly,
    /// Rebuild the list files from the existing cache and stop.
    ListsOnly,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub force: bool,
    pub no_db: bool,
    pub mode: RunMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: false,
            no_db: false,
            mode: RunMode::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub root_id: i64,
    pub child_count: usize,
    pub source_hash: String,
    pub fast_exit: bool,
    pub cache_miss_before: usize,
    pub fetched_ok: usize,
    pub skipped_missing: usize,
    pub species_count: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deactivated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
}

impl RunSummary {
    fn new(root_id: i64, child_count: usize, source_hash: String) -> Self {
        Self {
            root_id,
            child_count,
            source_hash,
            fast_exit: false,
            cache_miss_before: 0,
            fetched_ok: 0,
            skipped_missing: 0,
            species_count: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            deactivated: 0,
            run_id: None,
        }
    }
}

/// The sync pipeline: root resolution, child-id listing, cache refresh,
/// species extraction and database reconciliation, in that order. Generic
/// over the service client so tests can script the remote side.
pub struct App<S: TaxonService> {
    config: SyncConfig,
    service: S,
    cache: CacheStore,
    snapshots: Snapshots,
}

impl<S: TaxonService> App<S> {
    pub fn new(config: SyncConfig, service: S) -> Self {
        let cache = CacheStore::new(config.cache_root.clone());
        let snapshots = Snapshots::new(&config.data_root);
        Self {
            config,
            service,
            cache,
            snapshots,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    pub fn run(&self, options: &RunOptions) -> Result<RunSummary, SyncError> {
        info!("=== taxon refresh started ===");

        let names_payload = self.service.search_names(&self.config.root_name)?;
        let root_id = resolve_root_id(&names_payload, &self.config.root_name)?;
        info!(root_id, root_name = %self.config.root_name, "root taxon resolved");

        let child_payload = self.service.child_ids(root_id)?;
        let child_ids = extract_child_ids(&child_payload);
        self.snapshots.write_children(root_id, &child_ids)?;
        info!(child_count = child_ids.len(), "child ids fetched");

        let hash = source_hash(root_id, &child_ids);
        let mut summary = RunSummary::new(root_id, child_ids.len(), hash.clone());

        let source_unchanged = self
            .snapshots
            .load_source_revision()
            .map(|prev| prev.source_hash == hash && prev.root_id == root_id)
            .unwrap_or(false);
        if source_unchanged {
            info!("source revision unchanged (root + child ids)");
            if options.mode == RunMode::Full && self.config.fast_exit && !options.force {
                info!("fast exit, nothing can have changed upstream");
                info!("=== taxon refresh finished ===");
                summary.fast_exit = true;
                return Ok(summary);
            }
        }

        self.cache.ensure_root()?;
        summary.cache_miss_before = child_ids
            .iter()
            .filter(|&&id| !self.cache.has_meta(id))
            .count();

        if options.mode != RunMode::ListsOnly {
            summary.fetched_ok = self.refresh_cache(&child_ids)?;
        }
        info!(
            miss_before = summary.cache_miss_before,
            fetched_ok = summary.fetched_ok,
            "cache refreshed"
        );

        if options.mode == RunMode::CacheOnly {
            self.snapshots
                .write_source_revision(root_id, child_ids.len(), &hash)?;
            info!("=== taxon refresh finished ===");
            return Ok(summary);
        }

        let (species, skipped_missing) = self.collect_species(&child_ids);
        summary.skipped_missing = skipped_missing;
        summary.species_count = species.len();

        let species_ids: Vec<i64> = species.iter().map(|(record, _)| record.taxon_id).collect();
        let rows: Vec<SpeciesRow> = species
            .iter()
            .map(|(record, _)| record.display_row())
            .collect();
        self.snapshots.write_species_ids(root_id, &species_ids)?;
        self.snapshots.write_species_table(root_id, &rows)?;
        info!(
            species_count = species_ids.len(),
            skipped_missing, "species lists written"
        );

        if options.no_db || options.mode == RunMode::ListsOnly {
            self.snapshots
                .write_source_revision(root_id, child_ids.len(), &hash)?;
            info!("reconciliation skipped");
            info!("=== taxon refresh finished ===");
            return Ok(summary);
        }

        let mut db = TaxaDb::open(&self.config.db_path)?;
        let run_id = db.begin_run(root_id, child_ids.len(), &hash)?;
        let mut active_ids: HashSet<i64> = HashSet::with_capacity(species.len());
        for (record, digest) in &species {
            match db.upsert_taxon(run_id, record, Some(digest.as_str()), true)? {
                ChangeKind::Inserted => summary.inserted += 1,
                ChangeKind::Updated | ChangeKind::Reactivated => summary.updated += 1,
                _ => summary.unchanged += 1,
            }
            active_ids.insert(record.taxon_id);
        }
        summary.deactivated = db.deactivate_missing(run_id, &active_ids)?;
        db.end_run(
            run_id,
            active_ids.len(),
            summary.inserted,
            summary.updated,
            summary.unchanged,
            summary.deactivated,
        )?;
        summary.run_id = Some(run_id);

        self.snapshots
            .write_source_revision(root_id, child_ids.len(), &hash)?;
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            deactivated = summary.deactivated,
            "reconciliation finished"
        );
        info!("=== taxon refresh finished ===");
        Ok(summary)
    }

    /// Refreshes every stale id through the batch detail endpoint. Each
    /// chunk's cache writes are durable on their own, so a failure part-way
    /// keeps the chunks already written. Ids the service does not return are
    /// negative-cached so the next run does not ask for them again.
    fn refresh_cache(&self, child_ids: &[i64]) -> Result<usize, SyncError> {
        let to_fetch = self.cache.select_stale(child_ids, self.config.ttl_seconds);
        if to_fetch.is_empty() {
            return Ok(0);
        }
        debug!(stale = to_fetch.len(), "fetching taxa in batches");

        let mut written_ok = 0;
        for chunk in to_fetch.chunks(self.config.batch_size) {
            let objects = self.service.taxa_details(chunk)?;
            let mut returned: HashSet<i64> = HashSet::with_capacity(objects.len());
            for object in &objects {
                let Some(id) = object.get("taxonId").and_then(Value::as_i64) else {
                    continue;
                };
                returned.insert(id);
                self.cache.put(id, 200, Some(object))?;
                written_ok += 1;
            }
            for &id in chunk {
                if !returned.contains(&id) {
                    self.cache.put(id, 404, None)?;
                }
            }
        }
        Ok(written_ok)
    }

    /// Walks the cached child records and keeps the accepted taxonomic
    /// species, paired with their content digest. Missing, negative and
    /// unparseable entries are counted as skipped.
    fn collect_species(&self, child_ids: &[i64]) -> (Vec<(TaxonRecord, String)>, usize) {
        let mut species = Vec::new();
        let mut skipped = 0;
        for &id in child_ids {
            let Some(payload) = self.cache.get(id, self.config.ttl_seconds) else {
                skipped += 1;
                continue;
            };
            let Some(record) = TaxonRecord::from_value(&payload) else {
                skipped += 1;
                continue;
            };
            if !record.is_accepted_species() {
                continue;
            }
            let digest = self
                .cache
                .digest(id)
                .unwrap_or_else(|| taxon_digest(&payload));
            species.push((record, digest));
        }
        (species, skipped)
    }
}
