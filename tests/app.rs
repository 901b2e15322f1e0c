use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tempfile::TempDir;

use dyntaxa_sync::app::{App, RunMode, RunOptions};
use dyntaxa_sync::config::SyncConfig;
use dyntaxa_sync::db::TaxaDb;
use dyntaxa_sync::dyntaxa::TaxonService;
use dyntaxa_sync::error::SyncError;

const ROOT_ID: i64 = 3_000_188;

/// Scripted taxon service: a fixed root, a mutable child-id list and a
/// taxa-by-id table, recording the chunk size of every detail call.
struct MockService {
    child_ids: Mutex<Vec<i64>>,
    taxa: Mutex<HashMap<i64, Value>>,
    detail_calls: Mutex<Vec<usize>>,
}

impl MockService {
    fn new(taxa: Vec<Value>) -> Arc<Self> {
        let child_ids = taxa
            .iter()
            .map(|t| t["taxonId"].as_i64().unwrap())
            .collect();
        let taxa = taxa
            .into_iter()
            .map(|t| (t["taxonId"].as_i64().unwrap(), t))
            .collect();
        Arc::new(Self {
            child_ids: Mutex::new(child_ids),
            taxa: Mutex::new(taxa),
            detail_calls: Mutex::new(Vec::new()),
        })
    }

    fn detail_calls(&self) -> Vec<usize> {
        self.detail_calls.lock().unwrap().clone()
    }

    fn set_child_ids(&self, ids: Vec<i64>) {
        *self.child_ids.lock().unwrap() = ids;
    }

    fn remove_taxon(&self, taxon_id: i64) {
        self.child_ids.lock().unwrap().retain(|&id| id != taxon_id);
        self.taxa.lock().unwrap().remove(&taxon_id);
    }
}

impl TaxonService for MockService {
    fn search_names(&self, query: &str) -> Result<Value, SyncError> {
        Ok(json!({"data": [{
            "name": query,
            "category": {"value": "Order"},
            "type": {"value": "Taxonomic"},
            "status": {"value": "Accepted"},
            "taxonInformation": {
                "taxonId": ROOT_ID,
                "recommendedScientificName": query
            }
        }]}))
    }

    fn child_ids(&self, _taxon_id: i64) -> Result<Value, SyncError> {
        Ok(json!({"taxonIds": self.child_ids.lock().unwrap().clone()}))
    }

    fn taxa_details(&self, ids: &[i64]) -> Result<Vec<Value>, SyncError> {
        self.detail_calls.lock().unwrap().push(ids.len());
        let taxa = self.taxa.lock().unwrap();
        Ok(ids.iter().filter_map(|id| taxa.get(id).cloned()).collect())
    }
}

fn species(taxon_id: i64, sci: &str, swe: &str) -> Value {
    json!({
        "taxonId": taxon_id,
        "parentId": ROOT_ID,
        "category": {"value": "Species"},
        "type": {"value": "Taxonomic"},
        "status": {"value": "Accepted"},
        "names": [
            {"name": sci, "category": {"value": "ScientificName"}, "isRecommended": true},
            {"name": swe, "category": {"value": "SwedishName"}, "isRecommended": true}
        ]
    })
}

fn three_species() -> Vec<Value> {
    vec![
        species(201, "Aglais io", "påfågelöga"),
        species(202, "Aglais urticae", "nässelfjäril"),
        species(203, "Pieris napi", "rapsfjäril"),
    ]
}

fn test_config(temp: &TempDir, fast_exit: bool) -> SyncConfig {
    let data_root = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();
    SyncConfig {
        api_key: "test-key".to_string(),
        base_url: "http://localhost:9".to_string(),
        root_name: "Lepidoptera".to_string(),
        culture: "sv_SE".to_string(),
        ttl_seconds: 0,
        batch_size: 200,
        timeout_seconds: 5,
        fast_exit,
        cache_root: data_root.join("cache"),
        db_path: data_root.join("db").join("taxa.sqlite"),
        data_root,
    }
}

fn read_snapshot(path: &camino::Utf8Path) -> Value {
    let content = std::fs::read_to_string(path.as_std_path()).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[test]
fn first_run_inserts_every_species() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let config = test_config(&temp, false);
    let db_path = config.db_path.clone();
    let app = App::new(config, service.clone());

    let summary = app.run(&RunOptions::default()).unwrap();
    assert_eq!(summary.root_id, ROOT_ID);
    assert_eq!(summary.child_count, 3);
    assert_eq!(summary.cache_miss_before, 3);
    assert_eq!(summary.fetched_ok, 3);
    assert_eq!(summary.species_count, 3);
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.unchanged, 0);
    assert_eq!(summary.deactivated, 0);

    let ids = read_snapshot(app.snapshots().species_ids_path());
    assert_eq!(ids["rootId"], ROOT_ID);
    assert_eq!(ids["speciesTaxonIds"], json!([201, 202, 203]));

    let table = read_snapshot(app.snapshots().species_table_path());
    assert_eq!(table["species"][0]["scientificName"], "Aglais io");
    assert_eq!(table["species"][0]["genus"], "Aglais");

    let db = TaxaDb::open(&db_path).unwrap();
    assert_eq!(db.active_species_ids().unwrap(), vec![201, 202, 203]);
    let run = db.run(summary.run_id.unwrap()).unwrap().unwrap();
    assert_eq!(run.inserted_count, Some(3));
    assert_eq!(run.species_count, Some(3));
}

#[test]
fn second_run_with_identical_content_is_all_unchanged() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let app = App::new(test_config(&temp, false), service.clone());

    app.run(&RunOptions::default()).unwrap();
    let summary = app.run(&RunOptions::default()).unwrap();

    assert!(!summary.fast_exit);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.unchanged, 3);
    assert_eq!(summary.deactivated, 0);
    // TTL 0: everything was cached by the first run, nothing refetched.
    assert_eq!(summary.fetched_ok, 0);
    assert_eq!(service.detail_calls().len(), 1);
}

#[test]
fn removed_species_is_deactivated() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let config = test_config(&temp, false);
    let db_path = config.db_path.clone();
    let app = App::new(config, service.clone());

    app.run(&RunOptions::default()).unwrap();
    service.remove_taxon(202);
    let summary = app.run(&RunOptions::default()).unwrap();

    assert_eq!(summary.deactivated, 1);
    assert_eq!(summary.unchanged, 2);

    let db = TaxaDb::open(&db_path).unwrap();
    let row = db.taxon(202).unwrap().unwrap();
    assert!(!row.is_active);
    assert_eq!(db.active_species_ids().unwrap(), vec![201, 203]);

    let changes = db.changes(summary.run_id.unwrap()).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, "deactivated");
    assert_eq!(changes[0].taxon_id, 202);
}

#[test]
fn unchanged_source_fast_exits_without_fetch_or_db_writes() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let config = test_config(&temp, true);
    let db_path = config.db_path.clone();
    let app = App::new(config, service.clone());

    let first = app.run(&RunOptions::default()).unwrap();
    assert!(!first.fast_exit);
    let calls_after_first = service.detail_calls().len();

    let second = app.run(&RunOptions::default()).unwrap();
    assert!(second.fast_exit);
    assert_eq!(second.run_id, None);
    assert_eq!(service.detail_calls().len(), calls_after_first);

    let db = TaxaDb::open(&db_path).unwrap();
    assert_eq!(db.run_count().unwrap(), 1);

    // --force pushes through the short-circuit.
    let forced = app
        .run(&RunOptions {
            force: true,
            ..RunOptions::default()
        })
        .unwrap();
    assert!(!forced.fast_exit);
    assert_eq!(forced.unchanged, 3);

    let db = TaxaDb::open(&db_path).unwrap();
    assert_eq!(db.run_count().unwrap(), 2);
}

#[test]
fn omitted_ids_are_negative_cached_and_not_refetched() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    // One child id the service never returns details for.
    service.set_child_ids(vec![201, 202, 203, 999]);
    let app = App::new(test_config(&temp, false), service.clone());

    let summary = app.run(&RunOptions::default()).unwrap();
    assert_eq!(summary.fetched_ok, 3);
    assert_eq!(summary.skipped_missing, 1);
    assert_eq!(summary.species_count, 3);
    assert!(app.cache().has_meta(999));
    assert_eq!(app.cache().get(999, 0), None);

    // The negative marker keeps 999 out of the next fetch round.
    let summary = app.run(&RunOptions::default()).unwrap();
    assert_eq!(summary.fetched_ok, 0);
    assert_eq!(service.detail_calls().len(), 1);
}

#[test]
fn detail_fetches_respect_batch_size() {
    let temp = tempfile::tempdir().unwrap();
    let taxa: Vec<Value> = (1..=5)
        .map(|id| species(id, "Some species", "art"))
        .collect();
    let service = MockService::new(taxa);
    let mut config = test_config(&temp, false);
    config.batch_size = 2;
    let app = App::new(config, service.clone());

    app.run(&RunOptions::default()).unwrap();
    assert_eq!(service.detail_calls(), vec![2, 2, 1]);
}

#[test]
fn cache_only_mode_skips_lists_and_db() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let config = test_config(&temp, false);
    let db_path = config.db_path.clone();
    let app = App::new(config, service.clone());

    let summary = app
        .run(&RunOptions {
            mode: RunMode::CacheOnly,
            ..RunOptions::default()
        })
        .unwrap();

    assert_eq!(summary.fetched_ok, 3);
    assert_eq!(summary.species_count, 0);
    assert!(app.cache().get(201, 0).is_some());
    assert!(!app.snapshots().species_ids_path().as_std_path().exists());
    assert!(!db_path.as_std_path().exists());
    // The revision marker is still advanced.
    assert!(app.snapshots().load_source_revision().is_some());
}

#[test]
fn lists_only_mode_reads_cache_without_fetching() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let config = test_config(&temp, false);
    let db_path = config.db_path.clone();
    let app = App::new(config, service.clone());

    app.run(&RunOptions {
        mode: RunMode::CacheOnly,
        ..RunOptions::default()
    })
    .unwrap();
    let calls_after_cache = service.detail_calls().len();

    let summary = app
        .run(&RunOptions {
            mode: RunMode::ListsOnly,
            ..RunOptions::default()
        })
        .unwrap();

    assert_eq!(summary.species_count, 3);
    assert_eq!(summary.fetched_ok, 0);
    assert_eq!(service.detail_calls().len(), calls_after_cache);
    assert!(app.snapshots().species_ids_path().as_std_path().exists());
    assert!(!db_path.as_std_path().exists());
}

#[test]
fn no_db_run_builds_lists_but_skips_reconciliation() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let config = test_config(&temp, false);
    let db_path = config.db_path.clone();
    let app = App::new(config, service.clone());

    let summary = app
        .run(&RunOptions {
            no_db: true,
            ..RunOptions::default()
        })
        .unwrap();

    assert_eq!(summary.species_count, 3);
    assert_eq!(summary.run_id, None);
    assert!(app.snapshots().species_table_path().as_std_path().exists());
    assert!(!db_path.as_std_path().exists());
}

#[test]
fn non_species_and_malformed_records_are_filtered() {
    let temp = tempfile::tempdir().unwrap();
    let mut genus = species(300, "Aglais", "");
    genus["category"] = json!({"value": "Genus"});
    // A payload without an integer taxonId: the orchestrator cannot cache it
    // under an id, so the requested id ends up negative-cached.
    let malformed = json!({"category": {"value": "Species"}, "taxonId": "not a number"});

    let service = MockService::new(vec![species(201, "Aglais io", "påfågelöga"), genus]);
    service.taxa.lock().unwrap().insert(301, malformed);
    service.set_child_ids(vec![201, 300, 301]);
    let app = App::new(test_config(&temp, false), service.clone());

    let summary = app.run(&RunOptions::default()).unwrap();
    // The genus is cached fine but filtered out; the malformed record never
    // makes it into the cache and counts as skipped.
    assert_eq!(summary.species_count, 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.skipped_missing, 1);

    let ids = read_snapshot(app.snapshots().species_ids_path());
    assert_eq!(ids["speciesTaxonIds"], json!([201]));
}

#[test]
fn children_snapshot_written_even_on_fast_exit() {
    let temp = tempfile::tempdir().unwrap();
    let service = MockService::new(three_species());
    let app = App::new(test_config(&temp, true), service.clone());

    app.run(&RunOptions::default()).unwrap();
    let summary = app.run(&RunOptions::default()).unwrap();
    assert!(summary.fast_exit);

    let children = read_snapshot(app.snapshots().children_path());
    assert_eq!(children["rootId"], ROOT_ID);
    assert_eq!(children["childIds"], json!([201, 202, 203]));
}
