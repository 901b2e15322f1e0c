use std::collections::HashSet;
use std::fmt;
use std::fs;

use camino::Utf8Path;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::SyncError;
use crate::fs_util::now_epoch;
use crate::hash::canonical_json;
use crate::taxon::{CATEGORY_SPECIES, NAME_SCIENTIFIC, NAME_SWEDISH, TaxonRecord};

/// Bumped whenever the layout of the tables below changes. An existing
/// database with a different version refuses to open instead of being
/// migrated silently.
const SCHEMA_VERSION: &str = "2";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS taxa (
  taxon_id     INTEGER PRIMARY KEY,
  local_index  INTEGER UNIQUE NOT NULL,
  sci_name     TEXT,
  swe_name     TEXT,
  category     TEXT,
  type         TEXT,
  status       TEXT,
  parent_id    INTEGER,
  is_active    INTEGER NOT NULL DEFAULT 1,
  sha256       TEXT,
  updated_at   INTEGER NOT NULL,
  raw_json     TEXT
);

CREATE INDEX IF NOT EXISTS idx_taxa_active ON taxa(is_active);
CREATE INDEX IF NOT EXISTS idx_taxa_category ON taxa(category);
CREATE INDEX IF NOT EXISTS idx_taxa_sciname ON taxa(sci_name);

CREATE TABLE IF NOT EXISTS runs (
  run_id INTEGER PRIMARY KEY AUTOINCREMENT,
  started_at INTEGER NOT NULL,
  finished_at INTEGER,
  root_taxon_id INTEGER,
  child_ids_count INTEGER,
  source_hash TEXT,
  species_count INTEGER,
  inserted_count INTEGER,
  updated_count INTEGER,
  unchanged_count INTEGER,
  deactivated_count INTEGER
);

CREATE TABLE IF NOT EXISTS changes (
  change_id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id INTEGER NOT NULL,
  taxon_id INTEGER NOT NULL,
  change_type TEXT NOT NULL,
  old_sha256 TEXT,
  new_sha256 TEXT,
  at INTEGER NOT NULL,
  FOREIGN KEY(run_id) REFERENCES runs(run_id)
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Unchanged,
    Reactivated,
    Deactivated,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Inserted => "inserted",
            ChangeKind::Updated => "updated",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Reactivated => "reactivated",
            ChangeKind::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current persisted state of one taxon.
#[derive(Debug, Clone)]
pub struct TaxonRow {
    pub taxon_id: i64,
    pub local_index: i64,
    pub sci_name: Option<String>,
    pub swe_name: Option<String>,
    pub category: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub parent_id: Option<i64>,
    pub is_active: bool,
    pub sha256: Option<String>,
    pub updated_at: i64,
}

/// One entry of the append-only change log.
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub run_id: i64,
    pub taxon_id: i64,
    pub change_type: String,
    pub old_sha256: Option<String>,
    pub new_sha256: Option<String>,
    pub at: i64,
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub root_taxon_id: Option<i64>,
    pub child_ids_count: Option<i64>,
    pub source_hash: Option<String>,
    pub species_count: Option<i64>,
    pub inserted_count: Option<i64>,
    pub updated_count: Option<i64>,
    pub unchanged_count: Option<i64>,
    pub deactivated_count: Option<i64>,
}

/// The reconciliation store: current taxa, the run ledger, the append-only
/// change log and a small settings table carrying the schema version and the
/// local-index allocator.
#[derive(Debug)]
pub struct TaxaDb {
    conn: Connection,
}

impl TaxaDb {
    pub fn open(path: &Utf8Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path.as_std_path())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR IGNORE INTO settings(key,value) VALUES('schema_version',?1)",
            params![SCHEMA_VERSION],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO settings(key,value) VALUES('next_local_index','0')",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO settings(key,value) VALUES('last_source_hash','')",
            [],
        )?;

        let db = Self { conn };
        match db.setting("schema_version")? {
            Some(version) if version == SCHEMA_VERSION => Ok(db),
            Some(version) => Err(SyncError::DatabaseState(format!(
                "unsupported schema version {version} (expected {SCHEMA_VERSION})"
            ))),
            None => Err(SyncError::DatabaseState(
                "missing schema_version setting".to_string(),
            )),
        }
    }

    pub fn setting(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key=?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.conn.execute(
            "INSERT INTO settings(key,value) VALUES(?1,?2) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Hands out the next local index. Read-modify-write under an IMMEDIATE
    /// transaction, so two writers can never observe the same counter value.
    /// An allocated index is spent even if the caller's insert later fails.
    fn alloc_local_index(&mut self) -> Result<i64, SyncError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: String = tx
            .query_row(
                "SELECT value FROM settings WHERE key='next_local_index'",
                [],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                SyncError::DatabaseState("missing next_local_index setting".to_string())
            })?;
        let next: i64 = raw.parse().map_err(|_| {
            SyncError::DatabaseState(format!("invalid next_local_index value: {raw}"))
        })?;
        tx.execute(
            "UPDATE settings SET value=?1 WHERE key='next_local_index'",
            params![(next + 1).to_string()],
        )?;
        tx.commit()?;
        Ok(next)
    }

    pub fn begin_run(
        &mut self,
        root_taxon_id: i64,
        child_ids_count: usize,
        source_hash: &str,
    ) -> Result<i64, SyncError> {
        self.conn.execute(
            "INSERT INTO runs(started_at, root_taxon_id, child_ids_count, source_hash) \
             VALUES(?1,?2,?3,?4)",
            params![now_epoch(), root_taxon_id, child_ids_count as i64, source_hash],
        )?;
        let run_id = self.conn.last_insert_rowid();
        self.set_setting("last_source_hash", source_hash)?;
        Ok(run_id)
    }

    pub fn end_run(
        &mut self,
        run_id: i64,
        species_count: usize,
        inserted: usize,
        updated: usize,
        unchanged: usize,
        deactivated: usize,
    ) -> Result<(), SyncError> {
        self.conn.execute(
            "UPDATE runs SET finished_at=?1, species_count=?2, inserted_count=?3, \
             updated_count=?4, unchanged_count=?5, deactivated_count=?6 WHERE run_id=?7",
            params![
                now_epoch(),
                species_count as i64,
                inserted as i64,
                updated as i64,
                unchanged as i64,
                deactivated as i64,
                run_id
            ],
        )?;
        Ok(())
    }

    /// Applies one record. Idempotent: a record whose content hash matches
    /// the stored one on an already-active row is a no-op and appends no
    /// change record. A missing hash always forces an update.
    pub fn upsert_taxon(
        &mut self,
        run_id: i64,
        record: &TaxonRecord,
        digest: Option<&str>,
        make_active: bool,
    ) -> Result<ChangeKind, SyncError> {
        let sci = record.name_of(NAME_SCIENTIFIC);
        let swe = record.name_of(NAME_SWEDISH);
        let now = now_epoch();
        let raw_json = canonical_json(&record.raw);

        let existing = self
            .conn
            .query_row(
                "SELECT sha256, is_active FROM taxa WHERE taxon_id=?1",
                params![record.taxon_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)? != 0,
                    ))
                },
            )
            .optional()?;

        let Some((old_sha, old_active)) = existing else {
            let local_index = self.alloc_local_index()?;
            let tx = self.conn.transaction()?;
            tx.execute(
                "INSERT INTO taxa(taxon_id, local_index, sci_name, swe_name, category, type, \
                 status, parent_id, is_active, sha256, updated_at, raw_json) \
                 VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    record.taxon_id,
                    local_index,
                    sci,
                    swe,
                    record.category,
                    record.kind,
                    record.status,
                    record.parent_id,
                    make_active,
                    digest,
                    now,
                    raw_json
                ],
            )?;
            tx.execute(
                "INSERT INTO changes(run_id,taxon_id,change_type,old_sha256,new_sha256,at) \
                 VALUES(?1,?2,?3,?4,?5,?6)",
                params![
                    run_id,
                    record.taxon_id,
                    ChangeKind::Inserted.as_str(),
                    Option::<String>::None,
                    digest,
                    now
                ],
            )?;
            tx.commit()?;
            return Ok(ChangeKind::Inserted);
        };

        if make_active && old_active && digest.is_some() && old_sha.as_deref() == digest {
            return Ok(ChangeKind::Unchanged);
        }

        if make_active && !old_active {
            let tx = self.conn.transaction()?;
            tx.execute(
                "UPDATE taxa SET sci_name=?1, swe_name=?2, category=?3, type=?4, status=?5, \
                 parent_id=?6, is_active=1, sha256=?7, updated_at=?8, raw_json=?9 \
                 WHERE taxon_id=?10",
                params![
                    sci,
                    swe,
                    record.category,
                    record.kind,
                    record.status,
                    record.parent_id,
                    digest,
                    now,
                    raw_json,
                    record.taxon_id
                ],
            )?;
            tx.execute(
                "INSERT INTO changes(run_id,taxon_id,change_type,old_sha256,new_sha256,at) \
                 VALUES(?1,?2,?3,?4,?5,?6)",
                params![
                    run_id,
                    record.taxon_id,
                    ChangeKind::Reactivated.as_str(),
                    old_sha,
                    digest,
                    now
                ],
            )?;
            tx.commit()?;
            return Ok(ChangeKind::Reactivated);
        }

        if digest.is_none() || old_sha.as_deref() != digest {
            let tx = self.conn.transaction()?;
            tx.execute(
                "UPDATE taxa SET sci_name=?1, swe_name=?2, category=?3, type=?4, status=?5, \
                 parent_id=?6, is_active=?7, sha256=?8, updated_at=?9, raw_json=?10 \
                 WHERE taxon_id=?11",
                params![
                    sci,
                    swe,
                    record.category,
                    record.kind,
                    record.status,
                    record.parent_id,
                    if make_active { true } else { old_active },
                    digest,
                    now,
                    raw_json,
                    record.taxon_id
                ],
            )?;
            tx.execute(
                "INSERT INTO changes(run_id,taxon_id,change_type,old_sha256,new_sha256,at) \
                 VALUES(?1,?2,?3,?4,?5,?6)",
                params![
                    run_id,
                    record.taxon_id,
                    ChangeKind::Updated.as_str(),
                    old_sha,
                    digest,
                    now
                ],
            )?;
            tx.commit()?;
            return Ok(ChangeKind::Updated);
        }

        Ok(ChangeKind::Unchanged)
    }

    /// Deactivates every active Species row whose id is not in `active_ids`.
    /// Scan and writes share one IMMEDIATE transaction; the change records
    /// keep the stored hash on both sides, since only the active flag moved.
    pub fn deactivate_missing(
        &mut self,
        run_id: i64,
        active_ids: &HashSet<i64>,
    ) -> Result<usize, SyncError> {
        let now = now_epoch();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows: Vec<(i64, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT taxon_id, sha256 FROM taxa WHERE is_active=1 AND category=?1",
            )?;
            let mapped = stmt.query_map(params![CATEGORY_SPECIES], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut count = 0;
        for (taxon_id, sha) in rows {
            if active_ids.contains(&taxon_id) {
                continue;
            }
            tx.execute(
                "UPDATE taxa SET is_active=0, updated_at=?1 WHERE taxon_id=?2",
                params![now, taxon_id],
            )?;
            tx.execute(
                "INSERT INTO changes(run_id,taxon_id,change_type,old_sha256,new_sha256,at) \
                 VALUES(?1,?2,?3,?4,?5,?6)",
                params![
                    run_id,
                    taxon_id,
                    ChangeKind::Deactivated.as_str(),
                    sha,
                    sha,
                    now
                ],
            )?;
            count += 1;
        }

        tx.commit()?;
        Ok(count)
    }

    pub fn taxon(&self, taxon_id: i64) -> Result<Option<TaxonRow>, SyncError> {
        Ok(self
            .conn
            .query_row(
                "SELECT taxon_id, local_index, sci_name, swe_name, category, type, status, \
                 parent_id, is_active, sha256, updated_at FROM taxa WHERE taxon_id=?1",
                params![taxon_id],
                |row| {
                    Ok(TaxonRow {
                        taxon_id: row.get(0)?,
                        local_index: row.get(1)?,
                        sci_name: row.get(2)?,
                        swe_name: row.get(3)?,
                        category: row.get(4)?,
                        kind: row.get(5)?,
                        status: row.get(6)?,
                        parent_id: row.get(7)?,
                        is_active: row.get::<_, i64>(8)? != 0,
                        sha256: row.get(9)?,
                        updated_at: row.get(10)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn active_species_ids(&self) -> Result<Vec<i64>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT taxon_id FROM taxa WHERE is_active=1 AND category=?1 ORDER BY taxon_id",
        )?;
        let ids = stmt
            .query_map(params![CATEGORY_SPECIES], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    pub fn run(&self, run_id: i64) -> Result<Option<RunRow>, SyncError> {
        Ok(self
            .conn
            .query_row(
                "SELECT run_id, started_at, finished_at, root_taxon_id, child_ids_count, \
                 source_hash, species_count, inserted_count, updated_count, unchanged_count, \
                 deactivated_count FROM runs WHERE run_id=?1",
                params![run_id],
                |row| {
                    Ok(RunRow {
                        run_id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        root_taxon_id: row.get(3)?,
                        child_ids_count: row.get(4)?,
                        source_hash: row.get(5)?,
                        species_count: row.get(6)?,
                        inserted_count: row.get(7)?,
                        updated_count: row.get(8)?,
                        unchanged_count: row.get(9)?,
                        deactivated_count: row.get(10)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn run_count(&self) -> Result<i64, SyncError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?)
    }

    pub fn changes(&self, run_id: i64) -> Result<Vec<ChangeRow>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, taxon_id, change_type, old_sha256, new_sha256, at \
             FROM changes WHERE run_id=?1 ORDER BY change_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(ChangeRow {
                    run_id: row.get(0)?,
                    taxon_id: row.get(1)?,
                    change_type: row.get(2)?,
                    old_sha256: row.get(3)?,
                    new_sha256: row.get(4)?,
                    at: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}
