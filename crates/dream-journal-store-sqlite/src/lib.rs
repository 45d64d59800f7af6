use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dream_journal_core::{duplicate_ids, DreamRecord};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Storage key holding the whole dream collection as one JSON array.
pub const DREAMS_KEY: &str = "dreams";

const LATEST_SCHEMA_VERSION: i64 = 1;
const DREAMS_EXPORT_FILE: &str = "dreams.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY CHECK (length(key) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const SELECT_VALUE_SQL: &str = "SELECT value FROM kv_entries WHERE key = ?1";

const UPSERT_VALUE_SQL: &str = "INSERT INTO kv_entries(key, value, updated_at) VALUES (?1, ?2, ?3)
 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Opaque key-value persistence: the only capability the journal needs from storage.
pub trait KeyValueStore {
    /// # Errors
    /// Returns an error when the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// # Errors
    /// Returns an error when the backing storage cannot be written.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`, reporting whether it was present.
    ///
    /// # Errors
    /// Returns an error when the backing storage cannot be written.
    fn remove(&mut self, key: &str) -> Result<bool>;
}

/// Whole-collection persistence for dream records.
pub trait DreamRepository {
    /// # Errors
    /// Returns an error when the collection cannot be read or decoded.
    fn load(&self) -> Result<Vec<DreamRecord>>;

    /// # Errors
    /// Returns an error when the collection is inconsistent or cannot be written.
    fn save(&mut self, dreams: &[DreamRecord]) -> Result<()>;

    /// Apply `change` to the stored collection and persist the result as one unit.
    ///
    /// Nothing is written when `change` fails. The default loads then saves; repositories
    /// shared between processes hold a write lock across both steps.
    ///
    /// # Errors
    /// Returns the error from `change`, or an error when the collection cannot be read,
    /// decoded, or written.
    fn update<T, F>(&mut self, change: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(&mut Vec<DreamRecord>) -> Result<T>,
    {
        let mut dreams = self.load()?;
        let outcome = change(&mut dreams)?;
        self.save(&dreams)?;
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// [`DreamRepository`] storing the collection as a JSON array under a single key.
#[derive(Debug, Clone)]
pub struct KvDreamRepository<S> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> KvDreamRepository<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_key(store, DREAMS_KEY)
    }

    #[must_use]
    pub fn with_key(store: S, key: &str) -> Self {
        Self { store, key: key.to_string() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: KeyValueStore> DreamRepository for KvDreamRepository<S> {
    fn load(&self) -> Result<Vec<DreamRecord>> {
        decode_collection(&self.key, self.store.get(&self.key)?.as_deref())
    }

    fn save(&mut self, dreams: &[DreamRecord]) -> Result<()> {
        let blob = encode_collection(dreams)?;
        self.store.set(&self.key, &blob)
    }
}

fn decode_collection(key: &str, blob: Option<&str>) -> Result<Vec<DreamRecord>> {
    let Some(blob) = blob else {
        return Ok(Vec::new());
    };
    serde_json::from_str(blob)
        .with_context(|| format!("failed to decode dream collection stored under key `{key}`"))
}

fn encode_collection(dreams: &[DreamRecord]) -> Result<String> {
    let duplicates = duplicate_ids(dreams);
    if !duplicates.is_empty() {
        let ids = duplicates.iter().map(ToString::to_string).collect::<Vec<_>>();
        return Err(anyhow!("dream ids MUST be unique; duplicated: {}", ids.join(", ")));
    }

    serde_json::to_string(dreams).context("failed to serialize dream collection")
}

/// [`DreamRepository`] over a database file, opened and migrated on every call.
#[derive(Debug, Clone)]
pub struct SqliteDreamRepository {
    db_path: PathBuf,
    key: String,
}

impl SqliteDreamRepository {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_key(db_path, DREAMS_KEY)
    }

    #[must_use]
    pub fn with_key(db_path: PathBuf, key: &str) -> Self {
        Self { db_path, key: key.to_string() }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open the database at the configured path and bring its schema up to date.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(&self) -> Result<KvDreamRepository<SqliteStore>> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(KvDreamRepository::with_key(store, &self.key))
    }
}

impl DreamRepository for SqliteDreamRepository {
    fn load(&self) -> Result<Vec<DreamRecord>> {
        self.open()?.load()
    }

    fn save(&mut self, dreams: &[DreamRecord]) -> Result<()> {
        self.open()?.save(dreams)
    }

    fn update<T, F>(&mut self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<DreamRecord>) -> Result<T>,
    {
        let mut store = self.open()?.into_inner();
        let key = self.key.as_str();
        store.update_value(key, |blob| {
            let mut dreams = decode_collection(key, blob.as_deref())?;
            let outcome = change(&mut dreams)?;
            Ok((encode_collection(&dreams)?, outcome))
        })
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_dreams: usize,
    pub skipped_existing_dreams: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionReport {
    pub present: bool,
    pub decodes: bool,
    pub decode_error: Option<String>,
    pub dreams: usize,
    pub duplicate_ids: Vec<String>,
    pub undated: usize,
    pub malformed_dates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
    pub collection: CollectionReport,
}

impl SqliteStore {
    /// Open a SQLite-backed key-value store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            if table_exists(&self.conn, "kv_entries")? {
                // Table created before migrations were tracked.
                record_schema_version(&self.conn, 1)?;
            } else {
                self.apply_migration_1()?;
            }
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to create kv_entries table")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        tracing::debug!("applied schema migration v1");
        Ok(())
    }

    /// Keys currently stored, in ascending order.
    ///
    /// # Errors
    /// Returns an error when the key listing query fails.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv_entries ORDER BY key ASC")
            .context("failed to prepare key listing query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to run key listing query")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("failed to decode key listing row")?);
        }
        Ok(keys)
    }

    /// Read-modify-write of `key` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// `change` receives the current value and returns the value to store. Other connections
    /// wait on the busy timeout for the write lock, so no concurrent write is lost.
    /// The transaction rolls back when `change` or the write fails.
    ///
    /// # Errors
    /// Returns an error when the write lock cannot be acquired, `change` fails, or the write
    /// cannot be committed.
    pub fn update_value<T, F>(&mut self, key: &str, change: F) -> Result<T>
    where
        F: FnOnce(Option<String>) -> Result<(String, T)>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start immediate write transaction")?;
        let current = tx
            .query_row(SELECT_VALUE_SQL, params![key], |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("failed to read key `{key}`"))?;

        let (value, outcome) = change(current)?;
        tx.execute(UPSERT_VALUE_SQL, params![key, value, now_rfc3339()?])
            .with_context(|| format!("failed to write key `{key}`"))?;
        tx.commit().context("failed to commit write transaction")?;
        Ok(outcome)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run `PRAGMA quick_check` and read the schema status, then inspect the collection stored under `key`.
    ///
    /// # Errors
    /// Returns an error when any health query fails.
    pub fn integrity_check(&self, key: &str) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let collection = if table_exists(&self.conn, "kv_entries")? {
            inspect_collection(self, key)?
        } else {
            inspect_blob(None)
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status,
            collection,
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(SELECT_VALUE_SQL, params![key], |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("failed to read key `{key}`"))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(UPSERT_VALUE_SQL, params![key, value, now_rfc3339()?])
            .with_context(|| format!("failed to write key `{key}`"))?;
        tx.commit().context("failed to commit write transaction")?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let removed = tx
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .with_context(|| format!("failed to remove key `{key}`"))?;
        tx.commit().context("failed to commit remove transaction")?;
        Ok(removed > 0)
    }
}

/// Decode-level health of the collection stored under `key`.
///
/// # Errors
/// Returns an error only when the store itself cannot be read; decode failures are reported.
pub fn inspect_collection<S: KeyValueStore>(store: &S, key: &str) -> Result<CollectionReport> {
    Ok(inspect_blob(store.get(key)?.as_deref()))
}

fn inspect_blob(blob: Option<&str>) -> CollectionReport {
    let Some(blob) = blob else {
        return CollectionReport {
            present: false,
            decodes: true,
            decode_error: None,
            dreams: 0,
            duplicate_ids: Vec::new(),
            undated: 0,
            malformed_dates: 0,
        };
    };

    match serde_json::from_str::<Vec<DreamRecord>>(blob) {
        Ok(dreams) => CollectionReport {
            present: true,
            decodes: true,
            decode_error: None,
            dreams: dreams.len(),
            duplicate_ids: duplicate_ids(&dreams).iter().map(ToString::to_string).collect(),
            undated: dreams.iter().filter(|dream| dream.date.is_none()).count(),
            malformed_dates: dreams
                .iter()
                .filter(|dream| dream.date.is_some() && dream.calendar_date().is_none())
                .count(),
        },
        Err(err) => CollectionReport {
            present: true,
            decodes: false,
            decode_error: Some(err.to_string()),
            dreams: 0,
            duplicate_ids: Vec::new(),
            undated: 0,
            malformed_dates: 0,
        },
    }
}

/// Export the collection as deterministic NDJSON plus a digest manifest.
///
/// # Errors
/// Returns an error when the collection cannot be loaded or export files cannot be written.
pub fn export_snapshot<R: DreamRepository>(repo: &R, out_dir: &Path) -> Result<ExportManifest> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

    let dreams = repo.load()?;
    let (sha256, records) = write_ndjson_file(&out_dir.join(DREAMS_EXPORT_FILE), &dreams)?;

    let manifest = ExportManifest {
        schema_version: LATEST_SCHEMA_VERSION,
        exported_at: now_rfc3339()?,
        files: vec![ExportFileDigest { path: DREAMS_EXPORT_FILE.to_string(), sha256, records }],
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
    fs::write(&manifest_path, manifest_json)
        .with_context(|| format!("failed to write export manifest {}", manifest_path.display()))?;

    tracing::info!(dreams = records, dir = %out_dir.display(), "exported dream snapshot");
    Ok(manifest)
}

/// Merge an exported snapshot into the repository by dream id.
///
/// # Errors
/// Returns an error when the manifest does not verify, an id already exists and
/// `skip_existing` is false, or persistence fails.
pub fn import_snapshot<R: DreamRepository>(
    repo: &mut R,
    in_dir: &Path,
    skip_existing: bool,
) -> Result<ImportSummary> {
    let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
    validate_import_manifest(in_dir, &manifest)?;

    let incoming = read_ndjson_file::<DreamRecord>(&in_dir.join(DREAMS_EXPORT_FILE))?;
    let summary = repo.update(|dreams| {
        let mut known = dreams.iter().map(|dream| dream.id.clone()).collect::<BTreeSet<_>>();
        let mut summary = ImportSummary { imported_dreams: 0, skipped_existing_dreams: 0 };

        for dream in incoming {
            if known.contains(&dream.id) {
                if skip_existing {
                    summary.skipped_existing_dreams += 1;
                    continue;
                }
                return Err(anyhow!("dream already exists for id {}", dream.id));
            }
            known.insert(dream.id.clone());
            dreams.push(dream);
            summary.imported_dreams += 1;
        }
        Ok(summary)
    })?;

    tracing::info!(
        imported = summary.imported_dreams,
        skipped = summary.skipped_existing_dreams,
        "imported dream snapshot"
    );
    Ok(summary)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "kv_entries")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    let Some(expected) = by_path.get(DREAMS_EXPORT_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {DREAMS_EXPORT_FILE}"));
    };
    let file_path = in_dir.join(DREAMS_EXPORT_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {DREAMS_EXPORT_FILE}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {DREAMS_EXPORT_FILE}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use dream_journal_core::DreamId;
    use ulid::Ulid;

    fn mk_dream(id: &str, date: Option<&str>) -> DreamRecord {
        DreamRecord {
            id: DreamId::from(id),
            text: "Swimming with whales #ocean".to_string(),
            date: date.map(str::to_string),
            is_lucid: true,
            hashtags: vec!["#ocean".to_string()],
            tags: vec!["#Nature".to_string()],
            location: "Ocean".to_string(),
            characters: "Whales".to_string(),
            emotion: "Awe".to_string(),
            intensity: 7,
            clarity: 8,
            sleep_quality: 6,
        }
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn temp_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()))
    }

    #[test]
    fn memory_store_get_set_remove() -> Result<()> {
        let mut store = MemoryStore::new();
        assert_eq!(store.get("dreams")?, None);

        store.set("dreams", "[]")?;
        assert_eq!(store.get("dreams")?.as_deref(), Some("[]"));

        assert!(store.remove("dreams")?);
        assert!(!store.remove("dreams")?);
        assert_eq!(store.get("dreams")?, None);
        Ok(())
    }

    #[test]
    fn sqlite_store_upserts_and_removes_keys() -> Result<()> {
        let mut store = migrated_store()?;
        assert_eq!(store.get("dreams")?, None);

        store.set("dreams", "[1]")?;
        store.set("dreams", "[2]")?;
        store.set("settings", "{}")?;
        assert_eq!(store.get("dreams")?.as_deref(), Some("[2]"));
        assert_eq!(store.keys()?, vec!["dreams".to_string(), "settings".to_string()]);

        assert!(store.remove("settings")?);
        assert!(!store.remove("settings")?);
        assert_eq!(store.keys()?, vec!["dreams".to_string()]);
        Ok(())
    }

    #[test]
    fn sqlite_store_rejects_empty_keys() -> Result<()> {
        let mut store = migrated_store()?;
        assert!(store.set("", "[]").is_err());
        Ok(())
    }

    #[test]
    fn unmigrated_store_fails_reads() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        assert!(store.get(DREAMS_KEY).is_err());
        Ok(())
    }

    #[test]
    fn repository_loads_empty_collection_when_key_is_absent() -> Result<()> {
        let repo = KvDreamRepository::new(migrated_store()?);
        assert!(repo.load()?.is_empty());
        Ok(())
    }

    #[test]
    fn repository_round_trips_collection_under_single_key() -> Result<()> {
        let mut repo = KvDreamRepository::new(migrated_store()?);
        let dreams = vec![mk_dream("a", Some("2024-01-01")), mk_dream("b", None)];

        repo.save(&dreams)?;
        assert_eq!(repo.load()?, dreams);
        assert_eq!(repo.store().keys()?, vec![DREAMS_KEY.to_string()]);

        let blob = repo.store().get(DREAMS_KEY)?.unwrap_or_default();
        let raw: serde_json::Value = serde_json::from_str(&blob)?;
        assert_eq!(raw.as_array().map(Vec::len), Some(2));
        assert_eq!(raw[0]["isLucid"], serde_json::Value::Bool(true));
        Ok(())
    }

    #[test]
    fn repository_honours_custom_key() -> Result<()> {
        let mut repo = KvDreamRepository::with_key(MemoryStore::new(), "journal:v2");
        repo.save(&[mk_dream("a", None)])?;

        assert_eq!(repo.key(), "journal:v2");
        let store = repo.into_inner();
        assert!(store.get(DREAMS_KEY)?.is_none());
        assert!(store.get("journal:v2")?.is_some());
        Ok(())
    }

    #[test]
    fn repository_reports_malformed_blob() -> Result<()> {
        let mut store = MemoryStore::new();
        store.set(DREAMS_KEY, "{not json")?;
        let repo = KvDreamRepository::new(store);

        let Err(err) = repo.load() else {
            return Err(anyhow!("expected decode failure for malformed blob"));
        };
        assert!(err.to_string().contains("failed to decode dream collection"));
        Ok(())
    }

    #[test]
    fn repository_rejects_duplicate_ids_on_save() -> Result<()> {
        let mut repo = KvDreamRepository::new(MemoryStore::new());
        let Err(err) = repo.save(&[mk_dream("a", None), mk_dream("a", None)]) else {
            return Err(anyhow!("expected duplicate id rejection"));
        };
        assert!(err.to_string().contains("dream ids MUST be unique"));
        assert!(repo.store().get(DREAMS_KEY)?.is_none());
        Ok(())
    }

    #[test]
    fn file_repository_persists_across_opens() -> Result<()> {
        let db_path = temp_path("dream-journal-store").with_extension("sqlite3");
        let mut repo = SqliteDreamRepository::new(db_path.clone());
        repo.save(&[mk_dream("a", Some("2024-01-01"))])?;

        let reopened = SqliteDreamRepository::new(db_path.clone());
        assert_eq!(reopened.load()?.len(), 1);
        assert_eq!(reopened.db_path(), db_path.as_path());

        let other_key = SqliteDreamRepository::with_key(db_path.clone(), "archive");
        assert!(other_key.load()?.is_empty());

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn file_repository_fails_when_database_cannot_be_opened() {
        let db_path = temp_path("dream-journal-missing-dir").join("journal.sqlite3");
        let repo = SqliteDreamRepository::new(db_path);
        assert!(repo.load().is_err());
    }

    #[test]
    fn update_value_rolls_back_when_change_fails() -> Result<()> {
        let mut store = migrated_store()?;
        store.set(DREAMS_KEY, "[]")?;

        let written = store.update_value(DREAMS_KEY, |current| {
            assert_eq!(current.as_deref(), Some("[]"));
            Ok(("[1]".to_string(), 1_usize))
        })?;
        assert_eq!(written, 1);
        assert_eq!(store.get(DREAMS_KEY)?.as_deref(), Some("[1]"));

        let result: Result<()> = store.update_value(DREAMS_KEY, |_| Err(anyhow!("change rejected")));
        let Err(err) = result else {
            return Err(anyhow!("expected failing change to abort the update"));
        };
        assert!(err.to_string().contains("change rejected"));
        assert_eq!(store.get(DREAMS_KEY)?.as_deref(), Some("[1]"));
        Ok(())
    }

    #[test]
    fn file_repository_update_is_atomic_per_call() -> Result<()> {
        let db_path = temp_path("dream-journal-update").with_extension("sqlite3");
        let mut repo = SqliteDreamRepository::new(db_path.clone());

        let total = repo.update(|dreams| {
            dreams.push(mk_dream("a", Some("2024-01-01")));
            Ok(dreams.len())
        })?;
        assert_eq!(total, 1);

        let Err(err) = repo.update(|dreams| {
            dreams.push(mk_dream("a", None));
            Ok(())
        }) else {
            return Err(anyhow!("expected duplicate id rejection inside update"));
        };
        assert!(err.to_string().contains("dream ids MUST be unique"));

        let Err(err) = repo.update(|dreams| -> Result<()> {
            dreams.clear();
            Err(anyhow!("abandoned edit"))
        }) else {
            return Err(anyhow!("expected failing change to abort the update"));
        };
        assert!(err.to_string().contains("abandoned edit"));

        let stored = repo.load()?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.as_str(), "a");

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn file_repository_update_keeps_writes_from_parallel_connections() -> Result<()> {
        const WRITERS: usize = 4;
        const DREAMS_PER_WRITER: usize = 15;

        let db_path = temp_path("dream-journal-parallel").with_extension("sqlite3");
        SqliteDreamRepository::new(db_path.clone()).open()?;

        let handles = (0..WRITERS)
            .map(|writer| {
                let db_path = db_path.clone();
                std::thread::spawn(move || -> Result<()> {
                    let mut repo = SqliteDreamRepository::new(db_path);
                    for n in 0..DREAMS_PER_WRITER {
                        repo.update(|dreams| {
                            dreams.push(mk_dream(&format!("w{writer}-{n}"), None));
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().map_err(|_| anyhow!("writer thread panicked"))??;
        }

        let stored = SqliteDreamRepository::new(db_path.clone()).load()?;
        assert_eq!(stored.len(), WRITERS * DREAMS_PER_WRITER);
        assert!(duplicate_ids(&stored).is_empty());

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn keys_reports_missing_table_with_context() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = store.keys() else {
            return Err(anyhow!("expected key listing to fail before migration"));
        };
        assert!(err.to_string().contains("failed to prepare key listing query"));
        Ok(())
    }

    #[test]
    fn schema_status_reports_pending_then_current() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, 1);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(current_schema_version(&store.conn)?, 1);
        Ok(())
    }

    #[test]
    fn untracked_kv_table_is_adopted_by_migrate() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        store.conn.execute(
            "INSERT INTO kv_entries(key, value, updated_at) VALUES ('dreams', '[]', '2024-01-01T00:00:00Z')",
            [],
        )?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(store.get(DREAMS_KEY)?.as_deref(), Some("[]"));
        assert!(!store.schema_status()?.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let mut source = KvDreamRepository::new(migrated_store()?);
        source.save(&[mk_dream("a", Some("2024-01-01")), mk_dream("b", None)])?;

        let export_dir = temp_path("dream-journal-export");
        let manifest = export_snapshot(&source, &export_dir)?;
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].records, 2);
        assert!(export_dir.join(DREAMS_EXPORT_FILE).exists());
        assert!(export_dir.join(MANIFEST_FILE).exists());

        let mut target = KvDreamRepository::new(migrated_store()?);
        target.save(&[mk_dream("b", Some("2023-03-03"))])?;
        let summary = import_snapshot(&mut target, &export_dir, true)?;
        assert_eq!(summary, ImportSummary { imported_dreams: 1, skipped_existing_dreams: 1 });

        let merged = target.load()?;
        assert_eq!(merged.len(), 2);
        let kept = merged.iter().find(|dream| dream.id.as_str() == "b");
        assert_eq!(kept.and_then(|dream| dream.date.as_deref()), Some("2023-03-03"));

        let Err(err) = import_snapshot(&mut target, &export_dir, false) else {
            return Err(anyhow!("expected import to reject existing ids"));
        };
        assert!(err.to_string().contains("dream already exists"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        let mut source = KvDreamRepository::new(MemoryStore::new());
        source.save(&[mk_dream("a", None)])?;

        let export_dir = temp_path("dream-journal-export");
        export_snapshot(&source, &export_dir)?;

        let dreams_path = export_dir.join(DREAMS_EXPORT_FILE);
        let mut tampered = std::fs::OpenOptions::new().append(true).open(&dreams_path)?;
        writeln!(tampered, "{{\"id\":\"tampered\"}}")?;

        let mut target = KvDreamRepository::new(MemoryStore::new());
        let Err(err) = import_snapshot(&mut target, &export_dir, true) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for dreams.ndjson"));
        assert!(target.load()?.is_empty());

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let mut source = KvDreamRepository::new(migrated_store()?);
        source.save(&[mk_dream("a", Some("2024-05-05"))])?;

        let backup_file = temp_path("dream-journal-backup").with_extension("sqlite3");
        source.store().backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        let restored = KvDreamRepository::new(target).load()?;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id.as_str(), "a");

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    #[test]
    fn restore_rejects_missing_backup_file() -> Result<()> {
        let mut store = migrated_store()?;
        let missing = temp_path("dream-journal-missing").with_extension("sqlite3");

        let Err(err) = store.restore_database(&missing) else {
            return Err(anyhow!("expected restore failure for missing backup"));
        };
        assert!(err.to_string().contains("backup file does not exist"));
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut repo = KvDreamRepository::new(migrated_store()?);
        repo.save(&[mk_dream("a", Some("2024-01-01")), mk_dream("b", None)])?;

        let report = repo.store().integrity_check(DREAMS_KEY)?;
        assert!(report.quick_check_ok);
        assert_eq!(report.schema_status.current_version, 1);
        assert!(report.collection.present);
        assert!(report.collection.decodes);
        assert_eq!(report.collection.dreams, 2);
        assert_eq!(report.collection.undated, 1);
        assert_eq!(report.collection.malformed_dates, 0);
        Ok(())
    }

    #[test]
    fn integrity_check_flags_undecodable_and_inconsistent_blobs() -> Result<()> {
        let mut store = migrated_store()?;
        store.set(DREAMS_KEY, "[{\"id\": \"a\"}, {\"id\": \"a\", \"date\": \"yesterday\"}]")?;
        let report = store.integrity_check(DREAMS_KEY)?;
        assert!(report.collection.decodes);
        assert_eq!(report.collection.duplicate_ids, vec!["a".to_string()]);
        assert_eq!(report.collection.malformed_dates, 1);

        store.set(DREAMS_KEY, "not json")?;
        let report = store.integrity_check(DREAMS_KEY)?;
        assert!(!report.collection.decodes);
        assert!(report.collection.decode_error.is_some());
        Ok(())
    }

    #[test]
    fn integrity_check_on_fresh_database_reports_absent_collection() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let report = store.integrity_check(DREAMS_KEY)?;
        assert!(report.quick_check_ok);
        assert!(!report.collection.present);
        assert_eq!(report.schema_status.pending_versions, vec![1]);
        Ok(())
    }
}
