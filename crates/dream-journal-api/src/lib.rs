use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dream_journal_core::{
    aggregate, find_dream, insert_dream, remove_dream, replace_dream, run_query, DreamDraft,
    DreamFilter, DreamId, DreamRecord, DreamStats, JournalError,
};
use dream_journal_store_sqlite::{
    export_snapshot, import_snapshot, ExportManifest, ImportSummary, IntegrityReport,
    SchemaStatus, SqliteStore, DREAMS_KEY,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

pub use dream_journal_store_sqlite::{DreamRepository, SqliteDreamRepository};

const DEFAULT_READ_FAILURE_NOTICE: &str = "An error occurred while loading your dreams.";
const DEFAULT_WRITE_FAILURE_NOTICE: &str = "An error occurred while saving your dreams.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalConfig {
    pub storage_key: String,
    pub read_failure_notice: String,
    pub write_failure_notice: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            storage_key: DREAMS_KEY.to_string(),
            read_failure_notice: DEFAULT_READ_FAILURE_NOTICE.to_string(),
            write_failure_notice: DEFAULT_WRITE_FAILURE_NOTICE.to_string(),
        }
    }
}

/// Filtered and sorted dreams. `notice` is set when the journal could not be read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DreamListing {
    pub dreams: Vec<DreamRecord>,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub stats: DreamStats,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Dream journal operations over an injected [`DreamRepository`].
///
/// Reads never fail: an unreadable journal is presented as empty with a user-facing notice.
/// Writes report storage failures as errors carrying the configured write notice.
#[derive(Debug, Clone)]
pub struct DreamJournal<R> {
    repo: R,
    config: JournalConfig,
}

impl DreamJournal<SqliteDreamRepository> {
    /// Journal backed by the `SQLite` database at `db_path`, using the configured storage key.
    #[must_use]
    pub fn sqlite(db_path: PathBuf, config: JournalConfig) -> Self {
        let repo = SqliteDreamRepository::with_key(db_path, &config.storage_key);
        Self::with_config(repo, config)
    }
}

impl<R: DreamRepository> DreamJournal<R> {
    #[must_use]
    pub fn new(repo: R) -> Self {
        Self::with_config(repo, JournalConfig::default())
    }

    #[must_use]
    pub fn with_config(repo: R, config: JournalConfig) -> Self {
        Self { repo, config }
    }

    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repo
    }

    #[must_use]
    pub fn into_repository(self) -> R {
        self.repo
    }

    fn load_or_default(&self) -> (Vec<DreamRecord>, Option<String>) {
        match self.repo.load() {
            Ok(dreams) => (dreams, None),
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "dream journal unreadable; presenting empty journal"
                );
                (Vec::new(), Some(self.config.read_failure_notice.clone()))
            }
        }
    }

    /// Run `change` as one read-modify-write of the stored collection. Storage failures gain
    /// the write notice; a [`JournalError`] raised by `change` is returned as is.
    fn write<T>(&mut self, change: impl FnOnce(&mut Vec<DreamRecord>) -> Result<T>) -> Result<T> {
        self.repo.update(change).map_err(|err| {
            if journal_error(&err).is_some() {
                err
            } else {
                err.context(self.config.write_failure_notice.clone())
            }
        })
    }

    /// Record a new dream dated today (UTC) unless the draft names a date.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] for an invalid draft, or a
    /// storage error carrying the write notice.
    pub fn add_dream(&mut self, draft: DreamDraft) -> Result<DreamRecord> {
        self.add_dream_on(draft, OffsetDateTime::now_utc().date())
    }

    /// Record a new dream, using `today` when the draft has no date.
    ///
    /// # Errors
    /// Same as [`DreamJournal::add_dream`].
    pub fn add_dream_on(&mut self, draft: DreamDraft, today: Date) -> Result<DreamRecord> {
        let record = draft.into_new_record(DreamId::new(), today)?;
        let total = self.write(|dreams| {
            insert_dream(dreams, record.clone())?;
            Ok(dreams.len())
        })?;

        tracing::info!(id = %record.id, total, "dream added");
        Ok(record)
    }

    /// Replace every field of the dream `id` with the draft. The stored id keeps its encoding.
    ///
    /// # Errors
    /// Returns a validation error when the draft is invalid or undated, `NotFound` when the id
    /// is unknown, or a storage error carrying the write notice.
    pub fn edit_dream(&mut self, id: &DreamId, draft: DreamDraft) -> Result<DreamRecord> {
        let mut record = draft.into_edited_record(id.clone())?;
        record.id = self.write(|dreams| Ok(replace_dream(dreams, record.clone())?.id))?;

        tracing::info!(id = %record.id, "dream edited");
        Ok(record)
    }

    /// Delete the dream `id` and rewrite the remaining collection.
    ///
    /// # Errors
    /// Returns `NotFound` when the id is unknown, or a storage error carrying the write notice.
    pub fn delete_dream(&mut self, id: &DreamId) -> Result<DreamRecord> {
        let (removed, remaining) = self.write(|dreams| {
            let removed = remove_dream(dreams, id)?;
            Ok((removed, dreams.len()))
        })?;

        tracing::info!(id = %removed.id, remaining, "dream deleted");
        Ok(removed)
    }

    /// # Errors
    /// Returns `NotFound` when the id is unknown, or an error carrying the read notice when the
    /// journal cannot be read.
    pub fn get_dream(&self, id: &DreamId) -> Result<DreamRecord> {
        let dreams = self.repo.load().context(self.config.read_failure_notice.clone())?;
        find_dream(&dreams, id)
            .cloned()
            .ok_or_else(|| JournalError::NotFound(id.to_string()).into())
    }

    #[must_use]
    pub fn list_dreams(&self, filter: &DreamFilter) -> DreamListing {
        let (dreams, notice) = self.load_or_default();
        let dreams = run_query(&dreams, filter);
        tracing::debug!(
            selected = dreams.len(),
            sort_order = filter.sort_order.as_str(),
            "listed dreams"
        );
        DreamListing { dreams, notice }
    }

    #[must_use]
    pub fn stats(&self) -> StatsReport {
        let (dreams, notice) = self.load_or_default();
        StatsReport { stats: aggregate(&dreams), notice }
    }
}

/// Database maintenance over the `SQLite` file at `db_path`.
#[derive(Debug, Clone)]
pub struct MaintenanceApi {
    db_path: PathBuf,
    storage_key: String,
}

impl MaintenanceApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_storage_key(db_path, DREAMS_KEY)
    }

    #[must_use]
    pub fn with_storage_key(db_path: PathBuf, storage_key: &str) -> Self {
        Self { db_path, storage_key: storage_key.to_string() }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn repository(&self) -> SqliteDreamRepository {
        SqliteDreamRepository::with_key(self.db_path.clone(), &self.storage_key)
    }

    /// Report schema versions without applying migrations or touching stored dreams.
    ///
    /// Opening creates the database file when it is missing, and the `schema_migrations`
    /// bookkeeping table is created when absent.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        tracing::info!(version = after.current_version, "database migrated");
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the journal cannot be read or export files cannot be written.
    pub fn export(&self, out_dir: &Path) -> Result<ExportManifest> {
        export_snapshot(&self.repository(), out_dir)
    }

    /// # Errors
    /// Returns an error when the snapshot does not verify, an id collides and
    /// `skip_existing` is false, or persistence fails.
    pub fn import(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        let mut repo = self.repository();
        import_snapshot(&mut repo, in_dir, skip_existing)
    }

    /// # Errors
    /// Returns an error when the database cannot be migrated or the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup file is missing or restore fails.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)?;
        tracing::info!(from = %in_file.display(), "database restored");
        Ok(())
    }

    /// # Errors
    /// Returns an error when any health query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        let report = store.integrity_check(&self.storage_key)?;
        if !report.quick_check_ok || !report.collection.decodes {
            tracing::warn!(
                quick_check = %report.quick_check_message,
                decodes = report.collection.decodes,
                "integrity check found problems"
            );
        }
        Ok(report)
    }
}

/// Returns the [`JournalError`] at the root of `err`, if any.
#[must_use]
pub fn journal_error(err: &anyhow::Error) -> Option<&JournalError> {
    err.chain().find_map(|cause| cause.downcast_ref::<JournalError>())
}

/// Reject a storage key before it reaches the store.
///
/// # Errors
/// Returns an error when the key is blank.
pub fn validate_storage_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow!("storage key MUST be non-empty"));
    }
    Ok(())
}
