use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use quotebook_core::{
    filter_by_category, reconcile, CategoryEntry, LoadSource, MergeKey, QuoteRecord, QuoteStore,
    SelectionState, LAST_SYNC_KEY, LAST_VIEWED_QUOTE_KEY, QUOTES_KEY, SELECTED_CATEGORY_KEY,
};
use quotebook_remote::{
    post_local, try_fetch_remote, HttpRemote, PushStatus, RemoteConfig, RemoteSource,
};
use quotebook_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuoteListing {
    pub quotes: Vec<QuoteRecord>,
    pub categories: Vec<CategoryEntry>,
    /// Persisted selection after repair against the current index.
    pub selected: String,
    /// Category the `visible` list was filtered by.
    pub filter: String,
    pub visible: Vec<QuoteRecord>,
    pub last_sync: Option<String>,
    pub load_source: LoadSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddQuoteRequest {
    pub text: String,
    pub category: String,
    /// Send the new quote to the remote sink after it is stored.
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddQuoteResult {
    pub quote: QuoteRecord,
    pub selected: String,
    pub push: PushStatus,
    /// Set when the quote was stored but its category could not be selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionResult {
    pub selected: String,
    /// Whether the value names a category in the current index.
    pub known: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RandomQuote {
    pub quote: QuoteRecord,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub merge_key: MergeKey,
    pub added: usize,
    pub overwritten: usize,
    pub skipped: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportResult {
    pub sha256: String,
    pub quote_count: usize,
    pub quotes: Vec<QuoteRecord>,
    /// Pretty-printed file body the digest was computed over.
    #[serde(skip)]
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    /// Another run was in flight.
    Skipped,
    Failed,
    NoChange,
    Changed,
}

impl SyncOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::NoChange => "no-change",
            Self::Changed => "changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub fetched: usize,
    pub added: usize,
    pub replaced: usize,
    pub total: usize,
    pub synced_at: Option<String>,
    pub error: Option<String>,
}

impl SyncReport {
    fn empty(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            fetched: 0,
            added: 0,
            replaced: 0,
            total: 0,
            synced_at: None,
            error: None,
        }
    }
}

/// Clears the in-flight flag when the run ends, including on early return.
struct SyncPermit<'a>(&'a AtomicBool);

impl<'a> SyncPermit<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Facade over the quote store, the remote source, and the sync state machine.
///
/// Clones share the write lock and the sync in-flight flag.
#[derive(Clone)]
pub struct QuotebookApi {
    db_path: PathBuf,
    remote: Arc<dyn RemoteSource>,
    write_lock: Arc<Mutex<()>>,
    sync_in_flight: Arc<AtomicBool>,
}

impl std::fmt::Debug for QuotebookApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotebookApi")
            .field("db_path", &self.db_path)
            .field("sync_in_flight", &self.sync_in_flight.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl QuotebookApi {
    /// API backed by the default HTTP remote.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_remote_config(db_path, RemoteConfig::default())
    }

    #[must_use]
    pub fn with_remote_config(db_path: PathBuf, config: RemoteConfig) -> Self {
        Self::with_remote(db_path, Arc::new(HttpRemote::new(config)))
    }

    #[must_use]
    pub fn with_remote(db_path: PathBuf, remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            db_path,
            remote,
            write_lock: Arc::new(Mutex::new(())),
            sync_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_sqlite(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Callers hold the write lock. A database without a stored list gets the
    /// seed list written so ids stay stable across calls; an unreadable list is
    /// left in place until the next mutation overwrites it.
    fn open_store(&self) -> Result<QuoteStore<SqliteStore>> {
        let mut sqlite = self.open_sqlite()?;
        sqlite.migrate()?;
        let first_run = sqlite.get_item(QUOTES_KEY)?.is_none();
        let mut store = QuoteStore::open(sqlite);
        if first_run {
            store.save().context("failed to persist seed quotes")?;
            tracing::info!(db = %self.db_path.display(), "seeded new quote store");
        } else if let LoadSource::Seeded { reason } = store.load_source() {
            tracing::warn!(%reason, db = %self.db_path.display(), "stored quotes unreadable; using seed quotes");
        }
        Ok(store)
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| anyhow!("quotebook write lock poisoned"))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_sqlite()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_sqlite()?;
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

    /// Run `SQLite` health probes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or probed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_sqlite()?;
        store.integrity_check()
    }

    /// Current quotes, categories, and the visible slice.
    ///
    /// `category` filters the visible slice for this call only; otherwise the
    /// persisted selection applies. A persisted selection the index no longer
    /// knows is reset to `all` and written back.
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened or the repaired selection
    /// cannot be persisted.
    pub fn list_quotes(&self, category: Option<&str>) -> Result<QuoteListing> {
        let _guard = self.lock_writes()?;
        let mut store = self.open_store()?;
        let index = store.category_index();

        let persisted = store.storage().get_item(SELECTED_CATEGORY_KEY)?;
        let selection = SelectionState::restore(persisted.as_deref(), &index);
        if persisted.as_deref() != Some(selection.as_str()) {
            selection.persist(store.storage_mut())?;
        }

        let filter = category.unwrap_or(selection.as_str()).to_string();
        let visible = filter_by_category(store.quotes(), &filter).into_iter().cloned().collect();
        let last_sync = store.storage().get_item(LAST_SYNC_KEY)?;

        Ok(QuoteListing {
            quotes: store.quotes().to_vec(),
            categories: index.entries(),
            selected: selection.as_str().to_string(),
            filter,
            visible,
            last_sync,
            load_source: store.load_source().clone(),
        })
    }

    /// Category entries, starting with `all`.
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened.
    pub fn categories(&self) -> Result<Vec<CategoryEntry>> {
        let _guard = self.lock_writes()?;
        let store = self.open_store()?;
        Ok(store.category_index().entries())
    }

    /// Store one quote, select its category, then optionally push it.
    ///
    /// A failed selection write or a failed push is reported in the result and
    /// never undoes the add.
    ///
    /// # Errors
    /// Returns an error for blank text or when the quote cannot be persisted.
    pub fn add_quote(&self, input: AddQuoteRequest) -> Result<AddQuoteResult> {
        let (quote, selection, selection_warning) = {
            let _guard = self.lock_writes()?;
            let mut store = self.open_store()?;
            let quote = store.add(&input.text, &input.category)?;
            match SelectionState::select(store.storage_mut(), &quote.category) {
                Ok(selection) => (quote, selection, None),
                Err(err) => {
                    let warning = err.to_string();
                    tracing::warn!(
                        id = %quote.id,
                        error = %warning,
                        "quote stored but selection not saved"
                    );
                    let selection =
                        SelectionState::restore_from(store.storage(), &store.category_index());
                    (quote, selection, Some(warning))
                }
            }
        };
        tracing::info!(id = %quote.id, category = %quote.category, "quote added");

        let push = if input.push {
            post_local(self.remote.as_ref(), &quote)
        } else {
            PushStatus::Skipped
        };

        Ok(AddQuoteResult {
            quote,
            selected: selection.as_str().to_string(),
            push,
            selection_warning,
        })
    }

    /// Persist `value` as the selection; unknown values are stored as given.
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened or written.
    pub fn select_category(&self, value: &str) -> Result<SelectionResult> {
        let _guard = self.lock_writes()?;
        let mut store = self.open_store()?;
        let known = store.category_index().contains_label(value);
        let selection = SelectionState::select(store.storage_mut(), value)?;
        Ok(SelectionResult { selected: selection.as_str().to_string(), known })
    }

    /// Pick one quote from the filtered pool and remember it as last viewed.
    ///
    /// Returns `None` when the pool is empty.
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened or written.
    pub fn random_quote(&self, category: Option<&str>) -> Result<Option<RandomQuote>> {
        let _guard = self.lock_writes()?;
        let mut store = self.open_store()?;
        let index = store.category_index();
        let selection = SelectionState::restore_from(store.storage(), &index);
        let filter = category.unwrap_or(selection.as_str());

        let pool = filter_by_category(store.quotes(), filter);
        let Some(quote) = pool.choose(&mut rand::thread_rng()).map(|quote| (*quote).clone()) else {
            return Ok(None);
        };
        let pool_size = pool.len();

        store.storage_mut().set_item(LAST_VIEWED_QUOTE_KEY, quote.id.as_str())?;
        Ok(Some(RandomQuote { quote, pool_size }))
    }

    /// Id of the quote most recently returned by [`Self::random_quote`].
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened or read.
    pub fn last_viewed(&self) -> Result<Option<String>> {
        let mut sqlite = self.open_sqlite()?;
        sqlite.migrate()?;
        sqlite.get_item(LAST_VIEWED_QUOTE_KEY)
    }

    /// Merge a JSON array import into the store.
    ///
    /// # Errors
    /// Returns an error when `raw` is not a JSON array (store untouched) or
    /// persistence fails.
    pub fn import_json(&self, raw: &str, merge_key: MergeKey) -> Result<ImportResult> {
        let _guard = self.lock_writes()?;
        let mut store = self.open_store()?;
        let result = store.import_json(raw, merge_key)?;
        tracing::info!(
            added = result.added,
            overwritten = result.overwritten,
            skipped = result.skipped,
            merge_key = merge_key.as_str(),
            "import merged"
        );
        Ok(ImportResult {
            merge_key,
            added: result.added,
            overwritten: result.overwritten,
            skipped: result.skipped,
            total: store.quotes().len(),
        })
    }

    /// Pretty JSON export of the full list with its SHA-256 digest.
    ///
    /// # Errors
    /// Returns an error when storage cannot be opened or serialization fails.
    pub fn export(&self) -> Result<ExportResult> {
        let _guard = self.lock_writes()?;
        let store = self.open_store()?;
        let body = store.export_json()?;
        Ok(ExportResult {
            sha256: sha256_hex(body.as_bytes()),
            quote_count: store.quotes().len(),
            quotes: store.quotes().to_vec(),
            body,
        })
    }

    /// One reconciliation run against the remote source.
    ///
    /// Overlapping runs are skipped. The fetch happens outside the write lock;
    /// the local list is re-read under the lock before merging.
    ///
    /// # Errors
    /// Returns an error when local storage cannot be opened or written. Remote
    /// failures are reported as [`SyncOutcome::Failed`].
    pub fn sync(&self) -> Result<SyncReport> {
        let Some(_permit) = SyncPermit::acquire(&self.sync_in_flight) else {
            tracing::debug!("sync already in flight; skipping");
            return Ok(SyncReport::empty(SyncOutcome::Skipped));
        };

        let fetched = try_fetch_remote(self.remote.as_ref());

        let _guard = self.lock_writes()?;
        let mut store = self.open_store()?;
        let synced_at = now_rfc3339()?;

        let remote = match fetched {
            Ok(remote) => remote,
            Err(err) => {
                let error = format!("{err:#}");
                tracing::warn!(%error, "sync failed; local quotes untouched");
                store.storage_mut().set_item(LAST_SYNC_KEY, &synced_at)?;
                return Ok(SyncReport {
                    total: store.quotes().len(),
                    synced_at: Some(synced_at),
                    error: Some(error),
                    ..SyncReport::empty(SyncOutcome::Failed)
                });
            }
        };

        let fetched_count = remote.len();
        let outcome = reconcile(store.quotes(), &remote);
        let report = if remote.is_empty() || !outcome.changed {
            SyncReport {
                fetched: fetched_count,
                total: store.quotes().len(),
                ..SyncReport::empty(SyncOutcome::NoChange)
            }
        } else {
            let total = outcome.merged.len();
            store.replace_all(outcome.merged).context("failed to persist synced quotes")?;
            SyncReport {
                fetched: fetched_count,
                added: outcome.added,
                replaced: outcome.replaced,
                total,
                ..SyncReport::empty(SyncOutcome::Changed)
            }
        };

        store.storage_mut().set_item(LAST_SYNC_KEY, &synced_at)?;
        tracing::info!(
            outcome = report.outcome.as_str(),
            fetched = report.fetched,
            added = report.added,
            replaced = report.replaced,
            "sync finished"
        );
        Ok(SyncReport { synced_at: Some(synced_at), ..report })
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
