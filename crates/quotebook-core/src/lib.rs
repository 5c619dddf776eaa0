use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub const DEFAULT_CATEGORY: &str = "General";
pub const REMOTE_FALLBACK_CATEGORY: &str = "Server";
pub const ALL_CATEGORIES: &str = "all";

pub const QUOTES_KEY: &str = "quotes_v1";
pub const SELECTED_CATEGORY_KEY: &str = "selectedCategory_v1";
pub const LAST_VIEWED_QUOTE_KEY: &str = "lastViewedQuote";
pub const LAST_SYNC_KEY: &str = "lastSync_v1";

const IMPORT_KEY_SEPARATOR: &str = "@@";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("import format error: {0}")]
    ImportFormat(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct QuoteId(pub String);

impl QuoteId {
    /// Fresh identifier for a record created on this device.
    #[must_use]
    pub fn new_local() -> Self {
        Self(format!("local-{}", Ulid::new()))
    }

    #[must_use]
    pub fn remote(remote_id: &str) -> Self {
        Self(format!("server-{remote_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QuoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRecord {
    pub id: QuoteId,
    pub text: String,
    pub category: String,
    /// Milliseconds since the Unix epoch of the last local mutation.
    pub updated_at: i64,
}

impl QuoteRecord {
    /// Build a locally created record from user input.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when `text` is empty after trimming.
    pub fn new(text: &str, category: &str) -> Result<Self, KernelError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(KernelError::Validation("quote text MUST be non-empty".to_string()));
        }

        Ok(Self {
            id: QuoteId::new_local(),
            text: text.to_string(),
            category: default_category(category),
            updated_at: now_millis(),
        })
    }

    /// Normalize one persisted entry, filling best-effort defaults.
    ///
    /// Non-blank text and category are kept as written. Returns `None` when the
    /// entry is not an object or its text is blank.
    #[must_use]
    pub fn from_stored(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let text = object.get("text").and_then(scalar_string).unwrap_or_default();
        if text.trim().is_empty() {
            return None;
        }
        let category = object.get("category").and_then(scalar_string).unwrap_or_default();

        Some(Self {
            id: object
                .get("id")
                .and_then(scalar_string)
                .filter(|id| !id.trim().is_empty())
                .map_or_else(QuoteId::new_local, QuoteId),
            text,
            category: if category.trim().is_empty() {
                DEFAULT_CATEGORY.to_string()
            } else {
                category
            },
            updated_at: object.get("updatedAt").and_then(timestamp_millis).unwrap_or_else(now_millis),
        })
    }

    /// Normalize one imported entry: text and category are trimmed.
    ///
    /// Returns `None` when the entry is not an object or its text is blank.
    #[must_use]
    pub fn from_imported(value: &Value) -> Option<Self> {
        let mut record = Self::from_stored(value)?;
        record.text = record.text.trim().to_string();
        record.category = default_category(&record.category);
        Some(record)
    }

    #[must_use]
    pub fn text_key(&self) -> String {
        text_key(&self.text)
    }

    #[must_use]
    pub fn import_key(&self) -> String {
        import_key(&self.text, &self.category)
    }

    fn same_content(&self, other: &Self) -> bool {
        self.text == other.text && self.category == other.category
    }
}

#[must_use]
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

/// Trimmed category, or [`DEFAULT_CATEGORY`] when blank.
#[must_use]
pub fn default_category(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Merge key used by remote reconciliation.
#[must_use]
pub fn text_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Merge key used by file import.
#[must_use]
pub fn import_key(text: &str, category: &str) -> String {
    format!("{}{IMPORT_KEY_SEPARATOR}{}", text.trim(), category.trim())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(inner) => Some(inner.clone()),
        Value::Number(inner) => Some(inner.to_string()),
        Value::Bool(inner) => Some(inner.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => {
            number.as_i64().or_else(|| number.as_f64().map(|float| float as i64))
        }
        Value::String(raw) => raw.trim().parse::<i64>().ok().or_else(|| {
            OffsetDateTime::parse(raw.trim(), &time::format_description::well_known::Rfc3339)
                .ok()
                .and_then(|parsed| i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok())
        }),
        _ => None,
    }
}

/// The fixed list used whenever persisted quotes are missing or unreadable.
#[must_use]
pub fn seed_quotes() -> Vec<QuoteRecord> {
    let now = now_millis();
    [
        ("The best way to predict the future is to invent it.", "Inspiration"),
        ("Life is 10% what happens to us and 90% how we react to it.", "Motivation"),
        ("Simplicity is the ultimate sophistication.", "Design"),
    ]
    .into_iter()
    .map(|(text, category)| QuoteRecord {
        id: QuoteId::new_local(),
        text: text.to_string(),
        category: category.to_string(),
        updated_at: now,
    })
    .collect()
}

// ---------------------------------------------------------------------------
// Storage seam
// ---------------------------------------------------------------------------

/// String key/value persistence with whole-value overwrite semantics.
pub trait KeyValueStorage {
    /// # Errors
    /// Returns [`KernelError::Storage`] when the backend cannot be read.
    fn get_item(&self, key: &str) -> Result<Option<String>, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Storage`] when the backend cannot be written.
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), KernelError>;
}

/// In-process storage, mainly for tests and ephemeral sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStorage {
    items: BTreeMap<String, String>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, KernelError> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), KernelError> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Quote store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum LoadSource {
    /// Persisted list parsed; `dropped` entries failed validation.
    Stored { dropped: usize },
    Seeded { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoadOutcome {
    pub quotes: Vec<QuoteRecord>,
    pub source: LoadSource,
}

/// Key scheme for one import merge pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeKey {
    /// Normalized text only; an import can move a quote to another category.
    Text,
    /// `text@@category`; the same text in two categories stays two records.
    #[default]
    TextAndCategory,
}

impl MergeKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::TextAndCategory => "text_and_category",
        }
    }

    #[must_use]
    pub fn key_for(self, record: &QuoteRecord) -> String {
        match self {
            Self::Text => record.text_key(),
            Self::TextAndCategory => record.import_key(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct MergeResult {
    pub added: usize,
    pub overwritten: usize,
    pub skipped: usize,
}

/// Parse a persisted quote list. Fails on invalid JSON or a non-array payload.
///
/// # Errors
/// Returns [`KernelError::Storage`] when the payload is not a JSON array.
pub fn parse_stored_quotes(raw: &str) -> Result<(Vec<QuoteRecord>, usize), KernelError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| KernelError::Storage(format!("stored quotes are not valid JSON: {err}")))?;
    let Value::Array(entries) = value else {
        return Err(KernelError::Storage("stored quotes are not a JSON array".to_string()));
    };

    let quotes = entries.iter().filter_map(QuoteRecord::from_stored).collect::<Vec<_>>();
    let dropped = entries.len() - quotes.len();
    Ok((quotes, dropped))
}

/// Read the quote list from storage, falling back to [`seed_quotes`].
#[must_use]
pub fn load_quotes<S: KeyValueStorage + ?Sized>(storage: &S) -> LoadOutcome {
    let raw = match storage.get_item(QUOTES_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            return LoadOutcome {
                quotes: seed_quotes(),
                source: LoadSource::Seeded { reason: "no stored quotes".to_string() },
            };
        }
        Err(err) => {
            return LoadOutcome {
                quotes: seed_quotes(),
                source: LoadSource::Seeded { reason: err.to_string() },
            };
        }
    };

    match parse_stored_quotes(&raw) {
        Ok((quotes, dropped)) => LoadOutcome { quotes, source: LoadSource::Stored { dropped } },
        Err(err) => LoadOutcome {
            quotes: seed_quotes(),
            source: LoadSource::Seeded { reason: err.to_string() },
        },
    }
}

/// Owner of the canonical quote list. All mutations persist through [`QuoteStore::save`].
#[derive(Debug)]
pub struct QuoteStore<S> {
    storage: S,
    quotes: Vec<QuoteRecord>,
    load_source: LoadSource,
}

impl<S: KeyValueStorage> QuoteStore<S> {
    /// Open a store over `storage` and load its current list.
    pub fn open(storage: S) -> Self {
        let outcome = load_quotes(&storage);
        Self { storage, quotes: outcome.quotes, load_source: outcome.source }
    }

    /// Read the persisted list again without touching the in-memory copy.
    #[must_use]
    pub fn load(&self) -> LoadOutcome {
        load_quotes(&self.storage)
    }

    #[must_use]
    pub fn quotes(&self) -> &[QuoteRecord] {
        &self.quotes
    }

    #[must_use]
    pub fn load_source(&self) -> &LoadSource {
        &self.load_source
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    #[must_use]
    pub fn category_index(&self) -> CategoryIndex {
        CategoryIndex::rebuild(&self.quotes)
    }

    /// Overwrite the persisted list with the in-memory one.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when serialization or the write fails.
    pub fn save(&mut self) -> Result<(), KernelError> {
        let payload = serde_json::to_string(&self.quotes)
            .map_err(|err| KernelError::Storage(format!("failed to serialize quotes: {err}")))?;
        self.storage.set_item(QUOTES_KEY, &payload)
    }

    /// # Errors
    /// Returns [`KernelError::Storage`] when the new list cannot be persisted.
    pub fn replace_all(&mut self, quotes: Vec<QuoteRecord>) -> Result<(), KernelError> {
        self.quotes = quotes;
        self.save()
    }

    /// Append one locally authored quote and persist.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for blank text, or [`KernelError::Storage`]
    /// when persistence fails (the in-memory list is left unchanged in both cases).
    pub fn add(&mut self, text: &str, category: &str) -> Result<QuoteRecord, KernelError> {
        let record = QuoteRecord::new(text, category)?;
        self.quotes.push(record.clone());
        if let Err(err) = self.save() {
            self.quotes.pop();
            return Err(err);
        }
        Ok(record)
    }

    /// Merge imported entries under `scheme`; imported entries win.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when the merged list cannot be persisted.
    pub fn merge_imported(
        &mut self,
        entries: &[Value],
        scheme: MergeKey,
    ) -> Result<MergeResult, KernelError> {
        let (merged, result) = merge_imported(&self.quotes, entries, scheme);
        self.replace_all(merged)?;
        Ok(result)
    }

    /// Parse an import file body and merge it.
    ///
    /// # Errors
    /// Returns [`KernelError::ImportFormat`] when `raw` is not a JSON array (the store
    /// is left untouched), or [`KernelError::Storage`] when persistence fails.
    pub fn import_json(&mut self, raw: &str, scheme: MergeKey) -> Result<MergeResult, KernelError> {
        let entries = parse_import(raw)?;
        self.merge_imported(&entries, scheme)
    }

    /// Pretty-printed JSON array of the full list.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when serialization fails.
    pub fn export_json(&self) -> Result<String, KernelError> {
        serde_json::to_string_pretty(&self.quotes)
            .map_err(|err| KernelError::Storage(format!("failed to serialize quotes: {err}")))
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

/// # Errors
/// Returns [`KernelError::ImportFormat`] when `raw` is not valid JSON or not an array.
pub fn parse_import(raw: &str) -> Result<Vec<Value>, KernelError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| KernelError::ImportFormat(format!("import is not valid JSON: {err}")))?;
    match value {
        Value::Array(entries) => Ok(entries),
        _ => Err(KernelError::ImportFormat("import is not a JSON array".to_string())),
    }
}

/// Insertion-ordered map where a repeated key keeps its position and takes the new value.
#[derive(Debug, Default)]
struct KeyedQuotes {
    positions: BTreeMap<String, usize>,
    records: Vec<QuoteRecord>,
}

impl KeyedQuotes {
    /// Returns the previous record stored under `key`, if any.
    fn upsert(&mut self, key: String, record: QuoteRecord) -> Option<QuoteRecord> {
        if let Some(&position) = self.positions.get(&key) {
            return Some(std::mem::replace(&mut self.records[position], record));
        }
        self.positions.insert(key, self.records.len());
        self.records.push(record);
        None
    }

    fn into_records(self) -> Vec<QuoteRecord> {
        self.records
    }
}

/// Pure import merge: existing records seed the map, imported entries overwrite by
/// `scheme` key. Blank-text or non-object entries are skipped.
#[must_use]
pub fn merge_imported(
    existing: &[QuoteRecord],
    entries: &[Value],
    scheme: MergeKey,
) -> (Vec<QuoteRecord>, MergeResult) {
    let mut keyed = KeyedQuotes::default();
    for record in existing {
        keyed.upsert(scheme.key_for(record), record.clone());
    }

    let mut result = MergeResult::default();
    for entry in entries {
        let Some(record) = QuoteRecord::from_imported(entry) else {
            result.skipped += 1;
            continue;
        };
        if keyed.upsert(scheme.key_for(&record), record).is_some() {
            result.overwritten += 1;
        } else {
            result.added += 1;
        }
    }

    (keyed.into_records(), result)
}

// ---------------------------------------------------------------------------
// Category index and selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryEntry {
    pub key: String,
    pub label: String,
}

/// Categories in first-seen order, keyed case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CategoryIndex {
    categories: Vec<CategoryEntry>,
}

impl CategoryIndex {
    #[must_use]
    pub fn rebuild(quotes: &[QuoteRecord]) -> Self {
        let mut seen = BTreeSet::new();
        let mut categories = Vec::new();
        for quote in quotes {
            let label = quote.category.trim();
            if label.is_empty() {
                continue;
            }
            let key = label.to_lowercase();
            if seen.insert(key.clone()) {
                categories.push(CategoryEntry { key, label: label.to_string() });
            }
        }
        Self { categories }
    }

    /// Every entry, starting with the synthetic `all` entry.
    #[must_use]
    pub fn entries(&self) -> Vec<CategoryEntry> {
        let mut entries = Vec::with_capacity(self.categories.len() + 1);
        entries.push(CategoryEntry {
            key: ALL_CATEGORIES.to_string(),
            label: ALL_CATEGORIES.to_string(),
        });
        entries.extend(self.categories.iter().cloned());
        entries
    }

    /// Display labels of real categories.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.categories.iter().map(|entry| entry.label.as_str()).collect()
    }

    #[must_use]
    pub fn contains_label(&self, label: &str) -> bool {
        label == ALL_CATEGORIES || self.categories.iter().any(|entry| entry.label == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct SelectionState(String);

impl Default for SelectionState {
    fn default() -> Self {
        Self::all()
    }
}

impl SelectionState {
    #[must_use]
    pub fn all() -> Self {
        Self(ALL_CATEGORIES.to_string())
    }

    /// Keep `persisted` only when the index still knows it.
    #[must_use]
    pub fn restore(persisted: Option<&str>, index: &CategoryIndex) -> Self {
        match persisted {
            Some(value) if index.contains_label(value) => Self(value.to_string()),
            _ => Self::all(),
        }
    }

    /// Restore from storage; unreadable storage counts as nothing persisted.
    #[must_use]
    pub fn restore_from<S: KeyValueStorage + ?Sized>(storage: &S, index: &CategoryIndex) -> Self {
        let persisted = storage.get_item(SELECTED_CATEGORY_KEY).ok().flatten();
        Self::restore(persisted.as_deref(), index)
    }

    /// Persist `value` as the current selection without checking the index.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when the write fails.
    pub fn select<S: KeyValueStorage + ?Sized>(
        storage: &mut S,
        value: &str,
    ) -> Result<Self, KernelError> {
        let selection = Self(value.to_string());
        selection.persist(storage)?;
        Ok(selection)
    }

    /// # Errors
    /// Returns [`KernelError::Storage`] when the write fails.
    pub fn persist<S: KeyValueStorage + ?Sized>(&self, storage: &mut S) -> Result<(), KernelError> {
        storage.set_item(SELECTED_CATEGORY_KEY, &self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        self.0 == ALL_CATEGORIES
    }

    #[must_use]
    pub fn filter<'a>(&self, quotes: &'a [QuoteRecord]) -> Vec<&'a QuoteRecord> {
        filter_by_category(quotes, &self.0)
    }
}

/// Exact, case-sensitive category match; `all` keeps everything.
#[must_use]
pub fn filter_by_category<'a>(quotes: &'a [QuoteRecord], selection: &str) -> Vec<&'a QuoteRecord> {
    if selection == ALL_CATEGORIES {
        return quotes.iter().collect();
    }
    quotes.iter().filter(|quote| quote.category == selection).collect()
}

// ---------------------------------------------------------------------------
// Remote mapping and reconciliation
// ---------------------------------------------------------------------------

/// Body sent to the remote sink for one local record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPost {
    pub title: String,
    pub body: String,
    pub user_id: u32,
}

impl OutboundPost {
    #[must_use]
    pub fn from_record(record: &QuoteRecord, user_id: u32) -> Self {
        Self { title: record.text.clone(), body: record.category.clone(), user_id }
    }
}

/// Map one `{id, title, body, userId}` item into a record.
///
/// Items without a non-blank title are ignored. The category is the first word of
/// the body, or [`REMOTE_FALLBACK_CATEGORY`].
#[must_use]
pub fn map_remote_post(post: &Value, fetched_at: i64) -> Option<QuoteRecord> {
    let object = post.as_object()?;
    let text = object.get("title").and_then(scalar_string)?.trim().to_string();
    if text.is_empty() {
        return None;
    }
    let category = object
        .get("body")
        .and_then(scalar_string)
        .and_then(|body| body.split_whitespace().next().map(ToString::to_string))
        .unwrap_or_else(|| REMOTE_FALLBACK_CATEGORY.to_string());
    let id = object
        .get("id")
        .and_then(scalar_string)
        .map_or_else(|| QuoteId::remote(&Ulid::new().to_string()), |id| QuoteId::remote(&id));

    Some(QuoteRecord { id, text, category, updated_at: fetched_at })
}

#[must_use]
pub fn map_remote_posts(posts: &[Value], fetched_at: i64) -> Vec<QuoteRecord> {
    posts.iter().filter_map(|post| map_remote_post(post, fetched_at)).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reconciliation {
    pub merged: Vec<QuoteRecord>,
    pub changed: bool,
    /// Remote records whose key was absent locally.
    pub added: usize,
    /// Remote records that replaced a local record with different text or category.
    pub replaced: usize,
}

/// Remote-precedence merge keyed on normalized text.
///
/// Local records seed the map in order; remote records overwrite or append in
/// remote order. Records with a blank key are dropped. `changed` compares by key,
/// not by position.
#[must_use]
pub fn reconcile(local: &[QuoteRecord], remote: &[QuoteRecord]) -> Reconciliation {
    let mut keyed = KeyedQuotes::default();
    for record in local {
        let key = record.text_key();
        if key.is_empty() {
            continue;
        }
        keyed.upsert(key, record.clone());
    }

    let local_by_key = keyed
        .positions
        .iter()
        .map(|(key, &position)| (key.clone(), keyed.records[position].clone()))
        .collect::<BTreeMap<_, _>>();

    let mut added = 0_usize;
    let mut replaced = 0_usize;
    for record in remote {
        let key = record.text_key();
        if key.is_empty() {
            continue;
        }
        match keyed.upsert(key, record.clone()) {
            None => added += 1,
            Some(previous) if !previous.same_content(record) => replaced += 1,
            Some(_) => {}
        }
    }

    let merged = keyed.into_records();
    let changed = merged.len() != local.len()
        || merged.iter().any(|record| match local_by_key.get(&record.text_key()) {
            Some(previous) => !previous.same_content(record),
            None => true,
        });

    Reconciliation { merged, changed, added, replaced }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn quote(text: &str, category: &str) -> QuoteRecord {
        QuoteRecord {
            id: QuoteId::new_local(),
            text: text.to_string(),
            category: category.to_string(),
            updated_at: 1_700_000_000_000,
        }
    }

    fn store_with(quotes: Vec<QuoteRecord>) -> QuoteStore<MemoryStorage> {
        let mut store = QuoteStore::open(MemoryStorage::new());
        if let Err(err) = store.replace_all(quotes) {
            panic!("fixture store should persist: {err}");
        }
        store
    }

    struct FailingStorage;

    impl KeyValueStorage for FailingStorage {
        fn get_item(&self, _key: &str) -> Result<Option<String>, KernelError> {
            Err(KernelError::Storage("disk unavailable".to_string()))
        }

        fn set_item(&mut self, _key: &str, _value: &str) -> Result<(), KernelError> {
            Err(KernelError::Storage("disk unavailable".to_string()))
        }
    }

    #[test]
    fn load_round_trips_well_formed_list() {
        let expected = vec![quote("first", "Wisdom"), quote("second", "Motivation")];
        let store = store_with(expected.clone());

        let reopened = QuoteStore::open(store.into_storage());
        assert_eq!(reopened.quotes(), expected.as_slice());
        assert_eq!(reopened.load_source(), &LoadSource::Stored { dropped: 0 });
    }

    #[test]
    fn load_fills_defaults_and_drops_blank_text() {
        let mut storage = MemoryStorage::new();
        let raw = serde_json::json!([
            { "text": "no category or id" },
            { "text": "   ", "category": "Empty" },
            { "text": "blank category", "category": "  ", "id": "keep-me", "updatedAt": 5 },
            { "category": "missing text" },
            "not an object"
        ]);
        if let Err(err) = storage.set_item(QUOTES_KEY, &raw.to_string()) {
            panic!("memory storage should accept writes: {err}");
        }

        let outcome = load_quotes(&storage);
        assert_eq!(outcome.source, LoadSource::Stored { dropped: 3 });
        assert_eq!(outcome.quotes.len(), 2);
        assert_eq!(outcome.quotes[0].category, DEFAULT_CATEGORY);
        assert!(outcome.quotes[0].id.as_str().starts_with("local-"));
        assert_eq!(outcome.quotes[1].category, DEFAULT_CATEGORY);
        assert_eq!(outcome.quotes[1].id, QuoteId("keep-me".to_string()));
        assert_eq!(outcome.quotes[1].updated_at, 5);
    }

    #[test]
    fn load_keeps_padded_category_as_written() {
        let padded = vec![QuoteRecord {
            id: QuoteId("q1".to_string()),
            text: "hello".to_string(),
            category: " Wisdom ".to_string(),
            updated_at: 1,
        }];
        let store = store_with(padded.clone());
        assert_eq!(store.load().quotes, padded);

        let (merged, _) = merge_imported(
            &[],
            &[serde_json::json!({ "text": " hello ", "category": " Wisdom " })],
            MergeKey::Text,
        );
        assert_eq!(merged[0].text, "hello");
        assert_eq!(merged[0].category, "Wisdom");
    }

    #[test]
    fn load_seeds_defaults_when_storage_is_corrupt() {
        let mut storage = MemoryStorage::new();
        if let Err(err) = storage.set_item(QUOTES_KEY, "{not json") {
            panic!("memory storage should accept writes: {err}");
        }

        let outcome = load_quotes(&storage);
        assert!(matches!(outcome.source, LoadSource::Seeded { .. }));
        assert_eq!(outcome.quotes.len(), 3);
    }

    #[test]
    fn load_seeds_defaults_when_shape_is_not_an_array() {
        let mut storage = MemoryStorage::new();
        if let Err(err) = storage.set_item(QUOTES_KEY, r#"{"text":"x"}"#) {
            panic!("memory storage should accept writes: {err}");
        }

        let outcome = load_quotes(&storage);
        let LoadSource::Seeded { reason } = outcome.source else {
            panic!("expected seeded load");
        };
        assert!(reason.contains("not a JSON array"));
        assert!(!outcome.quotes.is_empty());
    }

    #[test]
    fn load_seeds_defaults_when_storage_read_fails() {
        let outcome = load_quotes(&FailingStorage);
        assert!(matches!(outcome.source, LoadSource::Seeded { .. }));
        assert_eq!(outcome.quotes.len(), seed_quotes().len());
    }

    #[test]
    fn add_rejects_blank_text_and_leaves_store_unchanged() {
        let mut store = store_with(vec![quote("existing", "X")]);

        let err = match store.add("", "X") {
            Ok(record) => panic!("blank text should be rejected, got {record:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, KernelError::Validation(_)));
        assert_eq!(store.quotes().len(), 1);
        assert_eq!(store.load().quotes.len(), 1);
    }

    #[test]
    fn add_defaults_blank_category_to_general_and_persists() {
        let mut store = store_with(vec![]);

        let record = match store.add("  hello  ", "   ") {
            Ok(record) => record,
            Err(err) => panic!("add should succeed: {err}"),
        };
        assert_eq!(record.text, "hello");
        assert_eq!(record.category, DEFAULT_CATEGORY);
        assert_eq!(store.load().quotes, vec![record]);
    }

    #[test]
    fn add_rolls_back_when_save_fails() {
        let mut store = QuoteStore::open(FailingStorage);
        let before = store.quotes().len();

        let result = store.add("hello", "X");
        assert!(matches!(result, Err(KernelError::Storage(_))));
        assert_eq!(store.quotes().len(), before);
    }

    #[test]
    fn category_index_keeps_first_seen_casing() {
        let quotes = vec![quote("a", "Wisdom"), quote("b", "wisdom"), quote("c", "Motivation")];
        let index = CategoryIndex::rebuild(&quotes);

        assert_eq!(index.labels(), vec!["Wisdom", "Motivation"]);
        let entries = index.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].label, ALL_CATEGORIES);
        assert_eq!(entries[1].key, "wisdom");
    }

    #[test]
    fn category_index_trims_and_skips_blank_categories() {
        let quotes = vec![quote("a", "  Design "), quote("b", "  ")];
        let index = CategoryIndex::rebuild(&quotes);
        assert_eq!(index.labels(), vec!["Design"]);
        assert!(index.contains_label(ALL_CATEGORIES));
        assert!(!index.contains_label("design"));
    }

    #[test]
    fn selection_falls_back_to_all_for_unknown_label() {
        let index = CategoryIndex::rebuild(&[quote("a", "Wisdom")]);
        assert_eq!(SelectionState::restore(Some("Extinct"), &index), SelectionState::all());
        assert_eq!(SelectionState::restore(None, &index), SelectionState::all());
        assert_eq!(SelectionState::restore(Some("Wisdom"), &index).as_str(), "Wisdom");
    }

    #[test]
    fn select_persists_without_validation_and_restore_repairs_it() {
        let mut storage = MemoryStorage::new();
        let selection = match SelectionState::select(&mut storage, "Extinct") {
            Ok(selection) => selection,
            Err(err) => panic!("select should persist: {err}"),
        };
        assert_eq!(selection.as_str(), "Extinct");

        let index = CategoryIndex::rebuild(&[quote("a", "Wisdom")]);
        assert!(SelectionState::restore_from(&storage, &index).is_all());
    }

    #[test]
    fn filter_matches_exact_category_only() {
        let quotes = vec![quote("a", "Wisdom"), quote("b", "wisdom"), quote("c", "Design")];
        let index = CategoryIndex::rebuild(&quotes);

        let wisdom = SelectionState::restore(Some("Wisdom"), &index);
        let filtered = wisdom.filter(&quotes);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].text, "a");

        assert_eq!(SelectionState::all().filter(&quotes).len(), 3);
    }

    #[test]
    fn import_merge_prefers_imported_record_under_text_key() {
        let mut store = store_with(vec![quote("A", "X")]);
        let imported = serde_json::json!([{ "text": "A", "category": "Y" }]).to_string();

        let result = match store.import_json(&imported, MergeKey::Text) {
            Ok(result) => result,
            Err(err) => panic!("import should succeed: {err}"),
        };
        assert_eq!(result, MergeResult { added: 0, overwritten: 1, skipped: 0 });
        assert_eq!(store.quotes().len(), 1);
        assert_eq!(store.quotes()[0].category, "Y");
    }

    #[test]
    fn import_merge_keeps_both_categories_under_default_key() {
        let mut store = store_with(vec![quote("A", "X")]);
        let imported = serde_json::json!([{ "text": "A", "category": "Y" }]).to_string();

        let result = match store.import_json(&imported, MergeKey::default()) {
            Ok(result) => result,
            Err(err) => panic!("import should succeed: {err}"),
        };
        assert_eq!(result, MergeResult { added: 1, overwritten: 0, skipped: 0 });
        let categories = store.quotes().iter().map(|q| q.category.as_str()).collect::<Vec<_>>();
        assert_eq!(categories, vec!["X", "Y"]);
    }

    #[test]
    fn import_merge_overwrites_same_text_and_category() {
        let mut store = store_with(vec![quote("A", "X"), quote("B", "X")]);
        let imported = serde_json::json!([
            { "id": "imported-a", "text": " A ", "category": "X " },
            { "text": "" },
            { "text": "C" }
        ]);
        let Value::Array(entries) = imported else { unreachable!() };

        let result = match store.merge_imported(&entries, MergeKey::TextAndCategory) {
            Ok(result) => result,
            Err(err) => panic!("merge should succeed: {err}"),
        };
        assert_eq!(result, MergeResult { added: 1, overwritten: 1, skipped: 1 });
        let quotes = store.quotes();
        assert_eq!(quotes.len(), 3);
        assert_eq!(quotes[0].id, QuoteId("imported-a".to_string()));
        assert_eq!(quotes[0].text, "A");
        assert_eq!(quotes[2].category, DEFAULT_CATEGORY);
    }

    #[test]
    fn import_rejects_non_array_and_leaves_store_unchanged() {
        let mut store = store_with(vec![quote("A", "X")]);
        let before = store.quotes().to_vec();

        for raw in ["{}", "not json", "\"text\""] {
            let err = match store.import_json(raw, MergeKey::default()) {
                Ok(result) => panic!("import of {raw} should fail, got {result:?}"),
                Err(err) => err,
            };
            assert!(matches!(err, KernelError::ImportFormat(_)));
        }
        assert_eq!(store.quotes(), before.as_slice());
        assert_eq!(store.load().quotes, before);
    }

    #[test]
    fn export_is_pretty_json_array_of_all_quotes() {
        let store = store_with(vec![quote("A", "X"), quote("B", "Y")]);
        let exported = match store.export_json() {
            Ok(exported) => exported,
            Err(err) => panic!("export should serialize: {err}"),
        };
        assert!(exported.contains("\n  {"));
        assert!(exported.contains("\"updatedAt\""));
        let (parsed, dropped) = match parse_stored_quotes(&exported) {
            Ok(parsed) => parsed,
            Err(err) => panic!("export should parse back: {err}"),
        };
        assert_eq!(dropped, 0);
        assert_eq!(parsed, store.quotes());
    }

    #[test]
    fn remote_posts_map_title_and_first_body_word() {
        let posts = serde_json::json!([
            { "id": 7, "title": " sunt aut facere ", "body": "quia et suscipit", "userId": 1 },
            { "id": 8, "title": "no body" },
            { "id": 9, "title": "   " },
            { "id": 10, "body": "missing title" }
        ]);
        let Value::Array(posts) = posts else { unreachable!() };

        let mapped = map_remote_posts(&posts, 42);
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].id, QuoteId("server-7".to_string()));
        assert_eq!(mapped[0].text, "sunt aut facere");
        assert_eq!(mapped[0].category, "quia");
        assert_eq!(mapped[0].updated_at, 42);
        assert_eq!(mapped[1].category, REMOTE_FALLBACK_CATEGORY);
    }

    #[test]
    fn outbound_post_uses_wire_field_names() {
        let post = OutboundPost::from_record(&quote("hello", "Wisdom"), 1);
        let value = match serde_json::to_value(&post) {
            Ok(value) => value,
            Err(err) => panic!("post should serialize: {err}"),
        };
        assert_eq!(value, serde_json::json!({ "title": "hello", "body": "Wisdom", "userId": 1 }));
    }

    #[test]
    fn reconcile_remote_wins_on_text_collision() {
        let local = vec![quote("hello", "local")];
        let remote = vec![quote("Hello ", "remote")];

        let outcome = reconcile(&local, &remote);
        assert!(outcome.changed);
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.merged[0].category, "remote");
        assert_eq!(outcome.replaced, 1);
        assert_eq!(outcome.added, 0);
        assert_eq!(local[0].category, "local");
    }

    #[test]
    fn reconcile_is_a_no_op_on_repeated_snapshot() {
        let local = vec![quote("hello", "local"), quote("mine", "Wisdom")];
        let remote = vec![quote("hello", "remote"), quote("new", "Server")];

        let first = reconcile(&local, &remote);
        assert!(first.changed);
        assert_eq!(first.added, 1);

        let second = reconcile(&first.merged, &remote);
        assert!(!second.changed);
        assert_eq!(second.merged, first.merged);
    }

    #[test]
    fn reconcile_empty_remote_on_unique_local_is_unchanged() {
        let local = vec![quote("a", "X"), quote("b", "Y")];
        let outcome = reconcile(&local, &[]);
        assert!(!outcome.changed);
        assert_eq!(outcome.merged, local);
    }

    #[test]
    fn reconcile_collapses_local_duplicates_and_reports_change() {
        let local = vec![quote("same", "X"), quote("SAME", "Y")];
        let outcome = reconcile(&local, &[]);
        assert!(outcome.changed);
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.merged[0].category, "Y");
    }

    #[test]
    fn reconcile_detects_change_despite_positional_coincidence() {
        // Positionally `merged[1]` equals `local[1]`, but the keyed diff must still see
        // the appended remote record.
        let local = vec![quote("a", "X"), quote("b", "Y")];
        let remote = vec![quote("c", "Z")];
        let outcome = reconcile(&local, &remote);
        assert!(outcome.changed);
        assert_eq!(outcome.merged.len(), 3);
    }

    fn arb_quote() -> impl Strategy<Value = QuoteRecord> {
        (" {0,2}[a-z]{1,8}( [a-z]{1,8})? {0,2}", " {0,2}[A-Za-z]{1,6} {0,2}", 0_i64..2_000_000_000_000).prop_map(
            |(text, category, updated_at)| QuoteRecord {
                id: QuoteId::new_local(),
                text,
                category,
                updated_at,
            },
        )
    }

    proptest! {
        #[test]
        fn property_save_then_load_round_trips(quotes in prop::collection::vec(arb_quote(), 0..12)) {
            let mut store = QuoteStore::open(MemoryStorage::new());
            prop_assert!(store.replace_all(quotes.clone()).is_ok());
            let outcome = store.load();
            prop_assert_eq!(outcome.source, LoadSource::Stored { dropped: 0 });
            prop_assert_eq!(outcome.quotes, quotes);
        }
    }

    proptest! {
        #[test]
        fn property_reconcile_is_idempotent(
            local in prop::collection::vec(arb_quote(), 0..10),
            remote in prop::collection::vec(arb_quote(), 0..10),
        ) {
            let first = reconcile(&local, &remote);
            let second = reconcile(&first.merged, &remote);
            prop_assert!(!second.changed);
            prop_assert_eq!(second.merged, first.merged);
        }
    }

    proptest! {
        #[test]
        fn property_merges_yield_unique_keys(
            local in prop::collection::vec(arb_quote(), 0..10),
            remote in prop::collection::vec(arb_quote(), 0..10),
        ) {
            let reconciled = reconcile(&local, &remote);
            let text_keys = reconciled.merged.iter().map(QuoteRecord::text_key).collect::<BTreeSet<_>>();
            prop_assert_eq!(text_keys.len(), reconciled.merged.len());

            let imported = remote
                .iter()
                .map(|record| serde_json::json!({ "text": record.text, "category": record.category }))
                .collect::<Vec<_>>();
            for scheme in [MergeKey::Text, MergeKey::TextAndCategory] {
                let (merged, result) = merge_imported(&local, &imported, scheme);
                let keys = merged.iter().map(|record| scheme.key_for(record)).collect::<BTreeSet<_>>();
                prop_assert_eq!(keys.len(), merged.len());
                prop_assert_eq!(result.added + result.overwritten, remote.len());
            }
        }
    }
}
