//! Record store gateway.
//!
//! `RecordStore` is the raw seam to whatever holds the CRM collections: it
//! answers fetch-by-ID, filter and array-overlap queries with JSON rows.
//! `Gateway` sits on top and does the things every caller needs the same way:
//! chunking ID lists to the backend's batch limit, deserializing rows into
//! typed records, and (for hydration) skipping failed batches.
//!
//! Backends:
//! - sqlite: local mirror (`SqliteStore`)
//! - rest: PostgREST endpoint (`RestStore`)

pub mod rest;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::types::{Company, Contact, Deal, Meeting};

pub use rest::RestStore;
pub use sqlite::SqliteStore;

/// Backend query-size limit for ID lists.
pub const DEFAULT_BATCH_SIZE: usize = 100;

// ============================================================================
// Collections and filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Meetings,
    Contacts,
    Companies,
    Deals,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Meetings,
        Collection::Contacts,
        Collection::Companies,
        Collection::Deals,
    ];

    /// Table name on the backend.
    pub fn table(self) -> &'static str {
        match self {
            Collection::Meetings => "Meetings",
            Collection::Contacts => "Contacts",
            Collection::Companies => "Companies",
            Collection::Deals => "Deals",
        }
    }

    /// Primary key column.
    pub fn id_field(self) -> &'static str {
        match self {
            Collection::Meetings => "id",
            _ => "whalesync_postgres_id",
        }
    }
}

impl std::str::FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.table().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown collection '{s}'"))
    }
}

/// Field predicate understood by every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: String },
    In { field: String, values: Vec<String> },
    /// `field >= at`, compared as timestamps.
    Since { field: String, at: DateTime<Utc> },
    /// `field < at`, compared as timestamps.
    Before { field: String, at: DateTime<Utc> },
    /// Case-insensitive substring match.
    Contains { field: String, needle: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: &str) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn is_in(field: &str, values: &[String]) -> Self {
        Filter::In {
            field: field.to_string(),
            values: values.to_vec(),
        }
    }

    pub fn since(field: &str, at: DateTime<Utc>) -> Self {
        Filter::Since {
            field: field.to_string(),
            at,
        }
    }

    pub fn before(field: &str, at: DateTime<Utc>) -> Self {
        Filter::Before {
            field: field.to_string(),
            at,
        }
    }

    pub fn contains(field: &str, needle: &str) -> Self {
        Filter::Contains {
            field: field.to_string(),
            needle: needle.to_string(),
        }
    }

    /// Reject field names that are not plain identifiers. Backends splice
    /// field names into query text.
    pub fn validate(&self) -> Result<(), StoreError> {
        match self {
            Filter::Eq { field, .. }
            | Filter::In { field, .. }
            | Filter::Since { field, .. }
            | Filter::Before { field, .. }
            | Filter::Contains { field, .. } => validate_field(field),
            Filter::And(parts) | Filter::Or(parts) => parts.iter().try_for_each(Filter::validate),
        }
    }
}

pub(crate) fn validate_field(field: &str) -> Result<(), StoreError> {
    let ok = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidFilter(format!("invalid field name '{field}'")))
    }
}

/// Timestamp format used on the wire, e.g. `2026-01-01T00:00:00.000Z`.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
    #[error("Schema migration failed: {0}")]
    Migration(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),
    #[error("Home directory not found")]
    HomeDirNotFound,
    #[error("Store connection lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Transient failures worth retrying: connectivity, timeouts, 408/429/5xx,
    /// and a busy/locked SQLite file.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StoreError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// ============================================================================
// Raw store trait
// ============================================================================

/// Read access to the four CRM collections. Rows come back in the backend's
/// natural order, which callers treat as significant.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<Vec<Value>, StoreError>;

    async fn fetch_by_filter(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError>;

    /// Rows whose array-valued `array_field` shares at least one entry with `ids`.
    async fn fetch_by_overlap(
        &self,
        collection: Collection,
        array_field: &str,
        ids: &[String],
    ) -> Result<Vec<Value>, StoreError>;
}

// ============================================================================
// Typed gateway
// ============================================================================

/// A typed record living in one collection.
pub trait Record: DeserializeOwned {
    const COLLECTION: Collection;
}

impl Record for Meeting {
    const COLLECTION: Collection = Collection::Meetings;
}

impl Record for Contact {
    const COLLECTION: Collection = Collection::Contacts;
}

impl Record for Company {
    const COLLECTION: Collection = Collection::Companies;
}

impl Record for Deal {
    const COLLECTION: Collection = Collection::Deals;
}

/// Result of a batched, skip-on-failure fetch.
#[derive(Debug)]
pub struct Batched<T> {
    pub records: Vec<T>,
    pub failed_batches: usize,
}

impl<T> Default for Batched<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            failed_batches: 0,
        }
    }
}

/// Typed, batching view over a `RecordStore`.
#[derive(Clone, Copy)]
pub struct Gateway<'a> {
    store: &'a dyn RecordStore,
    batch_size: usize,
}

impl<'a> Gateway<'a> {
    pub fn new(store: &'a dyn RecordStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Filter query. Errors propagate; callers decide whether to retry.
    pub async fn fetch_by_filter<T: Record>(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        let rows = self.store.fetch_by_filter(T::COLLECTION, filter).await?;
        Ok(decode_rows(rows))
    }

    /// Fetch records by ID in batches. Failed batches are logged and skipped.
    pub async fn fetch_by_ids<T: Record>(&self, ids: &[String]) -> Batched<T> {
        let mut out = Batched::default();
        for (index, batch) in ids.chunks(self.batch_size).enumerate() {
            match self.store.fetch_by_ids(T::COLLECTION, batch).await {
                Ok(rows) => out.records.extend(decode_rows(rows)),
                Err(e) => {
                    log::warn!(
                        "Error fetching {} batch {} ({} IDs): {}",
                        T::COLLECTION.table(),
                        index + 1,
                        batch.len(),
                        e
                    );
                    out.failed_batches += 1;
                }
            }
        }
        out
    }

    /// Fetch records whose array field overlaps `ids`, in batches.
    /// Failed batches are logged and skipped.
    pub async fn fetch_by_overlap<T: Record>(&self, array_field: &str, ids: &[String]) -> Batched<T> {
        let mut out = Batched::default();
        for (index, batch) in ids.chunks(self.batch_size).enumerate() {
            match self
                .store
                .fetch_by_overlap(T::COLLECTION, array_field, batch)
                .await
            {
                Ok(rows) => out.records.extend(decode_rows(rows)),
                Err(e) => {
                    log::warn!(
                        "Error fetching {} overlapping {} batch {}: {}",
                        T::COLLECTION.table(),
                        array_field,
                        index + 1,
                        e
                    );
                    out.failed_batches += 1;
                }
            }
        }
        out
    }

    /// Fetch records whose scalar `field` is one of `values`, in batches.
    /// Failed batches are logged and skipped.
    pub async fn fetch_where_in<T: Record>(&self, field: &str, values: &[String]) -> Batched<T> {
        let mut out = Batched::default();
        for (index, batch) in values.chunks(self.batch_size).enumerate() {
            let filter = Filter::is_in(field, batch);
            match self.store.fetch_by_filter(T::COLLECTION, &filter).await {
                Ok(rows) => out.records.extend(decode_rows(rows)),
                Err(e) => {
                    log::warn!(
                        "Error fetching {} by {} batch {}: {}",
                        T::COLLECTION.table(),
                        field,
                        index + 1,
                        e
                    );
                    out.failed_batches += 1;
                }
            }
        }
        out
    }
}

/// Deserialize rows, dropping malformed ones.
fn decode_rows<T: Record>(rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping malformed {} row: {}", T::COLLECTION.table(), e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_from_str() {
        assert_eq!("deals".parse::<Collection>().unwrap(), Collection::Deals);
        assert_eq!("Meetings".parse::<Collection>().unwrap(), Collection::Meetings);
        assert!("widgets".parse::<Collection>().is_err());
        assert_eq!(Collection::Meetings.id_field(), "id");
        assert_eq!(Collection::Companies.id_field(), "whalesync_postgres_id");
    }

    #[test]
    fn test_filter_validation_rejects_injection() {
        assert!(Filter::eq("deal_stage", "Closed Won").validate().is_ok());
        assert!(Filter::eq("deal_stage') OR 1=1 --", "x").validate().is_err());
        let nested = Filter::Or(vec![
            Filter::eq("ok_field", "a"),
            Filter::And(vec![Filter::contains("bad.field", "b")]),
        ]);
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(StoreError::Api { status: 429, message: String::new() }.is_retryable());
        assert!(!StoreError::Api { status: 404, message: String::new() }.is_retryable());
        assert!(!StoreError::InvalidFilter("x".into()).is_retryable());
    }

    #[test]
    fn test_decode_rows_skips_malformed() {
        let rows = vec![
            serde_json::json!({"whalesync_postgres_id": "d1", "deal_name": "Good"}),
            serde_json::json!({"deal_name": "Missing id"}),
        ];
        let deals: Vec<Deal> = decode_rows(rows);
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].id, "d1");
    }

    #[test]
    fn test_format_timestamp_matches_iso_string() {
        let at = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(&at), "2026-01-01T00:00:00.000Z");
    }
}
