//! PostgREST client for the hosted CRM tables.
//!
//! Uses reqwest with `apikey` + Bearer auth. All queries target
//! `{url}/rest/v1/{table}` and page through results with `limit`/`offset`
//! so backend row caps never truncate a result silently.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::{format_timestamp, validate_field, Collection, Filter, RecordStore, StoreError};

/// Rows requested per page.
const DEFAULT_PAGE_SIZE: usize = 1000;

pub struct RestStore {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    page_size: usize,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    fn table_url(&self, collection: Collection) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["rest", "v1", collection.table()]);
        Ok(url)
    }

    /// One page of `params`, ordered by the collection's ID so `offset`
    /// paging is stable across requests.
    fn page_url(
        &self,
        collection: Collection,
        params: &[(String, String)],
        offset: usize,
    ) -> Result<Url, StoreError> {
        let mut url = self.table_url(collection)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("order", &format!("{}.asc", collection.id_field()));
            query.append_pair("limit", &self.page_size.to_string());
            query.append_pair("offset", &offset.to_string());
        }
        Ok(url)
    }

    async fn get_rows(
        &self,
        collection: Collection,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, StoreError> {
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = self.page_url(collection, params, offset)?;

            let resp = self
                .client
                .get(url)
                .header("apikey", &self.api_key)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Accept", "application/json")
                .send()
                .await?;

            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let message = resp.text().await.unwrap_or_default();
                return Err(StoreError::Api { status, message });
            }

            let page: Vec<Value> = resp.json().await?;
            let page_len = page.len();
            rows.extend(page);
            if page_len < self.page_size {
                break;
            }
            offset += page_len;
        }
        log::debug!("{}: fetched {} rows", collection.table(), rows.len());
        Ok(rows)
    }
}

/// Quote a value for use inside `in.(...)`, `ov.{...}` and logical operators.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn quoted_list(values: &[String]) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",")
}

/// Operator expression without the field, e.g. `eq.Closed Won`.
fn operator(filter: &Filter, nested: bool) -> String {
    match filter {
        Filter::Eq { value, .. } if nested => format!("eq.{}", quote(value)),
        Filter::Eq { value, .. } => format!("eq.{value}"),
        Filter::In { values, .. } => format!("in.({})", quoted_list(values)),
        Filter::Since { at, .. } => format!("gte.{}", format_timestamp(at)),
        Filter::Before { at, .. } => format!("lt.{}", format_timestamp(at)),
        Filter::Contains { needle, .. } if nested => format!("ilike.{}", quote(&format!("*{needle}*"))),
        Filter::Contains { needle, .. } => format!("ilike.*{needle}*"),
        Filter::And(_) | Filter::Or(_) => String::new(),
    }
}

/// Expression form used inside `or=(...)` / `and(...)`.
fn nested_expr(filter: &Filter) -> String {
    match filter {
        Filter::And(parts) => format!(
            "and({})",
            parts.iter().map(nested_expr).collect::<Vec<_>>().join(",")
        ),
        Filter::Or(parts) => format!(
            "or({})",
            parts.iter().map(nested_expr).collect::<Vec<_>>().join(",")
        ),
        Filter::Eq { field, .. }
        | Filter::In { field, .. }
        | Filter::Since { field, .. }
        | Filter::Before { field, .. }
        | Filter::Contains { field, .. } => format!("{field}.{}", operator(filter, true)),
    }
}

/// Encode a filter as PostgREST query parameters. Top-level conjunctions
/// become separate parameters.
fn encode(filter: &Filter) -> Vec<(String, String)> {
    match filter {
        Filter::And(parts) => parts.iter().flat_map(encode).collect(),
        Filter::Or(parts) => vec![(
            "or".to_string(),
            format!(
                "({})",
                parts.iter().map(nested_expr).collect::<Vec<_>>().join(",")
            ),
        )],
        Filter::Eq { field, .. }
        | Filter::In { field, .. }
        | Filter::Since { field, .. }
        | Filter::Before { field, .. }
        | Filter::Contains { field, .. } => vec![(field.clone(), operator(filter, false))],
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn fetch_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = encode(&Filter::is_in(collection.id_field(), ids));
        self.get_rows(collection, &params).await
    }

    async fn fetch_by_filter(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        filter.validate()?;
        self.get_rows(collection, &encode(filter)).await
    }

    async fn fetch_by_overlap(
        &self,
        collection: Collection,
        array_field: &str,
        ids: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        validate_field(array_field)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = vec![(array_field.to_string(), format!("ov.{{{}}}", quoted_list(ids)))];
        self.get_rows(collection, &params).await
    }
}
