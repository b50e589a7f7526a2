use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::{
    parse_timestamp, value_to_text, DetailRecord, DetailTable, EntityTable, PrimaryEntity, Store,
    StoreError,
};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// PostgREST access (`<SUPABASE_URL>/rest/v1/<table>`) authenticated with the
/// service-role key. No transactions: every call stands alone.
#[derive(Debug, Clone)]
pub struct RestStore {
    base_url: String,
    http: Client,
    api_key: String,
    page_size: usize,
}

/// Error body PostgREST returns alongside non-2xx statuses.
#[derive(Debug, Deserialize)]
struct PgrstError {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("forest-admin/0.1")
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            api_key: api_key.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn endpoint(&self, table: &str) -> String {
        let (_, name) = split_profile(table);
        format!("{}/rest/v1/{}", self.base_url, name)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, self.endpoint(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key);
        if let (Some(schema), _) = split_profile(table) {
            req = req
                .header("Accept-Profile", schema)
                .header("Content-Profile", schema);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_response(status, &body))
    }

    async fn fetch_rows(
        &self,
        table: &str,
        select: &str,
        order: &str,
    ) -> Result<Vec<Map<String, Value>>, StoreError> {
        let out = collect_pages(self.page_size, move |offset, limit| async move {
            let mut req = self.request(reqwest::Method::GET, table).query(&[
                ("select", select.to_string()),
                ("order", format!("{order}.asc")),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ]);
            if offset == 0 {
                req = req.header("Prefer", "count=exact");
            }
            let resp = self.send(req).await?;
            let total = resp
                .headers()
                .get("content-range")
                .and_then(|h| h.to_str().ok())
                .and_then(parse_content_range);
            let rows: Vec<Map<String, Value>> = resp.json().await?;
            Ok::<_, StoreError>(Page { rows, total })
        })
        .await?;
        debug!(table, rows = out.len(), "fetched rows via rest");
        Ok(out)
    }

    /// Mutations ask for the affected rows back (only `column`) and count them.
    async fn mutate_counted(&self, req: RequestBuilder, column: &str) -> Result<u64, StoreError> {
        let req = req
            .query(&[("select", column)])
            .header("Prefer", "return=representation");
        let rows: Vec<Value> = self.send(req).await?.json().await?;
        Ok(rows.len() as u64)
    }
}

struct Page {
    rows: Vec<Map<String, Value>>,
    total: Option<u64>,
}

/// Pages until the server returns nothing or the reported total is reached.
/// The server's max-rows cap may shorten any page below `page_size`, so the
/// next offset follows what actually arrived.
async fn collect_pages<F, Fut>(
    page_size: usize,
    mut fetch: F,
) -> Result<Vec<Map<String, Value>>, StoreError>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Page, StoreError>>,
{
    let mut out = Vec::new();
    let mut total = None;
    loop {
        let page = fetch(out.len(), page_size).await?;
        total = total.or(page.total);
        if page.rows.is_empty() {
            break;
        }
        out.extend(page.rows);
        if total.is_some_and(|t| out.len() as u64 >= t) {
            break;
        }
    }
    Ok(out)
}

/// `schema.table` maps to the `Accept-Profile`/`Content-Profile` headers.
fn split_profile(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn eq_filter(value: &str) -> String {
    format!("eq.{value}")
}

fn in_filter(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// `Content-Range: 0-24/3573` or `*/0`.
fn parse_content_range(raw: &str) -> Option<u64> {
    raw.rsplit_once('/')?.1.trim().parse().ok()
}

fn classify_response(status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<PgrstError> = serde_json::from_str(body).ok();
    let detail = parsed
        .as_ref()
        .map(|e| {
            let mut s = e.message.clone().unwrap_or_default();
            if let Some(d) = e.details.as_deref() {
                s.push_str(" (");
                s.push_str(d);
                s.push(')');
            }
            s
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| truncate_for_log(body.to_string(), 300));
    if let Some(code) = parsed.as_ref().and_then(|e| e.code.as_deref()) {
        let by_code = StoreError::from_sqlstate(code, detail.clone());
        if !matches!(by_code, StoreError::Other(_)) {
            return by_code;
        }
    }
    match status.as_u16() {
        401 | 403 => StoreError::Auth(format!("http {status}: {detail}")),
        404 => StoreError::Config(format!("http {status}: {detail}")),
        409 => StoreError::Constraint(format!("http {status}: {detail}")),
        408 | 429 => StoreError::Transient(format!("http {status}: {detail}")),
        s if s >= 500 => StoreError::Transient(format!("http {status}: {detail}")),
        _ => StoreError::Other(format!("http {status}: {detail}")),
    }
}

#[async_trait]
impl Store for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn check_columns(&self, table: &str, columns: &[&str]) -> Result<(), StoreError> {
        let req = self
            .request(reqwest::Method::GET, table)
            .query(&[("select", columns.join(",")), ("limit", "0".to_string())]);
        self.send(req).await.map(|_| ()).map_err(|e| match e {
            StoreError::Other(msg) => StoreError::Config(format!("{table}: {msg}")),
            other => other,
        })
    }

    async fn fetch_entities(&self, spec: &EntityTable) -> Result<Vec<PrimaryEntity>, StoreError> {
        let mut select = format!("id:{},name:{}", spec.id_column, spec.name_column);
        if let Some(c) = spec.created_column.as_deref() {
            select.push_str(&format!(",created_at:{c}"));
        }
        let rows = self.fetch_rows(&spec.table, &select, &spec.id_column).await?;
        rows.into_iter()
            .map(|row| -> Result<PrimaryEntity, StoreError> {
                let id = row.get("id").and_then(value_to_text).ok_or_else(|| {
                    StoreError::Other(format!("{} row without usable id", spec.table))
                })?;
                Ok(PrimaryEntity {
                    id,
                    name: row
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    created_at: row
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .and_then(parse_timestamp),
                })
            })
            .collect()
    }

    async fn count_refs(&self, table: &str, column: &str, value: &str) -> Result<u64, StoreError> {
        let req = self
            .request(reqwest::Method::HEAD, table)
            .query(&[("select", column.to_string()), (column, eq_filter(value))])
            .header("Prefer", "count=exact");
        let resp = self.send(req).await?;
        resp.headers()
            .get("content-range")
            .and_then(|h| h.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| StoreError::Other(format!("{table}: missing Content-Range count")))
    }

    async fn repoint(
        &self,
        table: &str,
        column: &str,
        from: &str,
        to: &str,
    ) -> Result<u64, StoreError> {
        let mut body = Map::new();
        body.insert(column.to_string(), Value::String(to.to_string()));
        let req = self
            .request(reqwest::Method::PATCH, table)
            .query(&[(column, eq_filter(from))])
            .json(&body);
        self.mutate_counted(req, column).await
    }

    async fn delete_ids(
        &self,
        table: &str,
        id_column: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let req = self
            .request(reqwest::Method::DELETE, table)
            .query(&[(id_column, in_filter(ids))]);
        self.mutate_counted(req, id_column).await
    }

    async fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .fetch_rows(table, &format!("v:{column}"), column)
            .await?;
        let set: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| r.get("v").and_then(value_to_text))
            .collect();
        Ok(set.into_iter().collect())
    }

    async fn fetch_details(&self, spec: &DetailTable) -> Result<Vec<DetailRecord>, StoreError> {
        let select = format!(
            "id:{},owner_id:{},created_at:{}",
            spec.id_column, spec.owner_column, spec.created_column
        );
        let rows = self.fetch_rows(&spec.table, &select, &spec.id_column).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(DetailRecord {
                    id: row.get("id").and_then(value_to_text)?,
                    owner_id: row.get("owner_id").and_then(value_to_text)?,
                    created_at: row
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .and_then(parse_timestamp),
                })
            })
            .collect())
    }

    async fn delete_where(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError> {
        let req = self
            .request(reqwest::Method::DELETE, table)
            .query(&[(column, eq_filter(value))]);
        self.mutate_counted(req, column).await
    }

    async fn update_by_id(
        &self,
        table: &str,
        id_column: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let req = self
            .request(reqwest::Method::PATCH, table)
            .query(&[(id_column, eq_filter(id))])
            .json(patch);
        self.mutate_counted(req, id_column).await
    }

    async fn insert_row(&self, table: &str, row: &Map<String, Value>) -> Result<(), StoreError> {
        let req = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(req).await.map(|_| ())
    }
}
