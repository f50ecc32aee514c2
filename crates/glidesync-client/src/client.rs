//! The request gateway
//!
//! `Client` is the single surface every reconciler talks through. It owns
//! the transport, the token buckets, the schema cache and the acting-user
//! lookup; sub-components hold cheap clones of the whole aggregate. All
//! validation (path shapes, read-only mode, import prefixes) happens here
//! before a request reaches the transport.

use crate::coerce;
use crate::limits::{Direction, RateLimiter};
use crate::record_cache::{RecordCache, parse_ttl};
use crate::request::{ApiFamily, ApiRequest, Method, ParsedPath, parse_path};
use crate::schema::{SchemaCache, TableSchema};
use crate::scripted::ScriptedBackend;
use crate::status::Status;
use crate::transport::{Backend, HttpBackend, Payload, Transport};
use futures::{StreamExt, TryStreamExt, stream};
use glidesync_core::{GlideError, InstanceConfig, Record, Result, Value, WireRow};
use serde::Deserialize;
use std::sync::Arc;

/// Hard cap on rows a single query may address.
pub const RECORD_LIMIT: u64 = 100_000;

/// Rows fetched per page.
const PAGE_SIZE: u64 = 500;

/// Pages fetched in parallel.
const PAGE_CONCURRENCY: usize = 4;

/// Import rows posted in parallel.
const IMPORT_CONCURRENCY: usize = 40;

/// Decoded, validated response from the gateway.
#[derive(Debug)]
pub enum ApiResponse {
    /// Table-API list read, coerced through the schema.
    Rows(Vec<Record>),
    /// Table-API single-record read or write echo, coerced.
    Row(Record),
    /// Raw `result` payload (stats, import, attachment metadata).
    Value(serde_json::Value),
    /// Schema endpoint XML text.
    Xml(String),
    /// Attachment file contents.
    Bytes(Vec<u8>),
    /// Bodyless success (201/204).
    None,
}

impl ApiResponse {
    pub fn into_rows(self) -> Result<Vec<Record>> {
        match self {
            ApiResponse::Rows(rows) => Ok(rows),
            other => Err(GlideError::Protocol(format!(
                "expected a row list, got {other:?}"
            ))),
        }
    }

    pub fn into_value(self) -> Result<serde_json::Value> {
        match self {
            ApiResponse::Value(value) => Ok(value),
            other => Err(GlideError::Protocol(format!(
                "expected a result value, got {other:?}"
            ))),
        }
    }
}

/// One entry of a column projection: a plain name, or a rename.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ColumnSelect {
    Name(String),
    /// Single-entry `{from: to}` object.
    Rename(std::collections::BTreeMap<String, String>),
}

impl ColumnSelect {
    pub fn name(name: impl Into<String>) -> Self {
        ColumnSelect::Name(name.into())
    }

    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        ColumnSelect::Rename([(from.into(), to.into())].into_iter().collect())
    }

    /// The remote column this entry selects.
    fn source(&self) -> Result<&str> {
        match self {
            ColumnSelect::Name(name) => Ok(name),
            ColumnSelect::Rename(map) => {
                if map.len() != 1 {
                    return Err(GlideError::Validation(format!(
                        "rename entries take exactly one column, got {}",
                        map.len()
                    )));
                }
                Ok(map
                    .keys()
                    .next()
                    .unwrap_or_else(|| unreachable!("len checked above")))
            }
        }
    }

    fn target(&self) -> Option<(&str, &str)> {
        match self {
            ColumnSelect::Name(_) => None,
            ColumnSelect::Rename(map) => map.iter().next().map(|(k, v)| (k.as_str(), v.as_str())),
        }
    }
}

/// Options for `Client::get_records`.
#[derive(Default)]
pub struct GetRecordsOpts {
    /// Encoded query filter (`sysparm_query`).
    pub query: Option<String>,
    /// Column projection, possibly with renames. Empty selects everything.
    pub columns: Vec<ColumnSelect>,
    /// Stop after this many rows.
    pub max_records: Option<u64>,
    /// Opt-in persistent cache for this query.
    pub cache: Option<Arc<dyn RecordCache>>,
    /// Cache TTL as a human duration; defaults to one day.
    pub cache_ttl: Option<String>,
}

impl GetRecordsOpts {
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_columns(mut self, columns: Vec<ColumnSelect>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_max_records(mut self, max: u64) -> Self {
        self.max_records = Some(max);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn RecordCache>, ttl: impl Into<String>) -> Self {
        self.cache = Some(cache);
        self.cache_ttl = Some(ttl.into());
        self
    }
}

/// Outcome of an import-set run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub ignored: u64,
    pub errors: Vec<String>,
}

struct ClientInner {
    config: InstanceConfig,
    transport: Transport,
    limiter: RateLimiter,
    schemas: SchemaCache,
    acting_user: tokio::sync::OnceCell<String>,
}

/// Cheap-clone handle to the client aggregate.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client for the configured instance.
    ///
    /// The dev sentinel instance without credentials gets an empty
    /// scripted backend; use [`Client::scripted`] to keep the script
    /// handle and drive it.
    pub fn new(config: InstanceConfig) -> Result<Self> {
        config.validate()?;
        let backend: Box<dyn Backend> = if config.is_fake() {
            tracing::info!(instance = %config.instance, "fake mode: using scripted transport");
            Box::new(ScriptedBackend::new())
        } else {
            Box::new(HttpBackend::new(&config)?)
        };
        Self::with_backend(config, backend)
    }

    /// Build a client over a scripted backend and return the script handle.
    pub fn scripted(config: InstanceConfig) -> Result<(Self, Arc<ScriptedBackend>)> {
        config.validate()?;
        let script = Arc::new(ScriptedBackend::new());
        let client = Self::with_backend(config, Box::new(script.clone()))?;
        Ok((client, script))
    }

    fn with_backend(config: InstanceConfig, backend: Box<dyn Backend>) -> Result<Self> {
        let transport = Transport::new(&config, backend)?;
        let limiter = RateLimiter::from_config(&config);
        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                limiter,
                schemas: SchemaCache::default(),
                acting_user: tokio::sync::OnceCell::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.inner.schemas
    }

    /// Schema for a table, from cache or the wire.
    pub async fn schema_of(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.inner.schemas.get(table, &self.inner.transport).await
    }

    pub fn invalidate_schema(&self, table: &str) {
        self.inner.schemas.invalidate(table);
    }

    /// Live in-flight request count for a direction.
    pub fn in_flight(&self, direction: Direction) -> usize {
        self.inner.limiter.in_flight(direction)
    }

    /// The single uniform request gateway.
    #[tracing::instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let parsed = parse_path(&request.path)?;
        let direction = Direction::of(&request.method);

        if direction == Direction::Write && self.inner.config.read_only {
            return Err(GlideError::Configuration(format!(
                "read-only mode blocks {} {}",
                request.method, request.path
            )));
        }

        let mut query = request.query.clone();
        let url = match &parsed {
            ParsedPath::Schema { table } => {
                if request.method != Method::GET {
                    return Err(GlideError::Validation(format!(
                        "schema endpoint only supports GET, got {}",
                        request.method
                    )));
                }
                self.inner.transport.schema_url(table)?
            }
            ParsedPath::Rest {
                family,
                table,
                sys_id,
                ..
            } => {
                match family {
                    ApiFamily::Table => {
                        if matches!(request.method, Method::PUT | Method::DELETE)
                            && sys_id.is_none()
                        {
                            return Err(GlideError::Validation(format!(
                                "{} on the table API requires a sys_id",
                                request.method
                            )));
                        }
                        if direction == Direction::Read {
                            query.push((
                                "sysparm_exclude_reference_link".to_string(),
                                "true".to_string(),
                            ));
                        }
                    }
                    ApiFamily::Import => {
                        if !table.starts_with("u_imp_dm_") {
                            return Err(GlideError::Validation(format!(
                                "import tables must start with u_imp_dm_, got {table}"
                            )));
                        }
                    }
                    ApiFamily::Stats | ApiFamily::Attachment => {}
                }
                self.inner.transport.api_url(&request.path, &query)?
            }
        };

        let _permit = self.inner.limiter.acquire(direction).await;
        let payload = self
            .inner
            .transport
            .request(request.method.clone(), url, request.body.clone())
            .await?;

        self.interpret(&request, &parsed, payload).await
    }

    async fn interpret(
        &self,
        request: &ApiRequest,
        parsed: &ParsedPath,
        payload: Payload,
    ) -> Result<ApiResponse> {
        let value = match payload {
            Payload::Empty => return Ok(ApiResponse::None),
            Payload::Bytes(bytes) => return Ok(ApiResponse::Bytes(bytes)),
            Payload::Xml(text) => return Ok(ApiResponse::Xml(text)),
            Payload::Json(value) => value,
        };

        let result = value
            .get("result")
            .cloned()
            .ok_or_else(|| GlideError::Protocol("response has no result field".into()))?;

        let ParsedPath::Rest {
            family: ApiFamily::Table,
            table,
            sys_id,
            ..
        } = parsed
        else {
            return Ok(ApiResponse::Value(result));
        };

        if request.method == Method::GET && sys_id.is_none() {
            let serde_json::Value::Array(items) = result else {
                return Err(GlideError::Protocol(
                    "expected an array of rows, got an object".into(),
                ));
            };
            let wire = wire_rows(items)?;
            let rows = coerce::decode_rows(
                &self.inner.schemas,
                &self.inner.transport,
                table,
                wire,
            )
            .await?;
            return Ok(ApiResponse::Rows(rows));
        }

        match result {
            serde_json::Value::Object(row) => {
                let record = coerce::decode_row(
                    &self.inner.schemas,
                    &self.inner.transport,
                    table,
                    row,
                )
                .await?;
                Ok(ApiResponse::Row(record))
            }
            other => Ok(ApiResponse::Value(other)),
        }
    }

    /// Count rows matching a query via the stats API.
    pub async fn get_record_count(&self, table: &str, query: Option<&str>) -> Result<u64> {
        let mut request = ApiRequest::get(format!("/v1/stats/{table}"))
            .with_query("sysparm_count", "true");
        if let Some(query) = query {
            request = request.with_query("sysparm_query", query);
        }
        let stats = self.execute(request).await?.into_value()?;
        let count = stats
            .get("stats")
            .and_then(|s| s.get("count"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| GlideError::Protocol("stats response has no count".into()))?;
        count
            .parse::<u64>()
            .map_err(|_| GlideError::Protocol(format!("stats count is not a number: {count:?}")))
    }

    /// Fetch rows with projection, pagination and optional caching.
    #[tracing::instrument(skip(self, opts), fields(table = %table))]
    pub async fn get_records(&self, table: &str, opts: GetRecordsOpts) -> Result<Vec<Record>> {
        let query = opts.query.clone().unwrap_or_default();
        let fields: Vec<String> = opts
            .columns
            .iter()
            .map(|c| c.source().map(str::to_string))
            .collect::<Result<_>>()?;

        if let Some(cache) = &opts.cache {
            let key = cache_key(table, &query, &fields);
            let ttl = parse_ttl(opts.cache_ttl.as_deref().unwrap_or("1d"))?;
            if let Some(rows) = self.try_cached(table, &query, cache.as_ref(), &key, ttl).await? {
                return Ok(apply_renames(rows, &opts.columns));
            }
        }

        let total = self.get_record_count(table, opts.query.as_deref()).await?;
        if total > RECORD_LIMIT {
            return Err(GlideError::Quota {
                count: total,
                limit: RECORD_LIMIT,
            });
        }
        let target = opts.max_records.map_or(total, |m| m.min(total));
        tracing::debug!(total, target, "fetching records");

        let offsets: Vec<u64> = (0..target).step_by(PAGE_SIZE as usize).collect();
        let pages: Vec<Vec<WireRow>> = stream::iter(offsets)
            .map(|offset| {
                let limit = PAGE_SIZE.min(target - offset);
                self.fetch_wire_page(table, &query, &fields, offset, limit)
            })
            .buffered(PAGE_CONCURRENCY)
            .try_collect()
            .await?;
        let wire: Vec<WireRow> = pages.into_iter().flatten().collect();

        if let Some(cache) = &opts.cache {
            let key = cache_key(table, &query, &fields);
            cache
                .put(&key, &serde_json::Value::Array(
                    wire.iter().cloned().map(serde_json::Value::Object).collect(),
                ))
                .await?;
        }

        let rows =
            coerce::decode_rows(&self.inner.schemas, &self.inner.transport, table, wire).await?;
        Ok(apply_renames(rows, &opts.columns))
    }

    /// Serve a query from the record cache when the remote agrees it is
    /// still current: no rows updated after the cache mtime, and the
    /// count up to the mtime matches the cached length.
    async fn try_cached(
        &self,
        table: &str,
        query: &str,
        cache: &dyn RecordCache,
        key: &str,
        ttl: std::time::Duration,
    ) -> Result<Option<Vec<Record>>> {
        let Some(cached) = cache.get(key, ttl).await else {
            return Ok(None);
        };
        let Some(mtime) = cache.mtime(key).await else {
            return Ok(None);
        };
        let serde_json::Value::Array(items) = cached else {
            return Ok(None);
        };
        let wire = wire_rows(items)?;
        let stamp = coerce::encode_date(&mtime);

        let newer = self
            .get_record_count(table, Some(&augment(query, &format!("sys_updated_on>={stamp}"))))
            .await?;
        if newer != 0 {
            tracing::debug!(table = %table, newer, "record cache stale: rows updated since mtime");
            return Ok(None);
        }
        let up_to = self
            .get_record_count(table, Some(&augment(query, &format!("sys_updated_on<={stamp}"))))
            .await?;
        if up_to != wire.len() as u64 {
            tracing::debug!(table = %table, up_to, cached = wire.len(), "record cache stale: length drift");
            return Ok(None);
        }

        tracing::debug!(table = %table, rows = wire.len(), "serving records from cache");
        let rows =
            coerce::decode_rows(&self.inner.schemas, &self.inner.transport, table, wire).await?;
        Ok(Some(rows))
    }

    async fn fetch_wire_page(
        &self,
        table: &str,
        query: &str,
        fields: &[String],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<WireRow>> {
        let mut request = ApiRequest::get(format!("/v2/table/{table}"))
            .with_query("sysparm_limit", limit.to_string())
            .with_query("sysparm_offset", offset.to_string())
            .with_query("sysparm_exclude_reference_link", "true");
        if !query.is_empty() {
            request = request.with_query("sysparm_query", query);
        }
        if !fields.is_empty() {
            request = request.with_query("sysparm_fields", fields.join(","));
        }

        let url = self
            .inner
            .transport
            .api_url(&request.path, &request.query)?;
        let _permit = self.inner.limiter.acquire(Direction::Read).await;
        let payload = self
            .inner
            .transport
            .request(Method::GET, url, None)
            .await?;
        let Payload::Json(value) = payload else {
            return Err(GlideError::Protocol("expected a JSON row page".into()));
        };
        let result = value
            .get("result")
            .cloned()
            .ok_or_else(|| GlideError::Protocol("row page has no result field".into()))?;
        let serde_json::Value::Array(items) = result else {
            return Err(GlideError::Protocol(
                "expected an array of rows, got an object".into(),
            ));
        };
        wire_rows(items)
    }

    /// Create a row (table API). Returns the created record when the
    /// remote echoes it back.
    pub async fn insert(&self, table: &str, row: WireRow) -> Result<Option<Record>> {
        let response = self
            .execute(ApiRequest::post(
                format!("/v2/table/{table}"),
                serde_json::Value::Object(row),
            ))
            .await?;
        match response {
            ApiResponse::Row(record) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    /// Update a row by sys_id (table API).
    pub async fn update(&self, table: &str, sys_id: &str, patch: WireRow) -> Result<()> {
        self.execute(ApiRequest::put(
            format!("/v2/table/{table}/{sys_id}"),
            serde_json::Value::Object(patch),
        ))
        .await?;
        Ok(())
    }

    /// Delete a row by sys_id (table API).
    pub async fn delete_record(&self, table: &str, sys_id: &str) -> Result<()> {
        self.execute(ApiRequest::delete(format!("/v2/table/{table}/{sys_id}")))
            .await?;
        Ok(())
    }

    /// Push rows through an import set staging table.
    ///
    /// Transform results whose message starts with "Row transform ignored"
    /// count as ignored rather than failed.
    pub async fn import(
        &self,
        table: &str,
        rows: Vec<WireRow>,
        status: &dyn Status,
    ) -> Result<ImportOutcome> {
        let results: Vec<serde_json::Value> = stream::iter(rows)
            .map(|row| {
                self.execute(ApiRequest::post(
                    format!("/v1/import/{table}"),
                    serde_json::Value::Object(row),
                ))
            })
            .buffer_unordered(IMPORT_CONCURRENCY)
            .map(|response| response.and_then(ApiResponse::into_value))
            .try_collect()
            .await?;

        let mut outcome = ImportOutcome::default();
        for result in results {
            let rows = result.as_array().cloned().unwrap_or_else(|| vec![result]);
            for entry in rows {
                let row_status = entry.get("status").and_then(|s| s.as_str()).unwrap_or("");
                match row_status {
                    "inserted" => outcome.inserted += 1,
                    "updated" => outcome.updated += 1,
                    "ignored" => outcome.ignored += 1,
                    _ => {
                        let message = entry
                            .get("status_message")
                            .or_else(|| entry.get("error_message"))
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown import error");
                        if message.starts_with("Row transform ignored") {
                            outcome.ignored += 1;
                        } else {
                            status.warn(&format!("{table}: import row failed: {message}"));
                            outcome.errors.push(message.to_string());
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Download an attachment's file contents.
    pub async fn download_attachment(&self, sys_id: &str) -> Result<Vec<u8>> {
        let response = self
            .execute(ApiRequest::get(format!("/v1/attachment/{sys_id}/file")))
            .await?;
        match response {
            ApiResponse::Bytes(bytes) => Ok(bytes),
            other => Err(GlideError::Protocol(format!(
                "expected file bytes, got {other:?}"
            ))),
        }
    }

    /// The acting remote user, resolved once and cached.
    pub async fn user_name(&self) -> Result<String> {
        self.inner
            .acting_user
            .get_or_try_init(|| async {
                let username = self
                    .inner
                    .config
                    .username
                    .clone()
                    .unwrap_or_else(|| "admin".to_string());
                let rows = self
                    .execute(
                        ApiRequest::get("/v1/table/sys_user")
                            .with_query("sysparm_query", format!("user_name={username}")),
                    )
                    .await?
                    .into_rows()?;
                let row = rows.into_iter().next().ok_or_else(|| {
                    GlideError::Operational(format!("user {username} not found on the instance"))
                })?;
                match row.get("user_name") {
                    Some(Value::String(name)) if !name.is_empty() => Ok(name.clone()),
                    _ => Ok(username),
                }
            })
            .await
            .cloned()
    }
}

fn wire_rows(items: Vec<serde_json::Value>) -> Result<Vec<WireRow>> {
    items
        .into_iter()
        .map(|item| match item {
            serde_json::Value::Object(row) => Ok(row),
            other => Err(GlideError::Protocol(format!(
                "expected a row object, got {other}"
            ))),
        })
        .collect()
}

fn cache_key(table: &str, query: &str, fields: &[String]) -> String {
    format!("{table}?{query}&fields={}", fields.join(","))
}

fn augment(query: &str, condition: &str) -> String {
    if query.is_empty() {
        condition.to_string()
    } else {
        format!("{query}^{condition}")
    }
}

fn apply_renames(rows: Vec<Record>, columns: &[ColumnSelect]) -> Vec<Record> {
    let renames: Vec<(&str, &str)> = columns.iter().filter_map(ColumnSelect::target).collect();
    if renames.is_empty() {
        return rows;
    }
    rows.into_iter()
        .map(|mut row| {
            for (from, to) in &renames {
                if let Some(value) = row.remove(*from) {
                    row.insert((*to).to_string(), value);
                }
            }
            row
        })
        .collect()
}
