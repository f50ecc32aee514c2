//! Row delta-merge
//!
//! Reconciles a desired row set against the rows already on a table under
//! a caller-chosen primary-key function. Planning classifies every row
//! exactly once (matched, create, update, delete, duplicate-discard);
//! execution runs create, then update, then delete with bounded fan-out,
//! bracketed by the table's data policy being toggled off and back on.

use crate::policy::PolicyToggleGuard;
use chrono::Utc;
use futures::{StreamExt, stream};
use glidesync_client::{Client, ColumnSelect, GetRecordsOpts, RecordCache, Status, coerce};
use glidesync_core::{GlideError, Record, Result, Value, WireRow, guid};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Writes in flight per phase.
const WRITE_CONCURRENCY: usize = 40;

/// Default soft-delete flag column.
pub const DELETED_FLAG: &str = "u_in_datamart";

/// How incoming and existing rows are keyed.
#[derive(Debug, Clone, Default)]
pub enum PrimaryKey {
    /// md5 over every `u_`-prefixed field of the incoming rows.
    #[default]
    Default,
    /// A single field's value.
    Field(String),
    /// md5 over the named fields.
    Fields(Vec<String>),
}

impl PrimaryKey {
    /// Resolve `Default` into a concrete field list using the first
    /// incoming row; the soft-delete flag never participates.
    fn resolve(&self, rows: &[WireRow], deleted_flag: Option<&str>) -> PrimaryKey {
        match self {
            PrimaryKey::Default => {
                let fields: Vec<String> = rows
                    .first()
                    .map(|row| {
                        row.keys()
                            .filter(|k| k.starts_with("u_") && Some(k.as_str()) != deleted_flag)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                PrimaryKey::Fields(fields)
            }
            other => other.clone(),
        }
    }

    fn key_of(&self, row: &WireRow) -> Option<String> {
        match self {
            PrimaryKey::Default => unreachable!("resolved before keying"),
            PrimaryKey::Field(field) => row
                .get(field)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            PrimaryKey::Fields(fields) => {
                if fields.is_empty() {
                    return None;
                }
                let mut parts: Vec<String> = fields
                    .iter()
                    .map(|field| {
                        format!(
                            "{field}={}",
                            row.get(field).and_then(|v| v.as_str()).unwrap_or("")
                        )
                    })
                    .collect();
                parts.sort();
                Some(format!("{:x}", md5::compute(parts.join(","))))
            }
        }
    }
}

/// Options for one delta-merge run.
pub struct DeltaMergeOpts {
    pub primary_key: PrimaryKey,
    /// Soft-delete flag column; soft deletes only happen when the table's
    /// schema actually carries it.
    pub deleted_flag: Option<String>,
    /// Hard-delete rows missing from the incoming set.
    pub allow_deletes: bool,
    /// column -> business-key field on the referenced table; incoming
    /// values are rewritten to sys_ids before planning.
    pub reference_lookup: BTreeMap<String, String>,
    /// Opt-in record cache for the existing-row read.
    pub cache: Option<Arc<dyn RecordCache>>,
    pub cache_ttl: Option<String>,
}

impl Default for DeltaMergeOpts {
    fn default() -> Self {
        Self {
            primary_key: PrimaryKey::Default,
            deleted_flag: Some(DELETED_FLAG.to_string()),
            allow_deletes: false,
            reference_lookup: BTreeMap::new(),
            cache: None,
            cache_ttl: None,
        }
    }
}

/// Counters returned by a delta-merge run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub rows_matched: u64,
    pub rows_created: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
}

struct DeltaPlan {
    creates: Vec<WireRow>,
    updates: Vec<WireRow>,
    hard_deletes: Vec<String>,
    soft_deletes: Vec<WireRow>,
    matched: u64,
}

impl DeltaPlan {
    fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.hard_deletes.is_empty()
            && self.soft_deletes.is_empty()
    }
}

pub struct DeltaMerge {
    client: Client,
}

impl DeltaMerge {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Rewrite business keys in mapped reference columns to sys_ids.
    async fn apply_reference_lookup(
        &self,
        table: &str,
        incoming: &mut [Record],
        lookup: &BTreeMap<String, String>,
        status: &dyn Status,
    ) -> Result<()> {
        let schema = self.client.schema_of(table).await?;
        for (column, business_field) in lookup {
            let schema_column = schema.get(column).ok_or_else(|| {
                GlideError::Plan(format!("{table}.{column}: unknown reference column"))
            })?;
            let reference_table = schema_column.reference_table.clone().ok_or_else(|| {
                GlideError::Plan(format!("{table}.{column}: not a reference column"))
            })?;

            let rows = self
                .client
                .get_records(
                    &reference_table,
                    GetRecordsOpts::default().with_columns(vec![
                        ColumnSelect::name("sys_id"),
                        ColumnSelect::name(business_field),
                    ]),
                )
                .await?;
            let mut index: BTreeMap<String, String> = BTreeMap::new();
            for row in &rows {
                let business = crate::rows::text(row, business_field);
                let sys_id = crate::rows::text(row, "sys_id");
                if !business.is_empty() && !sys_id.is_empty() {
                    index.insert(business, sys_id);
                }
            }
            tracing::debug!(
                table = %table,
                column = %column,
                reference_table = %reference_table,
                entries = index.len(),
                "reference lookup index built"
            );

            for row in incoming.iter_mut() {
                let Some(value) = row.get(column) else { continue };
                let business = match value {
                    Value::Null => continue,
                    other => other.to_string(),
                };
                if business.is_empty() {
                    continue;
                }
                match index.get(&business) {
                    Some(sys_id) => {
                        row.insert(column.clone(), Value::String(sys_id.clone()));
                    }
                    None => {
                        status.warn(&format!(
                            "{table}.{column}: no {reference_table} row with {business_field}={business}"
                        ));
                        row.insert(column.clone(), Value::String(String::new()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn plan(
        &self,
        table: &str,
        mut incoming: Vec<Record>,
        opts: &DeltaMergeOpts,
        status: &dyn Status,
    ) -> Result<DeltaPlan> {
        if !opts.reference_lookup.is_empty() {
            self.apply_reference_lookup(table, &mut incoming, &opts.reference_lookup, status)
                .await?;
        }

        let schema = self.client.schema_of(table).await?;
        let soft_flag = opts
            .deleted_flag
            .as_deref()
            .filter(|flag| schema.contains_key(*flag))
            .map(str::to_string);

        let mut existing_opts = GetRecordsOpts::default();
        if let Some(cache) = &opts.cache {
            existing_opts = existing_opts.with_cache(
                cache.clone(),
                opts.cache_ttl.clone().unwrap_or_else(|| "1d".to_string()),
            );
        }
        let existing = self.client.get_records(table, existing_opts).await?;

        // Both sides go through the coercer so comparisons see normalized
        // wire strings.
        let incoming_wire = coerce::encode_rows(&schema, &incoming, status)?;
        let existing_wire = coerce::encode_rows(&schema, &existing, status)?;

        let key_fn = opts.primary_key.resolve(&incoming_wire, soft_flag.as_deref());

        let mut incoming_by_key: BTreeMap<String, WireRow> = BTreeMap::new();
        let mut unkeyed: Vec<WireRow> = Vec::new();
        let mut duplicates = 0u64;
        for mut row in incoming_wire {
            if let Some(flag) = &soft_flag {
                row.insert(flag.clone(), "1".into());
            }
            match key_fn.key_of(&row) {
                None => {
                    // Nothing to compare against, but the row is still
                    // new data: it survives as a create.
                    status.warn(&format!(
                        "{table}: incoming row has no primary key, creating it uncompared"
                    ));
                    unkeyed.push(row);
                }
                Some(key) => {
                    if incoming_by_key.contains_key(&key) {
                        duplicates += 1;
                        status.warn(&format!("{table}: duplicate incoming row for key {key}"));
                    } else {
                        incoming_by_key.insert(key, row);
                    }
                }
            }
        }
        if duplicates > 0 {
            status.log(&format!("{table}: discarded {duplicates} duplicate incoming rows"));
        }

        let mut existing_by_key: BTreeMap<String, WireRow> = BTreeMap::new();
        let mut existing_extra: Vec<WireRow> = Vec::new();
        for row in existing_wire {
            match key_fn.key_of(&row) {
                None => {
                    status.warn(&format!("{table}: existing row has no primary key, skipped"));
                }
                Some(key) => {
                    if existing_by_key.contains_key(&key) {
                        // Remote duplicates always leave.
                        existing_extra.push(row);
                    } else {
                        existing_by_key.insert(key, row);
                    }
                }
            }
        }

        let mut plan = DeltaPlan {
            creates: Vec::new(),
            updates: Vec::new(),
            hard_deletes: Vec::new(),
            soft_deletes: Vec::new(),
            matched: 0,
        };
        let now = coerce::encode_date(&Utc::now());

        for mut row in unkeyed {
            if schema.contains_key("first_discovered") && !row.contains_key("first_discovered") {
                row.insert("first_discovered".into(), now.as_str().into());
            }
            plan.creates.push(row);
        }

        for (key, mut row) in incoming_by_key {
            match existing_by_key.remove(&key) {
                None => {
                    if schema.contains_key("first_discovered")
                        && !row.contains_key("first_discovered")
                    {
                        row.insert("first_discovered".into(), now.as_str().into());
                    }
                    plan.creates.push(row);
                }
                Some(current) => {
                    let mut payload = WireRow::new();
                    for (field, value) in &row {
                        if current.get(field) != Some(value) {
                            payload.insert(field.clone(), value.clone());
                        }
                    }
                    if payload.is_empty() {
                        plan.matched += 1;
                    } else {
                        payload.insert(
                            "sys_id".into(),
                            current.get("sys_id").cloned().unwrap_or_default(),
                        );
                        payload.insert(
                            "sys_class_name".into(),
                            current
                                .get("sys_class_name")
                                .cloned()
                                .unwrap_or_else(|| table.into()),
                        );
                        plan.updates.push(payload);
                    }
                }
            }
        }

        let leftovers = existing_by_key
            .into_values()
            .chain(existing_extra);
        for row in leftovers {
            let sys_id = row
                .get("sys_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if sys_id.is_empty() || !guid::is_sys_id(&sys_id) {
                status.warn(&format!("{table}: existing row without a sys_id, skipped"));
                continue;
            }
            if opts.allow_deletes {
                plan.hard_deletes.push(sys_id);
            } else if let Some(flag) = &soft_flag {
                let already_off = row.get(flag).and_then(|v| v.as_str()) == Some("0");
                if !already_off {
                    let mut payload = WireRow::new();
                    payload.insert(flag.clone(), "0".into());
                    payload.insert("sys_id".into(), sys_id.into());
                    payload.insert(
                        "sys_class_name".into(),
                        row.get("sys_class_name")
                            .cloned()
                            .unwrap_or_else(|| table.into()),
                    );
                    plan.soft_deletes.push(payload);
                }
            }
        }

        Ok(plan)
    }

    /// Reconcile `incoming` against the table's rows.
    #[tracing::instrument(skip(self, incoming, opts, status), fields(table = %table, rows = incoming.len()))]
    pub async fn run(
        &self,
        table: &str,
        incoming: Vec<Record>,
        opts: DeltaMergeOpts,
        status: Arc<dyn Status>,
    ) -> Result<DeltaOutcome> {
        let plan = self.plan(table, incoming, &opts, &*status).await?;
        let matched = plan.matched;

        if plan.is_empty() {
            tracing::debug!(table = %table, matched, "nothing to write, policy untouched");
            return Ok(DeltaOutcome {
                rows_matched: matched,
                ..DeltaOutcome::default()
            });
        }

        status.log(&format!(
            "{table}: {} creates, {} updates, {} deletes",
            plan.creates.len(),
            plan.updates.len(),
            plan.hard_deletes.len() + plan.soft_deletes.len(),
        ));

        let guard = PolicyToggleGuard::disable(self.client.clone(), table).await?;
        let result = self.execute(table, plan, &*status).await;
        match result {
            Ok(outcome) => {
                guard.restore().await?;
                Ok(DeltaOutcome {
                    rows_matched: matched,
                    ..outcome
                })
            }
            Err(error) => {
                if let Err(restore_error) = guard.restore().await {
                    tracing::error!(
                        table = %table,
                        error = %restore_error,
                        "failed to re-enable policy after aborted merge"
                    );
                }
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        table: &str,
        plan: DeltaPlan,
        status: &dyn Status,
    ) -> Result<DeltaOutcome> {
        let created = run_phase(table, "create", plan.creates, status, |row| async move {
            self.client.insert(table, row).await.map(|_| ())
        })
        .await?;

        let updated = run_phase(table, "update", plan.updates, status, |row| async move {
            let sys_id = row
                .get("sys_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.client.update(table, &sys_id, row).await
        })
        .await?;

        let soft_deleted =
            run_phase(table, "soft-delete", plan.soft_deletes, status, |row| async move {
                let sys_id = row
                    .get("sys_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.client.update(table, &sys_id, row).await
            })
            .await?;

        let hard_deleted = run_phase(table, "delete", plan.hard_deletes, status, |sys_id| async move {
            self.client.delete_record(table, &sys_id).await
        })
        .await?;

        Ok(DeltaOutcome {
            rows_matched: 0,
            rows_created: created,
            rows_updated: updated,
            rows_deleted: soft_deleted + hard_deleted,
        })
    }
}

/// Run one write phase with bounded fan-out. Failures abort the merge but
/// are aggregated per message first.
async fn run_phase<T, F, Fut>(
    table: &str,
    label: &str,
    items: Vec<T>,
    status: &dyn Status,
    f: F,
) -> Result<u64>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if items.is_empty() {
        return Ok(0);
    }
    let total = items.len() as u64;
    status.add(total);
    let results: Vec<Result<()>> = stream::iter(items)
        .map(|item| f(item))
        .buffer_unordered(WRITE_CONCURRENCY)
        .collect()
        .await;
    status.done(total);

    let mut failures: BTreeMap<String, u64> = BTreeMap::new();
    let mut succeeded = 0u64;
    for result in results {
        match result {
            Ok(()) => succeeded += 1,
            Err(error) => *failures.entry(error.to_string()).or_default() += 1,
        }
    }
    if !failures.is_empty() {
        let summary: Vec<String> = failures
            .iter()
            .map(|(message, count)| format!("{count}x {message}"))
            .collect();
        return Err(GlideError::Operational(format!(
            "{table}: {label} phase failed: {}",
            summary.join("; ")
        )));
    }
    tracing::debug!(table = %table, phase = %label, rows = succeeded, "phase complete");
    Ok(succeeded)
}
