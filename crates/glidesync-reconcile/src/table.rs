//! Table reconciliation
//!
//! `get` flattens a table and its ancestor chain into one descriptor;
//! `sync` diffs a desired spec against it and commits in order: the table
//! action first, then columns in the caller's order. Creating a table
//! re-syncs after a short settle so server-materialized columns are seen.

use crate::column;
use crate::plan::{Plan, PendingAction};
use crate::rows::{flag, int, text};
use glidesync_client::{Client, GetRecordsOpts, Status};
use glidesync_core::{
    ChoiceMode, ColumnDescriptor, DataPolicyMode, GlideError, Record, Result, TableDescriptor,
    TableSpec, WireRow, guid,
};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait after creating a table before re-reading it.
const CREATE_SETTLE: Duration = Duration::from_secs(2);

/// Counts from a committed sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// One ancestry level before merging.
struct Level {
    table: String,
    columns: Vec<ColumnDescriptor>,
}

pub struct TableReconciler {
    client: Client,
}

impl TableReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn resolve_table(&self, name_or_id: &str) -> Result<Option<Record>> {
        let query = if guid::is_sys_id(name_or_id) {
            format!("sys_id={name_or_id}")
        } else {
            format!("name={name_or_id}")
        };
        let rows = self
            .client
            .get_records("sys_db_object", GetRecordsOpts::default().with_query(query))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Fetch one level's column definitions, choice lists, policy rules
    /// and documentation in parallel.
    async fn fetch_level(&self, table: &str, me: &str) -> Result<Level> {
        let (dictionary, choice_rows, rule_rows, doc_rows) = tokio::try_join!(
            self.client.get_records(
                "sys_dictionary",
                GetRecordsOpts::default().with_query(format!("name={table}")),
            ),
            self.client.get_records(
                "sys_choice",
                GetRecordsOpts::default().with_query(format!("name={table}^inactive=false")),
            ),
            self.client.get_records(
                "sys_data_policy_rule",
                GetRecordsOpts::default()
                    .with_query(format!("table={table}^sys_created_by={me}")),
            ),
            self.client.get_records(
                "sys_documentation",
                GetRecordsOpts::default().with_query(format!("name={table}")),
            ),
        )?;

        let mut choices: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for row in &choice_rows {
            choices
                .entry(text(row, "element"))
                .or_default()
                .insert(text(row, "value"), text(row, "label"));
        }

        let mut policies: BTreeMap<String, DataPolicyMode> = BTreeMap::new();
        for row in &rule_rows {
            let mode = if flag(row, "disabled") {
                DataPolicyMode::Readonly
            } else {
                DataPolicyMode::Writable
            };
            policies.insert(text(row, "field"), mode);
        }

        let mut docs: BTreeMap<String, String> = BTreeMap::new();
        for row in &doc_rows {
            let label = text(row, "label");
            if !label.is_empty() {
                docs.insert(text(row, "element"), label);
            }
        }

        let synthetic_null = format!("sys_dictionary_{table}_null");
        let mut columns = Vec::new();
        for row in &dictionary {
            let element = text(row, "element");
            if element.is_empty() || text(row, "sys_update_name") == synthetic_null {
                continue;
            }
            columns.push(ColumnDescriptor {
                name: element.clone(),
                internal_type: text(row, "internal_type"),
                label: docs
                    .get(&element)
                    .cloned()
                    .or_else(|| nonempty(text(row, "column_label"))),
                max_length: int(row, "max_length"),
                reference_table: nonempty(text(row, "reference")),
                choice_mode: ChoiceMode::from_remote(&text(row, "choice")),
                choices: choices.get(&element).cloned().unwrap_or_default(),
                data_policy: policies.get(&element).copied(),
                created_by: nonempty(text(row, "sys_created_by")),
                table: table.to_string(),
                overridden: false,
                sys_id: nonempty(text(row, "sys_id")),
            });
        }

        Ok(Level {
            table: table.to_string(),
            columns,
        })
    }

    /// Flattened descriptor for a table, or nothing when it is absent.
    #[tracing::instrument(skip(self), fields(table = %name_or_id))]
    pub async fn get(&self, name_or_id: &str) -> Result<Option<TableDescriptor>> {
        let Some(record) = self.resolve_table(name_or_id).await? else {
            return Ok(None);
        };
        let me = self.client.user_name().await?;

        // Collect levels leaf-first by following super_class.
        let mut levels = Vec::new();
        let mut parent_of_leaf = None;
        let mut current = record.clone();
        loop {
            let table = text(&current, "name");
            levels.push(self.fetch_level(&table, &me).await?);

            let super_class = text(&current, "super_class");
            if super_class.is_empty() {
                break;
            }
            let parent = self.resolve_table(&super_class).await?.ok_or_else(|| {
                GlideError::Schema(format!("{table}: parent table {super_class} does not exist"))
            })?;
            if parent_of_leaf.is_none() {
                parent_of_leaf = Some(text(&parent, "name"));
            }
            current = parent;
        }

        // Merge root -> leaf: the first occurrence of a column wins
        // structurally; deeper levels overwrite `table` and label.
        let mut columns: BTreeMap<String, ColumnDescriptor> = BTreeMap::new();
        for level in levels.iter().rev() {
            for column in &level.columns {
                match columns.entry(column.name.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(column.clone());
                    }
                    Entry::Occupied(mut slot) => {
                        let merged = slot.get_mut();
                        merged.overridden = true;
                        merged.table = level.table.clone();
                        if column.label.is_some() {
                            merged.label = column.label.clone();
                        }
                    }
                }
            }
        }

        Ok(Some(TableDescriptor {
            name: text(&record, "name"),
            label: nonempty(text(&record, "label")),
            sys_id: text(&record, "sys_id"),
            parent: parent_of_leaf,
            extendable: flag(&record, "is_extendable"),
            columns,
        }))
    }

    async fn plan_normalized(
        &self,
        desired: &TableSpec,
        status: &Arc<dyn Status>,
    ) -> Result<Plan> {
        let me = self.client.user_name().await?;
        let existing = self.get(&desired.name).await?;
        let mut plan = Plan::new(&desired.name);

        match &existing {
            None => {
                plan.creates_table = true;
                plan.push(PendingAction::create(
                    &desired.name,
                    format!("create table {}", desired.name),
                    create_table(self.client.clone(), desired.clone()),
                ));
                column::plan_columns(&self.client, desired, None, &me, status, &mut plan);
            }
            Some(descriptor) => {
                if let Some(parent) = &desired.parent {
                    if descriptor.parent.as_deref() != Some(parent.as_str()) {
                        return Err(GlideError::Plan(format!(
                            "{}: parent is {} but {} was declared",
                            desired.name,
                            descriptor.parent.as_deref().unwrap_or("(none)"),
                            parent,
                        )));
                    }
                }
                column::plan_columns(
                    &self.client,
                    desired,
                    Some(descriptor),
                    &me,
                    status,
                    &mut plan,
                );
            }
        }
        Ok(plan)
    }

    /// Plan without committing.
    pub async fn plan(&self, desired: &TableSpec, status: Arc<dyn Status>) -> Result<Plan> {
        let desired = desired.normalized()?;
        self.plan_normalized(&desired, &status).await
    }

    /// Plan and commit. Errors are reported collectively before any write.
    #[tracing::instrument(skip(self, desired, status), fields(table = %desired.name))]
    pub async fn sync(&self, desired: &TableSpec, status: Arc<dyn Status>) -> Result<SyncCounts> {
        let desired = desired.normalized()?;
        let plan = self.plan_normalized(&desired, &status).await?;
        if plan.has_errors() {
            return Err(GlideError::Plan(plan.error_summary()));
        }

        let counts = if plan.creates_table() {
            let mut actions = plan.into_actions().into_iter();
            let table_action = actions
                .next()
                .unwrap_or_else(|| unreachable!("create-table plan has a first action"));
            table_action.commit().await?;
            drop(actions);

            // The server materializes inherited columns asynchronously;
            // settle, then re-plan the columns against the real table.
            status.log(&format!(
                "{}: table created, re-reading materialized columns",
                desired.name
            ));
            tokio::time::sleep(CREATE_SETTLE).await;
            let follow_up = self.plan_normalized(&desired, &status).await?;
            if follow_up.has_errors() {
                return Err(GlideError::Plan(follow_up.error_summary()));
            }
            let (created, updated, deleted, _) = follow_up.counts();
            follow_up.commit().await?;
            SyncCounts {
                created: created + 1,
                updated,
                deleted,
            }
        } else {
            let (created, updated, deleted, _) = plan.counts();
            plan.commit().await?;
            SyncCounts {
                created,
                updated,
                deleted,
            }
        };

        self.client.invalidate_schema(&desired.name);
        Ok(counts)
    }
}

async fn create_table(client: Client, spec: TableSpec) -> Result<()> {
    let mut row = WireRow::new();
    row.insert("name".into(), spec.name.as_str().into());
    row.insert(
        "label".into(),
        spec.label
            .clone()
            .unwrap_or_else(|| spec.name.clone())
            .into(),
    );
    row.insert(
        "is_extendable".into(),
        if spec.extendable { "true" } else { "false" }.into(),
    );

    if let Some(parent) = &spec.parent {
        let rows = client
            .get_records(
                "sys_db_object",
                GetRecordsOpts::default().with_query(format!("name={parent}")),
            )
            .await?;
        let parent_row = rows.first().ok_or_else(|| {
            GlideError::Plan(format!("parent table {parent} does not exist"))
        })?;
        if !flag(parent_row, "is_extendable") {
            return Err(GlideError::Plan(format!(
                "parent table {parent} is not extendable"
            )));
        }
        row.insert("super_class".into(), text(parent_row, "sys_id").into());
    }

    client.insert("sys_db_object", row).await?;
    Ok(())
}

fn nonempty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
