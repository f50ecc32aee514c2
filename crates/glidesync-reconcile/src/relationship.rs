//! CI relationship reconciliation
//!
//! Maps reference columns on a row set onto `cmdb_rel_ci` rows of a named
//! relationship type. An empty column value means "disconnected" and is a
//! valid delete, never a create. Relationship types themselves are looked
//! up, not created; creating them through the API is unreliable.

use crate::rows::text;
use glidesync_client::{Client, GetRecordsOpts, Status};
use glidesync_core::{GlideError, Record, Result, WireRow};
use std::collections::{BTreeMap, BTreeSet};

/// Counts from one relationship sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipOutcome {
    pub created: u64,
    pub deleted: u64,
}

pub struct RelationshipReconciler {
    client: Client,
}

impl RelationshipReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn type_id(&self, parent: &str, child: &str) -> Result<String> {
        let rows = self
            .client
            .get_records(
                "cmdb_rel_type",
                GetRecordsOpts::default()
                    .with_query(format!("parent_descriptor={parent}^child_descriptor={child}")),
            )
            .await?;
        let row = rows.into_iter().next().ok_or_else(|| {
            GlideError::Operational(format!(
                "relationship type {parent}::{child} does not exist, please create it manually"
            ))
        })?;
        Ok(text(&row, "sys_id"))
    }

    /// Reconcile the relationships declared by `mapping` for `rows`.
    ///
    /// `mapping` is column name -> "parent-descriptor::child-descriptor";
    /// each row must carry a `sys_id` and one reference value per mapped
    /// column.
    #[tracing::instrument(skip(self, mapping, rows, status), fields(table = %table))]
    pub async fn sync(
        &self,
        table: &str,
        mapping: &BTreeMap<String, String>,
        rows: &[Record],
        status: &dyn Status,
    ) -> Result<RelationshipOutcome> {
        let mut seen_types = BTreeSet::new();
        let mut outcome = RelationshipOutcome::default();

        let row_ids: BTreeSet<String> = rows
            .iter()
            .map(|row| text(row, "sys_id"))
            .filter(|id| !id.is_empty())
            .collect();

        for (column, descriptor) in mapping {
            let (parent_desc, child_desc) = descriptor.split_once("::").ok_or_else(|| {
                GlideError::Plan(format!(
                    "{table}.{column}: relationship descriptor must be parent::child, got {descriptor}"
                ))
            })?;
            if !seen_types.insert(descriptor.clone()) {
                return Err(GlideError::Plan(format!(
                    "{table}: relationship type {descriptor} is mapped by more than one column"
                )));
            }
            let type_id = self.type_id(parent_desc, child_desc).await?;

            // Desired edges: parent is the row itself, child is the
            // reference value. Empty values mean disconnected.
            let mut desired: BTreeMap<String, (String, String)> = BTreeMap::new();
            for row in rows {
                let parent = text(row, "sys_id");
                let child = text(row, column);
                if parent.is_empty() || child.is_empty() {
                    continue;
                }
                desired.insert(format!("{parent}|{child}"), (parent, child));
            }

            let existing = self
                .client
                .get_records(
                    "cmdb_rel_ci",
                    GetRecordsOpts::default().with_query(format!("type={type_id}")),
                )
                .await?;
            let mut existing_by_key: BTreeMap<String, String> = BTreeMap::new();
            for row in &existing {
                let parent = text(row, "parent");
                if !row_ids.contains(&parent) {
                    continue;
                }
                let key = format!("{parent}|{}", text(row, "child"));
                existing_by_key.insert(key, text(row, "sys_id"));
            }

            for (key, (parent, child)) in &desired {
                if existing_by_key.remove(key).is_none() {
                    status.log(&format!("{table}.{column}: connecting {parent} -> {child}"));
                    let mut edge = WireRow::new();
                    edge.insert("type".into(), type_id.as_str().into());
                    edge.insert("parent".into(), parent.as_str().into());
                    edge.insert("child".into(), child.as_str().into());
                    self.client.insert("cmdb_rel_ci", edge).await?;
                    outcome.created += 1;
                }
            }

            for (key, sys_id) in existing_by_key {
                status.log(&format!("{table}.{column}: disconnecting {key}"));
                self.client.delete_record("cmdb_rel_ci", &sys_id).await?;
                outcome.deleted += 1;
            }
        }

        Ok(outcome)
    }
}
