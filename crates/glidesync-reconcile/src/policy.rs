//! Data-policy reconciliation
//!
//! Each managed table carries at most one user-owned `sys_data_policy2`
//! record whose condition selects rows created by the acting user.
//! Per-column `sys_data_policy_rule` rows hang off it. The policy's
//! `active` flag is toggled off around bulk row writes; the guard makes
//! the re-enable unconditional.

use crate::rows::text;
use glidesync_client::{Client, GetRecordsOpts, Status};
use glidesync_core::{DataPolicyMode, GlideError, Record, Result, WireRow};
use std::collections::BTreeMap;

pub struct PolicyReconciler {
    client: Client,
}

impl PolicyReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn canonical_policy(table: &str, me: &str) -> WireRow {
        let mut row = WireRow::new();
        row.insert("model_table".into(), table.into());
        row.insert("apply_import_set".into(), "true".into());
        row.insert("apply_soap".into(), "false".into());
        row.insert("enforce_ui".into(), "true".into());
        row.insert("inherit".into(), "false".into());
        row.insert(
            "short_description".into(),
            format!("Columns managed by {me}").into(),
        );
        row.insert("conditions".into(), format!("sys_created_by={me}^EQ").into());
        row
    }

    async fn find_policy(&self, table: &str) -> Result<Option<Record>> {
        let me = self.client.user_name().await?;
        let rows = self
            .client
            .get_records(
                "sys_data_policy2",
                GetRecordsOpts::default()
                    .with_query(format!("model_table={table}^sys_created_by={me}")),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Ensure the table's managed policy record exists with its canonical
    /// fields, returning its sys_id.
    #[tracing::instrument(skip(self), fields(table = %table))]
    pub async fn ensure_policy(&self, table: &str) -> Result<String> {
        let me = self.client.user_name().await?;
        let canonical = Self::canonical_policy(table, &me);

        if let Some(existing) = self.find_policy(table).await? {
            let sys_id = text(&existing, "sys_id");
            let drifted: WireRow = canonical
                .iter()
                .filter(|(field, want)| {
                    want.as_str().unwrap_or_default() != text(&existing, field)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !drifted.is_empty() {
                tracing::debug!(table = %table, fields = drifted.len(), "updating policy record");
                self.client
                    .update("sys_data_policy2", &sys_id, drifted)
                    .await?;
            }
            return Ok(sys_id);
        }

        tracing::debug!(table = %table, "creating policy record");
        let created = self.client.insert("sys_data_policy2", canonical).await?;
        if let Some(record) = created {
            let sys_id = text(&record, "sys_id");
            if !sys_id.is_empty() {
                return Ok(sys_id);
            }
        }
        // The create did not echo the record; read it back.
        let policy = self.find_policy(table).await?.ok_or_else(|| {
            GlideError::Operational(format!("policy record for {table} vanished after creation"))
        })?;
        Ok(text(&policy, "sys_id"))
    }

    /// Reconcile per-column rules. Deleting undeclared rules is opt-in.
    #[tracing::instrument(skip(self, desired, status), fields(table = %table))]
    pub async fn sync_rules(
        &self,
        table: &str,
        desired: &BTreeMap<String, DataPolicyMode>,
        delete_missing: bool,
        status: &dyn Status,
    ) -> Result<()> {
        let me = self.client.user_name().await?;
        let policy_id = self.ensure_policy(table).await?;

        let existing = self
            .client
            .get_records(
                "sys_data_policy_rule",
                GetRecordsOpts::default()
                    .with_query(format!("table={table}^sys_created_by={me}")),
            )
            .await?;
        let mut by_field: BTreeMap<String, &Record> = BTreeMap::new();
        for row in &existing {
            by_field.insert(text(row, "field"), row);
        }

        for (field, mode) in desired {
            let mut rule = WireRow::new();
            rule.insert("field".into(), field.as_str().into());
            rule.insert("table".into(), table.into());
            rule.insert("disabled".into(), mode.disabled_flag().into());
            rule.insert("mandatory".into(), "ignore".into());
            rule.insert("sys_data_policy".into(), policy_id.as_str().into());

            match by_field.remove(field) {
                None => {
                    status.log(&format!("{table}.{field}: adding data policy rule"));
                    self.client.insert("sys_data_policy_rule", rule).await?;
                }
                Some(row)
                    if text(row, "disabled") == mode.disabled_flag()
                        && text(row, "mandatory") == "ignore" => {}
                Some(row) => {
                    status.log(&format!("{table}.{field}: updating data policy rule"));
                    self.client
                        .update("sys_data_policy_rule", &text(row, "sys_id"), rule)
                        .await?;
                }
            }
        }

        if delete_missing {
            for (field, row) in by_field {
                status.log(&format!("{table}.{field}: removing data policy rule"));
                self.client
                    .delete_record("sys_data_policy_rule", &text(row, "sys_id"))
                    .await?;
            }
        }

        Ok(())
    }

    /// Reconcile a single column's rule.
    pub async fn sync_rule(
        &self,
        table: &str,
        field: &str,
        mode: DataPolicyMode,
        status: &dyn Status,
    ) -> Result<()> {
        let desired = [(field.to_string(), mode)].into_iter().collect();
        self.sync_rules(table, &desired, false, status).await
    }

    /// Flip the managed policy's `active` flag. A table without a managed
    /// policy is a no-op.
    #[tracing::instrument(skip(self), fields(table = %table, active = active))]
    pub async fn toggle(&self, table: &str, active: bool) -> Result<()> {
        let Some(policy) = self.find_policy(table).await? else {
            tracing::debug!(table = %table, "no managed policy to toggle");
            return Ok(());
        };
        let mut patch = WireRow::new();
        patch.insert(
            "active".into(),
            if active { "true" } else { "false" }.into(),
        );
        self.client
            .update("sys_data_policy2", &text(&policy, "sys_id"), patch)
            .await
    }
}

/// Scope guard bracketing bulk writes with a disabled policy.
///
/// `disable` flips the policy off; `restore` flips it back on and is the
/// normal exit on success and failure alike. If the guard is dropped
/// without an explicit restore (cancellation, panic) the re-enable is
/// spawned onto the runtime so the policy never stays off.
pub struct PolicyToggleGuard {
    client: Client,
    table: String,
    restored: bool,
}

impl PolicyToggleGuard {
    pub async fn disable(client: Client, table: &str) -> Result<Self> {
        PolicyReconciler::new(client.clone())
            .toggle(table, false)
            .await?;
        Ok(Self {
            client,
            table: table.to_string(),
            restored: false,
        })
    }

    /// Re-enable the policy; the happy-path exit.
    pub async fn restore(mut self) -> Result<()> {
        self.restored = true;
        PolicyReconciler::new(self.client.clone())
            .toggle(&self.table, true)
            .await
    }
}

impl Drop for PolicyToggleGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        tracing::warn!(table = %self.table, "policy guard dropped without restore, re-enabling");
        let client = self.client.clone();
        let table = self.table.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = PolicyReconciler::new(client).toggle(&table, true).await {
                    tracing::error!(table = %table, error = %error, "failed to re-enable policy");
                }
            });
        }
    }
}
