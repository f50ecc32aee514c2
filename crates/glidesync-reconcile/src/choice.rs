//! Choice-list reconciliation
//!
//! Keeps the `sys_choice` rows for one (table, column) pair in step with a
//! declared value -> label map. Existing rows are indexed by value; a
//! desired row is considered in place when every desired field matches the
//! existing row string-for-string.

use crate::rows::text;
use glidesync_client::{Client, GetRecordsOpts, Status};
use glidesync_core::{Record, Result, WireRow};
use std::collections::BTreeMap;

pub struct ChoiceReconciler {
    client: Client,
}

impl ChoiceReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn desired_row(table: &str, element: &str, value: &str, label: &str) -> WireRow {
        let mut row = WireRow::new();
        row.insert("name".into(), table.into());
        row.insert("element".into(), element.into());
        row.insert("value".into(), value.into());
        row.insert("label".into(), label.into());
        row.insert("inactive".into(), "false".into());
        row
    }

    fn matches(desired: &WireRow, existing: &Record) -> bool {
        desired.iter().all(|(field, want)| {
            want.as_str().unwrap_or_default() == text(existing, field)
        })
    }

    /// Reconcile the choice rows for `table.element` against `choices`.
    #[tracing::instrument(skip(self, choices, status), fields(table = %table, element = %element))]
    pub async fn sync(
        &self,
        table: &str,
        element: &str,
        choices: &BTreeMap<String, String>,
        status: &dyn Status,
    ) -> Result<()> {
        let existing = self
            .client
            .get_records(
                "sys_choice",
                GetRecordsOpts::default().with_query(format!("name={table}^element={element}")),
            )
            .await?;

        let mut by_value: BTreeMap<String, &Record> = BTreeMap::new();
        for row in &existing {
            by_value.insert(text(row, "value"), row);
        }

        for (value, label) in choices {
            let desired = Self::desired_row(table, element, value, label);
            match by_value.remove(value) {
                None => {
                    status.log(&format!("{table}.{element}: adding choice {value}={label}"));
                    self.client.insert("sys_choice", desired).await?;
                }
                Some(row) if Self::matches(&desired, row) => {}
                Some(row) => {
                    let sys_id = text(row, "sys_id");
                    status.log(&format!("{table}.{element}: updating choice {value}={label}"));
                    self.client.update("sys_choice", &sys_id, desired).await?;
                }
            }
        }

        // Anything still indexed is no longer declared.
        for (value, row) in by_value {
            let sys_id = text(row, "sys_id");
            status.log(&format!("{table}.{element}: removing choice {value}"));
            self.client.delete_record("sys_choice", &sys_id).await?;
        }

        Ok(())
    }
}
