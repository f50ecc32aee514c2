//! Column diffing and commits
//!
//! Plans one action per desired column against the flattened descriptor.
//! Type and reference table are immutable once created; inherited and
//! out-of-the-box columns are never touched. Deletes only reach columns
//! this client's user created on the table itself.

use crate::choice::ChoiceReconciler;
use crate::plan::{Plan, PendingAction};
use crate::policy::PolicyReconciler;
use glidesync_client::{Client, GetRecordsOpts, Status};
use glidesync_core::{ColumnSpec, ChoiceMode, Result, TableDescriptor, TableSpec, WireRow};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Plan create/update/delete/error actions for every column of `desired`.
pub(crate) fn plan_columns(
    client: &Client,
    desired: &TableSpec,
    existing: Option<&TableDescriptor>,
    me: &str,
    status: &Arc<dyn Status>,
    plan: &mut Plan,
) {
    let table = desired.name.clone();
    let mut desired_names = BTreeSet::new();

    for (id, spec) in &desired.columns {
        let name = spec.effective_name(id).to_string();
        desired_names.insert(name.clone());

        if name != *id && existing.and_then(|d| d.column(id)).is_some() {
            plan.push(PendingAction::error(
                id.clone(),
                format!("cannot rename {id} to {name}: renames are not supported"),
            ));
            continue;
        }

        let Some(current) = existing.and_then(|d| d.column(&name)) else {
            if !name.starts_with("u_") {
                plan.push(PendingAction::error(
                    name.clone(),
                    format!("new column {name} must carry the u_ prefix"),
                ));
                continue;
            }
            plan.push(PendingAction::create(
                name.clone(),
                format!("create {} column {name}", spec.column_type),
                create_column(client.clone(), table.clone(), name, spec.clone(), status.clone()),
            ));
            continue;
        };

        // Immutable once created.
        if current.internal_type != spec.column_type.as_str() {
            plan.push(PendingAction::error(
                name.clone(),
                format!(
                    "type of {name} cannot change from {} to {}",
                    current.internal_type, spec.column_type
                ),
            ));
            continue;
        }
        if current.reference_table != spec.reference_table {
            plan.push(PendingAction::error(
                name.clone(),
                format!(
                    "reference table of {name} cannot change from {} to {}",
                    current.reference_table.as_deref().unwrap_or("(none)"),
                    spec.reference_table.as_deref().unwrap_or("(none)"),
                ),
            ));
            continue;
        }

        let mut changes = Vec::new();
        if let Some(label) = &spec.label {
            if current.label.as_deref() != Some(label.as_str()) {
                changes.push(format!("label -> {label}"));
            }
        }
        if let Some(max_length) = spec.max_length {
            if current.max_length != Some(max_length) {
                changes.push(format!("max_length -> {max_length}"));
            }
        }
        let desired_mode = spec.effective_choice_mode();
        if desired_mode != current.choice_mode {
            changes.push(format!("choice mode -> {}", desired_mode.as_remote()));
        }
        if let Some(choices) = &spec.choices {
            if *choices != current.choices {
                changes.push("choice list".to_string());
            }
        }
        if let Some(policy) = spec.data_policy {
            if current.data_policy != Some(policy) {
                changes.push("data policy".to_string());
            }
        }
        if changes.is_empty() {
            continue;
        }

        // Ownership gates on updates.
        if !current.defined_on(&table) {
            plan.push(PendingAction::error(
                name.clone(),
                format!("cannot update {name}: inherited from {}", current.table),
            ));
            continue;
        }
        if !current.is_user_defined() {
            plan.push(PendingAction::error(
                name.clone(),
                format!("cannot update {name}: out-of-the-box columns are immutable"),
            ));
            continue;
        }
        let Some(dictionary_id) = current.sys_id.clone() else {
            plan.push(PendingAction::error(
                name.clone(),
                format!("cannot update {name}: dictionary row has no sys_id"),
            ));
            continue;
        };

        plan.push(PendingAction::update(
            name.clone(),
            format!("update {name} ({})", changes.join(", ")),
            update_column(
                client.clone(),
                table.clone(),
                dictionary_id,
                name,
                spec.clone(),
                status.clone(),
            ),
        ));
    }

    let Some(descriptor) = existing else {
        return;
    };
    for column in descriptor.columns.values() {
        let deletable = column.is_user_defined()
            && column.defined_on(&table)
            && !desired_names.contains(&column.name)
            && column.created_by.as_deref() == Some(me);
        if !deletable {
            continue;
        }
        let Some(dictionary_id) = column.sys_id.clone() else {
            continue;
        };
        plan.push(PendingAction::delete(
            column.name.clone(),
            format!("delete column {}", column.name),
            delete_column(client.clone(), table.clone(), dictionary_id),
        ));
    }
}

async fn create_column(
    client: Client,
    table: String,
    name: String,
    spec: ColumnSpec,
    status: Arc<dyn Status>,
) -> Result<()> {
    let mut row = WireRow::new();
    row.insert("name".into(), table.as_str().into());
    row.insert("element".into(), name.as_str().into());
    row.insert("internal_type".into(), spec.column_type.as_str().into());
    if let Some(max_length) = spec.max_length {
        row.insert("max_length".into(), max_length.to_string().into());
    }
    if let Some(reference) = &spec.reference_table {
        row.insert("reference".into(), reference.as_str().into());
    }
    let mode = spec.effective_choice_mode();
    if mode != ChoiceMode::Off {
        row.insert("choice".into(), mode.as_remote().into());
    }
    if let Some(label) = &spec.label {
        row.insert("column_label".into(), label.as_str().into());
    }

    client.insert("sys_dictionary", row).await?;
    finish_column_sync(&client, &table, &name, &spec, &status).await?;
    client.invalidate_schema(&table);
    Ok(())
}

async fn update_column(
    client: Client,
    table: String,
    dictionary_id: String,
    name: String,
    spec: ColumnSpec,
    status: Arc<dyn Status>,
) -> Result<()> {
    let mut patch = WireRow::new();
    if let Some(max_length) = spec.max_length {
        patch.insert("max_length".into(), max_length.to_string().into());
    }
    patch.insert(
        "choice".into(),
        spec.effective_choice_mode().as_remote().into(),
    );
    if let Some(label) = &spec.label {
        patch.insert("column_label".into(), label.as_str().into());
    }
    client.update("sys_dictionary", &dictionary_id, patch).await?;

    finish_column_sync(&client, &table, &name, &spec, &status).await?;
    client.invalidate_schema(&table);
    Ok(())
}

/// Shared tail of create and update: label docs, choices, policy rules.
async fn finish_column_sync(
    client: &Client,
    table: &str,
    name: &str,
    spec: &ColumnSpec,
    status: &Arc<dyn Status>,
) -> Result<()> {
    if let Some(label) = &spec.label {
        sync_label(client, table, name, label).await?;
    }
    if let Some(choices) = &spec.choices {
        ChoiceReconciler::new(client.clone())
            .sync(table, name, choices, &**status)
            .await?;
    }
    if let Some(policy) = spec.data_policy {
        PolicyReconciler::new(client.clone())
            .sync_rule(table, name, policy, &**status)
            .await?;
    }
    Ok(())
}

/// Keep the documentation row (the label's source of truth) in step.
async fn sync_label(client: &Client, table: &str, name: &str, label: &str) -> Result<()> {
    let existing = client
        .get_records(
            "sys_documentation",
            GetRecordsOpts::default().with_query(format!("name={table}^element={name}")),
        )
        .await?;

    let mut row = WireRow::new();
    row.insert("label".into(), label.into());
    match existing.first() {
        Some(doc) => {
            let sys_id = crate::rows::text(doc, "sys_id");
            if crate::rows::text(doc, "label") != label {
                client.update("sys_documentation", &sys_id, row).await?;
            }
        }
        None => {
            row.insert("name".into(), table.into());
            row.insert("element".into(), name.into());
            row.insert("language".into(), "en".into());
            client.insert("sys_documentation", row).await?;
        }
    }
    Ok(())
}

async fn delete_column(client: Client, table: String, dictionary_id: String) -> Result<()> {
    client.delete_record("sys_dictionary", &dictionary_id).await?;
    client.invalidate_schema(&table);
    Ok(())
}
