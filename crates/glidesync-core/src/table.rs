//! Flattened remote table descriptors
//!
//! A `TableDescriptor` is the merged view of a table and all of its
//! ancestors: one entry per column name, each recording the deepest
//! ancestor that defines it.

use crate::{ChoiceMode, DataPolicyMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One column of the merged hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Remote `internal_type` tag, kept verbatim.
    pub internal_type: String,
    pub label: Option<String>,
    pub max_length: Option<i64>,
    pub reference_table: Option<String>,
    pub choice_mode: ChoiceMode,
    /// Choice list as value -> label, empty when the column has none.
    pub choices: BTreeMap<String, String>,
    /// Data policy derived from the acting user's policy rules.
    pub data_policy: Option<DataPolicyMode>,
    pub created_by: Option<String>,
    /// Deepest (most specific) ancestor table defining this column.
    pub table: String,
    /// Set when the column appears in more than one ancestor.
    pub overridden: bool,
    /// sys_id of the dictionary row, absent for synthetic entries.
    pub sys_id: Option<String>,
}

impl ColumnDescriptor {
    /// User-defined columns carry the `u_` prefix; everything else is
    /// out-of-the-box and immutable for this client.
    pub fn is_user_defined(&self) -> bool {
        self.name.starts_with("u_")
    }

    /// Whether the column is defined on `table` itself, not inherited.
    pub fn defined_on(&self, table: &str) -> bool {
        self.table == table
    }
}

/// Merged descriptor for a table and its ancestor chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub label: Option<String>,
    pub sys_id: String,
    pub parent: Option<String>,
    pub extendable: bool,
    pub columns: BTreeMap<String, ColumnDescriptor>,
}

impl TableDescriptor {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.get(name)
    }

    /// Columns defined on this table itself (not inherited).
    pub fn own_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.values().filter(|c| c.defined_on(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, table: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            internal_type: "string".to_string(),
            label: None,
            max_length: None,
            reference_table: None,
            choice_mode: ChoiceMode::Off,
            choices: BTreeMap::new(),
            data_policy: None,
            created_by: None,
            table: table.to_string(),
            overridden: false,
            sys_id: None,
        }
    }

    #[test]
    fn test_ownership_helpers() {
        let own = column("u_name", "u_dm_host");
        let inherited = column("sys_id", "cmdb_ci");

        assert!(own.is_user_defined());
        assert!(own.defined_on("u_dm_host"));
        assert!(!inherited.is_user_defined());
        assert!(!inherited.defined_on("u_dm_host"));
    }

    #[test]
    fn test_own_columns_filters_inherited() {
        let mut columns = BTreeMap::new();
        columns.insert("u_name".to_string(), column("u_name", "u_dm_host"));
        columns.insert("sys_id".to_string(), column("sys_id", "cmdb_ci"));

        let descriptor = TableDescriptor {
            name: "u_dm_host".to_string(),
            label: None,
            sys_id: "a".repeat(32),
            parent: Some("cmdb_ci".to_string()),
            extendable: true,
            columns,
        };

        let own: Vec<_> = descriptor.own_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(own, vec!["u_name"]);
    }
}
