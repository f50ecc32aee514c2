//! Caller-declared desired state
//!
//! A `TableSpec` describes the shape a remote table should have. The
//! reconcilers diff it against the flattened remote descriptor and emit a
//! plan; nothing here performs I/O.

use crate::{GlideError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of column types the client understands.
///
/// `as_str` yields the remote's `internal_type` tag. `Text`, `Html` and
/// `Url` coerce like `String`; `List` coerces like `Reference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    Long,
    Float,
    Decimal,
    DateTime,
    String,
    Text,
    Html,
    Url,
    Reference,
    List,
}

impl ColumnType {
    /// Remote `internal_type` tag for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Long => "long",
            ColumnType::Float => "float",
            ColumnType::Decimal => "decimal",
            ColumnType::DateTime => "glide_date_time",
            ColumnType::String => "string",
            ColumnType::Text => "text",
            ColumnType::Html => "html",
            ColumnType::Url => "url",
            ColumnType::Reference => "reference",
            ColumnType::List => "glide_list",
        }
    }

    /// Parse a remote `internal_type` tag.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "boolean" => Ok(ColumnType::Boolean),
            "integer" => Ok(ColumnType::Integer),
            "long" => Ok(ColumnType::Long),
            "float" => Ok(ColumnType::Float),
            "decimal" => Ok(ColumnType::Decimal),
            "glide_date_time" => Ok(ColumnType::DateTime),
            "string" => Ok(ColumnType::String),
            "text" => Ok(ColumnType::Text),
            "html" => Ok(ColumnType::Html),
            "url" => Ok(ColumnType::Url),
            "reference" => Ok(ColumnType::Reference),
            "glide_list" => Ok(ColumnType::List),
            other => Err(GlideError::Plan(format!("unknown column type: {other}"))),
        }
    }

    /// Whether this type carries a GUID pointing at another table.
    pub fn is_reference(&self) -> bool {
        matches!(self, ColumnType::Reference | ColumnType::List)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Choice enforcement mode for a column.
///
/// The dictionary stores these as the strings "1" (nullable), "2"
/// (suggestion) and "3" (required); anything else means no choice list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceMode {
    #[default]
    Off,
    Nullable,
    Suggestion,
    Required,
}

impl ChoiceMode {
    /// Parse the dictionary's `choice` field.
    pub fn from_remote(value: &str) -> Self {
        match value {
            "1" => ChoiceMode::Nullable,
            "2" => ChoiceMode::Suggestion,
            "3" => ChoiceMode::Required,
            _ => ChoiceMode::Off,
        }
    }

    /// Dictionary `choice` field value, empty when off.
    pub fn as_remote(&self) -> &'static str {
        match self {
            ChoiceMode::Off => "",
            ChoiceMode::Nullable => "1",
            ChoiceMode::Suggestion => "2",
            ChoiceMode::Required => "3",
        }
    }
}

/// Per-column data policy: whether the platform should treat the column
/// as read-only everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPolicyMode {
    Readonly,
    Writable,
}

impl DataPolicyMode {
    /// The `sys_data_policy_rule.disabled` flag this mode maps to.
    pub fn disabled_flag(&self) -> &'static str {
        match self {
            DataPolicyMode::Readonly => "true",
            DataPolicyMode::Writable => "false",
        }
    }
}

/// Desired shape of a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name when it differs from the spec key. Renames are not
    /// supported; a divergent name on an existing column is a plan error.
    #[serde(default)]
    pub name: Option<String>,
    pub column_type: ColumnType,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub max_length: Option<i64>,
    /// Target table, required iff `column_type` is a reference type.
    #[serde(default)]
    pub reference_table: Option<String>,
    /// Choice list as value -> label.
    #[serde(default)]
    pub choices: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub choice_mode: Option<ChoiceMode>,
    #[serde(default)]
    pub data_policy: Option<DataPolicyMode>,
    #[serde(default)]
    pub syncback: bool,
}

impl ColumnSpec {
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            name: None,
            column_type,
            label: None,
            max_length: None,
            reference_table: None,
            choices: None,
            choice_mode: None,
            data_policy: None,
            syncback: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_reference_table(mut self, table: impl Into<String>) -> Self {
        self.reference_table = Some(table.into());
        self
    }

    pub fn with_choices<I, K, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.choices = Some(
            choices
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_choice_mode(mut self, mode: ChoiceMode) -> Self {
        self.choice_mode = Some(mode);
        self
    }

    pub fn with_data_policy(mut self, policy: DataPolicyMode) -> Self {
        self.data_policy = Some(policy);
        self
    }

    /// Name the column will carry on the remote, given its spec key.
    pub fn effective_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }

    /// Resolved choice mode: a choice map implies at least `Nullable`.
    pub fn effective_choice_mode(&self) -> ChoiceMode {
        match (self.choice_mode, &self.choices) {
            (Some(mode), _) => mode,
            (None, Some(_)) => ChoiceMode::Nullable,
            (None, None) => ChoiceMode::Off,
        }
    }

    fn validate(&self, id: &str) -> Result<()> {
        if self.column_type.is_reference() && self.reference_table.is_none() {
            return Err(GlideError::Plan(format!(
                "column {id} is a {} but has no reference_table",
                self.column_type
            )));
        }
        if !self.column_type.is_reference() && self.reference_table.is_some() {
            return Err(GlideError::Plan(format!(
                "column {id} is a {} and cannot have a reference_table",
                self.column_type
            )));
        }
        Ok(())
    }
}

/// Desired shape of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Parent table name; the lineage forms a DAG via single inheritance.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_extendable")]
    pub extendable: bool,
    /// Columns keyed by user id, in the caller's order.
    #[serde(default)]
    pub columns: IndexMap<String, ColumnSpec>,
}

fn default_extendable() -> bool {
    true
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            parent: None,
            extendable: true,
            columns: IndexMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_column(mut self, id: impl Into<String>, spec: ColumnSpec) -> Self {
        self.columns.insert(id.into(), spec);
        self
    }

    /// Validate the spec and fill derived attributes (choice modes).
    pub fn normalized(&self) -> Result<TableSpec> {
        let mut spec = self.clone();
        if spec.name.is_empty() {
            return Err(GlideError::Plan("table spec has no name".into()));
        }
        for (id, column) in spec.columns.iter_mut() {
            column.validate(id)?;
            if column.choices.is_some() && column.choice_mode.is_none() {
                column.choice_mode = Some(ChoiceMode::Nullable);
            }
        }
        Ok(spec)
    }
}
