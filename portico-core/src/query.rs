//! Query and mutation descriptors.
//!
//! A [`QueryDescriptor`] is validated at construction and carries the
//! canonical cache key used by the offline cache for that read.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A row as exchanged with providers.
pub type Row = Value;

/// Equality filters, keyed by column.
pub type Filter = BTreeMap<String, Value>;

/// Sort specification for a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// Options accepted by `db.query`.
///
/// Field order here is the serialization order of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality filter on `column`.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(column.into(), value.into());
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_filter(&self.filter)?;
        if let Some(order) = &self.order {
            validate_column("order.column", &order.column)?;
        }
        if self.limit == Some(0) {
            return Err(ValidationError::invalid("limit", "must be > 0"));
        }
        Ok(())
    }

    /// Deterministic JSON rendering: keys sorted at every depth.
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonicalize(value).to_string()
    }
}

/// Filter keys that PostgREST reads as query parameters or logical operators.
const RESERVED_FILTER_COLUMNS: &[&str] = &["and", "or", "not", "select", "order", "limit", "offset"];

/// Column names are spliced into provider filter and sort expressions, so they
/// are restricted to `[A-Za-z0-9_.]`.
fn validate_column(field: &str, column: &str) -> Result<(), ValidationError> {
    if column.is_empty() {
        return Err(ValidationError::invalid(field, "column names must not be empty"));
    }
    if !column
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'))
    {
        return Err(ValidationError::invalid(
            field,
            format!("'{}' contains characters outside [A-Za-z0-9_.]", column),
        ));
    }
    Ok(())
}

fn validate_filter(filter: &Filter) -> Result<(), ValidationError> {
    for column in filter.keys() {
        validate_column("filter", column)?;
        if RESERVED_FILTER_COLUMNS.contains(&column.to_ascii_lowercase().as_str()) {
            return Err(ValidationError::invalid(
                "filter",
                format!("'{}' is a reserved name", column),
            ));
        }
    }
    Ok(())
}

/// Validated table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::missing("table"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ValidationError::invalid(
                "table",
                format!("'{}' contains characters outside [A-Za-z0-9_.-]", name),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shared by the cache keys of every query on this table.
    pub fn query_cache_prefix(&self) -> String {
        format!("query:{}:", self.0)
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated read against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    table: TableName,
    options: QueryOptions,
    cache_key: String,
}

impl QueryDescriptor {
    pub fn new(table: impl Into<String>, options: QueryOptions) -> Result<Self, ValidationError> {
        let table = TableName::new(table)?;
        options.validate()?;
        let cache_key = format!("{}{}", table.query_cache_prefix(), options.canonical_json());
        Ok(Self {
            table,
            options,
            cache_key,
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Logical cache key, e.g. `query:todos:{"filter":{"done":false}}`.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Apply filter, order, offset and limit to an in-memory row set.
    pub fn apply(&self, rows: &[Row]) -> Vec<Row> {
        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|row| matches_filter(&self.options.filter, row))
            .cloned()
            .collect();

        if let Some(order) = &self.options.order {
            selected.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        let offset = self.options.offset.unwrap_or(0) as usize;
        let iter = selected.into_iter().skip(offset);
        match self.options.limit {
            Some(limit) => iter.take(limit as usize).collect(),
            None => iter.collect(),
        }
    }
}

/// Write operation kinds accepted by `db.mutate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationKind {
    Insert { rows: Vec<Row> },
    Upsert { rows: Vec<Row> },
    Update { filter: Filter, values: Map<String, Value> },
    Delete { filter: Filter },
}

/// A validated write against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    table: TableName,
    kind: MutationKind,
}

impl Mutation {
    pub fn insert(table: impl Into<String>, rows: Vec<Row>) -> Result<Self, ValidationError> {
        Self::with_rows(table, rows, false)
    }

    pub fn upsert(table: impl Into<String>, rows: Vec<Row>) -> Result<Self, ValidationError> {
        Self::with_rows(table, rows, true)
    }

    /// Update matching rows. An empty filter is rejected; whole-table updates
    /// are not expressible through the gateway.
    pub fn update(
        table: impl Into<String>,
        filter: Filter,
        values: Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        let table = TableName::new(table)?;
        if filter.is_empty() {
            return Err(ValidationError::missing("filter"));
        }
        validate_filter(&filter)?;
        if values.is_empty() {
            return Err(ValidationError::missing("values"));
        }
        Ok(Self {
            table,
            kind: MutationKind::Update { filter, values },
        })
    }

    pub fn delete(table: impl Into<String>, filter: Filter) -> Result<Self, ValidationError> {
        let table = TableName::new(table)?;
        if filter.is_empty() {
            return Err(ValidationError::missing("filter"));
        }
        validate_filter(&filter)?;
        Ok(Self {
            table,
            kind: MutationKind::Delete { filter },
        })
    }

    fn with_rows(
        table: impl Into<String>,
        rows: Vec<Row>,
        upsert: bool,
    ) -> Result<Self, ValidationError> {
        let table = TableName::new(table)?;
        if rows.is_empty() {
            return Err(ValidationError::missing("rows"));
        }
        if rows.iter().any(|row| !row.is_object()) {
            return Err(ValidationError::invalid("rows", "every row must be an object"));
        }
        let kind = if upsert {
            MutationKind::Upsert { rows }
        } else {
            MutationKind::Insert { rows }
        };
        Ok(Self { table, kind })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }
}

/// True when every filter column equals the row's value.
pub fn matches_filter(filter: &Filter, row: &Row) -> bool {
    filter
        .iter()
        .all(|(column, expected)| row.get(column) == Some(expected))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
