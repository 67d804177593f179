//! Warehouse sink abstraction.
//!
//! A warehouse holds tables addressed as `project.dataset.table`. The
//! pipeline only needs a handful of operations: overwrite-load a staging
//! table, run the insert-only merge, and drop the staging table again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::{self, Debug};

use crate::model::{WeatherRecord, format_timestamp};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryWarehouse;
pub use sqlite::SqliteWarehouse;

/// Columns of every weather table, in storage order.
pub const COLUMNS: [&str; 7] = [
    "timestamp",
    "city",
    "temp",
    "humidity",
    "weather_description",
    "wind_speed",
    "ingestion_timestamp",
];

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("warehouse task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, WarehouseError>;

/// How `load` treats rows already in the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Replace the table so it holds exactly the loaded rows.
    Truncate,
    Append,
}

/// Fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, table: &str) -> Result<Self> {
        if !is_project_id(project) {
            return Err(WarehouseError::InvalidName { kind: "project", name: project.to_string() });
        }
        if !is_identifier(dataset) {
            return Err(WarehouseError::InvalidName { kind: "dataset", name: dataset.to_string() });
        }
        if !is_identifier(table) {
            return Err(WarehouseError::InvalidName { kind: "table", name: table.to_string() });
        }

        Ok(Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        })
    }

    /// Staging table for one city, next to this table in the same dataset.
    pub fn staging_for(&self, city: &str) -> Result<Self> {
        let slug = city_slug(city);
        if slug.is_empty() {
            return Err(WarehouseError::InvalidName { kind: "city", name: city.to_string() });
        }

        Self::new(&self.project, &self.dataset, &format!("{}__staging_{slug}", self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Insert-only merge of a staging table into a permanent table, keyed on
/// `(timestamp, city)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeStatement {
    pub target: TableRef,
    pub source: TableRef,
    pub ingested_at: DateTime<Utc>,
}

impl MergeStatement {
    /// Canonical `MERGE` text. Backends without `MERGE` translate it.
    pub fn to_sql(&self) -> String {
        let insert_cols = COLUMNS.join(", ");
        let values: Vec<String> = COLUMNS[..COLUMNS.len() - 1]
            .iter()
            .map(|c| format!("S.{c}"))
            .collect();

        format!(
            "MERGE `{target}` T USING `{source}` S\n  \
             ON T.timestamp = S.timestamp AND T.city = S.city\n  \
             WHEN NOT MATCHED THEN INSERT ({insert_cols})\n    \
             VALUES ({values}, TIMESTAMP '{now}')",
            target = self.target,
            source = self.source,
            values = values.join(", "),
            now = format_timestamp(&self.ingested_at),
        )
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync + Debug {
    /// Create the permanent table if it does not exist yet.
    async fn ensure_table(&self, table: &TableRef) -> Result<()>;

    /// Write `rows` into `table`, returning the number of rows written.
    async fn load(
        &self,
        rows: &[WeatherRecord],
        table: &TableRef,
        disposition: WriteDisposition,
    ) -> Result<u64>;

    /// Run the merge to completion and return how many rows it inserted.
    async fn merge(&self, statement: &MergeStatement) -> Result<u64>;

    async fn delete_table(&self, table: &TableRef, ignore_if_missing: bool) -> Result<()>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool>;

    /// Row count per city, ordered by city name. A missing table has no rows.
    async fn row_counts(&self, table: &TableRef) -> Result<Vec<(String, u64)>>;
}

/// ASCII identifier: a letter, then letters, digits or underscores.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Project ids may also contain dashes, as cloud project ids do.
pub fn is_project_id(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Lowercase ASCII slug of a city name, used to name its staging table.
/// Empty when the name has no ASCII letters or digits.
pub fn city_slug(city: &str) -> String {
    let slug: String = city
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();

    if slug.chars().all(|c| c == '_') { String::new() } else { slug }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn table() -> TableRef {
        TableRef::new("seattle-weather-analytics", "weather_raw", "history").unwrap()
    }

    #[test]
    fn table_ref_displays_fully_qualified() {
        assert_eq!(table().to_string(), "seattle-weather-analytics.weather_raw.history");
    }

    #[test]
    fn table_ref_rejects_unsafe_names() {
        assert!(TableRef::new("p", "raw\"; drop", "t").is_err());
        assert!(TableRef::new("p", "raw", "1table").is_err());
        assert!(TableRef::new("p q", "raw", "t").is_err());
    }

    #[test]
    fn staging_names_are_scoped_per_city() {
        let seattle = table().staging_for("Seattle").unwrap();
        let sf = table().staging_for("San Francisco").unwrap();

        assert_eq!(seattle.table, "history__staging_seattle");
        assert_eq!(sf.table, "history__staging_san_francisco");
        assert_eq!(sf.dataset, "weather_raw");
        assert!(table().staging_for(" !! ").is_err());
    }

    #[test]
    fn merge_sql_inserts_only_unmatched_keys() {
        let stmt = MergeStatement {
            target: table(),
            source: table().staging_for("Seattle").unwrap(),
            ingested_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        let sql = stmt.to_sql();

        assert!(sql.starts_with(
            "MERGE `seattle-weather-analytics.weather_raw.history` T USING \
             `seattle-weather-analytics.weather_raw.history__staging_seattle` S"
        ));
        assert!(sql.contains("ON T.timestamp = S.timestamp AND T.city = S.city"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT (timestamp, city, temp, humidity, weather_description, wind_speed, ingestion_timestamp)"));
        assert!(sql.contains("VALUES (S.timestamp, S.city, S.temp, S.humidity, S.weather_description, S.wind_speed, TIMESTAMP '2024-05-01T12:00:00Z')"));
        assert!(!sql.contains("WHEN MATCHED"));
    }
}
