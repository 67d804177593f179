//! SQLite-backed warehouse.
//!
//! Each project gets a directory under the warehouse root. Every dataset is
//! its own database file in that directory, attached to the connection under
//! the dataset's name, so tables are addressed as `"dataset"."table"`.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use super::{MergeStatement, Result, TableRef, Warehouse, WarehouseError, WriteDisposition};
use crate::model::{WeatherRecord, format_timestamp};

#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
    /// Tables from any other project are rejected. `None` accepts any project.
    project: Option<String>,
    /// `None` keeps every dataset in memory.
    project_dir: Option<PathBuf>,
}

impl fmt::Debug for SqliteWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteWarehouse")
            .field("project", &self.project)
            .field("project_dir", &self.project_dir)
            .finish_non_exhaustive()
    }
}

impl SqliteWarehouse {
    /// Open (or create) the warehouse for `project` under `root`.
    pub fn open(root: &Path, project: &str) -> Result<Self> {
        if !super::is_project_id(project) {
            return Err(WarehouseError::InvalidName { kind: "project", name: project.to_string() });
        }

        let project_dir = root.join(project);
        std::fs::create_dir_all(&project_dir)?;

        let conn = Connection::open(project_dir.join("catalog.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            project: Some(project.to_string()),
            project_dir: Some(project_dir),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), project: None, project_dir: None })
    }

    fn check_project(&self, table: &TableRef) -> Result<()> {
        match &self.project {
            Some(project) if *project != table.project => Err(WarehouseError::InvalidName {
                kind: "project",
                name: format!("{} (warehouse is opened for {project})", table.project),
            }),
            _ => Ok(()),
        }
    }

    /// Run `f` against the connection on the blocking pool, with the table's
    /// dataset attached.
    async fn with_dataset<T, F>(&self, table: &TableRef, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &TableRef) -> Result<T> + Send + 'static,
    {
        self.check_project(table)?;

        let conn = Arc::clone(&self.conn);
        let project_dir = self.project_dir.clone();
        let table = table.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            attach_dataset(&conn, project_dir.as_deref(), &table.dataset)?;
            f(&mut *conn, &table)
        })
        .await
        .map_err(|e| WarehouseError::Task(e.to_string()))?
    }
}

fn attach_dataset(conn: &Connection, project_dir: Option<&Path>, dataset: &str) -> Result<()> {
    let attached: bool = conn
        .query_row(
            "SELECT 1 FROM pragma_database_list WHERE name = ?1",
            params![dataset],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if attached {
        return Ok(());
    }

    let file = match project_dir {
        Some(dir) => dir.join(format!("{dataset}.db")).to_string_lossy().into_owned(),
        None => ":memory:".to_string(),
    };
    conn.execute(&format!("ATTACH DATABASE ?1 AS \"{dataset}\""), params![file])?;
    Ok(())
}

/// `"dataset"."table"`. Names are validated identifiers, so quoting is enough.
fn qualified(table: &TableRef) -> String {
    format!("\"{}\".\"{}\"", table.dataset, table.table)
}

fn exists(conn: &Connection, table: &TableRef) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM \"{}\".sqlite_master WHERE type = 'table' AND name = ?1",
        table.dataset
    );
    let found = conn
        .query_row(&sql, params![table.table], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn create_table_sql(table: &TableRef, keyed: bool) -> String {
    let key = if keyed { ",\n    PRIMARY KEY (timestamp, city)" } else { "" };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
    timestamp           TEXT NOT NULL,
    city                TEXT NOT NULL,
    temp                REAL NOT NULL,
    humidity            INTEGER NOT NULL,
    weather_description TEXT NOT NULL,
    wind_speed          REAL NOT NULL,
    ingestion_timestamp TEXT{key}
)",
        qualified(table)
    )
}

/// SQLite has no `MERGE`; the insert-only form maps onto `INSERT … SELECT`
/// guarded by `NOT EXISTS`, which runs as one atomic statement.
fn merge_sql(statement: &MergeStatement) -> String {
    format!(
        "INSERT INTO {target} (timestamp, city, temp, humidity, weather_description, wind_speed, ingestion_timestamp)
SELECT S.timestamp, S.city, S.temp, S.humidity, S.weather_description, S.wind_speed, ?1
FROM {source} AS S
WHERE NOT EXISTS (
    SELECT 1 FROM {target} AS T WHERE T.timestamp = S.timestamp AND T.city = S.city
)",
        target = qualified(&statement.target),
        source = qualified(&statement.source),
    )
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn ensure_table(&self, table: &TableRef) -> Result<()> {
        self.with_dataset(table, |conn, table| {
            conn.execute_batch(&create_table_sql(table, true))?;
            Ok(())
        })
        .await
    }

    async fn load(
        &self,
        rows: &[WeatherRecord],
        table: &TableRef,
        disposition: WriteDisposition,
    ) -> Result<u64> {
        let rows = rows.to_vec();

        self.with_dataset(table, move |conn, table| {
            let tx = conn.transaction()?;

            if disposition == WriteDisposition::Truncate {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", qualified(table)))?;
            }
            tx.execute_batch(&create_table_sql(table, false))?;

            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {} (timestamp, city, temp, humidity, weather_description, wind_speed) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    qualified(table)
                ))?;
                for row in &rows {
                    stmt.execute(params![
                        format_timestamp(&row.timestamp),
                        row.city,
                        row.temp,
                        row.humidity,
                        row.weather_description,
                        row.wind_speed,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(rows.len() as u64)
        })
        .await
    }

    async fn merge(&self, statement: &MergeStatement) -> Result<u64> {
        self.check_project(&statement.source)?;
        let statement = statement.clone();
        let target = statement.target.clone();
        let project_dir = self.project_dir.clone();

        self.with_dataset(&target, move |conn, _| {
            if statement.source.dataset != statement.target.dataset {
                attach_dataset(conn, project_dir.as_deref(), &statement.source.dataset)?;
            }
            if !exists(conn, &statement.source)? {
                return Err(WarehouseError::TableNotFound(statement.source.to_string()));
            }

            let inserted = conn.execute(
                &merge_sql(&statement),
                params![format_timestamp(&statement.ingested_at)],
            )?;
            Ok(inserted as u64)
        })
        .await
    }

    async fn delete_table(&self, table: &TableRef, ignore_if_missing: bool) -> Result<()> {
        self.with_dataset(table, move |conn, table| {
            if !ignore_if_missing && !exists(conn, table)? {
                return Err(WarehouseError::TableNotFound(table.to_string()));
            }
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", qualified(table)))?;
            Ok(())
        })
        .await
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        self.with_dataset(table, |conn, table| exists(conn, table)).await
    }

    async fn row_counts(&self, table: &TableRef) -> Result<Vec<(String, u64)>> {
        self.with_dataset(table, |conn, table| {
            if !exists(conn, table)? {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT city, COUNT(*) FROM {} GROUP BY city ORDER BY city",
                qualified(table)
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn target() -> TableRef {
        TableRef::new("proj", "weather_raw", "history").unwrap()
    }

    fn record(city: &str, hour: u32, temp: f64) -> WeatherRecord {
        WeatherRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
            city: city.to_string(),
            temp,
            humidity: 60,
            weather_description: "light rain".to_string(),
            wind_speed: 3.5,
        }
    }

    fn ingested_at(table: &SqliteWarehouse, t: &TableRef) -> Vec<(String, Option<String>)> {
        let conn = table.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT timestamp, ingestion_timestamp FROM {} ORDER BY timestamp",
                qualified(t)
            ))
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[tokio::test]
    async fn truncate_load_replaces_previous_rows() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        let staging = target().staging_for("Seattle").unwrap();

        let first = [record("Seattle", 1, 50.0), record("Seattle", 2, 51.0)];
        assert_eq!(wh.load(&first, &staging, WriteDisposition::Truncate).await.unwrap(), 2);

        let second = [record("Seattle", 3, 52.0)];
        wh.load(&second, &staging, WriteDisposition::Truncate).await.unwrap();

        let counts = wh.row_counts(&staging).await.unwrap();
        assert_eq!(counts, vec![("Seattle".to_string(), 1)]);

        wh.load(&first, &staging, WriteDisposition::Append).await.unwrap();
        assert_eq!(wh.row_counts(&staging).await.unwrap()[0].1, 3);
    }

    #[tokio::test]
    async fn merge_inserts_only_missing_keys_and_keeps_existing_rows() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        let target = target();
        let staging = target.staging_for("Seattle").unwrap();
        wh.ensure_table(&target).await.unwrap();

        let first_at = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        wh.load(&[record("Seattle", 1, 50.0)], &staging, WriteDisposition::Truncate)
            .await
            .unwrap();
        let inserted = wh
            .merge(&MergeStatement { target: target.clone(), source: staging.clone(), ingested_at: first_at })
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        // Same key with a different temperature plus one new key.
        wh.load(
            &[record("Seattle", 1, 99.0), record("Seattle", 2, 51.0)],
            &staging,
            WriteDisposition::Truncate,
        )
        .await
        .unwrap();
        let later = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let inserted = wh
            .merge(&MergeStatement { target: target.clone(), source: staging, ingested_at: later })
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = ingested_at(&wh, &target);
        assert_eq!(
            rows,
            vec![
                ("2024-06-01T01:00:00Z".to_string(), Some("2024-06-02T00:00:00Z".to_string())),
                ("2024-06-01T02:00:00Z".to_string(), Some("2024-06-03T00:00:00Z".to_string())),
            ]
        );

        let conn = wh.conn.lock().unwrap();
        let temp: f64 = conn
            .query_row(
                &format!("SELECT temp FROM {} WHERE timestamp = '2024-06-01T01:00:00Z'", qualified(&target)),
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(temp, 50.0);
    }

    #[tokio::test]
    async fn merge_from_missing_staging_fails() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        let target = target();
        wh.ensure_table(&target).await.unwrap();

        let err = wh
            .merge(&MergeStatement {
                target: target.clone(),
                source: target.staging_for("Nowhere").unwrap(),
                ingested_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn delete_table_honours_ignore_if_missing() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        let staging = target().staging_for("Seattle").unwrap();

        wh.delete_table(&staging, true).await.unwrap();
        let err = wh.delete_table(&staging, false).await.unwrap_err();
        assert!(matches!(err, WarehouseError::TableNotFound(_)));

        wh.load(&[record("Seattle", 1, 50.0)], &staging, WriteDisposition::Truncate)
            .await
            .unwrap();
        assert!(wh.table_exists(&staging).await.unwrap());
        wh.delete_table(&staging, false).await.unwrap();
        assert!(!wh.table_exists(&staging).await.unwrap());
    }

    #[tokio::test]
    async fn rows_survive_reopening_the_project() {
        let dir = tempfile::tempdir().unwrap();
        let target = target();
        let staging = target.staging_for("Portland").unwrap();

        {
            let wh = SqliteWarehouse::open(dir.path(), "proj").unwrap();
            wh.ensure_table(&target).await.unwrap();
            wh.load(&[record("Portland", 4, 60.0)], &staging, WriteDisposition::Truncate)
                .await
                .unwrap();
            wh.merge(&MergeStatement { target: target.clone(), source: staging.clone(), ingested_at: Utc::now() })
                .await
                .unwrap();
        }

        assert!(dir.path().join("proj").join("weather_raw.db").exists());

        let wh = SqliteWarehouse::open(dir.path(), "proj").unwrap();
        assert_eq!(wh.row_counts(&target).await.unwrap(), vec![("Portland".to_string(), 1)]);
    }

    #[tokio::test]
    async fn tables_from_another_project_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let wh = SqliteWarehouse::open(dir.path(), "proj").unwrap();
        let foreign = TableRef::new("other-proj", "weather_raw", "history").unwrap();

        let err = wh.ensure_table(&foreign).await.unwrap_err();
        assert!(matches!(err, WarehouseError::InvalidName { kind: "project", .. }));
        assert!(wh.row_counts(&foreign).await.is_err());

        let err = wh
            .merge(&MergeStatement {
                target: target(),
                source: foreign.staging_for("Seattle").unwrap(),
                ingested_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::InvalidName { kind: "project", .. }));
        assert!(!dir.path().join("other-proj").exists());
    }

    #[tokio::test]
    async fn row_counts_of_missing_table_is_empty() {
        let wh = SqliteWarehouse::open_in_memory().unwrap();
        assert!(wh.row_counts(&target()).await.unwrap().is_empty());
    }
}
