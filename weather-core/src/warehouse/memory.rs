//! Process-local warehouse used for dry runs and tests.

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{MergeStatement, Result, TableRef, Warehouse, WarehouseError, WriteDisposition};
use crate::model::{StoredRecord, WeatherRecord};

/// One call made against the warehouse, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseOp {
    EnsureTable(String),
    Load { table: String, rows: usize },
    Merge { target: String, source: String, inserted: u64 },
    Delete(String),
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Vec<StoredRecord>>,
    ops: Vec<WarehouseOp>,
}

/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rows currently in `table`, empty when it does not exist.
    pub fn rows(&self, table: &TableRef) -> Vec<StoredRecord> {
        self.state().tables.get(&table.to_string()).cloned().unwrap_or_default()
    }

    pub fn operations(&self) -> Vec<WarehouseOp> {
        self.state().ops.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_table(&self, table: &TableRef) -> Result<()> {
        let mut state = self.state();
        state.tables.entry(table.to_string()).or_default();
        state.ops.push(WarehouseOp::EnsureTable(table.to_string()));
        Ok(())
    }

    async fn load(
        &self,
        rows: &[WeatherRecord],
        table: &TableRef,
        disposition: WriteDisposition,
    ) -> Result<u64> {
        let mut state = self.state();
        let stored = rows.iter().cloned().map(|record| StoredRecord { record, ingestion_timestamp: None });

        let entry = state.tables.entry(table.to_string()).or_default();
        if disposition == WriteDisposition::Truncate {
            entry.clear();
        }
        entry.extend(stored);

        state.ops.push(WarehouseOp::Load { table: table.to_string(), rows: rows.len() });
        Ok(rows.len() as u64)
    }

    async fn merge(&self, statement: &MergeStatement) -> Result<u64> {
        let mut state = self.state();
        let source_name = statement.source.to_string();
        let target_name = statement.target.to_string();

        let source = state
            .tables
            .get(&source_name)
            .cloned()
            .ok_or_else(|| WarehouseError::TableNotFound(source_name.clone()))?;
        let target = state
            .tables
            .get_mut(&target_name)
            .ok_or_else(|| WarehouseError::TableNotFound(target_name.clone()))?;

        // Like MERGE, matching is against the target as it was before the statement.
        let existing: HashSet<_> = target.iter().map(|t| t.record.key()).collect();
        let unmatched: Vec<StoredRecord> = source
            .into_iter()
            .filter(|s| !existing.contains(&s.record.key()))
            .map(|s| StoredRecord { record: s.record, ingestion_timestamp: Some(statement.ingested_at) })
            .collect();

        let inserted = unmatched.len() as u64;
        target.extend(unmatched);

        state.ops.push(WarehouseOp::Merge { target: target_name, source: source_name, inserted });
        Ok(inserted)
    }

    async fn delete_table(&self, table: &TableRef, ignore_if_missing: bool) -> Result<()> {
        let mut state = self.state();
        let name = table.to_string();

        if state.tables.remove(&name).is_none() && !ignore_if_missing {
            return Err(WarehouseError::TableNotFound(name));
        }

        state.ops.push(WarehouseOp::Delete(name));
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        Ok(self.state().tables.contains_key(&table.to_string()))
    }

    async fn row_counts(&self, table: &TableRef) -> Result<Vec<(String, u64)>> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for row in self.rows(table) {
            *counts.entry(row.record.city).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(hour: u32) -> WeatherRecord {
        WeatherRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            city: "Seattle".into(),
            temp: 40.0,
            humidity: 80,
            weather_description: "overcast clouds".into(),
            wind_speed: 0.0,
        }
    }

    #[tokio::test]
    async fn merge_matches_on_key_and_stamps_ingestion_time() {
        let wh = MemoryWarehouse::new();
        let target = TableRef::new("p", "d", "t").unwrap();
        let staging = target.staging_for("Seattle").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        wh.ensure_table(&target).await.unwrap();
        wh.load(&[record(1), record(2)], &staging, WriteDisposition::Truncate).await.unwrap();
        let stmt = MergeStatement { target: target.clone(), source: staging.clone(), ingested_at: at };

        assert_eq!(wh.merge(&stmt).await.unwrap(), 2);
        assert_eq!(wh.merge(&stmt).await.unwrap(), 0);

        let rows = wh.rows(&target);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.ingestion_timestamp == Some(at)));
        assert!(wh.rows(&staging).iter().all(|r| r.ingestion_timestamp.is_none()));
    }

    #[tokio::test]
    async fn merge_matches_against_the_target_before_the_statement() {
        let wh = MemoryWarehouse::new();
        let target = TableRef::new("p", "d", "t").unwrap();
        let staging = target.staging_for("Seattle").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        wh.ensure_table(&target).await.unwrap();
        wh.load(&[record(1)], &staging, WriteDisposition::Truncate).await.unwrap();
        let stmt = MergeStatement { target: target.clone(), source: staging.clone(), ingested_at: at };
        wh.merge(&stmt).await.unwrap();

        // A key repeated inside the source is inserted for each copy, as MERGE would.
        wh.load(&[record(1), record(3), record(3)], &staging, WriteDisposition::Truncate)
            .await
            .unwrap();
        assert_eq!(wh.merge(&stmt).await.unwrap(), 2);
        assert_eq!(wh.rows(&target).len(), 3);
    }

    #[tokio::test]
    async fn delete_missing_table() {
        let wh = MemoryWarehouse::new();
        let table = TableRef::new("p", "d", "gone").unwrap();

        assert!(wh.delete_table(&table, true).await.is_ok());
        assert!(matches!(
            wh.delete_table(&table, false).await,
            Err(WarehouseError::TableNotFound(_))
        ));
    }
}
