//! Database-backed PLC driver (C7): tags are columns of tables, and a scan
//! cycle reads the latest row of each registered table.
//!
//! Grounded on `DBPLCModule.py`'s `Memory` (one table per memory, one
//! column per tag) and `get_data`/`set_row` (history query / batched
//! insert). Unlike the Python original, every query is parameterized —
//! table and column names are validated against the registration list
//! built at startup rather than interpolated from caller input.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, PgPool, Row};

use crate::drivers::traits::Driver;
use crate::error::{EngineError, EngineResult};
use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

#[derive(Default)]
struct Table {
    /// column name -> tag key
    columns: RwLock<BTreeMap<String, String>>,
}

pub struct DatabaseDriver {
    key: String,
    dsn: String,
    polling_time: Duration,
    pool: RwLock<Option<PgPool>>,
    connected: AtomicBool,
    scan_loop_started: AtomicBool,
    tables: DashMap<String, Arc<Table>>,
    /// tag key -> (table, column), for writes and get_data lookups.
    tag_location: DashMap<String, (String, String)>,
}

impl DatabaseDriver {
    pub fn new(key: impl Into<String>, dsn: impl Into<String>, polling_time: Duration) -> Self {
        DatabaseDriver {
            key: key.into(),
            dsn: dsn.into(),
            polling_time,
            pool: RwLock::new(None),
            connected: AtomicBool::new(false),
            scan_loop_started: AtomicBool::new(false),
            tables: DashMap::new(),
            tag_location: DashMap::new(),
        }
    }

    pub fn register_tag(&self, table: impl Into<String>, column: impl Into<String>, tag_key: &str) {
        let table = table.into();
        let column = column.into();
        let entry = self
            .tables
            .entry(table.clone())
            .or_insert_with(|| Arc::new(Table::default()));
        entry.columns.write().insert(column.clone(), tag_key.to_string());
        self.tag_location.insert(tag_key.to_string(), (table, column));
    }

    /// Returns `[(timestamp, value)]` between `from`/`to`, matching the
    /// original's `get_data` history query used by the websocket gateway's
    /// trend endpoint.
    pub async fn get_data(
        &self,
        tag_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<(DateTime<Utc>, f64)>> {
        let (table, column) = self
            .tag_location
            .get(tag_key)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::UnknownTag(tag_key.to_string()))?;

        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| EngineError::Transport("database pool not open".to_string()))?;

        let query = format!(
            "SELECT date, {col} FROM {tbl} WHERE date > $1 AND date < $2 ORDER BY date ASC",
            col = quote_ident(&column),
            tbl = quote_ident(&table),
        );
        let rows = sqlx::query(&query)
            .bind(from)
            .bind(to)
            .fetch_all(&pool)
            .await
            .map_err(EngineError::Db)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: DateTime<Utc> = row.try_get("date").map_err(EngineError::Db)?;
            let value: f64 = row.try_get(column.as_str()).map_err(EngineError::Db)?;
            results.push((ts, value));
        }
        Ok(results)
    }

    /// Inserts one row across several tags at once, matching `set_row`.
    /// Tags not present in `values` are left null, same as the original.
    /// `date` defaults to `now()` when not supplied by the caller.
    pub async fn set_row(
        &self,
        table: &str,
        values: &BTreeMap<String, TagValue>,
        date: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| EngineError::Transport("database pool not open".to_string()))?;

        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| EngineError::Config(format!("unknown table '{table}'")))?;
        let known_columns = entry.columns.read().clone();

        let mut columns = Vec::new();
        let mut bind_values = Vec::new();
        for (column, value) in values.iter() {
            if !known_columns.contains_key(column) {
                return Err(EngineError::Config(format!("'{column}' is not a column of '{table}'")));
            }
            columns.push(quote_ident(column));
            bind_values.push(value.clone());
        }

        let placeholders: Vec<String> = (0..bind_values.len()).map(|i| format!("${}", i + 2)).collect();
        let query = format!(
            "INSERT INTO {tbl} (date, {cols}) VALUES ($1, {ph})",
            tbl = quote_ident(table),
            cols = columns.join(", "),
            ph = placeholders.join(", "),
        );
        let mut built = sqlx::query(&query).bind(date.unwrap_or_else(Utc::now));
        for value in &bind_values {
            built = bind_tag_value(built, value);
        }
        built.execute(&pool).await.map_err(EngineError::Db)?;
        Ok(())
    }

    /// Most recent full row of a table, matching `Memory.get_row()`.
    pub async fn get_row(&self, table: &str) -> EngineResult<Option<BTreeMap<String, TagValue>>> {
        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| EngineError::Transport("database pool not open".to_string()))?;
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| EngineError::Config(format!("unknown table '{table}'")))?;
        let columns = entry.columns.read().clone();
        if columns.is_empty() {
            return Ok(None);
        }

        let select_list = columns.keys().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let query = format!(
            "SELECT {cols} FROM {tbl} ORDER BY date DESC LIMIT 1",
            cols = select_list,
            tbl = quote_ident(table),
        );
        let row = sqlx::query(&query).fetch_optional(&pool).await.map_err(EngineError::Db)?;
        let Some(row) = row else { return Ok(None) };

        let mut out = BTreeMap::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let name = column.name();
            let Some(tag_key) = columns.get(name) else { continue };
            let value: Option<f64> = row.try_get(idx).map_err(EngineError::Db)?;
            out.insert(tag_key.clone(), value.map(TagValue::Float).unwrap_or(TagValue::Null));
        }
        Ok(Some(out))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema for a Memory's backing table: `date` primary key plus one
/// `DOUBLE PRECISION` column per tag. Matches the intent behind the
/// original's malformed `columns=[key_memory, metadata, ...]` table
/// construction (see DESIGN.md) rather than reproducing it.
fn create_table_sql(table: &str, columns: &[String]) -> String {
    let mut cols = vec!["date TIMESTAMPTZ PRIMARY KEY".to_string()];
    cols.extend(columns.iter().map(|c| format!("{} DOUBLE PRECISION", quote_ident(c))));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        cols.join(", ")
    )
}

fn bind_tag_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q TagValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        TagValue::Bool(b) => query.bind(*b),
        TagValue::Int(i) => query.bind(*i),
        TagValue::Float(f) => query.bind(*f),
        TagValue::Str(s) => query.bind(s.as_str()),
        TagValue::Timestamp(t) => query.bind(*t),
        TagValue::Null => query.bind(Option::<f64>::None),
    }
}

#[async_trait]
impl Driver for DatabaseDriver {
    fn key(&self) -> &str {
        &self.key
    }

    fn polling_time(&self) -> Duration {
        self.polling_time
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(self: Arc<Self>, store: Arc<TagStore>) {
        if self.scan_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(crate::tasks::spawn_scan_loop(self, store));
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.pool.write() = None;
    }

    async fn try_connect(&self) -> EngineResult<()> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&self.dsn)
            .await
            .map_err(EngineError::Db)?;

        for entry in self.tables.iter() {
            let table = entry.key().clone();
            let columns: Vec<String> = entry.value().columns.read().keys().cloned().collect();
            let ddl = create_table_sql(&table, &columns);
            sqlx::query(&ddl).execute(&pool).await.map_err(EngineError::Db)?;
        }

        *self.pool.write() = Some(pool);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, store: &TagStore) -> EngineResult<()> {
        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| EngineError::Transport("database pool not open".to_string()))?;

        let result: EngineResult<()> = async {
            for entry in self.tables.iter() {
                let table = entry.key().clone();
                let columns = entry.value().columns.read().clone();
                if columns.is_empty() {
                    continue;
                }
                let select_list = columns
                    .keys()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let query = format!(
                    "SELECT {cols} FROM {tbl} ORDER BY date DESC LIMIT 1",
                    cols = select_list,
                    tbl = quote_ident(&table),
                );
                let row = sqlx::query(&query).fetch_optional(&pool).await.map_err(EngineError::Db)?;
                let Some(row) = row else { continue };
                for (idx, column) in row.columns().iter().enumerate() {
                    let name = column.name();
                    let Some(tag_key) = columns.get(name) else { continue };
                    let value: Option<f64> = row.try_get(idx).map_err(EngineError::Db)?;
                    let tag_value = value.map(TagValue::Float).unwrap_or(TagValue::Null);
                    store.update(tag_key, tag_value).await?;
                }
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn write(&self, store: &TagStore, tag_key: &str, value: TagValue) -> EngineResult<()> {
        let (table, column) = self
            .tag_location
            .get(tag_key)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::UnknownTag(tag_key.to_string()))?;

        let mut values = BTreeMap::new();
        values.insert(column, value.clone());
        self.set_row(&table, &values, None).await?;
        store.update(tag_key, value).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers_defensively() {
        assert_eq!(quote_ident("normal"), "\"normal\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn create_table_sql_has_date_primary_key_and_float_columns() {
        let ddl = create_table_sql("sensors", &["temperature".to_string(), "pressure".to_string()]);
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"sensors\" (date TIMESTAMPTZ PRIMARY KEY, \"temperature\" DOUBLE PRECISION, \"pressure\" DOUBLE PRECISION)"
        );
    }

    #[test]
    fn register_tag_tracks_location() {
        let driver = DatabaseDriver::new("db1", "postgres://localhost/test", Duration::from_secs(1));
        driver.register_tag("sensors", "temperature", "plant.temp");
        assert_eq!(
            driver.tag_location.get("plant.temp").map(|e| e.clone()),
            Some(("sensors".to_string(), "temperature".to_string()))
        );
    }
}
