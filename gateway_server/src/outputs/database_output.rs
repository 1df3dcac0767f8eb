use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::error;

use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

use super::{Output, OutputInfo};

/// Inserts `(ts_col, desc_col, value_col)` into `table` via a parameterized
/// statement. Alarm edges are rendered as `"1"`/`"0"`. String
/// interpolation into SQL is deliberately avoided.
pub struct DatabaseOutput {
    pool: PgPool,
    table: String,
    ts_col: String,
    desc_col: String,
    value_col: String,
}

impl DatabaseOutput {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        ts_col: impl Into<String>,
        desc_col: impl Into<String>,
        value_col: impl Into<String>,
    ) -> Self {
        DatabaseOutput {
            pool,
            table: table.into(),
            ts_col: ts_col.into(),
            desc_col: desc_col.into(),
            value_col: value_col.into(),
        }
    }
}

#[async_trait]
impl Output for DatabaseOutput {
    async fn write(
        &self,
        store: &TagStore,
        expr_key: &str,
        ts: DateTime<Utc>,
        value: &TagValue,
        info: &OutputInfo,
    ) {
        let description = store
            .get(expr_key)
            .map(|e| e.description.read().clone())
            .unwrap_or_default();

        let rendered = if info.alarmgroup.is_some() {
            match value {
                TagValue::Bool(true) => "1".to_string(),
                _ => "0".to_string(),
            }
        } else {
            value.render().unwrap_or_default()
        };

        let query = format!(
            "INSERT INTO {} ({}, {}, {}) VALUES ($1, $2, $3)",
            self.table, self.ts_col, self.desc_col, self.value_col
        );
        let result = sqlx::query(&query)
            .bind(ts)
            .bind(&description)
            .bind(&rendered)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            error!(table = %self.table, error = %e, "database output insert failed");
        }
    }
}
