use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

use super::{Output, OutputInfo};

/// Writes a formatted line through `tracing`. When `info.alarmgroup` is
/// set the value is rendered as `"ON"`/`"OFF"` rather than its raw form.
pub struct LogOutput;

#[async_trait]
impl Output for LogOutput {
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
                TagValue::Bool(true) => "ON".to_string(),
                _ => "OFF".to_string(),
            }
        } else {
            value.render().unwrap_or_default()
        };

        match &info.alarmgroup {
            Some(group) => info!(
                tag = expr_key,
                group = group.as_str(),
                value = %rendered,
                "{} [{}] {} {} ({})",
                ts.format("%Y-%m-%d %H:%M:%S"),
                group,
                expr_key,
                rendered,
                description,
            ),
            None => info!(
                tag = expr_key,
                value = %rendered,
                "{} {} {} ({})",
                ts.format("%Y-%m-%d %H:%M:%S"),
                expr_key,
                rendered,
                description,
            ),
        }
    }
}
