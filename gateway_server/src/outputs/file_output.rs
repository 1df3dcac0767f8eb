use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

use super::{Output, OutputInfo};

/// Appends `"{ts} {value} {description}\n"` to `path`, opening in append
/// mode and closing after each write — crash-safe at the cost of
/// throughput.
pub struct FileOutput {
    path: String,
}

impl FileOutput {
    pub fn new(path: impl Into<String>) -> Self {
        FileOutput { path: path.into() }
    }
}

#[async_trait]
impl Output for FileOutput {
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

        let line = format!(
            "{} {} {}\n",
            ts.format("%Y-%m-%d %H:%M:%S"),
            rendered,
            description
        );

        let opened = OpenOptions::new().create(true).append(true).open(&self.path).await;
        match opened {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!(path = %self.path, error = %e, "file output write failed");
                }
            }
            Err(e) => {
                error!(path = %self.path, error = %e, "file output open failed");
            }
        }
    }
}
