pub mod database_output;
pub mod file_output;
pub mod log_output;
pub mod mail_output;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::tags::store::{TagKind, TagStore};
use crate::tags::structures::TagValue;

pub use database_output::DatabaseOutput;
pub use file_output::FileOutput;
pub use log_output::LogOutput;
pub use mail_output::MailOutput;

/// Extra context an edge carries beyond the value itself. Populated when
/// the write came from an alarm edge rather than a plain expression change.
pub struct OutputInfo {
    pub alarmgroup: Option<String>,
}

/// A stateless writer invoked synchronously from the task that delivered
/// the triggering update. Failures are logged by the implementation and
/// never propagate back into the tag graph.
#[async_trait]
pub trait Output: Send + Sync {
    async fn write(
        &self,
        store: &TagStore,
        expr_key: &str,
        ts: DateTime<Utc>,
        value: &TagValue,
        info: &OutputInfo,
    );
}

/// Replaces `{i.key}`, `{i.description}`, `{i.value}` in `template` with
/// renderings of `expr_key`'s `usedtags[i]`, zero-based.
pub fn transform(store: &TagStore, expr_key: &str, template: &str) -> String {
    let usedtags = match store.get(expr_key) {
        Some(entry) => match &entry.kind {
            TagKind::Expression(state) => state.usedtags.read().clone(),
            TagKind::Direct => Vec::new(),
        },
        None => Vec::new(),
    };

    let mut out = template.to_string();
    for (i, tag_key) in usedtags.iter().enumerate() {
        let Some(tag) = store.get(tag_key) else {
            continue;
        };
        let value = tag.value.read().clone();
        out = out.replace(&format!("{{{i}.key}}"), &tag.key);
        out = out.replace(&format!("{{{i}.description}}"), &tag.description.read());
        out = out.replace(&format!("{{{i}.value}}"), &value.render().unwrap_or_default());
    }
    out
}
