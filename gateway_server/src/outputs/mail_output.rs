use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::error;

use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

use super::{transform, Output, OutputInfo};

/// Sends an SMTP(S) message with the expression's description as subject
/// and a body containing date, tag key, and value. Errors are logged and
/// never raise back into the caller.
pub struct MailOutput {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    body_template: String,
}

impl MailOutput {
    pub fn new(
        relay: &str,
        username: Option<String>,
        password: Option<String>,
        from: Mailbox,
        to: Vec<Mailbox>,
        body_template: Option<String>,
    ) -> Result<Self, lettre::transport::smtp::Error> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(relay)?;
        if let (Some(username), Some(password)) = (username, password) {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(MailOutput {
            transport: builder.build(),
            from,
            to,
            body_template: body_template
                .unwrap_or_else(|| "{0.key}: {0.description} = {0.value}".to_string()),
        })
    }
}

#[async_trait]
impl Output for MailOutput {
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

        let body = format!(
            "{}\ndate: {}\nconcept: {}\nvalue: {}\n",
            transform(store, expr_key, &self.body_template),
            ts.format("%Y-%m-%d %H:%M:%S"),
            expr_key,
            rendered,
        );

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(description);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        let message = match builder.body(body) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "mail output message build failed");
                return;
            }
        };

        if let Err(e) = self.transport.send(message).await {
            error!(error = %e, "mail output send failed");
        }
    }
}
