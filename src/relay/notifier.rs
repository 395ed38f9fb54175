//! Records a device notification and pushes it to the device's followers.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{bounded, CallTimeouts, RelayError, RelayResult};
use crate::devices::{paths, NotificationRecord};
use crate::push::{NotificationDispatcher, PushMessage};
use crate::server::metrics;
use crate::store::{DocumentStore, Query};

/// Distinct push tokens of a device's opted-in users.
pub type TokenSet = BTreeSet<String>;

/// What happened to one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertOutcome {
    /// Id of the stored notification record, if the write succeeded.
    pub record_id: Option<String>,
    pub recipients: usize,
    pub dispatched: bool,
    pub delivered: usize,
    pub failed: usize,
}

pub struct DeviceNotifier {
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    timeouts: CallTimeouts,
}

impl DeviceNotifier {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            store,
            dispatcher,
            timeouts,
        }
    }

    /// Appends a notification record for `device_id`, then pushes `message` to every
    /// token of the device's opted-in users.
    ///
    /// Never fails: each step logs its own error. A failed record write does not stop
    /// the push, and a failed push does not remove the record.
    pub async fn notify_device(&self, device_id: &str, message: &PushMessage) -> AlertOutcome {
        let mut outcome = AlertOutcome::default();

        let record = NotificationRecord::new(
            message.title.clone(),
            message.body.clone(),
            message.action_tag.clone(),
        );
        let collection = paths::notifications(device_id);
        match bounded(
            "write notification record",
            self.timeouts.store,
            self.store.add(&collection, record.to_fields()),
        )
        .await
        {
            Ok(document) => outcome.record_id = Some(document.id),
            Err(e) => error!("Failed to record notification for device {}: {}", device_id, e),
        }

        let tokens = match self.resolve_tokens(device_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!("Failed to resolve push tokens for device {}: {}", device_id, e);
                return outcome;
            }
        };
        self.dispatch(&format!("device {}", device_id), tokens, message, outcome)
            .await
    }

    /// Pushes `message` to every token registered by `user_id`. Nothing is recorded.
    pub async fn notify_user(&self, user_id: &str, message: &PushMessage) -> AlertOutcome {
        match self.user_tokens(user_id).await {
            Ok(tokens) => {
                self.dispatch(
                    &format!("user {}", user_id),
                    tokens,
                    message,
                    AlertOutcome::default(),
                )
                .await
            }
            Err(e) => {
                error!("Failed to fetch push tokens of user {}: {}", user_id, e);
                AlertOutcome::default()
            }
        }
    }

    /// Push tokens of every user linked to `device_id` with notifications enabled.
    ///
    /// Users are looked up concurrently; a failing lookup is logged and skipped.
    pub async fn resolve_tokens(&self, device_id: &str) -> RelayResult<TokenSet> {
        let links = Query::collection(paths::device_users(device_id))
            .where_eq("notificationsEnabled", true);
        let users = bounded(
            "query device users",
            self.timeouts.store,
            self.store.query(&links),
        )
        .await?;

        let lookups = users.iter().map(|user| async move {
            (user.id.as_str(), self.user_tokens(&user.id).await)
        });

        let mut tokens = TokenSet::new();
        for (user_id, result) in join_all(lookups).await {
            match result {
                Ok(user_tokens) => tokens.extend(user_tokens),
                Err(e) => warn!("Skipping tokens of user {}: {}", user_id, e),
            }
        }
        Ok(tokens)
    }

    /// Non-empty push tokens registered by `user_id`.
    pub async fn user_tokens(&self, user_id: &str) -> RelayResult<TokenSet> {
        let query = Query::collection(paths::user_tokens(user_id));
        let documents = bounded(
            "fetch user tokens",
            self.timeouts.store,
            self.store.query(&query),
        )
        .await?;
        Ok(documents
            .iter()
            .filter_map(|d| d.get("token").and_then(Value::as_str))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Sends one batch to `tokens` and fills in the delivery counts of `outcome`.
    async fn dispatch(
        &self,
        recipient: &str,
        tokens: TokenSet,
        message: &PushMessage,
        mut outcome: AlertOutcome,
    ) -> AlertOutcome {
        outcome.recipients = tokens.len();
        if tokens.is_empty() {
            info!("{}", RelayError::NoRecipients(recipient.to_string()));
            return outcome;
        }

        let tokens: Vec<String> = tokens.into_iter().collect();
        let report = match bounded(
            "push dispatch",
            self.timeouts.dispatch,
            self.dispatcher.send_to_tokens(&tokens, message),
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                error!("Push for {} failed: {}", recipient, e);
                metrics::record_push_deliveries(0, tokens.len());
                outcome.dispatched = true;
                outcome.failed = tokens.len();
                return outcome;
            }
        };

        outcome.dispatched = true;
        outcome.delivered = report.success_count();
        outcome.failed = report.failure_count();
        metrics::record_push_deliveries(outcome.delivered, outcome.failed);

        if outcome.failed > 0 {
            for (token, reason) in report.failures() {
                warn!("Push to token {} failed: {}", token, reason);
            }
            warn!(
                "Push for {}: {}",
                recipient,
                RelayError::DispatchPartialFailure {
                    failed: outcome.failed,
                    total: tokens.len(),
                }
            );
        } else {
            info!(
                "Pushed \"{}\" for {} to {} tokens",
                message.title, recipient, outcome.delivered
            );
        }
        outcome
    }
}
