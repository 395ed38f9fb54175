//! Push notification dispatch.
//!
//! The relay hands a token list and a message to a [`NotificationDispatcher`] and gets
//! back one result per token. Delivery is fire-and-forget: failed tokens are reported,
//! never retried.

mod gateway;
mod recording;

pub use gateway::HttpPushDispatcher;
pub use recording::RecordingDispatcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Payload of one push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    /// Client-side action identifier, e.g. `lowFeedAction`.
    pub action_tag: Option<String>,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            action_tag: None,
        }
    }

    pub fn with_action(mut self, action_tag: impl Into<String>) -> Self {
        self.action_tag = Some(action_tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDelivery {
    pub token: String,
    pub outcome: DeliveryOutcome,
}

/// Per-token results of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub results: Vec<TokenDelivery>,
}

impl DispatchReport {
    pub fn all_delivered(tokens: &[String]) -> Self {
        Self {
            results: tokens
                .iter()
                .map(|t| TokenDelivery {
                    token: t.clone(),
                    outcome: DeliveryOutcome::Delivered,
                })
                .collect(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Delivered)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            DeliveryOutcome::Failed(reason) => Some((r.token.as_str(), reason.as_str())),
            DeliveryOutcome::Delivered => None,
        })
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("push gateway unreachable: {0}")]
    Transport(String),
    #[error("push gateway rejected the batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid push gateway response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Sends `message` to every token. An empty token list is a no-op.
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<DispatchReport, DispatchError>;
}

/// Dispatcher used when no push gateway is configured: logs and reports success.
pub struct LogOnlyDispatcher;

#[async_trait]
impl NotificationDispatcher for LogOnlyDispatcher {
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<DispatchReport, DispatchError> {
        if !tokens.is_empty() {
            info!(
                "Push (not delivered, no gateway configured) to {} tokens: {} - {}",
                tokens.len(),
                message.title,
                message.body
            );
        }
        Ok(DispatchReport::all_delivered(tokens))
    }
}
