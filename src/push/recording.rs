//! In-process dispatcher that keeps every batch it is given.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    DeliveryOutcome, DispatchError, DispatchReport, NotificationDispatcher, PushMessage,
    TokenDelivery,
};

/// Records dispatched batches; tokens listed as rejected are reported as failed.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(Vec<String>, PushMessage)>>,
    rejected_tokens: HashSet<String>,
    unreachable: bool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rejected_tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Every call fails with a transport error (after being recorded).
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<(Vec<String>, PushMessage)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn dispatch_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<DispatchReport, DispatchError> {
        if tokens.is_empty() {
            return Ok(DispatchReport::default());
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((tokens.to_vec(), message.clone()));
        }
        if self.unreachable {
            return Err(DispatchError::Transport("connection refused".into()));
        }
        let results = tokens
            .iter()
            .map(|token| TokenDelivery {
                token: token.clone(),
                outcome: if self.rejected_tokens.contains(token) {
                    DeliveryOutcome::Failed("registration-token-not-registered".into())
                } else {
                    DeliveryOutcome::Delivered
                },
            })
            .collect();
        Ok(DispatchReport { results })
    }
}
