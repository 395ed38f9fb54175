//! Subscription and fanout engine.
//!
//! Turns document store change feeds into per-connection client messages and into
//! low-feed push notifications. Every watch runs as its own task and is torn down through
//! the [`SubscriptionRegistry`] when its connection goes away.

pub mod carts;
pub mod change_feed;
pub mod fanout;
pub mod lifecycle;
pub mod notifier;
pub mod subscriptions;
pub mod threshold;

#[cfg(test)]
pub(crate) mod testing;

pub use carts::{cart_message, CartNotifier};
pub use change_feed::{ChangeFeed, FeedCancel, FeedEvent};
pub use fanout::{FanoutOptions, FanoutRouter};
pub use lifecycle::RelayHub;
pub use notifier::{AlertOutcome, DeviceNotifier, TokenSet};
pub use subscriptions::{SubscriptionRegistry, Topic, WatchHandle};
pub use threshold::{AlertVariant, FeedState, LevelTracker, LowFeedAlert, ThresholdMonitor};

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::push::DispatchError;
use crate::server::websocket::ConnectionId;
use crate::store::StoreError;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Store(StoreError),
    #[error("device {0} has no numeric feedLevel/foodLevelThreshold")]
    MalformedDevice(String),
    #[error("no push recipients for {0}")]
    NoRecipients(String),
    #[error("{failed} of {total} push deliveries failed")]
    DispatchPartialFailure { failed: usize, total: usize },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),
}

impl From<StoreError> for RelayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(reason) => RelayError::StoreUnavailable(reason),
            other => RelayError::Store(other),
        }
    }
}

/// Timeouts applied to collaborator calls.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeouts {
    pub store: Duration,
    pub dispatch: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(10),
            dispatch: Duration::from_secs(10),
        }
    }
}

/// Runs a collaborator call with an upper bound on its duration.
pub(crate) async fn bounded<T, E, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> RelayResult<T>
where
    F: Future<Output = Result<T, E>>,
    RelayError: From<E>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(RelayError::from),
        Err(_) => Err(RelayError::Timeout { operation, timeout }),
    }
}
