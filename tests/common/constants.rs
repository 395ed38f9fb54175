//! Shared test constants

#![allow(dead_code)]

/// Device seeded with an opted-in follower.
pub const FEEDER_ID: &str = "feeder-01";

/// Second device, without followers.
pub const OTHER_FEEDER_ID: &str = "feeder-02";

pub const FOLLOWER_USER_ID: &str = "user-1";
pub const FOLLOWER_TOKEN: &str = "push-token-1";

pub const FEED_THRESHOLD: u64 = 10;

/// How long to wait for an expected message.
pub const MESSAGE_TIMEOUT_MS: u64 = 2000;

/// How long to listen when asserting that nothing arrives.
pub const QUIET_PERIOD_MS: u64 = 150;

pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;
