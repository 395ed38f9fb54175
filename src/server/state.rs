use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use crate::relay::RelayHub;

pub type GuardedRelayHub = Arc<RelayHub>;

#[derive(Clone)]
pub struct ServerState {
    pub start_time: Instant,
    pub hub: GuardedRelayHub,
}

impl ServerState {
    pub fn new(hub: GuardedRelayHub) -> Self {
        Self {
            start_time: Instant::now(),
            hub,
        }
    }
}

impl FromRef<ServerState> for GuardedRelayHub {
    fn from_ref(input: &ServerState) -> Self {
        input.hub.clone()
    }
}
