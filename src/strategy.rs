use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{config::Server, context::TargetAddress};

/// Per-connection server selection with feedback hooks.
///
/// Only `pick_server` is required; the feedback calls default to no-ops.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn pick_server(&self, client: Option<SocketAddr>, dest: &TargetAddress) -> Option<Arc<Server>>;
    fn update_latency(&self, _server: &Server, _latency: Duration) {}
    fn update_last_read(&self, _server: &Server) {}
    fn update_last_write(&self, _server: &Server) {}
    fn set_failure(&self, _server: &Server) {}
}

pub type StrategyRef = Arc<dyn Strategy>;
