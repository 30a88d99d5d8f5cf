use crate::auth::token::ClaimTokens;
use crate::mesh::driver::DriverHandle;
use crate::mesh::replicator::Replicator;
use crate::mesh::MeshState;
use crate::store::RecordStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-global state shared by every connection handler. Built once
/// during bootstrap, torn down in reverse order at shutdown.
pub struct ServerContext {
    pub store: Arc<RecordStore>,
    pub tokens: Arc<dyn ClaimTokens>,
    pub mesh: Arc<MeshState>,
    pub replicator: Arc<dyn Replicator>,
    /// Present only when a mesh is configured.
    pub driver: Option<DriverHandle>,
    pub buffer_cap: usize,
    pub idle_timeout: Option<Duration>,
    /// Honor 5-element metadata frames on the TLS transport.
    pub accept_frame_metadata: bool,
    pub started_at: Instant,
}

impl ServerContext {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
