//! Process-wide gateway context.
//!
//! The queue, the registry, and the pending-connect table are explicit
//! singletons with defined ownership, passed around as one `Arc` handle
//! rather than hidden globals. Handlers, the janitor, and the HTTP layer
//! all see the same instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::gateway::config::GatewayConfig;
use crate::gateway::exec::SshExecRunner;
use crate::gateway::queue::CommandQueue;
use crate::gateway::registry::SessionRegistry;

/// Shared state for the whole gateway process.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub registry: Arc<SessionRegistry>,
    pub queue: CommandQueue,
    /// Connect attempts that have not authenticated yet, keyed by the
    /// provisional session id. The janitor cancels these under memory
    /// pressure; authenticated sessions are never evicted that way.
    pub pending: DashMap<String, CancellationToken>,
    /// First-use host key fingerprint cache shared by all handshakes.
    pub host_fingerprints: Arc<DashMap<String, String>>,
    started_at: Instant,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let runner = Arc::new(SshExecRunner::new(registry.clone(), config.command_timeout));
        let queue = CommandQueue::new(config.queue.clone(), runner);
        Arc::new(Self {
            config,
            registry,
            queue,
            pending: DashMap::new(),
            host_fingerprints: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
