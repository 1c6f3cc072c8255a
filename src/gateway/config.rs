//! Configuration resolution for the SSH gateway.
//!
//! Values come from the environment with built-in defaults:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORT` / `SSH_SERVER_PORT` | 3001 | HTTP listen port (`PORT` wins) |
//! | `HOST` | `0.0.0.0` | HTTP listen address |
//! | `CORS_ORIGIN` | unset | Allowed origin(s), single URL or CSV |
//! | `NODE_ENV` | `development` | Deployment environment label |
//! | `PRODUCTION_URL` | unset | Extra allowed origin in production |
//! | `SSH_MAX_CONCURRENT_COMMANDS` | 3 | Concurrent exec channels across the process |
//! | `SSH_COMMAND_DELAY_MS` | 300 | Delay between queued command completions |
//! | `SSH_QUEUE_MAX_PENDING` | 256 | Pending queue bound; overflow is rejected |
//! | `SSH_COMMAND_TIMEOUT` | 180 | Exec command timeout in seconds |
//! | `SSH_HOST_KEY_POLICY` | `tofu` | `accept-all`, `tofu` or `pinned` |
//! | `SSH_PINNED_HOST_KEYS` | unset | CSV of SHA256 fingerprints for `pinned` |

use std::env;
use std::time::Duration;

use crate::gateway::queue::QueueSettings;
use crate::gateway::session::HostKeyPolicy;

/// Default HTTP listen port
pub(crate) const DEFAULT_LISTEN_PORT: u16 = 3001;

/// Default HTTP listen address
pub(crate) const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Default cap on concurrent SSH exec channels
pub(crate) const DEFAULT_MAX_CONCURRENT_COMMANDS: usize = 3;

/// Default delay between the completion of one queued command and the next
pub(crate) const DEFAULT_COMMAND_DELAY_MS: u64 = 300;

/// Default bound on pending queue entries
pub(crate) const DEFAULT_QUEUE_MAX_PENDING: usize = 256;

/// Default exec command timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// SSH handshake (dial) timeout
pub(crate) const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard ceiling on the whole dial-and-authenticate sequence
pub(crate) const AUTH_HARD_TIMEOUT: Duration = Duration::from_secs(15);

/// Progress-log interval while a connection is still unauthenticated
pub(crate) const AUTH_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// SSH-level keepalive interval
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Missed keepalives tolerated before the connection is considered dead
pub(crate) const KEEPALIVE_MAX: usize = 3;

/// Channel budget per SSH connection: queue slots plus the shell channel
/// must stay under this figure to avoid CHANNEL_OPEN_FAILURE.
#[allow(dead_code)]
pub(crate) const MAX_SESSION_CHANNELS: usize = 6;

/// Timeout for opening the PTY shell channel
pub(crate) const SHELL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle window for coalescing shell output into one `data` event
pub(crate) const OUTPUT_COALESCE_INTERVAL: Duration = Duration::from_millis(50);

/// Gateway-to-client heartbeat interval
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between shell open and the first monitoring tick
pub(crate) const MONITORING_STARTUP_DELAY: Duration = Duration::from_secs(2);

/// Monitoring probe interval
pub(crate) const MONITORING_INTERVAL: Duration = Duration::from_secs(1);

/// Janitor idle-expiry scan interval
pub(crate) const IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(600);

/// Sessions idle longer than this are destroyed by the janitor
pub(crate) const IDLE_SESSION_MAX_AGE: Duration = Duration::from_secs(1800);

/// Janitor memory-pressure scan interval
pub(crate) const MEMORY_SCAN_INTERVAL: Duration = Duration::from_secs(120);

/// Resident-set threshold above which unauthenticated connects are evicted
pub(crate) const MEMORY_PRESSURE_LIMIT_BYTES: u64 = 800 * 1024 * 1024;

/// Batch commands are processed in sequential chunks of this size
pub(crate) const BATCH_CHUNK_SIZE: usize = 3;

/// Terminal type requested for the PTY
pub(crate) const DEFAULT_TERM: &str = "xterm-256color";

/// Default terminal dimensions
pub(crate) const DEFAULT_COLS: u32 = 80;
pub(crate) const DEFAULT_ROWS: u32 = 24;

/// Resolved gateway configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub cors_origins: Vec<String>,
    pub node_env: String,
    pub production_url: Option<String>,
    pub queue: QueueSettings,
    pub command_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
}

impl GatewayConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            listen_host: resolve_listen_host(),
            listen_port: resolve_listen_port(),
            cors_origins: resolve_cors_origins(),
            node_env: resolve_node_env(),
            production_url: env::var("PRODUCTION_URL").ok().filter(|v| !v.is_empty()),
            queue: QueueSettings {
                max_concurrent: resolve_max_concurrent(),
                inter_command_delay: Duration::from_millis(resolve_command_delay_ms()),
                max_pending: resolve_queue_max_pending(),
            },
            command_timeout: Duration::from_secs(resolve_command_timeout()),
            host_key_policy: resolve_host_key_policy(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            cors_origins: Vec::new(),
            node_env: "development".to_string(),
            production_url: None,
            queue: QueueSettings::default(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            host_key_policy: HostKeyPolicy::TrustOnFirstUse,
        }
    }
}

/// Resolve the listen port: `PORT`, then `SSH_SERVER_PORT`, then the default.
pub(crate) fn resolve_listen_port() -> u16 {
    for var in ["PORT", "SSH_SERVER_PORT"] {
        if let Ok(raw) = env::var(var)
            && let Ok(port) = raw.parse::<u16>()
        {
            return port;
        }
    }
    DEFAULT_LISTEN_PORT
}

/// Resolve the listen address from `HOST`.
pub(crate) fn resolve_listen_host() -> String {
    env::var("HOST")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string())
}

/// Resolve allowed CORS origins from `CORS_ORIGIN` (single URL or CSV),
/// adding `PRODUCTION_URL` when `NODE_ENV` is `production`.
pub(crate) fn resolve_cors_origins() -> Vec<String> {
    let mut origins: Vec<String> = env::var("CORS_ORIGIN")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if resolve_node_env() == "production"
        && let Ok(url) = env::var("PRODUCTION_URL")
        && !url.is_empty()
        && !origins.contains(&url)
    {
        origins.push(url);
    }

    origins
}

/// Resolve the deployment environment label from `NODE_ENV`.
pub(crate) fn resolve_node_env() -> String {
    env::var("NODE_ENV")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "development".to_string())
}

/// Resolve the concurrent-command cap from `SSH_MAX_CONCURRENT_COMMANDS`.
pub(crate) fn resolve_max_concurrent() -> usize {
    if let Ok(raw) = env::var("SSH_MAX_CONCURRENT_COMMANDS")
        && let Ok(value) = raw.parse::<usize>()
        && value > 0
    {
        return value;
    }
    DEFAULT_MAX_CONCURRENT_COMMANDS
}

/// Resolve the inter-command delay from `SSH_COMMAND_DELAY_MS`.
pub(crate) fn resolve_command_delay_ms() -> u64 {
    if let Ok(raw) = env::var("SSH_COMMAND_DELAY_MS")
        && let Ok(value) = raw.parse::<u64>()
    {
        return value;
    }
    DEFAULT_COMMAND_DELAY_MS
}

/// Resolve the pending-queue bound from `SSH_QUEUE_MAX_PENDING`.
pub(crate) fn resolve_queue_max_pending() -> usize {
    if let Ok(raw) = env::var("SSH_QUEUE_MAX_PENDING")
        && let Ok(value) = raw.parse::<usize>()
        && value > 0
    {
        return value;
    }
    DEFAULT_QUEUE_MAX_PENDING
}

/// Resolve the exec command timeout from `SSH_COMMAND_TIMEOUT` (seconds).
pub(crate) fn resolve_command_timeout() -> u64 {
    if let Ok(raw) = env::var("SSH_COMMAND_TIMEOUT")
        && let Ok(value) = raw.parse::<u64>()
        && value > 0
    {
        return value;
    }
    DEFAULT_COMMAND_TIMEOUT_SECS
}

/// Resolve the host key policy from `SSH_HOST_KEY_POLICY` and
/// `SSH_PINNED_HOST_KEYS`.
pub(crate) fn resolve_host_key_policy() -> HostKeyPolicy {
    match env::var("SSH_HOST_KEY_POLICY").as_deref() {
        Ok("accept-all") => HostKeyPolicy::AcceptAll,
        Ok("pinned") => {
            let pins: Vec<String> = env::var("SSH_PINNED_HOST_KEYS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            HostKeyPolicy::Pinned(pins)
        }
        _ => HostKeyPolicy::TrustOnFirstUse,
    }
}
