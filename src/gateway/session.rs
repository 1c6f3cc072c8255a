//! Session entity and host key policy.
//!
//! A [`Session`] is the lifetime of one authenticated SSH connection. It
//! owns the russh handle exclusively, tracks the currently bound client
//! transport, and carries the activity stamps the janitor uses for expiry.
//! All timers scoped to a session hang off its cancellation token, so
//! nothing can fire after teardown.
//!
//! Destruction is idempotent: the first caller wins the [`Teardown`] guard,
//! later calls are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use russh::keys::HashAlg;
use russh::{Disconnect, client, keys};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::config::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::gateway::context::GatewayContext;
use crate::gateway::shell::{ShellCommand, ShellHandle};
use crate::gateway::transport::{EventOutlet, EventSink};
use crate::gateway::types::ServerEvent;

/// How the gateway treats a server host key during the handshake.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Accept any key (`StrictHostKeyChecking=no`). A documented weakness,
    /// kept available for lab environments.
    AcceptAll,
    /// Cache the first fingerprint seen per host for the process lifetime
    /// and require it to match thereafter.
    TrustOnFirstUse,
    /// Only accept keys whose SHA256 fingerprint is in the configured set.
    Pinned(Vec<String>),
}

/// Decide whether a host key fingerprint is acceptable under a policy.
///
/// `seen` is the process-wide first-use cache keyed by `host:port`.
pub(crate) fn evaluate_host_key(
    policy: &HostKeyPolicy,
    seen: &DashMap<String, String>,
    host: &str,
    fingerprint: &str,
) -> bool {
    match policy {
        HostKeyPolicy::AcceptAll => true,
        HostKeyPolicy::TrustOnFirstUse => match seen.get(host) {
            Some(known) => known.value() == fingerprint,
            None => {
                seen.insert(host.to_string(), fingerprint.to_string());
                true
            }
        },
        HostKeyPolicy::Pinned(pins) => pins.iter().any(|pin| pin == fingerprint),
    }
}

/// russh client handler carrying the host key policy.
pub struct GatewayClientHandler {
    host: String,
    policy: HostKeyPolicy,
    seen: Arc<DashMap<String, String>>,
}

impl GatewayClientHandler {
    pub fn new(host: impl Into<String>, policy: HostKeyPolicy, seen: Arc<DashMap<String, String>>) -> Self {
        Self {
            host: host.into(),
            policy,
            seen,
        }
    }
}

impl client::Handler for GatewayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let accepted = evaluate_host_key(&self.policy, &self.seen, &self.host, &fingerprint);
        if accepted {
            debug!("Host key for {} accepted ({})", self.host, fingerprint);
        } else {
            warn!(
                "Host key for {} rejected by policy {:?} ({})",
                self.host, self.policy, fingerprint
            );
        }
        Ok(accepted)
    }
}

/// One-shot destruction guard.
///
/// The first `begin()` returns true and flips the flag; every later call
/// returns false. Keeps teardown idempotent without locks.
pub(crate) struct Teardown {
    destroyed: AtomicBool,
}

impl Teardown {
    pub(crate) fn new() -> Self {
        Self {
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// One authenticated (or authenticating) SSH connection.
pub struct Session {
    session_id: String,
    host: String,
    port: u16,
    username: String,
    handle: Arc<client::Handle<GatewayClientHandler>>,
    outlet: EventOutlet,
    transport_id: StdMutex<Option<String>>,
    shell: StdMutex<Option<ShellHandle>>,
    dims: StdMutex<(u32, u32)>,
    authenticated: AtomicBool,
    running_background: AtomicBool,
    teardown: Teardown,
    cancel: CancellationToken,
    created_at: Instant,
    last_activity: StdMutex<Instant>,
    last_command_at: StdMutex<Option<Instant>>,
}

impl Session {
    pub fn new(
        session_id: String,
        host: String,
        port: u16,
        username: String,
        handle: client::Handle<GatewayClientHandler>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            session_id,
            host,
            port,
            username,
            handle: Arc::new(handle),
            outlet: EventOutlet::new(sink),
            transport_id: StdMutex::new(None),
            shell: StdMutex::new(None),
            dims: StdMutex::new((DEFAULT_COLS, DEFAULT_ROWS)),
            authenticated: AtomicBool::new(false),
            running_background: AtomicBool::new(false),
            teardown: Teardown::new(),
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
            last_activity: StdMutex::new(Instant::now()),
            last_command_at: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn handle(&self) -> &Arc<client::Handle<GatewayClientHandler>> {
        &self.handle
    }

    /// Emit an event to whichever transport is currently bound.
    pub fn emit(&self, event: ServerEvent) {
        self.outlet.emit(event);
    }

    /// Swap the event sink, detaching the previous transport. Output after
    /// this point reaches the new transport only.
    pub fn replace_sink(&self, sink: Arc<dyn EventSink>) {
        self.outlet.replace(sink);
    }

    pub fn bind_transport(&self, transport_id: Option<String>) {
        *self.transport_id.lock().expect("session lock poisoned") = transport_id;
    }

    pub fn transport_id(&self) -> Option<String> {
        self.transport_id
            .lock()
            .expect("session lock poisoned")
            .clone()
    }

    /// Install a shell handle, returning the previous one if present.
    pub fn install_shell(&self, shell: ShellHandle) -> Option<ShellHandle> {
        self.shell
            .lock()
            .expect("session lock poisoned")
            .replace(shell)
    }

    pub fn take_shell(&self) -> Option<ShellHandle> {
        self.shell.lock().expect("session lock poisoned").take()
    }

    /// Clone of the mailbox sender for the current shell, if one is open.
    pub fn shell_sender(&self) -> Option<tokio::sync::mpsc::Sender<ShellCommand>> {
        self.shell
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|shell| shell.tx.clone())
    }

    pub fn set_dims(&self, cols: u32, rows: u32) {
        *self.dims.lock().expect("session lock poisoned") = (cols, rows);
    }

    pub fn dims(&self) -> (u32, u32) {
        *self.dims.lock().expect("session lock poisoned")
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_running_background(&self, value: bool) {
        self.running_background.store(value, Ordering::SeqCst);
    }

    /// True while the currently executing queued command is background;
    /// the shell streamer suppresses terminal output in that window.
    pub fn running_background(&self) -> bool {
        self.running_background.load(Ordering::SeqCst)
    }

    /// Record activity; the janitor expires sessions by this stamp.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("session lock poisoned")
            .elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Throttling hint: stamp of the last command accepted for this session.
    pub fn note_command(&self) {
        *self.last_command_at.lock().expect("session lock poisoned") = Some(Instant::now());
    }

    pub fn last_command_at(&self) -> Option<Instant> {
        *self.last_command_at.lock().expect("session lock poisoned")
    }

    /// Token that all session-scoped timers and loops are children of.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_destroyed(&self) -> bool {
        self.teardown.is_destroyed()
    }

    pub(crate) fn begin_teardown(&self) -> bool {
        self.teardown.begin()
    }
}

/// Tear a session down: cancel its timers, drop its pending queue entries,
/// remove it from the registry, close the shell channel, then the SSH
/// connection. Safe to call any number of times.
pub async fn destroy_session(ctx: &Arc<GatewayContext>, session: &Arc<Session>) {
    if !session.begin_teardown() {
        return;
    }

    info!(
        "Destroying session {} ({}@{}:{})",
        session.id(),
        session.username(),
        session.host(),
        session.port()
    );

    session.cancel_token().cancel();
    ctx.queue.clear_session(session.id());
    ctx.registry.remove(session.id());

    // Shell channel goes before the SSH client.
    if let Some(shell) = session.take_shell() {
        shell.cancel.cancel();
        let _ = shell.tx.send(ShellCommand::Close).await;
    }

    if let Err(e) = session
        .handle()
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        debug!("Disconnect for session {} returned: {}", session.id(), e);
    }
}
