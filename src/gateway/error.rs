//! Error classification for the gateway core.
//!
//! Errors travel as strings with context (the russh layer reports strings
//! anyway); this module classifies them to decide how far recovery has to
//! go. Only authentication and transport failures are fatal to a session:
//! a failed exec channel or shell open leaves the SSH connection usable.
//!
//! # Kinds
//!
//! - **Validation**: bad client input; reject with an `error` event, no
//!   state change.
//! - **Auth**: authentication denied or timed out; the session is destroyed.
//! - **Transport**: the SSH connection itself dropped; the session is
//!   destroyed.
//! - **Channel**: a single channel failed (exec, PTY, shell); the session
//!   survives.
//! - **Internal**: anything unexpected; logged and surfaced, session kept
//!   unless the SSH client is unusable.

/// Classification of a gateway error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    Transport,
    Channel,
    Internal,
}

/// Input validation failures.
const VALIDATION_ERRORS: &[&str] = &[
    "missing required",
    "invalid private key",
    "invalid terminal dimensions",
    "missing command",
];

/// Authentication failures; always fatal to the session.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication timeout",
    "authentication rejected",
    "permission denied",
    "no authentication methods",
    "all authentication methods failed",
];

/// Connection-level failures; the SSH client is gone.
const TRANSPORT_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "connection closed",
    "network is unreachable",
    "no route to host",
    "broken pipe",
    "disconnected",
    "keepalive",
    "failed to connect",
];

/// Single-channel failures; the session survives.
const CHANNEL_ERRORS: &[&str] = &[
    "channel open failure",
    "failed to open channel",
    "failed to open shell",
    "pty request failed",
    "shell request failed",
    "exited with code",
    "command timed out",
    "queue is full",
];

/// Classify an error message into an [`ErrorKind`].
///
/// Validation is checked first (it never touches the SSH side), then auth
/// (which takes precedence over connection keywords, mirroring the retry
/// classifier this grew out of), then transport, then channel. Anything
/// unmatched is internal.
pub fn classify(error: &str) -> ErrorKind {
    let error_lower = error.to_lowercase();

    for pattern in VALIDATION_ERRORS {
        if error_lower.contains(pattern) {
            return ErrorKind::Validation;
        }
    }

    for pattern in AUTH_ERRORS {
        if error_lower.contains(pattern) {
            return ErrorKind::Auth;
        }
    }

    for pattern in TRANSPORT_ERRORS {
        if error_lower.contains(pattern) {
            return ErrorKind::Transport;
        }
    }

    for pattern in CHANNEL_ERRORS {
        if error_lower.contains(pattern) {
            return ErrorKind::Channel;
        }
    }

    ErrorKind::Internal
}

/// Whether an error of this kind requires destroying the session.
pub fn is_session_fatal(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Auth | ErrorKind::Transport)
}
