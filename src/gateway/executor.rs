//! Command execution entry points.
//!
//! `execute-command` runs one command through the queue and answers with a
//! `command-result` event correlated by `executionId`. Kill commands get a
//! dedicated workflow: run, inspect stderr for permission failures, verify
//! the target actually died, and refresh the process table for the client.
//!
//! `execute-batch` partitions commands into chunks of three; chunks run
//! sequentially while the members of a chunk go through the queue
//! concurrently, so a batch cannot starve interactive work.

use std::sync::Arc;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::gateway::config::BATCH_CHUNK_SIZE;
use crate::gateway::context::GatewayContext;
use crate::gateway::error;
use crate::gateway::queue::CommandSpec;
use crate::gateway::session::{Session, destroy_session};
use crate::gateway::transport::EventSink;
use crate::gateway::types::{
    BatchEntryResult, ExecuteBatchRequest, ExecuteCommandRequest, ServerEvent,
};

/// `kill -<sig> <pid>`, optionally under sudo.
static KILL_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(sudo\s+)?kill\s+-\d+\s+(\d+)$").expect("valid kill pattern"));

/// Match a kill command and extract the target pid.
pub(crate) fn kill_target(command: &str) -> Option<u32> {
    KILL_COMMAND
        .captures(command.trim())
        .and_then(|captures| captures.get(2))
        .and_then(|pid| pid.as_str().parse().ok())
}

/// Decide from the verification probe whether the process died.
///
/// The probe is `ps -p <pid> > /dev/null 2>&1; echo $?`: a `0` means the
/// process still exists.
pub(crate) fn kill_verified(probe_output: &str) -> bool {
    probe_output
        .trim()
        .parse::<i32>()
        .map(|status| status != 0)
        .unwrap_or(false)
}

/// Stderr fragments indicating the kill needs elevation.
const ELEVATION_MARKERS: &[&str] = &["Operation not permitted", "Permission denied"];

pub(crate) fn needs_elevation(stderr: &str) -> bool {
    ELEVATION_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Handle an `execute-command` event.
pub async fn execute_command(
    ctx: &Arc<GatewayContext>,
    sink: &Arc<dyn EventSink>,
    transport_id: &str,
    request: ExecuteCommandRequest,
) {
    let background = request.background;
    let respond_error = |message: &str| {
        sink.emit(ServerEvent::CommandResult {
            execution_id: request.execution_id.clone(),
            error: Some(message.to_string()),
            output: String::new(),
            error_output: String::new(),
            background,
        });
    };

    let Some(session) = ctx.registry.lookup(transport_id) else {
        respond_error("No active SSH session");
        return;
    };
    if !session.is_authenticated() {
        respond_error("Session is not authenticated");
        return;
    }

    let command = request.command.as_deref().unwrap_or("").trim().to_string();
    if command.is_empty() {
        respond_error("Missing command");
        return;
    }

    session.note_command();

    if let Some(pid) = kill_target(&command) {
        kill_workflow(ctx, &session, &command, pid).await;
        return;
    }

    let spec = CommandSpec {
        session_id: session.id().to_string(),
        command: command.clone(),
        background,
        stream_partial: request.stream,
        execution_id: request.execution_id.clone(),
        sink: Some(sink.clone()),
    };
    debug!(
        "Session {} executing '{}' (background={})",
        session.id(),
        command,
        background
    );
    let outcome = ctx.queue.submit(spec).await;

    // A channel failure leaves the connection usable; only a dead SSH
    // connection takes the session with it.
    let fatal = outcome
        .error
        .as_deref()
        .is_some_and(|e| error::is_session_fatal(error::classify(e)));

    sink.emit(ServerEvent::CommandResult {
        execution_id: request.execution_id,
        error: outcome.error,
        output: outcome.output,
        error_output: outcome.error_output,
        background: outcome.background,
    });

    if fatal {
        warn!(
            "Session {} lost its SSH connection during command execution",
            session.id()
        );
        session.emit(ServerEvent::Closed {
            message: "SSH connection lost".to_string(),
        });
        destroy_session(ctx, &session).await;
    }
}

/// Kill workflow: run the kill, surface permission problems, verify the
/// process is gone, then push a fresh process table.
async fn kill_workflow(ctx: &Arc<GatewayContext>, session: &Arc<Session>, command: &str, pid: u32) {
    info!("Session {} kill workflow for pid {}", session.id(), pid);

    let outcome = ctx
        .queue
        .submit(CommandSpec::foreground(session.id(), command))
        .await;

    if needs_elevation(&outcome.error_output) {
        let error = outcome.error_output.trim().to_string();
        session.emit(ServerEvent::CommandError {
            command: command.to_string(),
            error,
            needs_elevation: true,
        });
        session.emit(ServerEvent::Data(format!(
            "\r\n\x1b[31mNeed sudo privileges to kill process {}\x1b[0m\r\n",
            pid
        )));
        return;
    }

    let probe = ctx
        .queue
        .submit(CommandSpec::background(
            session.id(),
            format!("ps -p {} > /dev/null 2>&1; echo $?", pid),
        ))
        .await;
    let success = probe.error.is_none() && kill_verified(&probe.output);

    session.emit(ServerEvent::ProcessKilled { pid, success });
    if success {
        session.emit(ServerEvent::Data(format!(
            "\r\n\x1b[32mProcess {} terminated\x1b[0m\r\n",
            pid
        )));
    } else {
        session.emit(ServerEvent::Data(format!(
            "\r\n\x1b[31mProcess {} is still running\x1b[0m\r\n",
            pid
        )));
    }

    let stats = ctx
        .queue
        .submit(CommandSpec::background(
            session.id(),
            "ps aux --sort=-%cpu | head -20",
        ))
        .await;
    if stats.error.is_none() {
        session.emit(ServerEvent::ProcessStatsUpdate {
            data: stats.output,
        });
    }
}

/// Handle an `execute-batch` event.
pub async fn execute_batch(
    ctx: &Arc<GatewayContext>,
    sink: &Arc<dyn EventSink>,
    transport_id: &str,
    request: ExecuteBatchRequest,
) {
    let batch_id = request.batch_id.clone().unwrap_or_default();
    let background = request.background;

    let session = match ctx.registry.lookup(transport_id) {
        Some(session) if session.is_authenticated() => session,
        _ => {
            sink.emit(ServerEvent::CommandBatchResult {
                batch_id,
                results: Vec::new(),
                error: Some("No active SSH session".to_string()),
                background,
            });
            return;
        }
    };

    session.note_command();
    info!(
        "Session {} executing batch '{}' of {} command(s)",
        session.id(),
        batch_id,
        request.commands.len()
    );

    let mut results = Vec::with_capacity(request.commands.len());
    for chunk in request.commands.chunks(BATCH_CHUNK_SIZE) {
        let chunk_futures: Vec<_> = chunk
            .iter()
            .map(|command| {
                let queue = ctx.queue.clone();
                let session_id = session.id().to_string();
                let command = command.clone();
                async move {
                    let spec = if background {
                        CommandSpec::background(&session_id, &command)
                    } else {
                        CommandSpec::foreground(&session_id, &command)
                    };
                    let outcome = queue.submit(spec).await;
                    BatchEntryResult {
                        command,
                        output: outcome.output,
                        error: outcome.error,
                        background,
                    }
                }
            })
            .collect();
        results.extend(join_all(chunk_futures).await);
    }

    session.emit(ServerEvent::CommandBatchResult {
        batch_id,
        results,
        error: None,
        background,
    });
}
