//! Interactive shell streaming.
//!
//! One task owns the PTY channel for its whole life. It selects over the
//! input mailbox (keystrokes, resizes, close), channel messages, the
//! output-coalescing deadline, and the session cancel token, so every
//! mutation of the channel happens from a single place.
//!
//! Output handling:
//!
//! - stdout is coalesced for 50 ms and flushed as one `data` event; byte
//!   order across windows is preserved. While the session is running a
//!   background command the window's bytes are discarded instead (exec
//!   output never belongs on the terminal).
//! - stderr (`ext == 1`) is emitted immediately as `error-data`.
//! - channel close flushes whatever is buffered, emits `closed` with the
//!   exit code or signal, and tears the session down.
//!
//! After the shell opens, two init probes run through the queue as
//! background commands, and two seconds later the monitoring loop starts
//! emitting `monitoring-data` once per second. The monitor also runs
//! through the queue, so it can never exhaust the channel budget.

use std::sync::Arc;

use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::config::{
    DEFAULT_TERM, MONITORING_INTERVAL, MONITORING_STARTUP_DELAY, OUTPUT_COALESCE_INTERVAL,
    SHELL_OPEN_TIMEOUT,
};
use crate::gateway::context::GatewayContext;
use crate::gateway::queue::CommandSpec;
use crate::gateway::session::{Session, destroy_session};
use crate::gateway::types::{MetricValue, ServerEvent, SystemStats};

/// Commands accepted by the shell owner task.
#[derive(Debug)]
pub enum ShellCommand {
    /// Raw input bytes for the PTY.
    Data(Vec<u8>),
    /// SIGWINCH the remote terminal.
    Resize(u32, u32),
    /// Close the channel and end the task.
    Close,
}

/// Handle to a running shell: the mailbox plus its cancel token.
pub struct ShellHandle {
    pub tx: mpsc::Sender<ShellCommand>,
    pub cancel: CancellationToken,
}

/// Buffers stdout between flushes, discarding background-window bytes.
pub(crate) struct OutputCoalescer {
    buf: Vec<u8>,
}

impl OutputCoalescer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Append a chunk unless suppressed. Returns true when the chunk was
    /// buffered and a flush should be scheduled.
    pub(crate) fn push(&mut self, data: &[u8], suppress: bool) -> bool {
        if suppress {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain the buffer as lossy UTF-8 terminal text.
    pub(crate) fn take_text(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned()
    }
}

/// Open the shell and attach init probes and the monitoring loop.
///
/// Called once per session after authentication.
pub async fn start(ctx: &Arc<GatewayContext>, session: &Arc<Session>) -> Result<(), String> {
    open_shell(ctx, session).await?;
    spawn_init_commands(ctx, session);
    spawn_monitoring(ctx.clone(), session.clone());
    Ok(())
}

/// Open a PTY shell channel at the session's current dimensions.
pub async fn open_shell(ctx: &Arc<GatewayContext>, session: &Arc<Session>) -> Result<(), String> {
    let (cols, rows) = session.dims();

    let channel = tokio::time::timeout(SHELL_OPEN_TIMEOUT, async {
        let channel = session
            .handle()
            .channel_open_session()
            .await
            .map_err(|e| format!("Failed to open shell: {}", e))?;
        channel
            .request_pty(false, DEFAULT_TERM, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| format!("PTY request failed: {}", e))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| format!("Shell request failed: {}", e))?;
        Ok::<_, String>(channel)
    })
    .await
    .map_err(|_| "Failed to open shell: timed out".to_string())??;

    info!(
        "Shell opened for session {} ({}x{}, {})",
        session.id(),
        cols,
        rows,
        DEFAULT_TERM
    );

    let (tx, rx) = mpsc::channel(64);
    let cancel = session.cancel_token().child_token();
    if let Some(old) = session.install_shell(ShellHandle {
        tx,
        cancel: cancel.clone(),
    }) {
        old.cancel.cancel();
    }

    tokio::spawn(shell_loop(ctx.clone(), session.clone(), channel, rx, cancel));
    Ok(())
}

/// Replace the current shell channel with a fresh one at current dims.
pub async fn restart_shell(ctx: &Arc<GatewayContext>, session: &Arc<Session>) -> Result<(), String> {
    if let Some(old) = session.take_shell() {
        old.cancel.cancel();
        let _ = old.tx.send(ShellCommand::Close).await;
    }
    open_shell(ctx, session).await
}

async fn shell_loop(
    ctx: Arc<GatewayContext>,
    session: Arc<Session>,
    mut channel: russh::Channel<russh::client::Msg>,
    mut rx: mpsc::Receiver<ShellCommand>,
    cancel: CancellationToken,
) {
    let mut coalescer = OutputCoalescer::new();
    let mut deadline: Option<tokio::time::Instant> = None;
    let mut exit_code: Option<u32> = None;
    let mut exit_signal: Option<String> = None;
    let mut remote_closed = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = channel.eof().await;
                break;
            }

            command = rx.recv() => match command {
                Some(ShellCommand::Data(data)) => {
                    session.touch();
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("Input write for session {} failed: {}", session.id(), e);
                        remote_closed = true;
                        break;
                    }
                }
                Some(ShellCommand::Resize(cols, rows)) => {
                    if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                        warn!("Resize for session {} failed: {}", session.id(), e);
                    } else {
                        debug!("Session {} pty resized to {}x{}", session.id(), cols, rows);
                    }
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    break;
                }
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                if deadline.is_some() =>
            {
                if !coalescer.is_empty() {
                    session.emit(ServerEvent::Data(coalescer.take_text()));
                }
                deadline = None;
            }

            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    session.touch();
                    if coalescer.push(&data, session.running_background()) {
                        deadline = Some(tokio::time::Instant::now() + OUTPUT_COALESCE_INTERVAL);
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        session.emit(ServerEvent::ErrorData(
                            String::from_utf8_lossy(&data).into_owned(),
                        ));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    exit_signal = Some(format!("{:?}", signal_name));
                }
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => {
                    remote_closed = true;
                    break;
                }
                Some(_) => {}
            },
        }
    }

    if !coalescer.is_empty() {
        session.emit(ServerEvent::Data(coalescer.take_text()));
    }

    if remote_closed {
        info!(
            "Shell channel for session {} closed (code {:?}, signal {:?})",
            session.id(),
            exit_code,
            exit_signal
        );
        session.emit(ServerEvent::Closed {
            message: close_message(exit_code, exit_signal.as_deref()),
        });
        destroy_session(&ctx, &session).await;
    }
}

pub(crate) fn close_message(exit_code: Option<u32>, exit_signal: Option<&str>) -> String {
    match (exit_code, exit_signal) {
        (Some(code), _) => format!("Shell closed (exit code {})", code),
        (None, Some(signal)) => format!("Shell closed (signal {})", signal),
        (None, None) => "Shell closed".to_string(),
    }
}

/// Init probes run right after the shell opens; results surface as
/// `system-info` events rather than terminal bytes.
const INIT_COMMANDS: &[(&str, &str)] = &[("uname", "uname -a"), ("uptime", "uptime")];

fn spawn_init_commands(ctx: &Arc<GatewayContext>, session: &Arc<Session>) {
    for (kind, command) in INIT_COMMANDS {
        let queue = ctx.queue.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let outcome = queue
                .submit(CommandSpec::background(session.id(), *command))
                .await;
            match outcome.error {
                None => session.emit(ServerEvent::SystemInfo {
                    kind: (*kind).to_string(),
                    data: outcome.output,
                }),
                Some(e) => debug!("Init probe '{}' failed: {}", command, e),
            }
        });
    }
}

/// CPU utilization percentage across all cores.
const CPU_PROBE: &str = r#"top -bn1 | grep "Cpu(s)" | awk '{print $2 + $4}'"#;

/// Used-memory percentage.
const MEMORY_PROBE: &str = r#"free -m | awk 'NR==2{printf "%.1f", $3*100/$2}'"#;

/// Periodic diagnostics. Both probes are queued as background commands so
/// the monitor shares the channel budget with everything else.
fn spawn_monitoring(ctx: Arc<GatewayContext>, session: Arc<Session>) {
    let cancel = session.cancel_token().child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(MONITORING_STARTUP_DELAY) => {}
        }

        let mut ticker = tokio::time::interval(MONITORING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if session.is_destroyed() || !ctx.registry.contains(session.id()) {
                        break;
                    }
                    let cpu = ctx.queue
                        .submit(CommandSpec::background(session.id(), CPU_PROBE))
                        .await;
                    let memory = ctx.queue
                        .submit(CommandSpec::background(session.id(), MEMORY_PROBE))
                        .await;

                    let (Some(cpu), Some(memory)) = (metric_of(&cpu.error, &cpu.output), metric_of(&memory.error, &memory.output)) else {
                        continue;
                    };
                    session.emit(ServerEvent::MonitoringData {
                        kind: "system-stats".to_string(),
                        stats: SystemStats {
                            cpu: MetricValue { value: cpu },
                            memory: MetricValue { value: memory },
                        },
                    });
                }
            }
        }
        debug!("Monitoring loop for session {} ended", session.id());
    });
}

fn metric_of(error: &Option<String>, output: &str) -> Option<f64> {
    if error.is_some() {
        return None;
    }
    parse_metric(output)
}

/// Parse a probe's numeric output; anything non-finite is discarded.
pub(crate) fn parse_metric(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod coalescer {
        use super::*;

        #[test]
        fn test_buffers_in_order() {
            let mut coalescer = OutputCoalescer::new();
            assert!(coalescer.push(b"hello ", false));
            assert!(coalescer.push(b"world", false));
            assert_eq!(coalescer.take_text(), "hello world");
            assert!(coalescer.is_empty());
        }

        #[test]
        fn test_background_window_is_discarded() {
            let mut coalescer = OutputCoalescer::new();
            assert!(!coalescer.push(b"background noise", true));
            assert!(coalescer.is_empty());
        }

        #[test]
        fn test_suppression_only_affects_its_window() {
            let mut coalescer = OutputCoalescer::new();
            coalescer.push(b"before ", false);
            coalescer.push(b"SUPPRESSED", true);
            coalescer.push(b"after", false);
            assert_eq!(coalescer.take_text(), "before after");
        }

        #[test]
        fn test_take_drains() {
            let mut coalescer = OutputCoalescer::new();
            coalescer.push(b"once", false);
            assert_eq!(coalescer.take_text(), "once");
            assert_eq!(coalescer.take_text(), "");
        }

        #[test]
        fn test_lossy_utf8() {
            let mut coalescer = OutputCoalescer::new();
            coalescer.push(&[0x68, 0x69, 0xff], false);
            let text = coalescer.take_text();
            assert!(text.starts_with("hi"));
        }
    }

    mod metrics {
        use super::*;

        #[test]
        fn test_parses_plain_number() {
            assert_eq!(parse_metric("12.5\n"), Some(12.5));
            assert_eq!(parse_metric(" 40 "), Some(40.0));
        }

        #[test]
        fn test_rejects_garbage() {
            assert_eq!(parse_metric(""), None);
            assert_eq!(parse_metric("n/a"), None);
            assert_eq!(parse_metric("12.5%"), None);
        }

        #[test]
        fn test_rejects_non_finite() {
            assert_eq!(parse_metric("NaN"), None);
            assert_eq!(parse_metric("inf"), None);
        }
    }

    mod close_messages {
        use super::*;

        #[test]
        fn test_exit_code_wins() {
            assert_eq!(close_message(Some(0), None), "Shell closed (exit code 0)");
            assert_eq!(
                close_message(Some(130), Some("INT")),
                "Shell closed (exit code 130)"
            );
        }

        #[test]
        fn test_signal_without_code() {
            assert_eq!(
                close_message(None, Some("KILL")),
                "Shell closed (signal KILL)"
            );
        }

        #[test]
        fn test_bare_close() {
            assert_eq!(close_message(None, None), "Shell closed");
        }
    }
}
