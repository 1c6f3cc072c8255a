//! SSH exec channel runner.
//!
//! Runs one queued command on its session's SSH connection: opens an exec
//! channel, collects stdout/stderr, maps the exit status into the callback
//! outcome, and closes the channel gracefully so the connection stays
//! usable. A timeout returns the partial output collected so far rather
//! than failing the session.
//!
//! While the command runs, the session's running-background flag is set so
//! the shell streamer suppresses any terminal echo triggered by background
//! work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use tracing::warn;

use crate::gateway::queue::{CommandOutcome, CommandSpec, ExecRunner};
use crate::gateway::registry::SessionRegistry;
use crate::gateway::session::Session;
use crate::gateway::types::ServerEvent;

/// Production [`ExecRunner`] backed by russh exec channels.
pub struct SshExecRunner {
    registry: Arc<SessionRegistry>,
    command_timeout: Duration,
}

impl SshExecRunner {
    pub fn new(registry: Arc<SessionRegistry>, command_timeout: Duration) -> Self {
        Self {
            registry,
            command_timeout,
        }
    }

    async fn execute(&self, session: &Arc<Session>, spec: &CommandSpec) -> CommandOutcome {
        let mut channel = match session.handle().channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                return CommandOutcome::failed(
                    format!("Failed to open channel: {}", e),
                    spec.background,
                );
            }
        };

        if let Err(e) = channel.exec(true, spec.command.as_str()).await {
            let _ = channel.close().await;
            return CommandOutcome::failed(
                format!("Failed to execute command: {}", e),
                spec.background,
            );
        }

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;
        let mut timed_out = false;

        let collect = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        if spec.stream_partial && !spec.background
                            && let Some(sink) = &spec.sink
                        {
                            sink.emit(ServerEvent::CommandOutputStream {
                                execution_id: spec.execution_id.clone(),
                                output: String::from_utf8_lossy(&data).into_owned(),
                                partial: true,
                            });
                        }
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in the SSH protocol
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) => break,
                    Some(_) => {}
                    None => break,
                }
            }
        };

        if tokio::time::timeout(self.command_timeout, collect)
            .await
            .is_err()
        {
            timed_out = true;
            warn!(
                "Command timed out after {:?}, returning partial output ({} bytes stdout, {} bytes stderr)",
                self.command_timeout,
                stdout.len(),
                stderr.len()
            );
        }

        // Close gracefully to keep the session alive.
        let _ = channel.close().await;

        let error = if timed_out {
            Some(format!(
                "Command timed out after {} seconds",
                self.command_timeout.as_secs()
            ))
        } else {
            match exit_code {
                Some(code) if code != 0 => Some(format!("exited with code {}", code)),
                _ => None,
            }
        };

        CommandOutcome {
            error,
            output: String::from_utf8_lossy(&stdout).into_owned(),
            error_output: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.map(|code| code as i32),
            background: spec.background,
        }
    }
}

#[async_trait]
impl ExecRunner for SshExecRunner {
    async fn run(&self, spec: &CommandSpec) -> CommandOutcome {
        let Some(session) = self.registry.get(&spec.session_id) else {
            return CommandOutcome::failed("No active SSH session", spec.background);
        };

        session.set_running_background(spec.background);
        let outcome = self.execute(&session, spec).await;
        session.set_running_background(false);

        if outcome.error.is_none() {
            session.touch();
        }
        outcome
    }
}
