//! Wire event types for the client transport.
//!
//! Every frame on the transport is a JSON object `{event, payload}`. Inbound
//! frames deserialize into [`ClientEvent`], outbound frames serialize from
//! [`ServerEvent`]. Event names are kebab-case, payload fields camelCase, so
//! the browser side never has to translate.

use serde::{Deserialize, Serialize};

/// Events received from a client transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    CheckConnection(CheckConnectionRequest),
    Connect(ConnectRequest),
    ExecuteCommand(ExecuteCommandRequest),
    ExecuteBatch(ExecuteBatchRequest),
    RestartShell,
    Resize(ResizeRequest),
    Input(String),
    RefreshConnection,
    Disconnect,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConnectionRequest {
    pub session_id: String,
}

/// Connection parameters supplied by the client.
///
/// All fields are optional at the wire level so that a missing field produces
/// a validation error instead of a deserialization failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandRequest {
    pub command: Option<String>,
    #[serde(default)]
    pub background: bool,
    pub execution_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBatchRequest {
    #[serde(default)]
    pub commands: Vec<String>,
    pub batch_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResizeRequest {
    pub cols: u32,
    pub rows: u32,
}

/// Events emitted to a client transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { message: String, session_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectionExists { message: String, session_id: String },
    Error {
        message: String,
    },
    Ended {
        message: String,
    },
    Closed {
        message: String,
    },
    /// Terminal bytes, possibly containing ANSI sequences.
    Data(String),
    /// Stderr bytes from the shell channel, never batched.
    ErrorData(String),
    Heartbeat {
        timestamp: i64,
    },
    SystemInfo {
        #[serde(rename = "type")]
        kind: String,
        data: String,
    },
    MonitoringData {
        #[serde(rename = "type")]
        kind: String,
        stats: SystemStats,
    },
    #[serde(rename_all = "camelCase")]
    CommandOutputStream {
        execution_id: Option<String>,
        output: String,
        partial: bool,
    },
    #[serde(rename_all = "camelCase")]
    CommandResult {
        execution_id: Option<String>,
        error: Option<String>,
        output: String,
        error_output: String,
        background: bool,
    },
    #[serde(rename_all = "camelCase")]
    CommandBatchResult {
        batch_id: String,
        results: Vec<BatchEntryResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        background: bool,
    },
    #[serde(rename_all = "camelCase")]
    CommandError {
        command: String,
        error: String,
        needs_elevation: bool,
    },
    ProcessKilled {
        pid: u32,
        success: bool,
    },
    ProcessStatsUpdate {
        data: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu: MetricValue,
    pub memory: MetricValue,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricValue {
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntryResult {
    pub command: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub background: bool,
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub uptime: u64,
    pub memory: MemoryUsage,
    pub queued_commands: usize,
    pub running_commands: usize,
}

/// Process memory figures read from the OS.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss_bytes: u64,
    pub data_bytes: u64,
}

#[cfg(test)]
mod wire_format {
    use super::*;

    mod inbound {
        use super::*;

        #[test]
        fn test_connect_with_all_fields() {
            let frame = r#"{"event":"connect","payload":{"host":"example.com","port":22,"username":"deploy","privateKey":"-----BEGIN KEY-----","passphrase":"secret"}}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::Connect(req) => {
                    assert_eq!(req.host.as_deref(), Some("example.com"));
                    assert_eq!(req.port, Some(22));
                    assert_eq!(req.username.as_deref(), Some("deploy"));
                    assert_eq!(req.private_key.as_deref(), Some("-----BEGIN KEY-----"));
                    assert_eq!(req.passphrase.as_deref(), Some("secret"));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_connect_with_missing_private_key_still_parses() {
            // A missing field must surface as a validation error downstream,
            // not as a malformed frame.
            let frame = r#"{"event":"connect","payload":{"host":"h","port":22,"username":"u"}}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::Connect(req) => assert!(req.private_key.is_none()),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_execute_command_defaults() {
            let frame = r#"{"event":"execute-command","payload":{"command":"ls"}}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::ExecuteCommand(req) => {
                    assert_eq!(req.command.as_deref(), Some("ls"));
                    assert!(!req.background);
                    assert!(!req.stream);
                    assert!(req.execution_id.is_none());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_execute_batch() {
            let frame = r#"{"event":"execute-batch","payload":{"commands":["a","b"],"batchId":"b1","sessionId":"s1","background":true}}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::ExecuteBatch(req) => {
                    assert_eq!(req.commands, vec!["a", "b"]);
                    assert_eq!(req.batch_id.as_deref(), Some("b1"));
                    assert!(req.background);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_input_is_raw_string() {
            let frame = r#"{"event":"input","payload":"ls -la\n"}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::Input(data) => assert_eq!(data, "ls -la\n"),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_resize() {
            let frame = r#"{"event":"resize","payload":{"cols":120,"rows":40}}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::Resize(req) => {
                    assert_eq!(req.cols, 120);
                    assert_eq!(req.rows, 40);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_payloadless_events() {
            for (frame, expect_disconnect) in [
                (r#"{"event":"restart-shell"}"#, false),
                (r#"{"event":"refresh-connection"}"#, false),
                (r#"{"event":"disconnect"}"#, true),
            ] {
                let event: ClientEvent = serde_json::from_str(frame).unwrap();
                assert_eq!(matches!(event, ClientEvent::Disconnect), expect_disconnect);
            }
        }

        #[test]
        fn test_check_connection() {
            let frame = r#"{"event":"check-connection","payload":{"sessionId":"abc"}}"#;
            let event: ClientEvent = serde_json::from_str(frame).unwrap();
            match event {
                ClientEvent::CheckConnection(req) => assert_eq!(req.session_id, "abc"),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[test]
        fn test_unknown_event_is_rejected() {
            let frame = r#"{"event":"mystery","payload":{}}"#;
            assert!(serde_json::from_str::<ClientEvent>(frame).is_err());
        }
    }

    mod outbound {
        use super::*;

        #[test]
        fn test_connected_shape() {
            let event = ServerEvent::Connected {
                message: "SSH connection established".to_string(),
                session_id: "s-1".to_string(),
            };
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "connected");
            assert_eq!(json["payload"]["sessionId"], "s-1");
            assert_eq!(json["payload"]["message"], "SSH connection established");
        }

        #[test]
        fn test_data_is_plain_string_payload() {
            let event = ServerEvent::Data("\u{1b}[32mok\u{1b}[0m".to_string());
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "data");
            assert!(json["payload"].is_string());
        }

        #[test]
        fn test_error_data_event_name() {
            let event = ServerEvent::ErrorData("boom".to_string());
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "error-data");
        }

        #[test]
        fn test_monitoring_data_shape() {
            let event = ServerEvent::MonitoringData {
                kind: "system-stats".to_string(),
                stats: SystemStats {
                    cpu: MetricValue { value: 12.5 },
                    memory: MetricValue { value: 40.0 },
                },
            };
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "monitoring-data");
            assert_eq!(json["payload"]["type"], "system-stats");
            assert_eq!(json["payload"]["stats"]["cpu"]["value"], 12.5);
            assert_eq!(json["payload"]["stats"]["memory"]["value"], 40.0);
        }

        #[test]
        fn test_command_error_carries_needs_elevation() {
            let event = ServerEvent::CommandError {
                command: "kill -9 1".to_string(),
                error: "Operation not permitted".to_string(),
                needs_elevation: true,
            };
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "command-error");
            assert_eq!(json["payload"]["needsElevation"], true);
        }

        #[test]
        fn test_batch_result_omits_absent_error() {
            let event = ServerEvent::CommandBatchResult {
                batch_id: "b1".to_string(),
                results: vec![BatchEntryResult {
                    command: "ls".to_string(),
                    output: "ok".to_string(),
                    error: None,
                    background: false,
                }],
                error: None,
                background: false,
            };
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["payload"]["batchId"], "b1");
            assert!(json["payload"].get("error").is_none());
            assert!(json["payload"]["results"][0].get("error").is_none());
        }

        #[test]
        fn test_command_output_stream_is_partial() {
            let event = ServerEvent::CommandOutputStream {
                execution_id: Some("e1".to_string()),
                output: "chunk".to_string(),
                partial: true,
            };
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "command-output-stream");
            assert_eq!(json["payload"]["executionId"], "e1");
            assert_eq!(json["payload"]["partial"], true);
        }

        #[test]
        fn test_process_killed_shape() {
            let event = ServerEvent::ProcessKilled {
                pid: 4242,
                success: true,
            };
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], "process-killed");
            assert_eq!(json["payload"]["pid"], 4242);
        }

        #[test]
        fn test_health_response_field_names() {
            let health = HealthResponse {
                status: "ok".to_string(),
                connections: 2,
                uptime: 60,
                memory: MemoryUsage {
                    rss_bytes: 1024,
                    data_bytes: 512,
                },
                queued_commands: 1,
                running_commands: 3,
            };
            let json = serde_json::to_value(&health).unwrap();
            assert_eq!(json["queuedCommands"], 1);
            assert_eq!(json["runningCommands"], 3);
            assert_eq!(json["memory"]["rssBytes"], 1024);
        }
    }
}
