//! Decoding of single rollout-log lines into a closed set of record shapes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::util::parse_utc_timestamp;

const SHELL_TOOL_NAMES: [&str; 3] = ["shell", "shell_command", "exec_command"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionMeta {
    pub id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    SessionMeta(SessionMeta),
    TurnContext {
        cwd: Option<PathBuf>,
    },
    UserMessage {
        text: String,
    },
    AssistantMessage,
    TurnAborted,
    ToolCall {
        call_id: String,
        command: Option<String>,
        completed: bool,
    },
    ToolOutput {
        call_id: String,
        output: Option<String>,
    },
    /// Anything else: unknown types, malformed JSON, missing fields.
    Unrecognized,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    timestamp: Option<Value>,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct SessionMetaPayload {
    id: Option<String>,
    cwd: Option<String>,
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct TurnContextPayload {
    cwd: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventMsg {
    UserMessage { message: Option<String> },
    AgentMessage,
    AssistantMessage,
    TurnAborted,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseItem {
    Message {
        role: Option<String>,
        #[serde(default)]
        content: Vec<ContentItem>,
    },
    FunctionCall {
        call_id: Option<String>,
        name: Option<String>,
        arguments: Option<Value>,
        status: Option<String>,
    },
    CustomToolCall {
        call_id: Option<String>,
        status: Option<String>,
    },
    FunctionCallOutput {
        call_id: Option<String>,
        output: Option<Value>,
    },
    CustomToolCallOutput {
        call_id: Option<String>,
        output: Option<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ContentItem {
    text: Option<String>,
    input_text: Option<String>,
}

pub fn decode_line(line: &str) -> LogRecord {
    decode_timed_line(line).0
}

/// Like [`decode_line`], also returning the envelope's `timestamp`.
pub fn decode_timed_line(line: &str) -> (LogRecord, Option<DateTime<Utc>>) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return (LogRecord::Unrecognized, None);
    }
    match serde_json::from_str::<Envelope>(trimmed) {
        Ok(envelope) => {
            let timestamp = envelope
                .timestamp
                .as_ref()
                .and_then(Value::as_str)
                .and_then(parse_utc_timestamp);
            (decode_envelope(envelope, timestamp), timestamp)
        }
        Err(_) => (LogRecord::Unrecognized, None),
    }
}

fn decode_envelope(envelope: Envelope, outer_timestamp: Option<DateTime<Utc>>) -> LogRecord {
    let payload = &envelope.payload;
    match envelope.kind.as_str() {
        "session_meta" => {
            let Ok(meta) = SessionMetaPayload::deserialize(payload) else {
                return LogRecord::Unrecognized;
            };
            LogRecord::SessionMeta(SessionMeta {
                id: meta.id,
                cwd: meta.cwd.map(PathBuf::from),
                timestamp: meta
                    .timestamp
                    .as_deref()
                    .and_then(parse_utc_timestamp)
                    .or(outer_timestamp),
            })
        }
        "turn_context" => match TurnContextPayload::deserialize(payload) {
            Ok(context) => LogRecord::TurnContext {
                cwd: context.cwd.map(PathBuf::from),
            },
            Err(_) => LogRecord::Unrecognized,
        },
        "event_msg" => match EventMsg::deserialize(payload) {
            Ok(EventMsg::UserMessage {
                message: Some(text),
            }) => LogRecord::UserMessage { text },
            Ok(EventMsg::AgentMessage | EventMsg::AssistantMessage) => {
                LogRecord::AssistantMessage
            }
            Ok(EventMsg::TurnAborted) => LogRecord::TurnAborted,
            _ => LogRecord::Unrecognized,
        },
        "response_item" => match ResponseItem::deserialize(payload) {
            Ok(item) => decode_response_item(item),
            Err(_) => LogRecord::Unrecognized,
        },
        _ => LogRecord::Unrecognized,
    }
}

fn decode_response_item(item: ResponseItem) -> LogRecord {
    match item {
        ResponseItem::Message { role, content } => match role.as_deref() {
            Some("assistant") => LogRecord::AssistantMessage,
            Some("user") => content
                .into_iter()
                .next()
                .and_then(|entry| entry.text.or(entry.input_text))
                .map_or(LogRecord::Unrecognized, |text| LogRecord::UserMessage {
                    text,
                }),
            _ => LogRecord::Unrecognized,
        },
        ResponseItem::FunctionCall {
            call_id: Some(call_id),
            name,
            arguments,
            status,
        } => LogRecord::ToolCall {
            call_id,
            command: shell_command(name.as_deref(), arguments.as_ref()),
            completed: status.as_deref() == Some("completed"),
        },
        ResponseItem::CustomToolCall {
            call_id: Some(call_id),
            status,
        } => LogRecord::ToolCall {
            call_id,
            command: None,
            completed: status.as_deref() == Some("completed"),
        },
        ResponseItem::FunctionCallOutput {
            call_id: Some(call_id),
            output,
        }
        | ResponseItem::CustomToolCallOutput {
            call_id: Some(call_id),
            output,
        } => LogRecord::ToolOutput {
            call_id,
            output: output.and_then(output_text),
        },
        _ => LogRecord::Unrecognized,
    }
}

fn shell_command(name: Option<&str>, arguments: Option<&Value>) -> Option<String> {
    if !SHELL_TOOL_NAMES.contains(&name?) {
        return None;
    }
    let parsed;
    let arguments = match arguments? {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).ok()?;
            &parsed
        }
        other => other,
    };
    let command = arguments.get("command").or_else(|| arguments.get("cmd"))?;
    match command {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let argv: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            match argv.as_slice() {
                [] => None,
                // [bash, -lc, script]
                [_, flag, script] if flag.starts_with('-') && flag.ends_with('c') => {
                    Some((*script).to_string())
                }
                _ => Some(argv.join(" ")),
            }
        }
        _ => None,
    }
}

fn output_text(output: Value) -> Option<String> {
    match output {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timed_decode_reads_envelope_timestamp() {
        let (record, timestamp) = decode_timed_line(
            r#"{"timestamp":"2026-01-04T12:00:05.250Z","type":"event_msg","payload":{"type":"turn_aborted"}}"#,
        );
        assert_eq!(record, LogRecord::TurnAborted);
        let expected = Utc.with_ymd_and_hms(2026, 1, 4, 12, 0, 5).single().expect("ts")
            + chrono::Duration::milliseconds(250);
        assert_eq!(timestamp, Some(expected));
        assert_eq!(decode_timed_line("not json"), (LogRecord::Unrecognized, None));
    }

    #[test]
    fn decodes_event_msg_user_and_agent_messages() {
        assert_eq!(
            decode_line(r#"{"type":"event_msg","payload":{"type":"user_message","message":"Hello"}}"#),
            LogRecord::UserMessage {
                text: "Hello".to_string()
            }
        );
        assert_eq!(
            decode_line(r#"{"type":"event_msg","payload":{"type":"agent_message","message":"Done"}}"#),
            LogRecord::AssistantMessage
        );
        assert_eq!(
            decode_line(r#"{"type":"event_msg","payload":{"type":"turn_aborted","reason":"interrupted"}}"#),
            LogRecord::TurnAborted
        );
    }

    #[test]
    fn user_message_without_text_is_unrecognized() {
        assert_eq!(
            decode_line(r#"{"type":"event_msg","payload":{"type":"user_message"}}"#),
            LogRecord::Unrecognized
        );
    }

    #[test]
    fn decodes_response_item_messages_by_role() {
        assert_eq!(
            decode_line(
                r#"{"type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"<environment_context>x"}]}}"#
            ),
            LogRecord::UserMessage {
                text: "<environment_context>x".to_string()
            }
        );
        assert_eq!(
            decode_line(
                r#"{"type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"ok"}]}}"#
            ),
            LogRecord::AssistantMessage
        );
    }

    #[test]
    fn decodes_function_call_command_from_json_arguments() {
        let record = decode_line(
            r#"{"type":"response_item","payload":{"type":"function_call","name":"exec_command","call_id":"call_1","arguments":"{\"cmd\":\"git commit -m \\\"msg\\\"\"}"}}"#,
        );
        assert_eq!(
            record,
            LogRecord::ToolCall {
                call_id: "call_1".to_string(),
                command: Some("git commit -m \"msg\"".to_string()),
                completed: false,
            }
        );
    }

    #[test]
    fn decodes_argv_style_shell_command() {
        let record = decode_line(
            r#"{"type":"response_item","payload":{"type":"function_call","name":"shell","call_id":"c","arguments":{"command":["bash","-lc","git add . && git commit -m x"]}}}"#,
        );
        let LogRecord::ToolCall { command, .. } = record else {
            panic!("expected tool call");
        };
        assert_eq!(command.as_deref(), Some("git add . && git commit -m x"));
    }

    #[test]
    fn non_shell_tools_carry_no_command() {
        let record = decode_line(
            r#"{"type":"response_item","payload":{"type":"function_call","name":"view_image","call_id":"c","arguments":"{\"command\":\"git commit\"}"}}"#,
        );
        let LogRecord::ToolCall { command, .. } = record else {
            panic!("expected tool call");
        };
        assert_eq!(command, None);
    }

    #[test]
    fn structured_tool_output_is_serialized() {
        let record = decode_line(
            r#"{"type":"response_item","payload":{"type":"function_call_output","call_id":"c","output":{"output":"ok","metadata":{"exit_code":0}}}}"#,
        );
        let LogRecord::ToolOutput { call_id, output } = record else {
            panic!("expected tool output");
        };
        assert_eq!(call_id, "c");
        assert!(output.expect("output").contains(r#""exit_code":0"#));
    }

    #[test]
    fn session_meta_falls_back_to_envelope_timestamp() {
        let record = decode_line(
            r#"{"timestamp":"2026-01-04T00:00:01Z","type":"session_meta","payload":{"id":"abc","cwd":"/repo"}}"#,
        );
        let LogRecord::SessionMeta(meta) = record else {
            panic!("expected session meta");
        };
        assert_eq!(meta.id.as_deref(), Some("abc"));
        assert_eq!(meta.cwd, Some(PathBuf::from("/repo")));
        assert_eq!(meta.timestamp, parse_utc_timestamp("2026-01-04T00:00:01Z"));
    }

    #[test]
    fn garbage_and_unknown_shapes_are_unrecognized() {
        assert_eq!(decode_line("not json"), LogRecord::Unrecognized);
        assert_eq!(decode_line(""), LogRecord::Unrecognized);
        assert_eq!(decode_line(r#"{"payload":{}}"#), LogRecord::Unrecognized);
        assert_eq!(
            decode_line(r#"{"type":"event_msg","payload":{"type":"token_count","info":null}}"#),
            LogRecord::Unrecognized
        );
        assert_eq!(
            decode_line(r#"{"type":"response_item","payload":{"type":"reasoning","summary":[]}}"#),
            LogRecord::Unrecognized
        );
        assert_eq!(
            decode_line(r#"{"type":"response_item","payload":{"type":"function_call_output","output":"x"}}"#),
            LogRecord::Unrecognized
        );
    }
}
