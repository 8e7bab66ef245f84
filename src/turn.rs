use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::commit;
use crate::reader::TailWindow;
use crate::records::{self, LogRecord};

const BOOTSTRAP_PREFIXES: [&str; 3] = [
    "# AGENTS.md instructions",
    "<environment_context>",
    "<user_instructions>",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TitleState {
    #[default]
    New,
    Running,
    DoneCommitted,
    DoneNoCommit,
}

impl TitleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running => "running",
            Self::DoneCommitted => "done_committed",
            Self::DoneNoCommit => "done_no_commit",
        }
    }
}

/// What a record did to the turn boundary, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    Started,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TurnState {
    pub title_state: TitleState,
    pub pending_tool_calls: HashSet<String>,
    pub pending_commit_calls: HashSet<String>,
    pub turn_commit_seen: bool,
}

impl TurnState {
    pub fn apply(&mut self, record: &LogRecord) -> Option<TurnEvent> {
        match record {
            LogRecord::UserMessage { text } => {
                if is_bootstrap_message(text) {
                    return None;
                }
                self.title_state = TitleState::Running;
                self.pending_tool_calls.clear();
                self.pending_commit_calls.clear();
                self.turn_commit_seen = false;
                Some(TurnEvent::Started)
            }
            LogRecord::ToolCall {
                call_id,
                command,
                completed,
            } => {
                if *completed {
                    self.pending_tool_calls.remove(call_id);
                } else {
                    self.pending_tool_calls.insert(call_id.clone());
                }
                if command.as_deref().is_some_and(commit::has_commit) {
                    self.pending_commit_calls.insert(call_id.clone());
                }
                None
            }
            LogRecord::ToolOutput { call_id, output } => {
                self.pending_tool_calls.remove(call_id);
                if self.pending_commit_calls.remove(call_id)
                    && output
                        .as_deref()
                        .is_some_and(commit::output_reports_success)
                {
                    self.turn_commit_seen = true;
                }
                None
            }
            LogRecord::AssistantMessage | LogRecord::TurnAborted => {
                if self.title_state == TitleState::New {
                    return None;
                }
                Some(self.finish())
            }
            LogRecord::SessionMeta(_)
            | LogRecord::TurnContext { .. }
            | LogRecord::Unrecognized => None,
        }
    }

    pub fn apply_line(&mut self, line: &str) -> Option<TurnEvent> {
        self.apply(&records::decode_line(line))
    }

    fn finish(&mut self) -> TurnEvent {
        self.title_state = if self.turn_commit_seen {
            TitleState::DoneCommitted
        } else {
            TitleState::DoneNoCommit
        };
        TurnEvent::Finished
    }
}

/// Turn state rebuilt from a tail window, with the record times of the last
/// turn's boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    pub state: TurnState,
    pub turn_started_at: Option<DateTime<Utc>>,
    pub turn_finished_at: Option<DateTime<Utc>>,
}

pub fn reduce(mut state: TurnState, record: &LogRecord) -> TurnState {
    state.apply(record);
    state
}

/// Re-derives turn state from a window of lines, oldest first, starting
/// from `New`.
pub fn replay<I, S>(lines: I) -> TurnState
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    replay_lines(lines, false).state
}

/// Replays a tail window. When the window lost the start of the file, a
/// finished turn whose user message fell outside it still counts as done.
pub fn replay_tail(window: &TailWindow) -> Replay {
    replay_lines(&window.lines, window.truncated)
}

fn replay_lines<I, S>(lines: I, truncated: bool) -> Replay
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut replay = Replay::default();
    for line in lines {
        let (record, timestamp) = records::decode_timed_line(line.as_ref());
        let state = &mut replay.state;
        let event = match record {
            LogRecord::AssistantMessage | LogRecord::TurnAborted
                if truncated && state.title_state == TitleState::New =>
            {
                Some(state.finish())
            }
            _ => state.apply(&record),
        };
        match event {
            Some(TurnEvent::Started) => {
                replay.turn_started_at = timestamp;
                replay.turn_finished_at = None;
            }
            Some(TurnEvent::Finished) => replay.turn_finished_at = timestamp,
            None => {}
        }
    }
    replay
}

pub fn is_bootstrap_message(text: &str) -> bool {
    let stripped = text.trim_start();
    BOOTSTRAP_PREFIXES
        .iter()
        .any(|prefix| stripped.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> LogRecord {
        LogRecord::UserMessage {
            text: text.to_string(),
        }
    }

    fn call(id: &str, command: &str) -> LogRecord {
        LogRecord::ToolCall {
            call_id: id.to_string(),
            command: Some(command.to_string()),
            completed: false,
        }
    }

    fn output(id: &str, text: &str) -> LogRecord {
        LogRecord::ToolOutput {
            call_id: id.to_string(),
            output: Some(text.to_string()),
        }
    }

    fn running() -> TurnState {
        reduce(TurnState::default(), &user("Hello"))
    }

    #[test]
    fn bootstrap_message_keeps_new() {
        let state = replay([
            r##"{"type":"event_msg","payload":{"type":"user_message","message":"# AGENTS.md instructions for /repo"}}"##,
        ]);
        assert_eq!(state.title_state, TitleState::New);
    }

    #[test]
    fn real_user_message_starts_running() {
        let state = replay([
            r#"{"type":"event_msg","payload":{"type":"user_message","message":"Hello"}}"#,
        ]);
        assert_eq!(state.title_state, TitleState::Running);
    }

    #[test]
    fn user_message_runs_from_every_state() {
        for prior in [
            TitleState::New,
            TitleState::Running,
            TitleState::DoneCommitted,
            TitleState::DoneNoCommit,
        ] {
            let state = TurnState {
                title_state: prior,
                pending_tool_calls: HashSet::from(["a".to_string()]),
                pending_commit_calls: HashSet::from(["a".to_string()]),
                turn_commit_seen: true,
            };
            let next = reduce(state, &user("next task"));
            assert_eq!(next.title_state, TitleState::Running);
            assert!(next.pending_tool_calls.is_empty());
            assert!(next.pending_commit_calls.is_empty());
            assert!(!next.turn_commit_seen);
        }
    }

    #[test]
    fn successful_commit_then_assistant_is_done_committed() {
        let mut state = running();
        state.apply(&call("call_1", r#"git commit -m "x""#));
        assert!(state.pending_commit_calls.contains("call_1"));
        state.apply(&output("call_1", "Exit code: 0"));
        assert!(state.turn_commit_seen);
        assert!(state.pending_tool_calls.is_empty());
        assert_eq!(
            state.apply(&LogRecord::AssistantMessage),
            Some(TurnEvent::Finished)
        );
        assert_eq!(state.title_state, TitleState::DoneCommitted);
    }

    #[test]
    fn failed_commit_is_done_no_commit() {
        let mut state = running();
        state.apply(&call("call_1", "git commit -m x"));
        state.apply(&output("call_1", "Exit code: 1"));
        state.apply(&LogRecord::AssistantMessage);
        assert_eq!(state.title_state, TitleState::DoneNoCommit);
    }

    #[test]
    fn non_commit_command_is_done_no_commit() {
        let mut state = running();
        state.apply(&call("call_1", "cargo test"));
        state.apply(&output("call_1", "Exit code: 0"));
        state.apply(&LogRecord::TurnAborted);
        assert_eq!(state.title_state, TitleState::DoneNoCommit);
    }

    #[test]
    fn commit_from_previous_turn_does_not_leak() {
        let mut state = running();
        state.apply(&call("call_1", "git commit -m x"));
        state.apply(&output("call_1", "Exit code: 0"));
        state.apply(&LogRecord::AssistantMessage);
        state.apply(&user("again"));
        state.apply(&LogRecord::AssistantMessage);
        assert_eq!(state.title_state, TitleState::DoneNoCommit);
    }

    #[test]
    fn output_for_call_from_previous_turn_is_ignored() {
        let mut state = running();
        state.apply(&call("call_1", "git commit -m x"));
        state.apply(&user("interrupting"));
        state.apply(&output("call_1", "Exit code: 0"));
        state.apply(&LogRecord::AssistantMessage);
        assert_eq!(state.title_state, TitleState::DoneNoCommit);
    }

    #[test]
    fn assistant_message_before_any_turn_stays_new() {
        let state = reduce(TurnState::default(), &LogRecord::AssistantMessage);
        assert_eq!(state.title_state, TitleState::New);
    }

    #[test]
    fn completed_status_call_is_not_pending() {
        let mut state = running();
        state.apply(&LogRecord::ToolCall {
            call_id: "c".to_string(),
            command: None,
            completed: true,
        });
        assert!(state.pending_tool_calls.is_empty());
    }

    #[test]
    fn reapplying_a_record_is_idempotent() {
        let sequence = [
            user("Hello"),
            call("call_1", "git add . && git commit -m x"),
            output("call_1", "Process exited with code 0"),
            LogRecord::AssistantMessage,
            LogRecord::Unrecognized,
        ];
        let mut state = TurnState::default();
        for record in &sequence {
            let once = reduce(state.clone(), record);
            let twice = reduce(once.clone(), record);
            assert_eq!(once, twice);
            state = once;
        }
        assert_eq!(state.title_state, TitleState::DoneCommitted);
    }

    #[test]
    fn replay_of_full_log_lines() {
        let state = replay([
            r#"{"type":"session_meta","payload":{"id":"s","cwd":"/repo"}}"#,
            r#"{"type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"<environment_context>\n</environment_context>"}]}}"#,
            r#"{"type":"event_msg","payload":{"type":"user_message","message":"Commit"}}"#,
            r#"{"type":"response_item","payload":{"type":"function_call","call_id":"call_1","name":"exec_command","arguments":"{\"cmd\":\"git commit -m \\\"msg\\\"\"}"}}"#,
            "garbage line",
            r#"{"type":"response_item","payload":{"type":"function_call_output","call_id":"call_1","output":"Exit code: 0"}}"#,
            r#"{"type":"event_msg","payload":{"type":"agent_message","message":"done"}}"#,
        ]);
        assert_eq!(state.title_state, TitleState::DoneCommitted);
    }

    #[test]
    fn pending_tool_call_keeps_running() {
        let state = replay([
            r#"{"type":"event_msg","payload":{"type":"user_message","message":"Run tool"}}"#,
            r#"{"type":"response_item","payload":{"type":"function_call","call_id":"call_1","name":"exec_command"}}"#,
        ]);
        assert_eq!(state.title_state, TitleState::Running);
        assert!(state.pending_tool_calls.contains("call_1"));
    }

    fn long_finished_turn() -> String {
        let mut body = String::from(
            r#"{"timestamp":"2026-01-04T12:00:00Z","type":"event_msg","payload":{"type":"user_message","message":"Refactor"}}"#,
        );
        body.push('\n');
        for n in 0..120 {
            body.push_str(&format!(
                r#"{{"type":"response_item","payload":{{"type":"function_call","call_id":"c{n}","name":"exec_command","arguments":"{{\"cmd\":\"cargo test\"}}"}}}}"#
            ));
            body.push('\n');
            body.push_str(&format!(
                r#"{{"type":"response_item","payload":{{"type":"function_call_output","call_id":"c{n}","output":"Exit code: 0"}}}}"#
            ));
            body.push('\n');
        }
        body.push_str(
            r#"{"timestamp":"2026-01-04T12:30:00Z","type":"event_msg","payload":{"type":"agent_message","message":"done"}}"#,
        );
        body.push('\n');
        body
    }

    #[test]
    fn cut_tail_window_still_finishes_turn() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("rollout-long.jsonl");
        std::fs::write(&path, long_finished_turn()).expect("write");
        let window = crate::reader::read_tail_window(
            &path,
            crate::reader::REPLAY_MAX_BYTES,
            crate::reader::REPLAY_MAX_LINES,
        )
        .expect("window");
        assert!(window.truncated);
        assert!(!window.lines.iter().any(|line| line.contains("user_message")));

        let replayed = replay_tail(&window);
        assert_eq!(replayed.state.title_state, TitleState::DoneNoCommit);
        assert_eq!(replayed.turn_started_at, None);
        assert!(replayed.turn_finished_at.is_some());
    }

    #[test]
    fn whole_window_keeps_new_before_first_turn() {
        let window = TailWindow {
            lines: vec![
                r#"{"type":"event_msg","payload":{"type":"agent_message","message":"hi"}}"#
                    .to_string(),
            ],
            end_offset: 0,
            truncated: false,
        };
        assert_eq!(replay_tail(&window).state.title_state, TitleState::New);
    }

    #[test]
    fn replay_records_turn_boundaries() {
        let window = TailWindow {
            lines: vec![
                r#"{"timestamp":"2026-01-04T11:00:00Z","type":"event_msg","payload":{"type":"user_message","message":"first"}}"#.to_string(),
                r#"{"timestamp":"2026-01-04T11:05:00Z","type":"event_msg","payload":{"type":"agent_message","message":"ok"}}"#.to_string(),
                r#"{"timestamp":"2026-01-04T12:00:00Z","type":"event_msg","payload":{"type":"user_message","message":"second"}}"#.to_string(),
                r#"{"timestamp":"2026-01-04T12:10:00Z","type":"event_msg","payload":{"type":"turn_aborted"}}"#.to_string(),
            ],
            end_offset: 0,
            truncated: true,
        };
        let replayed = replay_tail(&window);
        assert_eq!(replayed.state.title_state, TitleState::DoneNoCommit);
        assert_eq!(
            replayed.turn_started_at,
            crate::util::parse_utc_timestamp("2026-01-04T12:00:00Z")
        );
        assert_eq!(
            replayed.turn_finished_at,
            crate::util::parse_utc_timestamp("2026-01-04T12:10:00Z")
        );
    }

    #[test]
    fn bootstrap_detection_ignores_leading_whitespace() {
        assert!(is_bootstrap_message("  \n<environment_context>"));
        assert!(!is_bootstrap_message("please read # AGENTS.md instructions"));
    }
}
