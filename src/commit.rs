//! Heuristic detection of `git ... commit` in shell command text.
//!
//! This only reads the command string a tool call was given. It cannot see
//! what actually ran, so shell functions, aliases, `eval`, and unusual
//! quoting will slip past it. A commit is only trusted once the matching
//! tool output reports exit code 0.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

const GIT_EXECUTABLES: [&str; 2] = ["git", "git.exe"];
const COMMIT_SUBCOMMAND: &str = "commit";

static EXIT_CODE_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"Exit code:\s*(-?\d+)").expect("exit code pattern"),
        Regex::new(r"exited with code\s+(-?\d+)").expect("process exit pattern"),
        Regex::new(r#""exit_code"\s*:\s*(-?\d+)"#).expect("json exit code pattern"),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Word(String),
    Separator,
}

pub fn has_commit(command: &str) -> bool {
    let Some(pieces) = tokenize(command) else {
        return command.contains("git commit");
    };
    pieces
        .split(|piece| *piece == Piece::Separator)
        .any(segment_has_commit)
}

/// First exit code reported by a tool output, trying each known phrasing in
/// order.
pub fn parse_exit_code(output: &str) -> Option<i64> {
    EXIT_CODE_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(output)
            .and_then(|captures| captures.get(1))
            .and_then(|code| code.as_str().parse::<i64>().ok())
    })
}

pub fn output_reports_success(output: &str) -> bool {
    parse_exit_code(output) == Some(0)
}

fn segment_has_commit(segment: &[Piece]) -> bool {
    segment.iter().enumerate().any(|(idx, piece)| {
        is_git_word(piece)
            && segment[idx + 1..]
                .iter()
                .any(|later| matches!(later, Piece::Word(word) if word == COMMIT_SUBCOMMAND))
    })
}

fn is_git_word(piece: &Piece) -> bool {
    let Piece::Word(word) = piece else {
        return false;
    };
    if GIT_EXECUTABLES.contains(&word.as_str()) {
        return true;
    }
    Path::new(word)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| GIT_EXECUTABLES.contains(&name))
}

/// Splits on whitespace and control operators outside quotes. Returns `None`
/// for an unterminated quote or a dangling escape.
fn tokenize(command: &str) -> Option<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        other => word.push(other),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            escaped @ ('"' | '\\' | '$' | '`') => word.push(escaped),
                            '\n' => {}
                            other => {
                                word.push('\\');
                                word.push(other);
                            }
                        },
                        other => word.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next()? {
                    '\n' => {}
                    other => word.push(other),
                }
            }
            // `2>&1`, `>&2`, `&>file` are redirections, not operators
            '&' if word.ends_with(['>', '<']) || chars.peek() == Some(&'>') => {
                in_word = true;
                word.push(ch);
            }
            '&' | '|' => {
                flush_word(&mut pieces, &mut word, &mut in_word);
                while matches!(chars.peek(), Some('&' | '|')) {
                    chars.next();
                }
                pieces.push(Piece::Separator);
            }
            ';' | '\n' => {
                flush_word(&mut pieces, &mut word, &mut in_word);
                pieces.push(Piece::Separator);
            }
            other if other.is_whitespace() => {
                flush_word(&mut pieces, &mut word, &mut in_word);
            }
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush_word(&mut pieces, &mut word, &mut in_word);
    Some(pieces)
}

fn flush_word(pieces: &mut Vec<Piece>, word: &mut String, in_word: &mut bool) {
    if *in_word {
        pieces.push(Piece::Word(std::mem::take(word)));
        *in_word = false;
    }
}
