use std::fs::OpenOptions;
use std::io::{self, Write};

use crossterm::execute;
use crossterm::terminal::SetTitle;

use crate::config::TitleConfig;
use crate::turn::TitleState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSet {
    pub new: String,
    pub running: String,
    pub done: String,
    pub no_commit: String,
    pub stalled: String,
}

impl TitleSet {
    pub fn from_config(cfg: &TitleConfig) -> Self {
        Self {
            new: cfg.new_title.clone(),
            running: cfg.running_title.clone(),
            done: cfg.done_title.clone(),
            no_commit: cfg.no_commit_title.clone(),
            stalled: cfg.stalled_title.clone(),
        }
    }

    /// The stalled mask only ever replaces the running title.
    pub fn render(&self, state: TitleState, stalled: bool) -> &str {
        match state {
            TitleState::New => &self.new,
            TitleState::Running if stalled => &self.stalled,
            TitleState::Running => &self.running,
            TitleState::DoneCommitted => &self.done,
            TitleState::DoneNoCommit => &self.no_commit,
        }
    }
}

impl Default for TitleSet {
    fn default() -> Self {
        Self::from_config(&TitleConfig::default())
    }
}

pub trait TitleSink: Send {
    fn set_title(&mut self, title: &str) -> io::Result<()>;
}

/// Writes the title escape sequence to the controlling terminal.
pub struct TerminalTitle<W: Write + Send> {
    out: W,
}

impl TerminalTitle<Box<dyn Write + Send>> {
    /// Prefers `/dev/tty` so the sequence reaches the terminal even when
    /// stdout is redirected.
    pub fn open() -> Self {
        let out: Box<dyn Write + Send> = match OpenOptions::new().write(true).open("/dev/tty") {
            Ok(tty) => Box::new(tty),
            Err(_) => Box::new(io::stdout()),
        };
        Self { out }
    }
}

#[cfg(test)]
impl<W: Write + Send> TerminalTitle<W> {
    pub(crate) fn with_writer(out: W) -> Self {
        Self { out }
    }

    pub(crate) fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> TitleSink for TerminalTitle<W> {
    fn set_title(&mut self, title: &str) -> io::Result<()> {
        execute!(self.out, SetTitle(title))
    }
}
