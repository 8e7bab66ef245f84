//! The background thread that finds the session log, keeps it bound and
//! turns what it reads into title updates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::discovery::{LogDiscovery, LogSource, ResolvedLog};
use crate::git;
use crate::overlay::TimeoutOverlay;
use crate::reader::{LogReader, REPLAY_MAX_BYTES, REPLAY_MAX_LINES, read_tail_window};
use crate::records::decode_line;
use crate::title::{TitleSet, TitleSink};
use crate::turn::{self, Replay, TitleState, TurnEvent, TurnState};

const STOP_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Title sink plus the last title it displayed. A write that would repeat
/// the displayed title is skipped.
pub struct TitleWriter {
    sink: Box<dyn TitleSink>,
    last: Option<String>,
}

impl TitleWriter {
    pub fn new(sink: Box<dyn TitleSink>) -> Self {
        Self { sink, last: None }
    }

    /// Returns true when something was written.
    pub fn show(&mut self, title: &str) -> bool {
        if self.last.as_deref() == Some(title) {
            return false;
        }
        match self.sink.set_title(title) {
            Ok(()) => {
                self.last = Some(title.to_string());
                true
            }
            Err(err) => {
                debug!(error = %err, "title write failed");
                false
            }
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct BindingOptions {
    pub settings: RuntimeSettings,
    pub titles: TitleSet,
    pub verify_head_change: bool,
    /// Bound immediately and never switched away from.
    pub explicit_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub bound: Option<ResolvedLog>,
    pub title_state: TitleState,
    pub stalled: bool,
    pub title: Option<String>,
}

struct Shared {
    bound: Option<ResolvedLog>,
    state: TurnState,
    overlay: TimeoutOverlay,
    head_moved: bool,
    writer: TitleWriter,
}

impl Shared {
    fn displayed_state(&self) -> TitleState {
        if self.head_moved && self.state.title_state == TitleState::DoneNoCommit {
            TitleState::DoneCommitted
        } else {
            self.state.title_state
        }
    }

    fn refresh(&mut self, titles: &TitleSet) {
        let title = titles
            .render(self.displayed_state(), self.overlay.is_active())
            .to_string();
        self.writer.show(&title);
    }

    fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            bound: self.bound.clone(),
            title_state: self.state.title_state,
            stalled: self.overlay.is_active(),
            title: self.writer.last().map(str::to_string),
        }
    }
}

pub struct SessionBinder {
    stop: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
    handle: JoinHandle<()>,
}

impl SessionBinder {
    pub fn spawn(
        discovery: LogDiscovery,
        options: BindingOptions,
        writer: TitleWriter,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let shared = Arc::new(Mutex::new(Shared {
            bound: None,
            state: TurnState::default(),
            overlay: TimeoutOverlay::new(Instant::now()),
            head_moved: false,
            writer,
        }));
        let worker = Worker {
            repo: options
                .verify_head_change
                .then(|| git::repo_root(&discovery.request().cwd))
                .flatten(),
            discovery,
            options,
            shared: Arc::clone(&shared),
            stop: Arc::clone(&stop),
            reader: None,
            turn_base_head: None,
        };
        let handle = thread::Builder::new()
            .name("codex-title-binding".to_string())
            .spawn(move || worker.run())
            .context("failed to start binding thread")?;
        Ok(Self {
            stop,
            shared,
            handle,
        })
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        lock(&self.shared).snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raises the stop flag and waits for the thread. The displayed title is
    /// left as it is.
    pub fn stop(self) -> BindingSnapshot {
        self.stop.store(true, Ordering::SeqCst);
        if self.handle.join().is_err() {
            warn!("binding thread panicked");
        }
        lock(&self.shared).snapshot()
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Worker {
    discovery: LogDiscovery,
    options: BindingOptions,
    shared: Arc<Mutex<Shared>>,
    stop: Arc<AtomicBool>,
    reader: Option<LogReader>,
    repo: Option<PathBuf>,
    turn_base_head: Option<String>,
}

impl Worker {
    fn run(mut self) {
        let Some(resolved) = self.discover() else {
            if !self.stopped() {
                info!("no log bound; title updates stop here");
            }
            return;
        };
        self.bind(resolved);

        let mut last_pid_check = Instant::now();
        while !self.stopped() {
            let progressed = self.drain_lines();
            if !progressed {
                self.idle_tick();
                self.pause(self.options.settings.poll_interval);
            }
            if self.follows_pid()
                && last_pid_check.elapsed() >= self.options.settings.pid_recheck_interval
            {
                last_pid_check = Instant::now();
                self.check_for_switch();
            }
        }
        debug!("binding stopped");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleeps in short slices so a stop request is noticed promptly.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
        }
    }

    fn pid_discovery_enabled(&self) -> bool {
        self.discovery.request().pid.is_some()
            && !self.options.settings.pid_log_timeout.is_zero()
    }

    fn follows_pid(&self) -> bool {
        self.pid_discovery_enabled()
            && lock(&self.shared)
                .bound
                .as_ref()
                .is_some_and(|bound| bound.source != LogSource::Explicit)
    }

    fn discover(&self) -> Option<ResolvedLog> {
        if let Some(path) = &self.options.explicit_log {
            return Some(ResolvedLog {
                path: path.clone(),
                source: LogSource::Explicit,
            });
        }

        let pid_enabled = self.pid_discovery_enabled();
        if pid_enabled {
            let started = Instant::now();
            while !self.stopped() && started.elapsed() < self.options.settings.pid_log_timeout {
                if let Some(found) = self.discovery.resolve_pid() {
                    return Some(found);
                }
                self.pause(self.options.settings.retry_interval);
            }
        }
        if self.stopped() {
            return None;
        }
        if let Some(found) = self.discovery.resolve_fallback() {
            return Some(found);
        }
        if !pid_enabled {
            return None;
        }

        // The process may still open its log later (for example after a
        // resume); keep asking until it exits.
        while !self.stopped() {
            self.pause(self.options.settings.pid_recheck_interval);
            if let Some(found) = self.discovery.resolve_pid() {
                return Some(found);
            }
        }
        None
    }

    /// Re-derives everything from the tail of `resolved` and starts tailing
    /// it. State from a previously bound log is dropped wholesale.
    fn bind(&mut self, resolved: ResolvedLog) {
        let window = match read_tail_window(&resolved.path, REPLAY_MAX_BYTES, REPLAY_MAX_LINES) {
            Ok(window) => window,
            Err(err) => {
                debug!(path = %resolved.path.display(), error = %err, "replay skipped");
                Default::default()
            }
        };
        let replayed = turn::replay_tail(&window);
        let head_moved = replayed.state.title_state == TitleState::DoneNoCommit
            && self.committed_during(&replayed);
        let state = replayed.state;
        self.reader = Some(LogReader::open_at(&resolved.path, window.end_offset));
        self.turn_base_head = if state.title_state == TitleState::Running {
            self.current_head()
        } else {
            None
        };

        info!(
            path = %resolved.path.display(),
            source = resolved.source.as_str(),
            state = state.title_state.as_str(),
            replayed = window.lines.len(),
            "bind"
        );
        let mut shared = lock(&self.shared);
        shared.bound = Some(resolved);
        shared.state = state;
        shared.overlay = TimeoutOverlay::new(Instant::now());
        shared.head_moved = head_moved;
        shared.refresh(&self.options.titles);
    }

    /// Looks for a commit made while the replayed turn ran.
    fn committed_during(&self, replayed: &Replay) -> bool {
        let (Some(repo), Some(start), Some(end)) = (
            self.repo.as_deref(),
            replayed.turn_started_at,
            replayed.turn_finished_at,
        ) else {
            return false;
        };
        git::commit_in_range(repo, start, end)
    }

    fn check_for_switch(&mut self) {
        let Some(found) = self.discovery.resolve_pid() else {
            return;
        };
        let current = lock(&self.shared).bound.as_ref().map(|bound| bound.path.clone());
        if current.as_ref() == Some(&found.path) {
            return;
        }
        info!(
            from = %current.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
            to = %found.path.display(),
            "switch"
        );
        self.bind(found);
    }

    /// Feeds every complete line currently available. Returns whether any
    /// line was read.
    fn drain_lines(&mut self) -> bool {
        let mut progressed = false;
        while !self.stopped() {
            let Some(reader) = self.reader.as_mut() else {
                break;
            };
            match reader.next_line() {
                Ok(Some(line)) => {
                    progressed = true;
                    self.consume(&line);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(path = %reader.path().display(), error = %err, "log read failed");
                    break;
                }
            }
        }
        progressed
    }

    fn consume(&mut self, line: &str) {
        let record = decode_line(line);
        let now = Instant::now();
        let (event, title_state) = {
            let mut shared = lock(&self.shared);
            shared.overlay.note_activity(now);
            let event = shared.state.apply(&record);
            (event, shared.state.title_state)
        };

        let head_moved = match event {
            Some(TurnEvent::Started) => {
                self.turn_base_head = self.current_head();
                Some(false)
            }
            Some(TurnEvent::Finished) if title_state == TitleState::DoneNoCommit => {
                Some(self.head_moved_since_turn_start())
            }
            Some(TurnEvent::Finished) => Some(false),
            None => None,
        };

        let mut shared = lock(&self.shared);
        if let Some(moved) = head_moved {
            shared.head_moved = moved;
        }
        let state = shared.state.title_state;
        shared
            .overlay
            .tick(now, state, self.options.settings.stall_timeout);
        shared.refresh(&self.options.titles);
    }

    fn idle_tick(&mut self) {
        let mut shared = lock(&self.shared);
        let state = shared.state.title_state;
        if shared
            .overlay
            .tick(Instant::now(), state, self.options.settings.stall_timeout)
        {
            debug!(stalled = shared.overlay.is_active(), "stall overlay changed");
        }
        shared.refresh(&self.options.titles);
    }

    fn current_head(&self) -> Option<String> {
        self.repo.as_deref().and_then(git::head)
    }

    fn head_moved_since_turn_start(&self) -> bool {
        let Some(base) = &self.turn_base_head else {
            return false;
        };
        self.current_head().is_some_and(|head| &head != base)
    }
}
