use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::candidate::{LogCandidate, best_candidate, is_log_file_name};
use crate::config::CodexPaths;
use crate::reader::read_tail_window;
use crate::util::str_at;

const TUI_TAIL_BYTES: u64 = 1024 * 1024;
const TUI_TAIL_LINES: usize = 1000;
const HISTORY_TAIL_BYTES: u64 = 256 * 1024;
const HISTORY_TAIL_LINES: usize = 200;

static TUI_RESUME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<ts>\d{4}-\d{2}-\d{2}T[0-9:.]+Z)\s+INFO Resum(?:ing|ed) rollout(?: successfully)? from "(?P<path>[^"]+)""#,
    )
    .expect("tui resume pattern")
});

/// Which signal produced a bound log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Pid,
    Tui,
    History,
    SessionDir,
    RecentAny,
    /// Pinned on the command line.
    Explicit,
}

impl LogSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Tui => "tui",
            Self::History => "history",
            Self::SessionDir => "session_dir",
            Self::RecentAny => "recent_any",
            Self::Explicit => "explicit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLog {
    pub path: PathBuf,
    pub source: LogSource,
}

#[derive(Debug, Error)]
pub enum OpenFilesError {
    #[error("process {pid} is not running")]
    ProcessGone { pid: u32 },
    #[error("failed to list open files of process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("lsof failed for process {pid}: {status}")]
    Lsof { pid: u32, status: String },
}

/// Lists the files a process (and its descendants) currently holds open.
pub trait OpenFiles: Send {
    fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, OpenFilesError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFilesMethod {
    Procfs,
    Lsof,
}

impl OpenFilesMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Procfs => "/proc",
            Self::Lsof => "lsof",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOpenFiles {
    method: OpenFilesMethod,
}

impl ProcessOpenFiles {
    pub fn detect() -> Self {
        let method = if Path::new("/proc/self/fd").is_dir() {
            OpenFilesMethod::Procfs
        } else {
            OpenFilesMethod::Lsof
        };
        Self { method }
    }

    pub fn method(&self) -> OpenFilesMethod {
        self.method
    }
}

impl OpenFiles for ProcessOpenFiles {
    fn open_files(&self, pid: u32) -> Result<Vec<PathBuf>, OpenFilesError> {
        match self.method {
            OpenFilesMethod::Procfs => procfs_open_files(pid),
            OpenFilesMethod::Lsof => lsof_open_files(pid),
        }
    }
}

fn procfs_open_files(pid: u32) -> Result<Vec<PathBuf>, OpenFilesError> {
    let proc_root = Path::new("/proc");
    if !proc_root.join(pid.to_string()).is_dir() {
        return Err(OpenFilesError::ProcessGone { pid });
    }
    let mut files = Vec::new();
    for process in process_tree(proc_root, pid) {
        let fd_dir = proc_root.join(process.to_string()).join("fd");
        let entries = match fs::read_dir(&fd_dir) {
            Ok(entries) => entries,
            Err(source) if process == pid => return Err(OpenFilesError::Io { pid, source }),
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                files.push(target);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// `root` followed by every live descendant, breadth first.
fn process_tree(proc_root: &Path, root: u32) -> Vec<u32> {
    let mut seen = HashSet::from([root]);
    let mut order = vec![root];
    let mut idx = 0;
    while idx < order.len() {
        let pid = order[idx];
        idx += 1;
        let Ok(tasks) = fs::read_dir(proc_root.join(pid.to_string()).join("task")) else {
            continue;
        };
        for task in tasks.flatten() {
            let Ok(children) = fs::read_to_string(task.path().join("children")) else {
                continue;
            };
            for child in children.split_whitespace().filter_map(|raw| raw.parse::<u32>().ok()) {
                if seen.insert(child) {
                    order.push(child);
                }
            }
        }
    }
    order
}

fn lsof_open_files(pid: u32) -> Result<Vec<PathBuf>, OpenFilesError> {
    let output = Command::new("lsof")
        .arg("-p")
        .arg(pid.to_string())
        .arg("-Fn")
        .output()
        .map_err(|source| OpenFilesError::Io { pid, source })?;
    if !output.status.success() && output.stdout.is_empty() {
        return Err(OpenFilesError::Lsof {
            pid,
            status: output.status.to_string(),
        });
    }
    Ok(parse_lsof_names(&String::from_utf8_lossy(&output.stdout)))
}

/// `-Fn` output: one field per line, file names prefixed with `n`.
fn parse_lsof_names(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter(|name| !name.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Everything discovery needs to know about the supervised session.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub cwd: PathBuf,
    pub start_time: DateTime<Utc>,
    pub pid: Option<u32>,
    pub paths: CodexPaths,
    /// Replaces the dated bucket under the sessions root.
    pub session_dir: Option<PathBuf>,
    pub clock_skew: Duration,
}

impl DiscoveryRequest {
    /// `sessions/YYYY/MM/DD` for the local date of `start_time`.
    pub fn day_bucket(&self) -> PathBuf {
        if let Some(dir) = &self.session_dir {
            return dir.clone();
        }
        let local = self.start_time.with_timezone(&Local);
        self.paths
            .sessions_root
            .join(local.format("%Y").to_string())
            .join(local.format("%m").to_string())
            .join(local.format("%d").to_string())
    }
}

pub struct LogDiscovery {
    request: DiscoveryRequest,
    open_files: Box<dyn OpenFiles>,
}

impl LogDiscovery {
    pub fn new(request: DiscoveryRequest, open_files: Box<dyn OpenFiles>) -> Self {
        Self {
            request,
            open_files,
        }
    }

    pub fn request(&self) -> &DiscoveryRequest {
        &self.request
    }

    /// Full resolution: the pid step, then the one-shot fallbacks.
    pub fn resolve(&self) -> Option<ResolvedLog> {
        self.resolve_pid().or_else(|| self.resolve_fallback())
    }

    pub fn resolve_pid(&self) -> Option<ResolvedLog> {
        let pid = self.request.pid?;
        let open = match self.open_files.open_files(pid) {
            Ok(open) => open,
            Err(err) => {
                debug!(pid, error = %err, "discovery:pid listing failed");
                return None;
            }
        };
        let candidates: Vec<LogCandidate> = open
            .iter()
            .filter(|path| is_log_file_name(path))
            .filter_map(|path| LogCandidate::inspect(path))
            .collect();
        let best = best_candidate(
            &candidates,
            self.request.start_time,
            &self.request.cwd,
            self.request.clock_skew,
        )?;
        debug!(path = %best.path.display(), "discovery:pid");
        Some(ResolvedLog {
            path: best.path.clone(),
            source: LogSource::Pid,
        })
    }

    /// Steps that do not depend on the process: resume log, history, today's
    /// bucket, then the whole sessions tree.
    pub fn resolve_fallback(&self) -> Option<ResolvedLog> {
        let steps: [(LogSource, fn(&Self) -> Option<PathBuf>); 4] = [
            (LogSource::Tui, Self::from_tui_log),
            (LogSource::History, Self::from_history),
            (LogSource::SessionDir, Self::from_session_dir),
            (LogSource::RecentAny, Self::from_recent_any),
        ];
        steps.into_iter().find_map(|(source, step)| {
            let path = step(self)?;
            debug!(path = %path.display(), source = source.as_str(), "discovery:fallback");
            Some(ResolvedLog { path, source })
        })
    }

    fn from_tui_log(&self) -> Option<PathBuf> {
        let window =
            read_tail_window(&self.request.paths.tui_log, TUI_TAIL_BYTES, TUI_TAIL_LINES).ok()?;
        let mut fallback = None;
        for line in window.lines.iter().rev() {
            let Some(captures) = TUI_RESUME_PATTERN.captures(line) else {
                continue;
            };
            let path = PathBuf::from(&captures["path"]);
            if !path.is_file() {
                continue;
            }
            if LogCandidate::inspect(&path).is_some_and(|c| c.matches_cwd(&self.request.cwd)) {
                return Some(path);
            }
            fallback.get_or_insert(path);
        }
        fallback
    }

    fn from_history(&self) -> Option<PathBuf> {
        let window = read_tail_window(
            &self.request.paths.history,
            HISTORY_TAIL_BYTES,
            HISTORY_TAIL_LINES,
        )
        .ok()?;
        let session_id = window.lines.iter().rev().find_map(|line| {
            let value: Value = serde_json::from_str(line).ok()?;
            str_at(&value, &["session_id"]).filter(|id| !id.is_empty())
        })?;
        self.find_by_session_id(&session_id)
    }

    fn find_by_session_id(&self, session_id: &str) -> Option<PathBuf> {
        let suffix = format!("{session_id}.jsonl");
        let matches: Vec<(SystemTime, PathBuf)> = walk_files(&self.request.paths.sessions_root)
            .filter(|(_, path)| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(&suffix))
            })
            .collect();
        newest_preferring_cwd(matches, &self.request.cwd)
    }

    fn from_session_dir(&self) -> Option<PathBuf> {
        let entries = fs::read_dir(self.request.day_bucket()).ok()?;
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_log_file_name(path))
            .filter_map(|path| Some((fs::metadata(&path).ok()?.modified().ok()?, path)))
            .max_by_key(|(mtime, _)| *mtime)
            .map(|(_, path)| path)
    }

    fn from_recent_any(&self) -> Option<PathBuf> {
        let logs: Vec<(SystemTime, PathBuf)> = walk_files(&self.request.paths.sessions_root)
            .filter(|(_, path)| is_log_file_name(path))
            .collect();
        newest_preferring_cwd(logs, &self.request.cwd)
    }
}

/// Regular files under `root` with their mtimes. A missing root is empty.
fn walk_files(root: &Path) -> impl Iterator<Item = (SystemTime, PathBuf)> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.into_path()))
        })
}

fn newest_preferring_cwd(mut logs: Vec<(SystemTime, PathBuf)>, cwd: &Path) -> Option<PathBuf> {
    logs.sort_by(|left, right| right.0.cmp(&left.0));
    let newest = logs.first().map(|(_, path)| path.clone());
    logs.into_iter()
        .map(|(_, path)| path)
        .find(|path| LogCandidate::inspect(path).is_some_and(|c| c.matches_cwd(cwd)))
        .or(newest)
}
