use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::reader::read_head_lines;
use crate::records::{LogRecord, decode_line};
use crate::util::{distance_millis, system_time_to_utc};

pub const LOG_FILE_PREFIX: &str = "rollout-";
pub const LOG_FILE_EXTENSION: &str = "jsonl";
pub const META_SCAN_LINES: usize = 200;

/// A possible binding target plus whatever its leading records say about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCandidate {
    pub path: PathBuf,
    pub mtime: DateTime<Utc>,
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogCandidate {
    /// `None` when the file is gone or reports no modification time.
    pub fn inspect(path: &Path) -> Option<Self> {
        let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
        let mut candidate = Self {
            path: path.to_path_buf(),
            mtime: system_time_to_utc(mtime),
            session_id: None,
            cwd: None,
            timestamp: None,
        };
        let lines = read_head_lines(path, META_SCAN_LINES).unwrap_or_default();
        for line in &lines {
            match decode_line(line) {
                LogRecord::SessionMeta(meta) => {
                    candidate.session_id = meta.id;
                    candidate.timestamp = meta.timestamp;
                    if meta.cwd.is_some() {
                        candidate.cwd = meta.cwd;
                    }
                    break;
                }
                LogRecord::TurnContext { cwd: Some(cwd) } if candidate.cwd.is_none() => {
                    candidate.cwd = Some(cwd);
                }
                _ => {}
            }
        }
        Some(candidate)
    }

    pub fn matches_cwd(&self, cwd: &Path) -> bool {
        self.cwd.as_deref() == Some(cwd)
    }

    /// Embedded timestamp if it is within `skew` of `start_time`, otherwise
    /// the file mtime. A zero skew trusts any embedded timestamp.
    fn effective_timestamp(&self, start_time: DateTime<Utc>, skew: Duration) -> DateTime<Utc> {
        match self.timestamp {
            Some(ts) if skew.is_zero() => ts,
            Some(ts) if distance_millis(ts, start_time) as u128 <= skew.as_millis() => ts,
            _ => self.mtime,
        }
    }

    fn rank_key(
        &self,
        start_time: DateTime<Utc>,
        cwd: &Path,
        skew: Duration,
    ) -> (u8, i64, Reverse<DateTime<Utc>>) {
        let cwd_rank = if self.matches_cwd(cwd) { 0 } else { 1 };
        let distance = distance_millis(self.effective_timestamp(start_time, skew), start_time);
        (cwd_rank, distance, Reverse(self.mtime))
    }
}

/// Working-directory match first, then closeness to `start_time`, then the
/// newest mtime.
pub fn best_candidate<'a>(
    candidates: &'a [LogCandidate],
    start_time: DateTime<Utc>,
    cwd: &Path,
    skew: Duration,
) -> Option<&'a LogCandidate> {
    candidates
        .iter()
        .min_by_key(|candidate| candidate.rank_key(start_time, cwd, skew))
}

pub fn is_log_file_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with(LOG_FILE_PREFIX)
        && path.extension().and_then(|ext| ext.to_str()) == Some(LOG_FILE_EXTENSION)
}
