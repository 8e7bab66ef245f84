use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, SecondsFormat, Utc};

pub fn repo_root(path: &Path) -> Option<PathBuf> {
    rev_parse(path, "--show-toplevel").map(PathBuf::from)
}

/// Commit hash HEAD points at, or `None` outside a repository or before the
/// first commit.
pub fn head(repo_root: &Path) -> Option<String> {
    rev_parse(repo_root, "HEAD")
}

/// Whether any commit in `repo_root` has a commit date between `start` and
/// `end` (either order).
pub fn commit_in_range(repo_root: &Path, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    let (since, until) = if end < start { (end, start) } else { (start, end) };
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .arg("log")
        .arg("--format=%H")
        .arg(format!("--since={}", since.to_rfc3339_opts(SecondsFormat::Secs, false)))
        .arg(format!("--until={}", until.to_rfc3339_opts(SecondsFormat::Secs, false)))
        .arg("-1")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(output) => output.status.success() && !output.stdout.trim_ascii().is_empty(),
        Err(_) => false,
    }
}

fn rev_parse(path: &Path, arg: &str) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .arg("rev-parse")
        .arg(arg)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}
