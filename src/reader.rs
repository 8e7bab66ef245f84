use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

pub const REPLAY_MAX_BYTES: u64 = 64 * 1024;
pub const REPLAY_MAX_LINES: usize = 200;

/// Follows a growing log one complete line at a time. A trailing line
/// without its newline is held back until the writer finishes it.
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    identity: Option<FileIdentity>,
    cursor: u64,
    partial: Vec<u8>,
}

impl LogReader {
    /// The file is opened lazily, so a log that does not exist yet is not an
    /// error.
    pub fn open_at(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            file: None,
            identity: None,
            cursor: offset,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset just past the last complete line handed out.
    #[cfg(test)]
    pub(crate) fn offset(&self) -> u64 {
        self.cursor
    }

    /// Next complete line without its terminator, or `None` when the writer
    /// has not produced one yet.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        // At most one reopen per call: the second pass reads the fresh file.
        for _ in 0..2 {
            if self.file.is_none() && !self.open()? {
                return Ok(None);
            }
            let Some(reader) = self.file.as_mut() else {
                return Ok(None);
            };
            let read = reader.read_until(b'\n', &mut self.partial)?;
            if self.partial.ends_with(b"\n") {
                self.cursor += self.partial.len() as u64;
                let raw = std::mem::take(&mut self.partial);
                return Ok(Some(decode_line(&raw)));
            }
            if read > 0 || !self.replaced()? {
                return Ok(None);
            }
            debug!(path = %self.path.display(), "log truncated or replaced, rereading");
            self.file = None;
            self.identity = None;
            self.cursor = 0;
            self.partial.clear();
        }
        Ok(None)
    }

    fn open(&mut self) -> io::Result<bool> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let metadata = file.metadata()?;
        if metadata.len() < self.cursor {
            self.cursor = 0;
        }
        file.seek(SeekFrom::Start(self.cursor))?;
        self.identity = file_identity(&metadata);
        self.partial.clear();
        self.file = Some(BufReader::new(file));
        Ok(true)
    }

    /// True when the path now names a shorter file than what was consumed,
    /// or a different file altogether.
    fn replaced(&self) -> io::Result<bool> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let consumed = self.cursor + self.partial.len() as u64;
        if metadata.len() < consumed {
            return Ok(true);
        }
        Ok(self.identity.is_some() && file_identity(&metadata) != self.identity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailWindow {
    pub lines: Vec<String>,
    /// Where live tailing resumes: the end of the last complete line.
    pub end_offset: u64,
    /// Earlier lines of the file were left out of `lines`.
    pub truncated: bool,
}

/// Last `max_lines` complete lines found within the final `max_bytes` of
/// the file, oldest first. A line cut by the window start is dropped.
pub fn read_tail_window(
    path: &Path,
    max_bytes: u64,
    max_lines: usize,
) -> io::Result<TailWindow> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    // One byte of lookbehind tells whether `start` sits on a line boundary.
    let read_from = start.saturating_sub(1);
    file.seek(SeekFrom::Start(read_from))?;
    let mut bytes = Vec::new();
    file.take(len - read_from).read_to_end(&mut bytes)?;

    let mut first = 0;
    if start > 0 {
        match bytes.iter().position(|b| *b == b'\n') {
            Some(pos) => first = pos + 1,
            None => {
                return Ok(TailWindow {
                    lines: Vec::new(),
                    end_offset: start,
                    truncated: true,
                });
            }
        }
    }
    let Some(last_newline) = bytes.iter().rposition(|b| *b == b'\n') else {
        return Ok(TailWindow::default());
    };
    let end_offset = read_from + last_newline as u64 + 1;
    if first > last_newline {
        return Ok(TailWindow {
            lines: Vec::new(),
            end_offset,
            truncated: start > 0,
        });
    }

    let mut lines: Vec<String> = bytes[first..last_newline]
        .split(|b| *b == b'\n')
        .map(decode_line)
        .collect();
    let mut truncated = start > 0;
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
        truncated = true;
    }
    Ok(TailWindow {
        lines,
        end_offset,
        truncated,
    })
}

/// Leading lines of a file, at most `max_lines`. Used to probe a
/// candidate's metadata without reading the whole log.
pub fn read_head_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for chunk in reader.split(b'\n').take(max_lines) {
        lines.push(decode_line(&chunk?));
    }
    Ok(lines)
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(unix)]
type FileIdentity = (u64, u64);

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
type FileIdentity = ();

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> Option<FileIdentity> {
    None
}
