//! Direct accounting-file follower.
//!
//! Discovers accounting files under a directory by pattern, filtered to a
//! recent modification window, and reads them forward from a caller-held
//! cursor. The same pull semantics the HTTP bridge exposes: a bounded batch
//! of events, the cursor to use next, and a `has_more` hint.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use crate::{
    cursor::Cursor,
    error::Result,
    event::{AccountingEvent, OutcomeKind},
    parser::LineParser,
};

/// Per-pull statistics, mirrored from the bridge contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PullStats {
    pub parsed: usize,
    pub skipped: usize,
    pub unknown_outcome: usize,
    pub received_lines: usize,
    pub unique_lines: usize,
}

/// One batch of the accounting feed.
#[derive(Debug, Clone)]
pub struct Pull {
    pub events: Vec<AccountingEvent>,
    /// Opaque cursor for the next pull. Equal to the input cursor when no
    /// new bytes existed.
    pub next_cursor: String,
    pub has_more: bool,
    pub stats: PullStats,
}

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub dir: PathBuf,
    /// Simple `prefix*suffix` patterns, e.g. `acct-*.csv`.
    pub patterns: Vec<String>,
    /// Only files modified within this window are considered.
    pub recent_window: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/pmta"),
            patterns: vec!["acct-*.csv".to_string()],
            recent_window: Duration::from_secs(48 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    inode: u64,
    mtime: i64,
    size: u64,
}

/// Stateful follower. Exactly one poller owns the cursor; the parser state
/// (learned CSV headers) lives here so resumes can prime them.
#[derive(Debug)]
pub struct Tailer {
    config: TailerConfig,
    parser: Mutex<LineParser>,
}

impl Tailer {
    #[must_use]
    pub fn new(config: TailerConfig) -> Self {
        Self {
            config,
            parser: Mutex::new(LineParser::new()),
        }
    }

    #[must_use]
    pub fn with_type_map(config: TailerConfig, type_map: &str) -> Self {
        Self {
            config,
            parser: Mutex::new(LineParser::new().with_type_map(type_map)),
        }
    }

    /// Read up to `limit` events forward of `cursor`.
    ///
    /// A pull never skips unread bytes within the cursor's inode; when the
    /// inode at the cursor's path changed, the replacement file is consumed
    /// from offset zero as the successor.
    ///
    /// # Errors
    /// I/O failures discovering or reading files, or an undecodable cursor.
    /// The caller's cursor remains valid either way.
    pub async fn pull(&self, cursor: Option<&str>, limit: usize) -> Result<Pull> {
        let limit = limit.max(1);
        let cursor = match cursor.filter(|c| !c.is_empty()) {
            Some(token) => Some(Cursor::decode(token)?),
            None => None,
        };

        let files = self.discover().await?;
        if files.is_empty() {
            let next_cursor = cursor.as_ref().map(Cursor::encode).unwrap_or_default();
            return Ok(Pull {
                events: Vec::new(),
                next_cursor,
                has_more: false,
                stats: PullStats::default(),
            });
        }

        let (mut index, mut offset) = position_of(&files, cursor.as_ref());
        let mut events = Vec::new();
        let mut stats = PullStats::default();
        let mut seen_lines: HashSet<String> = HashSet::new();
        let mut position = None;
        let mut has_more = false;

        while index < files.len() && events.len() < limit {
            let file = &files[index];
            let consumed = self
                .read_file(file, offset, limit - events.len(), &mut events, &mut stats, &mut seen_lines)
                .await?;
            position = Some(Cursor {
                path: file.path.display().to_string(),
                inode: file.inode,
                offset: consumed,
                mtime: file.mtime,
            });

            if events.len() >= limit {
                has_more = consumed < file.size || index + 1 < files.len();
                break;
            }
            index += 1;
            offset = 0;
        }

        let next_cursor = position
            .map(|c| c.encode())
            .or_else(|| cursor.as_ref().map(Cursor::encode))
            .unwrap_or_default();

        Ok(Pull {
            events,
            next_cursor,
            has_more,
            stats,
        })
    }

    /// Discover candidate files sorted by `(mtime, name)`.
    async fn discover(&self) -> Result<Vec<Candidate>> {
        let horizon = SystemTime::now()
            .checked_sub(self.config.recent_window)
            .unwrap_or(UNIX_EPOCH);

        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %self.config.dir.display(), "accounting directory missing");
                return Ok(files);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Rotated away between readdir and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !self
                .config
                .patterns
                .iter()
                .any(|pattern| glob_match(pattern, name))
            {
                continue;
            }
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            if modified < horizon {
                continue;
            }
            files.push(Candidate {
                path: entry.path(),
                inode: inode_of(&metadata),
                mtime: epoch_secs(modified),
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| (a.mtime, &a.path).cmp(&(b.mtime, &b.path)));
        Ok(files)
    }

    /// Read lines from `file` starting at `offset`, appending up to `want`
    /// events. Returns the byte offset consumed up to.
    async fn read_file(
        &self,
        file: &Candidate,
        offset: u64,
        want: usize,
        events: &mut Vec<AccountingEvent>,
        stats: &mut PullStats,
        seen_lines: &mut HashSet<String>,
    ) -> Result<u64> {
        let path_key = file.path.display().to_string();
        let mut start = offset.min(file.size);
        if start > 0 && start >= file.size {
            return Ok(start);
        }

        let handle = tokio::fs::File::open(&file.path).await?;
        let mut reader = BufReader::new(handle);

        // Resuming into the middle of a CSV whose header we never saw:
        // prime the header from line one, out of band, before seeking.
        if start > 0 && !self.parser.lock().has_header(&path_key) {
            let mut first_line = String::new();
            let header_len = reader.read_line(&mut first_line).await?;
            if header_len > 0 {
                let _ = self.parser.lock().parse_line(&path_key, &first_line);
            }
            if start > header_len as u64 {
                reader.seek(std::io::SeekFrom::Start(start)).await?;
            } else {
                start = header_len as u64;
            }
        } else if start > 0 {
            reader.seek(std::io::SeekFrom::Start(start)).await?;
        }

        let target = events.len() + want;
        let mut consumed = start;
        let mut buffer = Vec::new();
        while events.len() < target {
            buffer.clear();
            let read = reader.read_until(b'\n', &mut buffer).await?;
            if read == 0 {
                break;
            }
            // Only count a line as consumed when it is newline-terminated;
            // a partial trailing line is re-read on the next pull.
            if buffer.last() != Some(&b'\n') && consumed + read as u64 >= file.size {
                break;
            }
            consumed += read as u64;

            let line = String::from_utf8_lossy(&buffer);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            stats.received_lines += 1;
            if !seen_lines.insert(line.to_string()) {
                continue;
            }
            stats.unique_lines += 1;

            match self.parser.lock().parse_line(&path_key, line) {
                Some(mut event) => {
                    stats.parsed += 1;
                    if event.kind == OutcomeKind::Unknown {
                        stats.unknown_outcome += 1;
                    }
                    event.source_file = Some(path_key.clone());
                    event.offset = Some(consumed);
                    events.push(event);
                }
                None => stats.skipped += 1,
            }
        }

        debug!(
            file = %path_key,
            from = start,
            to = consumed,
            events = events.len(),
            "tailed accounting file"
        );
        Ok(consumed)
    }
}

/// Resolve the starting `(file index, offset)` for a cursor against the
/// discovered files.
fn position_of(files: &[Candidate], cursor: Option<&Cursor>) -> (usize, u64) {
    let Some(cursor) = cursor else {
        return (0, 0);
    };

    // Exact (path, inode) match: same file, resume at the stored offset.
    if let Some(index) = files
        .iter()
        .position(|f| f.path.display().to_string() == cursor.path && f.inode == cursor.inode)
    {
        return (index, cursor.offset);
    }

    // Same path, different inode: the file was rotated in place. The
    // replacement is the successor, consumed from the start.
    if let Some(index) = files
        .iter()
        .position(|f| f.path.display().to_string() == cursor.path)
    {
        return (index, 0);
    }

    // Otherwise, the first file strictly after the cursor's (mtime, name).
    let successor = files
        .iter()
        .position(|f| (f.mtime, f.path.display().to_string()) > (cursor.mtime, cursor.path.clone()));
    match successor {
        Some(index) => (index, 0),
        None => (files.len(), 0),
    }
}

/// Minimal `prefix*suffix` matching, enough for `acct-*.csv` style patterns.
fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
    0
}

#[allow(clippy::cast_possible_wrap)]
fn epoch_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
