use super::reader::{read_line_bounded, LineRead};
use super::{RawLine, SourceError};
use crate::config::types::LogsConfig;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::time::sleep;
use tracing::{debug, info};

const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Tails the node's log files in a directory, following rotations.
///
/// Files are consumed oldest first. The reader stays on a file until it hits
/// EOF *and* a newer unread file exists, so lines appended to a file that
/// was just renamed by the rotation are still picked up before switching.
/// Files are remembered by device, inode and creation time, which keeps a
/// renamed file from being read a second time under its new name. Entries
/// for files that left the directory are forgotten, so a later file that
/// reuses a freed inode is still read.
pub struct LogsSource {
    name: Arc<str>,
    dir: PathBuf,
    pattern: Regex,
    follow: bool,
    poll_interval: Duration,
    limit: usize,
    current: Option<OpenLog>,
    consumed: HashSet<FileId>,
    buf: Vec<u8>,
    next_seq: u64,
}

struct OpenLog {
    path: PathBuf,
    reader: BufReader<File>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileId {
    dev: u64,
    ino: u64,
    created: Option<SystemTime>,
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    id: FileId,
    modified: SystemTime,
    rotation: u32,
}

impl LogsSource {
    pub fn new(config: &LogsConfig, limit: usize) -> Result<Self, SourceError> {
        let dir = config.dir.clone().ok_or(SourceError::Missing("logs.dir"))?;
        let pattern = Regex::new(&config.pattern)?;

        Ok(Self {
            name: Arc::from(format!("logs:{}", dir.display())),
            dir,
            pattern,
            follow: config.follow,
            poll_interval: config.poll_interval,
            limit,
            current: None,
            consumed: HashSet::new(),
            buf: Vec::new(),
            next_seq: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next_line(&mut self) -> Result<Option<RawLine>, SourceError> {
        loop {
            if self.current.is_none() && !self.open_next().await? {
                if !self.follow {
                    return Ok(None);
                }
                sleep(self.poll_interval).await;
                continue;
            }

            let Some(current) = self.current.as_mut() else {
                continue;
            };

            match read_line_bounded(&mut current.reader, &mut self.buf, self.limit, false).await? {
                LineRead::Line(text) => return Ok(Some(self.emit(text))),
                LineRead::TooLong => {
                    return Err(SourceError::LineTooLong {
                        seq: self.next_seq,
                        limit: self.limit,
                    })
                }
                LineRead::Eof => {}
            }

            // At EOF: the file is finished once something newer shows up
            if self.has_unread_files().await? || !self.follow {
                if let Some(finished) = self.current.take() {
                    debug!(path = %finished.path.display(), "Finished log file");
                }
                if let Some(text) = self.take_partial() {
                    return Ok(Some(self.emit(text)));
                }
                continue;
            }

            sleep(self.poll_interval).await;
        }
    }

    fn emit(&mut self, text: String) -> RawLine {
        let seq = self.next_seq;
        self.next_seq += 1;
        RawLine {
            source: Arc::clone(&self.name),
            seq,
            text,
        }
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(text)
    }

    /// Opens the oldest file not read yet. Returns false when there is none.
    async fn open_next(&mut self) -> Result<bool, SourceError> {
        let files = self.scan().await?;
        self.forget_missing(&files);
        let Some(next) = files
            .into_iter()
            .find(|f| !self.consumed.contains(&f.id))
        else {
            return Ok(false);
        };

        let file = File::open(&next.path).await?;
        info!(path = %next.path.display(), "Opened log file");

        self.consumed.insert(next.id);
        self.current = Some(OpenLog {
            path: next.path,
            reader: BufReader::with_capacity(READ_BUFFER_CAPACITY, file),
        });
        Ok(true)
    }

    async fn has_unread_files(&mut self) -> Result<bool, SourceError> {
        let files = self.scan().await?;
        self.forget_missing(&files);
        Ok(files.iter().any(|f| !self.consumed.contains(&f.id)))
    }

    /// Drops consumed entries whose file is no longer listed. The open file
    /// keeps its inode allocated, so it cannot be confused with a new one.
    fn forget_missing(&mut self, files: &[LogFile]) {
        let before = self.consumed.len();
        self.consumed.retain(|id| files.iter().any(|f| &f.id == id));
        let forgotten = before - self.consumed.len();
        if forgotten > 0 {
            debug!(forgotten, "Forgot log files no longer in the directory");
        }
    }

    /// Lists matching files, oldest first.
    async fn scan(&self) -> Result<Vec<LogFile>, SourceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !self.pattern.is_match(name) {
                continue;
            }

            // The file may disappear between listing and stat
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }

            files.push(LogFile {
                path: entry.path(),
                id: file_id(&metadata),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                rotation: rotation_index(name),
            });
        }

        files.sort_by(|a, b| {
            (a.modified, Reverse(a.rotation), &a.path).cmp(&(b.modified, Reverse(b.rotation), &b.path))
        });
        Ok(files)
    }
}

/// Numeric rotation suffix, `node.log.3` -> 3. Higher means older.
fn rotation_index(name: &str) -> u32 {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse().ok())
        .unwrap_or(0)
}

// Creation time tells apart two files that got the same inode in turn
#[cfg(unix)]
fn file_id(metadata: &Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    FileId {
        dev: metadata.dev(),
        ino: metadata.ino(),
        created: metadata.created().ok(),
    }
}

#[cfg(not(unix))]
fn file_id(metadata: &Metadata) -> FileId {
    FileId {
        dev: 0,
        ino: 0,
        created: metadata.created().ok(),
    }
}
