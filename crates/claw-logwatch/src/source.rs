//! Tailing line source.
//!
//! [`LineSource`] follows a single file the way `tail -F` does: it reads
//! appended bytes, splits them on `\n` (a trailing `\r` is dropped), holds an
//! unterminated tail until it is completed or times out, and survives
//! truncation and rotation. A missing file is retried with exponential
//! backoff instead of failing the pipeline.
//!
//! Lines that have been split but not yet delivered live in the source, not in
//! the `next_line` future, so dropping that future inside a `select!` loses
//! nothing.

use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, StartPosition};
use crate::error::{LogwatchError, Result};
use crate::stats::PipelineStats;
use crate::types::RawLine;

/// Upper bound on reads per steady-state poll so a fast writer cannot starve
/// delivery. A rotated handle is always read to EOF.
const MAX_READS_PER_POLL: usize = 64;

/// Exponential backoff between open attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `initial` and capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Returns true if no failure has been seen since the last reset.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.current == self.initial
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Device and inode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity_of(metadata: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn identity_of(_metadata: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    identity: Option<FileIdentity>,
    offset: u64,
}

/// What the path currently refers to, relative to the open handle.
enum PathState {
    Same,
    Truncated,
    Replaced,
    Gone,
}

/// Tails a file and yields lines.
#[derive(Debug)]
pub struct LineSource {
    path: PathBuf,
    config: SourceConfig,
    file: Option<OpenFile>,
    pending: Vec<u8>,
    pending_since: Option<Instant>,
    ready: VecDeque<RawLine>,
    backoff: Backoff,
    stats: Arc<PipelineStats>,
    seek_to_end: bool,
}

impl LineSource {
    /// Creates a source for the given path. Nothing is opened until the first
    /// poll.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: SourceConfig) -> Self {
        let backoff = Backoff::new(config.initial_backoff(), config.max_backoff());
        let seek_to_end = config.start_position == StartPosition::End;
        Self {
            path: path.into(),
            config,
            file: None,
            pending: Vec::new(),
            pending_since: None,
            ready: VecDeque::new(),
            backoff,
            stats: Arc::new(PipelineStats::new()),
            seek_to_end,
        }
    }

    /// Reports counters into shared stats.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// The monitored path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while a handle is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Waits for the next line.
    ///
    /// Never fails: a missing file is retried with backoff and read errors
    /// drop the handle so the next attempt reopens it.
    pub async fn next_line(&mut self) -> RawLine {
        loop {
            if let Some(line) = self.try_next() {
                return line;
            }

            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(self.idle_wait()).await,
                Ok(_) => self.backoff.reset(),
                Err(LogwatchError::SourceMissing(path)) => {
                    self.stats.record_open_failure();
                    if self.backoff.is_reset() {
                        warn!(path = %path, "log file not found, retrying");
                    } else {
                        debug!(path = %path, "log file still missing");
                    }
                    tokio::time::sleep(self.backoff.next_delay()).await;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "read failed, reopening");
                    self.file = None;
                    tokio::time::sleep(self.backoff.next_delay()).await;
                }
            }
        }
    }

    /// Returns a line that is already split, without touching the file.
    pub fn try_next(&mut self) -> Option<RawLine> {
        let line = self.ready.pop_front()?;
        self.stats.record_line(line.incomplete);
        Some(line)
    }

    /// Performs one read pass and returns how many lines became ready.
    ///
    /// # Errors
    ///
    /// Returns `LogwatchError::SourceMissing` if the file cannot be found and
    /// `LogwatchError::Io` for other I/O failures.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let before = self.ready.len();

        if self.file.is_none() {
            self.open().await?;
        }

        self.read_available(MAX_READS_PER_POLL).await?;

        match self.path_state().await? {
            PathState::Same | PathState::Gone => {}
            PathState::Truncated => {
                info!(path = %self.path.display(), "log file truncated, reading from start");
                self.flush_pending();
                self.stats.record_reopen();
                self.file = None;
                self.open().await?;
                self.read_available(MAX_READS_PER_POLL).await?;
            }
            PathState::Replaced => {
                info!(path = %self.path.display(), "log file rotated, following new file");
                self.read_available(usize::MAX).await?;
                self.flush_pending();
                self.stats.record_reopen();
                self.file = None;
                self.open().await?;
                self.read_available(MAX_READS_PER_POLL).await?;
            }
        }

        if self.partial_expired() {
            self.flush_pending();
        }

        Ok(self.ready.len() - before)
    }

    async fn open(&mut self) -> Result<()> {
        let seek_to_end = std::mem::replace(&mut self.seek_to_end, false);

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LogwatchError::SourceMissing(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        let offset = if seek_to_end {
            file.seek(SeekFrom::End(0)).await?
        } else {
            0
        };

        debug!(path = %self.path.display(), offset, "opened log file");
        self.backoff.reset();
        self.file = Some(OpenFile {
            file,
            identity: identity_of(&metadata),
            offset,
        });
        Ok(())
    }

    async fn read_available(&mut self, max_reads: usize) -> Result<()> {
        let mut chunk = vec![0u8; self.config.read_chunk_bytes];
        for _ in 0..max_reads {
            let Some(open) = self.file.as_mut() else {
                break;
            };
            let n = open.file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            open.offset += n as u64;
            self.pending.extend_from_slice(&chunk[..n]);
            self.split_pending();
        }
        Ok(())
    }

    async fn path_state(&self) -> Result<PathState> {
        let Some(open) = self.file.as_ref() else {
            return Ok(PathState::Same);
        };

        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PathState::Gone),
            Err(e) => return Err(e.into()),
        };

        let identity = identity_of(&metadata);
        if identity.is_some() && identity != open.identity {
            return Ok(PathState::Replaced);
        }
        if metadata.len() < open.offset {
            return Ok(PathState::Truncated);
        }
        Ok(PathState::Same)
    }

    fn split_pending(&mut self) {
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let mut line = &self.pending[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let text = String::from_utf8_lossy(line);
            if !text.trim().is_empty() {
                self.ready.push_back(RawLine::complete(text.into_owned()));
            }
            start = end + 1;
        }

        if start > 0 {
            self.pending.drain(..start);
            self.pending_since = None;
        }

        if self.pending.is_empty() {
            self.pending_since = None;
        } else if self.pending_since.is_none() {
            self.pending_since = Some(Instant::now());
        }

        if self.pending.len() >= self.config.max_line_bytes {
            debug!(bytes = self.pending.len(), "flushing oversized line");
            self.flush_pending();
        }
    }

    fn partial_expired(&self) -> bool {
        self.pending_since
            .is_some_and(|since| since.elapsed() >= self.config.partial_line_timeout())
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.pending);
        self.pending_since = None;
        let text = String::from_utf8_lossy(&bytes);
        let text = text.strip_suffix('\r').unwrap_or(&*text);
        if !text.trim().is_empty() {
            self.ready.push_back(RawLine::incomplete(text));
        }
    }

    fn idle_wait(&self) -> Duration {
        let idle = self.config.idle_poll();
        match self.pending_since {
            Some(since) => {
                let remaining = self
                    .config
                    .partial_line_timeout()
                    .saturating_sub(since.elapsed());
                idle.min(remaining.max(Duration::from_millis(1)))
            }
            None => idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn config() -> SourceConfig {
        SourceConfig {
            idle_poll_ms: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..SourceConfig::default()
        }
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        file.write_all(content.as_bytes()).expect("append");
    }

    fn drain(source: &mut LineSource) -> Vec<RawLine> {
        std::iter::from_fn(|| source.try_next()).collect()
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("robot.log");
        (dir, path)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert!(!backoff.is_reset());
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn reads_lines_and_skips_blank_and_crlf() {
        let (_dir, path) = setup();
        append(&path, "first\r\n\n   \nsecond\n");

        let mut source = LineSource::new(&path, config());
        assert_eq!(source.poll_once().await.expect("poll"), 2);
        assert_eq!(
            drain(&mut source),
            vec![RawLine::complete("first"), RawLine::complete("second")]
        );
    }

    #[tokio::test]
    async fn holds_partial_line_until_terminated() {
        let (_dir, path) = setup();
        append(&path, "abc");

        let mut source = LineSource::new(&path, config());
        assert_eq!(source.poll_once().await.expect("poll"), 0);

        append(&path, "def\n");
        assert_eq!(source.poll_once().await.expect("poll"), 1);
        assert_eq!(drain(&mut source), vec![RawLine::complete("abcdef")]);
    }

    #[tokio::test]
    async fn flushes_partial_line_after_timeout() {
        let (_dir, path) = setup();
        append(&path, "ok\ncut off");

        let cfg = SourceConfig {
            partial_line_timeout_ms: 0,
            ..config()
        };
        let mut source = LineSource::new(&path, cfg);
        assert_eq!(source.poll_once().await.expect("poll"), 2);
        assert_eq!(
            drain(&mut source),
            vec![RawLine::complete("ok"), RawLine::incomplete("cut off")]
        );
    }

    #[tokio::test]
    async fn flushes_oversized_partial_line() {
        let (_dir, path) = setup();
        append(&path, "0123456789abc");

        let cfg = SourceConfig {
            max_line_bytes: 8,
            ..config()
        };
        let mut source = LineSource::new(&path, cfg);
        source.poll_once().await.expect("poll");
        assert_eq!(drain(&mut source), vec![RawLine::incomplete("0123456789abc")]);
    }

    #[tokio::test]
    async fn rereads_from_start_after_truncation() {
        let (_dir, path) = setup();
        append(&path, "a\nb\n");

        let stats = Arc::new(PipelineStats::new());
        let mut source = LineSource::new(&path, config()).with_stats(Arc::clone(&stats));
        assert_eq!(source.poll_once().await.expect("poll"), 2);
        drain(&mut source);

        std::fs::write(&path, "c\n").expect("truncate");
        assert_eq!(source.poll_once().await.expect("poll"), 1);
        assert_eq!(drain(&mut source), vec![RawLine::complete("c")]);
        assert_eq!(stats.snapshot(0).source_reopens, 1);
    }

    #[tokio::test]
    async fn truncation_flushes_held_partial() {
        let (_dir, path) = setup();
        append(&path, "a\nparti");

        let mut source = LineSource::new(&path, config());
        assert_eq!(source.poll_once().await.expect("poll"), 1);

        std::fs::write(&path, "x\n").expect("truncate");
        source.poll_once().await.expect("poll");
        assert_eq!(
            drain(&mut source),
            vec![
                RawLine::complete("a"),
                RawLine::incomplete("parti"),
                RawLine::complete("x")
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn follows_rotation_after_draining_old_file() {
        let (dir, path) = setup();
        append(&path, "old1\n");

        let mut source = LineSource::new(&path, config());
        source.poll_once().await.expect("poll");

        let rotated = dir.path().join("robot.log.1");
        std::fs::rename(&path, &rotated).expect("rotate");
        append(&rotated, "old2\n");
        append(&path, "new1\n");

        source.poll_once().await.expect("poll");
        let texts: Vec<String> = drain(&mut source).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["old1", "old2", "new1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rotation_drains_old_tail_past_read_cap() {
        let (dir, path) = setup();
        append(&path, "start\n");

        let cfg = SourceConfig {
            read_chunk_bytes: 16,
            ..config()
        };
        let mut source = LineSource::new(&path, cfg);
        source.poll_once().await.expect("poll");
        drain(&mut source);

        let tail: String = (0..200).map(|i| format!("old-{i:04}\n")).collect();
        assert!(tail.len() > 16 * MAX_READS_PER_POLL);
        append(&path, &tail);

        let rotated = dir.path().join("robot.log.1");
        std::fs::rename(&path, &rotated).expect("rotate");
        append(&path, "new\n");

        source.poll_once().await.expect("poll");
        let texts: Vec<String> = drain(&mut source).into_iter().map(|l| l.text).collect();
        assert_eq!(texts.len(), 201);
        assert_eq!(texts[0], "old-0000");
        assert_eq!(texts[199], "old-0199");
        assert_eq!(texts[200], "new");
    }

    #[tokio::test]
    async fn missing_file_reports_source_missing() {
        let (_dir, path) = setup();
        let mut source = LineSource::new(&path, config());
        assert!(matches!(
            source.poll_once().await,
            Err(LogwatchError::SourceMissing(_))
        ));
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn waits_for_missing_file_to_appear() {
        let (_dir, path) = setup();
        let stats = Arc::new(PipelineStats::new());
        let mut source = LineSource::new(&path, config()).with_stats(Arc::clone(&stats));

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            append(&writer_path, "hello\n");
        });

        let line = tokio::time::timeout(Duration::from_secs(5), source.next_line())
            .await
            .expect("line before timeout");
        assert_eq!(line, RawLine::complete("hello"));

        let snap = stats.snapshot(0);
        assert!(snap.source_open_failures >= 1);
        assert_eq!(snap.lines_ingested, 1);
    }

    #[tokio::test]
    async fn start_at_end_skips_existing_content() {
        let (_dir, path) = setup();
        append(&path, "old\n");

        let cfg = SourceConfig {
            start_position: StartPosition::End,
            ..config()
        };
        let mut source = LineSource::new(&path, cfg);
        assert_eq!(source.poll_once().await.expect("poll"), 0);

        append(&path, "new\n");
        source.poll_once().await.expect("poll");
        assert_eq!(drain(&mut source), vec![RawLine::complete("new")]);
    }

    #[tokio::test]
    async fn start_at_end_reads_file_created_later_from_start() {
        let (_dir, path) = setup();
        let cfg = SourceConfig {
            start_position: StartPosition::End,
            ..config()
        };
        let mut source = LineSource::new(&path, cfg);
        assert!(source.poll_once().await.is_err());

        append(&path, "first\n");
        source.poll_once().await.expect("poll");
        assert_eq!(drain(&mut source), vec![RawLine::complete("first")]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (_dir, path) = setup();
        std::fs::write(&path, b"bad \xff byte\n").expect("write");

        let mut source = LineSource::new(&path, config());
        source.poll_once().await.expect("poll");
        let lines = drain(&mut source);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains('\u{FFFD}'));
    }
}
