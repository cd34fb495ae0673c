use std::collections::VecDeque;
use std::io::{BufRead, BufReader as StdBufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use controlcenter_postfix::RecordLocation;
use flate2::read::GzDecoder;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SourceError;
use super::file::{StreamSource, line_text};
use crate::reader::{LineSource, SourceLine};

pub const DEFAULT_BASES: [&str; 3] = ["mail.log", "maillog", "zimbra.log"];

const GZ_LINE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rotation {
    /// `base-YYYYMMDD[.gz]`
    Dated(u32),
    /// `base.N[.gz]`, a higher `N` is older.
    Numbered(u32),
    Active,
}

impl Rotation {
    fn order_key(self) -> (u8, i64) {
        match self {
            Self::Dated(date) => (0, i64::from(date)),
            Self::Numbered(index) => (1, -i64::from(index)),
            Self::Active => (2, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub rotation: Rotation,
    pub compressed: bool,
}

fn base_pattern(base: &str) -> Result<Regex> {
    let pattern = format!(r"^{}(?:-(\d{{8}})|\.(\d+))?(\.gz)?$", regex::escape(base));
    Regex::new(&pattern).with_context(|| format!("invalid log file pattern: base={base}"))
}

fn classify(
    pattern: &Regex,
    name: &str,
) -> Option<(Rotation, bool)> {
    let captures = pattern.captures(name)?;
    let compressed = captures.get(3).is_some();

    let rotation = if let Some(date) = captures.get(1) {
        Rotation::Dated(date.as_str().parse().ok()?)
    } else if let Some(index) = captures.get(2) {
        Rotation::Numbered(index.as_str().parse().ok()?)
    } else if compressed {
        return None;
    } else {
        Rotation::Active
    };

    Some((rotation, compressed))
}

/// Log files of the first base name, in `bases` order, that has any file
/// in `dir`. Oldest first, the active file last.
pub async fn discover_log_files(
    dir: &Path,
    bases: &[String],
) -> Result<Vec<LogFile>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read log directory: path={}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await.context("failed to list log directory")? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    for base in bases {
        let pattern = base_pattern(base)?;

        let mut files: Vec<LogFile> = names
            .iter()
            .filter_map(|name| {
                let (rotation, compressed) = classify(&pattern, name)?;
                Some(LogFile { path: dir.join(name), rotation, compressed })
            })
            .collect();

        if files.is_empty() {
            continue;
        }

        files.sort_by_key(|f| f.rotation.order_key());
        debug!("log files found: dir={}, base={base}, count={}", dir.display(), files.len());
        return Ok(files);
    }

    Ok(Vec::new())
}

#[derive(Debug, Clone)]
pub struct DirSettings {
    pub bases: Vec<String>,
    /// Keep reading the active file as it grows.
    pub follow: bool,
    pub poll_interval: Duration,
}

impl Default for DirSettings {
    fn default() -> Self {
        Self {
            bases: DEFAULT_BASES.iter().map(|b| b.to_string()).collect(),
            follow: false,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Every rotated log file in a directory, oldest first, then the active
/// one, optionally followed as it grows.
pub struct DirSource {
    files: VecDeque<LogFile>,
    current: Option<Current>,
    follow: bool,
    poll_interval: Duration,
    changes: Option<Changes>,
}

struct Changes {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

enum Current {
    Plain(StreamSource<File>),
    Gz(GzLines),
    Tail(Tail),
}

impl DirSource {
    pub async fn open(
        dir: &Path,
        settings: DirSettings,
    ) -> Result<Self> {
        let files = discover_log_files(dir, &settings.bases).await?;
        if files.is_empty() {
            return Err(SourceError::NoLogFiles(dir.to_path_buf()).into());
        }

        let changes = if settings.follow { Some(watch(dir)?) } else { None };

        info!("log directory opened: path={}, files={}, follow={}", dir.display(), files.len(), settings.follow);

        Ok(Self {
            files: files.into(),
            current: None,
            follow: settings.follow,
            poll_interval: settings.poll_interval,
            changes,
        })
    }

    async fn open_next(
        &mut self,
        file: LogFile,
    ) -> Result<Current> {
        let filename = file.path.display().to_string();

        if file.compressed {
            return Ok(Current::Gz(GzLines::spawn(file.path, filename)));
        }

        if self.follow && file.rotation == Rotation::Active {
            return Ok(Current::Tail(Tail::open(file.path).await?));
        }

        let handle = File::open(&file.path)
            .await
            .with_context(|| format!("failed to open log file: path={filename}"))?;
        Ok(Current::Plain(StreamSource::with_filename(handle, filename)))
    }

    async fn wait_for_change(&mut self) {
        let poll = tokio::time::sleep(self.poll_interval);

        match self.changes.as_mut() {
            Some(changes) => {
                tokio::select! {
                    _ = poll => {}
                    event = changes.rx.recv() => {
                        if let Some(Err(err)) = event {
                            warn!("log directory watch error: error={err}");
                        }
                    }
                }
            }
            None => poll.await,
        }
    }
}

fn watch(dir: &Path) -> Result<Changes> {
    let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = RecommendedWatcher::new(
        move |result| {
            let _ = tx.send(result);
        },
        NotifyConfig::default(),
    )
    .map_err(|err| anyhow!("failed to create notify watcher: {err}"))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch log directory: {}", dir.display()))?;

    Ok(Changes { _watcher: watcher, rx })
}

impl LineSource for DirSource {
    async fn next_line(&mut self) -> Result<Option<SourceLine>> {
        loop {
            match self.current.as_mut() {
                Some(Current::Plain(source)) => match source.next_line().await? {
                    Some(line) => return Ok(Some(line)),
                    None => self.current = None,
                },
                Some(Current::Gz(lines)) => match lines.next_line().await {
                    Some(line) => return Ok(Some(line)),
                    None => self.current = None,
                },
                Some(Current::Tail(tail)) => {
                    if let Some(line) = tail.next_line().await? {
                        return Ok(Some(line));
                    }
                    self.wait_for_change().await;
                }
                None => {
                    let Some(file) = self.files.pop_front() else {
                        return Ok(None);
                    };

                    match self.open_next(file).await {
                        Ok(current) => self.current = Some(current),
                        Err(err) => warn!("skipping log file: error={err:#}"),
                    }
                }
            }
        }
    }
}

/// Lines of a gzipped file, decompressed on a blocking thread.
struct GzLines {
    rx: mpsc::Receiver<SourceLine>,
}

impl GzLines {
    fn spawn(
        path: PathBuf,
        filename: String,
    ) -> Self {
        let (tx, rx) = mpsc::channel(GZ_LINE_BUFFER);

        tokio::task::spawn_blocking(move || {
            if let Err(err) = read_gz(&path, &filename, &tx) {
                warn!("corrupt compressed log file, rest skipped: path={filename}, error={err:#}");
            }
        });

        Self { rx }
    }

    async fn next_line(&mut self) -> Option<SourceLine> {
        self.rx.recv().await
    }
}

fn read_gz(
    path: &Path,
    filename: &str,
    tx: &mpsc::Sender<SourceLine>,
) -> Result<()> {
    let file = std::fs::File::open(path).context("failed to open compressed log file")?;
    let mut reader = StdBufReader::new(GzDecoder::new(StdBufReader::new(file)));
    let mut buf = Vec::new();
    let mut line = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).context("failed to decompress")? == 0 {
            return Ok(());
        }

        line += 1;
        let source_line = SourceLine::with_location(line_text(&buf), RecordLocation::new(filename, line));
        if tx.blocking_send(source_line).is_err() {
            return Ok(());
        }
    }
}

/// The active file in follow mode.
struct Tail {
    path: PathBuf,
    filename: String,
    reader: BufReader<File>,
    position: u64,
    line: u64,
    partial: Vec<u8>,
}

impl Tail {
    async fn open(path: PathBuf) -> Result<Self> {
        let filename = path.display().to_string();
        let file = File::open(&path)
            .await
            .with_context(|| format!("failed to open log file: path={filename}"))?;

        Ok(Self { path, filename, reader: BufReader::new(file), position: 0, line: 0, partial: Vec::new() })
    }

    /// A complete line, or `None` when there is nothing new yet. Only at
    /// the end of the open file is it checked for truncation or rotation.
    async fn next_line(&mut self) -> Result<Option<SourceLine>> {
        let read = self
            .reader
            .read_until(b'\n', &mut self.partial)
            .await
            .with_context(|| format!("failed to read log file: path={}", self.filename))?;
        self.position += read as u64;

        if read == 0 {
            self.reopen_if_truncated().await?;
            return Ok(None);
        }

        if !self.partial.ends_with(b"\n") {
            return Ok(None);
        }

        self.line += 1;
        let text = line_text(&self.partial);
        self.partial.clear();

        Ok(Some(SourceLine::with_location(text, RecordLocation::new(self.filename.clone(), self.line))))
    }

    async fn reopen_if_truncated(&mut self) -> Result<()> {
        let Ok(metadata) = tokio::fs::metadata(&self.path).await else {
            // rotated away and not recreated yet
            return Ok(());
        };

        let open = self.reader.get_ref().metadata().await.ok();
        if metadata.len() >= self.position && !is_replaced(&metadata, &open) {
            return Ok(());
        }

        info!("log file truncated or rotated, reading from the start: path={}", self.filename);

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to reopen log file: path={}", self.filename))?;

        self.reader = BufReader::new(file);
        self.position = 0;
        self.line = 0;
        self.partial.clear();
        Ok(())
    }
}

#[cfg(unix)]
fn is_replaced(
    on_disk: &std::fs::Metadata,
    open: &Option<std::fs::Metadata>,
) -> bool {
    use std::os::unix::fs::MetadataExt;

    open.as_ref().is_some_and(|open| open.ino() != on_disk.ino() || open.dev() != on_disk.dev())
}

#[cfg(not(unix))]
fn is_replaced(
    _on_disk: &std::fs::Metadata,
    _open: &Option<std::fs::Metadata>,
) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::*;
    use crate::dbrunner::tests::temp_dir;

    fn write(
        dir: &Path,
        name: &str,
        content: &str,
    ) {
        std::fs::write(dir.join(name), content).expect("write");
    }

    fn write_gz(
        dir: &Path,
        name: &str,
        content: &str,
    ) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content.as_bytes()).expect("compress");
        std::fs::write(dir.join(name), encoder.finish().expect("finish")).expect("write");
    }

    fn names(files: &[LogFile]) -> Vec<String> {
        files
            .iter()
            .filter_map(|f| f.path.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect()
    }

    fn bases() -> Vec<String> {
        DirSettings::default().bases
    }

    async fn collect(source: &mut DirSource) -> Vec<SourceLine> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line().await.expect("read") {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn numbered_rotation_is_read_oldest_first() {
        let dir = temp_dir();
        write(&dir, "mail.log", "");
        write(&dir, "mail.log.1", "");
        write_gz(&dir, "mail.log.2.gz", "");
        write_gz(&dir, "mail.log.10.gz", "");
        write(&dir, "maillog", "");
        write(&dir, "mail.err", "");

        let files = discover_log_files(&dir, &bases()).await.expect("discover");
        assert_eq!(names(&files), vec!["mail.log.10.gz", "mail.log.2.gz", "mail.log.1", "mail.log"]);
        assert!(files[0].compressed);
        assert_eq!(files[3].rotation, Rotation::Active);
    }

    #[tokio::test]
    async fn dated_rotation_is_read_by_date() {
        let dir = temp_dir();
        write(&dir, "maillog", "");
        write(&dir, "maillog-20200102", "");
        write_gz(&dir, "maillog-20200101.gz", "");

        let files = discover_log_files(&dir, &bases()).await.expect("discover");
        assert_eq!(names(&files), vec!["maillog-20200101.gz", "maillog-20200102", "maillog"]);
    }

    #[tokio::test]
    async fn empty_directory_is_an_error() {
        let dir = temp_dir();
        let err = DirSource::open(&dir, DirSettings::default()).await.err().expect("no files");
        assert!(matches!(err.downcast_ref::<SourceError>(), Some(SourceError::NoLogFiles(_))));
    }

    #[tokio::test]
    async fn reads_every_file_with_its_own_location() {
        let dir = temp_dir();
        write_gz(&dir, "mail.log.2.gz", "one\ntwo\n");
        write(&dir, "mail.log.1", "three\n");
        write(&dir, "mail.log", "four\nfive\n");

        let mut source = DirSource::open(&dir, DirSettings::default()).await.expect("open");
        let lines = collect(&mut source).await;

        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three", "four", "five"]);

        let location = lines[4].location.clone().expect("location");
        assert!(location.filename.ends_with("mail.log"));
        assert_eq!(location.line, 2);
        assert_eq!(lines[1].location.as_ref().map(|l| l.line), Some(2));
    }

    #[tokio::test]
    async fn corrupt_compressed_file_is_skipped() {
        let dir = temp_dir();
        write(&dir, "mail.log.2.gz", "not compressed at all\n");
        write(&dir, "mail.log.1", "kept\n");
        write(&dir, "mail.log", "");

        let mut source = DirSource::open(&dir, DirSettings::default()).await.expect("open");
        let texts: Vec<String> = collect(&mut source).await.into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["kept"]);
    }

    #[tokio::test]
    async fn follow_reads_appended_lines_and_restarts_after_truncation() {
        let dir = temp_dir();
        write(&dir, "mail.log", "first\n");

        let settings = DirSettings { follow: true, poll_interval: Duration::from_millis(20), ..DirSettings::default() };
        let mut source = DirSource::open(&dir, settings).await.expect("open");

        let line = timeout(Duration::from_secs(5), source.next_line()).await.expect("first").expect("read");
        assert_eq!(line.map(|l| l.text), Some("first".to_string()));

        let mut file = tokio::fs::OpenOptions::new().append(true).open(dir.join("mail.log")).await.expect("append");
        file.write_all(b"sec").await.expect("write");
        file.flush().await.expect("flush");
        file.write_all(b"ond\n").await.expect("write");
        file.flush().await.expect("flush");

        let line = timeout(Duration::from_secs(5), source.next_line()).await.expect("second").expect("read");
        assert_eq!(line.map(|l| l.text), Some("second".to_string()));

        write(&dir, "mail.log", "x\n");

        let line = timeout(Duration::from_secs(5), source.next_line()).await.expect("third").expect("read");
        let line = line.expect("line");
        assert_eq!(line.text, "x");
        assert_eq!(line.location.map(|l| l.line), Some(1));
    }
}
