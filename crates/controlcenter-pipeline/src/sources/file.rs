use std::path::Path;

use anyhow::{Context, Result};
use controlcenter_postfix::RecordLocation;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Stdin};

use crate::reader::{LineSource, SourceLine};

/// Lines of any byte stream: a file, stdin or a socket connection.
pub struct StreamSource<R> {
    reader: BufReader<R>,
    filename: Option<String>,
    line: u64,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader: BufReader::new(reader), filename: None, line: 0, buf: Vec::new() }
    }

    /// Lines carry `filename` and their line number.
    pub fn with_filename(
        reader: R,
        filename: impl Into<String>,
    ) -> Self {
        Self { filename: Some(filename.into()), ..Self::new(reader) }
    }
}

impl<R: AsyncRead + Unpin + Send> LineSource for StreamSource<R> {
    async fn next_line(&mut self) -> Result<Option<SourceLine>> {
        self.buf.clear();

        let read = self.reader.read_until(b'\n', &mut self.buf).await.context("failed to read line")?;
        if read == 0 {
            return Ok(None);
        }

        self.line += 1;
        let text = line_text(&self.buf);

        Ok(Some(match &self.filename {
            Some(filename) => SourceLine::with_location(text, RecordLocation::new(filename.clone(), self.line)),
            None => SourceLine::new(text),
        }))
    }
}

/// Invalid UTF-8 is replaced rather than rejected; the line ending is
/// dropped.
pub(crate) fn line_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

pub async fn open_file(path: &Path) -> Result<StreamSource<File>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open log file: path={}", path.display()))?;
    Ok(StreamSource::with_filename(file, path.display().to_string()))
}

pub fn stdin_source() -> StreamSource<Stdin> {
    StreamSource::new(tokio::io::stdin())
}
