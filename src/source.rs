// src/source.rs
use anyhow::{anyhow, Context, Result};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};
use tracing::warn;

/// A readable, line-oriented input stream.
pub trait LineSource {
    fn open(&mut self) -> Result<()>;

    /// Next physical line without its terminator, or `None` at EOF.
    fn read_line(&mut self) -> Result<Option<String>>;

    fn close(&mut self) -> Result<()>;

    /// Human readable name for logs.
    fn name(&self) -> String;
}

/// Read one physical line as text. Bytes that are not valid UTF-8 (legacy
/// Latin-1 captures) become U+FFFD instead of failing the read.
fn read_text_line<R: BufRead>(reader: &mut R, name: &str) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    let n = reader
        .read_until(b'\n', &mut bytes)
        .with_context(|| format!("reading from {}", name))?;
    if n == 0 {
        return Ok(None);
    }
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    let line = match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => {
            warn!(source = name, "line is not valid UTF-8, replacing invalid bytes");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    Ok(Some(line))
}

/// Lines read from any buffered reader, e.g. an in-memory cursor or stdin.
pub struct ReaderSource<R: BufRead> {
    name: String,
    reader: Option<R>,
    opened: bool,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader: Some(reader),
            opened: false,
        }
    }
}

impl<R: BufRead> LineSource for ReaderSource<R> {
    fn open(&mut self) -> Result<()> {
        if self.reader.is_none() {
            return Err(anyhow!("source {} already closed", self.name));
        }
        self.opened = true;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        if !self.opened {
            return Err(anyhow!("source {} is not open", self.name));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("source {} is not open", self.name))?;
        read_text_line(reader, &self.name)
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.opened = false;
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Lines read from a file on disk, opened lazily by [`LineSource::open`].
pub struct FileSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineSource for FileSource {
    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open input file: {:?}", self.path))?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("input file {:?} is not open", self.path))?;
        read_text_line(reader, &self.path.display().to_string())
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}
