// ai
//! 📂 File backends — newline-delimited in, bytes out.
//!
//! 🧠 Knowledge graph:
//! - `FileSource` reads fixed-size blocks and splits them on `\n` with `memchr`, one chunk
//!   per line, newline stripped (`\r\n` too). A final line without a newline still counts.
//! - `FileSink` wraps a `BufWriter`. It accepts batched writes, and only `finalize` flushes.
//! - Configs live right next to the backend that reads them. One backend, one config, one file.

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, trace};

use crate::backends::{Sink, Source};
use crate::chunk::Chunk;
use crate::error::StreamError;

const READ_BLOCK_BYTES: usize = 64 * 1024;

/// 📂 Where to read lines from.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSourceConfig {
    pub file_name: String,
    /// 🧹 drop lines that are empty after stripping the newline
    #[serde(default)]
    pub skip_blank_lines: bool,
}

/// 📂 Reads a file one line at a time, without ever holding more than a block and a line.
pub struct FileSource {
    file: File,
    config: FileSourceConfig,
    // -- 📦 bytes read but not yet split into lines
    pending: Vec<u8>,
    eof: bool,
    lines_read: u64,
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("config", &self.config)
            .field("lines_read", &self.lines_read)
            .finish()
    }
}

impl FileSource {
    pub async fn new(config: FileSourceConfig) -> Result<Self> {
        let file = File::open(&config.file_name).await.with_context(|| {
            format!(
                "💀 The door to '{}' would not budge. It might not exist, or it might not like us.",
                config.file_name
            )
        })?;
        Ok(Self {
            file,
            config,
            pending: Vec::new(),
            eof: false,
            lines_read: 0,
        })
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let at = memchr::memchr(b'\n', &self.pending)?;
        let mut line: Vec<u8> = self.pending.drain(..=at).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            let mut block = vec![0u8; READ_BLOCK_BYTES];
            let read = self
                .file
                .read(&mut block)
                .await
                .with_context(|| format!("💀 Reading '{}' failed halfway through", self.config.file_name))?;
            trace!("📖 read {read} bytes from {}", self.config.file_name);
            if read == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&block[..read]);
            }
        }
    }
}

#[async_trait]
impl Source for FileSource {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        while let Some(line) = self.next_line().await? {
            if self.config.skip_blank_lines && line.is_empty() {
                continue;
            }
            self.lines_read += 1;
            return Ok(Some(Chunk::Bytes(line)));
        }
        debug!("🏁 {} ran dry after {} lines", self.config.file_name, self.lines_read);
        Ok(None)
    }
}

/// 📂 Where to write bytes to. The file is truncated on open.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSinkConfig {
    pub file_name: String,
    /// ↩️ put a `\n` after every chunk
    #[serde(default = "default_append_newline")]
    pub append_newline: bool,
}

fn default_append_newline() -> bool {
    true
}

/// 📂 A `BufWriter` with a `Sink` badge on.
#[derive(Debug)]
pub struct FileSink {
    out: BufWriter<File>,
    config: FileSinkConfig,
}

impl FileSink {
    pub async fn new(config: FileSinkConfig) -> Result<Self> {
        let file = File::create(&config.file_name).await.with_context(|| {
            format!(
                "💀 The sink file '{}' could not be conjured into existence. Does the parent directory exist?",
                config.file_name
            )
        })?;
        Ok(Self {
            out: BufWriter::new(file),
            config,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        self.out.write_all(&chunk.into_bytes()).await?;
        if self.config.append_newline {
            self.out.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn writev(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        for chunk in chunks {
            self.write(chunk).await?;
        }
        Ok(())
    }

    fn supports_writev(&self) -> bool {
        true
    }

    async fn finalize(&mut self) -> Result<()> {
        self.out
            .flush()
            .await
            .with_context(|| format!("💀 Flushing '{}' failed at the finish line", self.config.file_name))
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> Result<()> {
        if let Some(err) = err {
            debug!("🗑️ {} torn down early: {err}", self.config.file_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_lines_come_out_one_at_a_time() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("in.txt");
        tokio::fs::write(&path, "alpha\r\n\nbeta\ngamma").await?;

        let mut source = FileSource::new(FileSourceConfig {
            file_name: path.display().to_string(),
            skip_blank_lines: true,
        })
        .await?;
        let mut lines = Vec::new();
        while let Some(chunk) = source.next_chunk().await? {
            lines.push(chunk.to_text_lossy());
        }
        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_finalize_flushes_the_lot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.txt");
        let mut sink = FileSink::new(FileSinkConfig {
            file_name: path.display().to_string(),
            append_newline: true,
        })
        .await?;
        sink.write(Chunk::from("one")).await?;
        sink.writev(vec![Chunk::from("two"), Chunk::from("three")]).await?;
        sink.finalize().await?;
        assert_eq!(tokio::fs::read_to_string(&path).await?, "one\ntwo\nthree\n");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_file_is_not_there() {
        let missing = FileSource::new(FileSourceConfig {
            file_name: "/definitely/not/here.txt".into(),
            skip_blank_lines: false,
        })
        .await;
        assert!(missing.is_err());
    }
}
