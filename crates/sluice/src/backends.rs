// ai
//! 🔌 Backends — the far ends of a sluice. Sources pour, sinks swallow.
//!
//! 🎬 *[a writable endpoint stands at the edge of the channel. below it, a sink.]*
//! *[the endpoint does the bookkeeping. the sink does the I/O. nobody swaps jobs.]*
//!
//! # Knowledge Graph 🧠
//! - Pattern: trait → concrete impls (InMemory*, File*) → `*Backend` enum for config-driven dispatch.
//! - A [`Sink`] is what a `Writable` calls into: one write at a time, never concurrently,
//!   always from the endpoint's own dispatcher task.
//! - A [`Source`] is what a `Readable` pulls from when built with `Readable::from_source`.
//! - Failures come back as `anyhow::Error`; the endpoint wraps them into `StreamError::Io`.
//! - Ancient proverb: "He who puts bookkeeping in the Sink, debugs two state machines." 🦆

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::chunk::Chunk;
use crate::error::StreamError;

pub mod file;
pub mod in_mem;

pub use file::{FileSink, FileSinkConfig, FileSource, FileSourceConfig};
pub use in_mem::{InMemorySink, InMemorySource};

// ===== Source Trait and Backend Enum =====

/// 🚰 Something that yields chunks until it runs dry.
///
/// # Contract 📜
/// - `Ok(Some(chunk))` while data flows, `Ok(None)` at EOF, `Err` when it went sideways.
/// - `close` runs once after the last pull, EOF or not.
#[async_trait]
pub trait Source: Send + 'static {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ===== Sink Trait and Backend Enum =====

/// 🕳️ The I/O behind a writable endpoint.
///
/// # Contract 📜
/// - `construct` runs once, before anything else, when `needs_construct` says so. Writes
///   queue up behind it; a failure destroys the endpoint with that error.
/// - `write` is never called while a previous `write`/`writev`/`finalize` is still running.
/// - `writev` receives everything that piled up behind a slow write, in order, but only
///   when `supports_writev` says so. Otherwise chunks arrive one by one.
/// - `finalize` runs once, after the last write completed, before `finish` is announced.
/// - `destroy` runs once, during teardown, with the error that caused it (if any).
///   Its own failure is reported alongside the original one, never instead of it.
#[async_trait]
pub trait Sink: Send + 'static {
    async fn write(&mut self, chunk: Chunk) -> Result<()>;

    /// 🏗️ Async setup (open a socket, create a table, ...). Off unless `needs_construct`.
    async fn construct(&mut self) -> Result<()> {
        Ok(())
    }

    fn needs_construct(&self) -> bool {
        false
    }

    async fn writev(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        for chunk in chunks {
            self.write(chunk).await?;
        }
        Ok(())
    }

    fn supports_writev(&self) -> bool {
        false
    }

    async fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&mut self, _err: Option<&StreamError>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Sink for Box<dyn Sink> {
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        (**self).write(chunk).await
    }

    async fn construct(&mut self) -> Result<()> {
        (**self).construct().await
    }

    fn needs_construct(&self) -> bool {
        (**self).needs_construct()
    }

    async fn writev(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        (**self).writev(chunks).await
    }

    fn supports_writev(&self) -> bool {
        (**self).supports_writev()
    }

    async fn finalize(&mut self) -> Result<()> {
        (**self).finalize().await
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> Result<()> {
        (**self).destroy(err).await
    }
}

/// 🪄 A sink made of a closure. For when a whole struct is too much ceremony.
pub struct FnSink<F> {
    write: F,
}

/// 🪄 Build a [`Sink`] from `|chunk| async { ... }`.
pub fn sink_fn<F>(write: F) -> FnSink<F>
where
    F: FnMut(Chunk) -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    FnSink { write }
}

#[async_trait]
impl<F> Sink for FnSink<F>
where
    F: FnMut(Chunk) -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        (self.write)(chunk).await
    }
}

// ===== Config-driven dispatch =====

/// 🧾 Where the CLI reads from.
#[derive(Debug, Deserialize, Clone)]
pub enum SourceConfig {
    InMemory { lines: Vec<String> },
    File(FileSourceConfig),
}

/// 🧾 Where the CLI writes to.
#[derive(Debug, Deserialize, Clone)]
pub enum SinkConfig {
    InMemory,
    File(FileSinkConfig),
}

/// 🎭 The many faces of a Source.
#[derive(Debug)]
pub enum SourceBackend {
    InMemory(InMemorySource),
    File(FileSource),
}

impl SourceBackend {
    pub async fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(match config {
            SourceConfig::InMemory { lines } => {
                SourceBackend::InMemory(InMemorySource::new(lines.iter().map(|l| Chunk::from(l.as_str()))))
            }
            SourceConfig::File(file_config) => SourceBackend::File(FileSource::new(file_config.clone()).await?),
        })
    }
}

#[async_trait]
impl Source for SourceBackend {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        match self {
            SourceBackend::InMemory(source) => source.next_chunk().await,
            SourceBackend::File(source) => source.next_chunk().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SourceBackend::InMemory(source) => source.close().await,
            SourceBackend::File(source) => source.close().await,
        }
    }
}

/// 🎭 The many faces of a Sink.
#[derive(Debug)]
pub enum SinkBackend {
    InMemory(InMemorySink),
    File(FileSink),
}

impl SinkBackend {
    pub async fn from_config(config: &SinkConfig) -> Result<Self> {
        Ok(match config {
            SinkConfig::InMemory => SinkBackend::InMemory(InMemorySink::new()),
            SinkConfig::File(file_config) => SinkBackend::File(FileSink::new(file_config.clone()).await?),
        })
    }
}

#[async_trait]
impl Sink for SinkBackend {
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.write(chunk).await,
            SinkBackend::File(sink) => sink.write(chunk).await,
        }
    }

    async fn construct(&mut self) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.construct().await,
            SinkBackend::File(sink) => sink.construct().await,
        }
    }

    fn needs_construct(&self) -> bool {
        match self {
            SinkBackend::InMemory(sink) => sink.needs_construct(),
            SinkBackend::File(sink) => sink.needs_construct(),
        }
    }

    async fn writev(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.writev(chunks).await,
            SinkBackend::File(sink) => sink.writev(chunks).await,
        }
    }

    fn supports_writev(&self) -> bool {
        match self {
            SinkBackend::InMemory(sink) => sink.supports_writev(),
            SinkBackend::File(sink) => sink.supports_writev(),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.finalize().await,
            SinkBackend::File(sink) => sink.finalize().await,
        }
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> Result<()> {
        match self {
            SinkBackend::InMemory(sink) => sink.destroy(err).await,
            SinkBackend::File(sink) => sink.destroy(err).await,
        }
    }
}
