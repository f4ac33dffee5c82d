// ai
//! 🚰 The SourceWorker: pulls from a `Source`, pushes into a `Readable`, naps when it's full.
//!
//! 🧠 Knowledge graph:
//! - Wait for space → pull one chunk → push. Repeat until EOF, an error, or teardown.
//! - A pull races teardown; destroying the readable drops the pending pull on the floor.
//! - `Source::close` runs once on the way out, however we got there.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::Worker;
use crate::backends::Source;
use crate::chunk::Chunk;
use crate::readable::{ChunkStream, Readable};

pub(crate) struct SourceWorker {
    readable: Readable,
    source: Box<dyn Source>,
}

impl SourceWorker {
    pub(crate) fn new(readable: Readable, source: Box<dyn Source>) -> Self {
        Self { readable, source }
    }

    async fn pump(&mut self) {
        loop {
            if self.readable.wait_for_space().await.is_err() {
                trace!("🛑 SourceWorker: readable went away, stop pulling");
                return;
            }
            let pulled = tokio::select! {
                biased;
                _ = self.readable.torn_down() => return,
                pulled = self.source.next_chunk() => pulled,
            };
            match pulled {
                Ok(Some(chunk)) => {
                    if let Err(err) = self.readable.push(chunk) {
                        self.readable.destroy(Some(err));
                        return;
                    }
                }
                Ok(None) => {
                    debug!("🏁 SourceWorker: source ran dry");
                    self.readable.push_end();
                    return;
                }
                Err(err) => {
                    debug!("💥 SourceWorker: source failed: {err:#}");
                    self.readable.destroy(Some(err.into()));
                    return;
                }
            }
        }
    }
}

impl Worker for SourceWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            self.pump().await;
            if let Err(err) = self.source.close().await {
                warn!("⚠️ source refused to close quietly: {err:#}");
            }
            Ok(())
        })
    }
}

/// 🌊 A [`Source`] over a pull sequence. Errors in the sequence become source failures.
pub(crate) struct StreamSource {
    stream: ChunkStream,
}

impl StreamSource {
    pub(crate) fn new(stream: ChunkStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Source for StreamSource {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        match self.stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}
