// ai
//! 📦 In-memory backends. RAM in, RAM out, nothing to clean up but vibes.
//!
//! 🧠 Knowledge graph:
//! - `InMemorySource` hands out a fixed list of chunks, one per pull.
//! - `InMemorySink` is `Clone`; every clone shares one ledger behind an `Arc`, so a test can
//!   hand a clone to the endpoint and keep another one for the assertions.
//! - The ledger records more than the data: call counts, batch sizes, whether finalize and
//!   destroy ran and with what. Tests lean on all of it.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::{Sink, Source};
use crate::chunk::Chunk;
use crate::error::StreamError;

/// 🚰 A source that knows exactly what it will say, in order.
#[derive(Debug, Default)]
pub struct InMemorySource {
    remaining: VecDeque<Chunk>,
}

impl InMemorySource {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            remaining: chunks.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Source for InMemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        Ok(self.remaining.pop_front())
    }
}

/// 📒 Everything an `InMemorySink` has seen.
#[derive(Debug, Default, Clone)]
pub struct SinkLedger {
    pub received: Vec<Chunk>,
    /// one entry per underlying call: 1 for `write`, n for an n-chunk `writev`
    pub batches: Vec<usize>,
    pub finalized: usize,
    pub destroyed: usize,
    /// `code()` of the error handed to `destroy`, if there was one
    pub destroy_error: Option<&'static str>,
}

/// 📦 A sink that never forgets.
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    ledger: Arc<Mutex<SinkLedger>>,
    writev: bool,
    // -- 💣 fail the write that would bring `received` past this many chunks
    fail_after: Option<usize>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📦 Accept batched writes.
    pub fn with_writev(mut self) -> Self {
        self.writev = true;
        self
    }

    /// 💣 Accept `count` chunks, then fail every write after that.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub async fn ledger(&self) -> SinkLedger {
        self.ledger.lock().await.clone()
    }

    pub async fn received(&self) -> Vec<Chunk> {
        self.ledger.lock().await.received.clone()
    }

    /// 🪄 Everything received, glued back together as text.
    pub async fn received_text(&self) -> String {
        self.ledger
            .lock()
            .await
            .received
            .iter()
            .map(Chunk::to_text_lossy)
            .collect()
    }

    async fn store(&self, chunks: Vec<Chunk>) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        if let Some(limit) = self.fail_after
            && ledger.received.len() + chunks.len() > limit
        {
            bail!("in-memory sink refused chunk #{}: it was told to stop at {limit}", ledger.received.len() + 1);
        }
        ledger.batches.push(chunks.len());
        ledger.received.extend(chunks);
        Ok(())
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        self.store(vec![chunk]).await
    }

    async fn writev(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        self.store(chunks).await
    }

    fn supports_writev(&self) -> bool {
        self.writev
    }

    async fn finalize(&mut self) -> Result<()> {
        self.ledger.lock().await.finalized += 1;
        Ok(())
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        ledger.destroyed += 1;
        ledger.destroy_error = err.map(StreamError::code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_the_source_runs_dry_exactly_once() -> Result<()> {
        let mut source = InMemorySource::new(["a", "b"].map(Chunk::from));
        assert_eq!(source.next_chunk().await?, Some(Chunk::from("a")));
        assert_eq!(source.next_chunk().await?, Some(Chunk::from("b")));
        assert_eq!(source.next_chunk().await?, None);
        assert_eq!(source.next_chunk().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_clones_share_one_memory() -> Result<()> {
        let mut sink = InMemorySink::new().failing_after(2);
        let observer = sink.clone();
        sink.write(Chunk::from("x")).await?;
        sink.writev(vec![Chunk::from("y")]).await?;
        assert!(sink.write(Chunk::from("z")).await.is_err());
        sink.destroy(Some(&StreamError::PrematureClose)).await?;

        let ledger = observer.ledger().await;
        assert_eq!(ledger.batches, vec![1, 1]);
        assert_eq!(observer.received_text().await, "xy");
        assert_eq!(ledger.destroyed, 1);
        assert_eq!(ledger.destroy_error, Some("ERR_STREAM_PREMATURE_CLOSE"));
        Ok(())
    }
}
