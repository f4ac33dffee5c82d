// ai
//! 🔌 The PumpWorker: one pipeline connection, upstream sequence → downstream writable.
//!
//! 🎬 *[pull. write. "false." wait for drain. pull. write. "true." pull. nothing left. end.]*
//!
//! 🧠 Knowledge graph:
//! - Pull one chunk, write it, and when `write` says `false` wait for drain before pulling
//!   again. Upstream never runs ahead of the writable's high-water mark.
//! - While waiting on upstream we also watch the writable: if it dies first, that is what we
//!   report.
//! - Input exhausted → `end()` (unless told not to) → wait for `finish`.
//! - Once the run is aborted we stop pulling, and report however the writable actually
//!   ended. The supervisor tears it down; its own teardown error is the interesting part.

use anyhow::Result;
use async_channel::Sender;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::trace;

use super::Worker;
use crate::abort::AbortSignal;
use crate::error::StreamError;
use crate::pipeline::run::StageReport;
use crate::readable::ChunkStream;
use crate::writable::Writable;

pub(crate) struct PumpWorker {
    stage: usize,
    feed: ChunkStream,
    target: Writable,
    end: bool,
    signal: AbortSignal,
    reports: Sender<StageReport>,
}

impl PumpWorker {
    pub(crate) fn new(
        stage: usize,
        feed: ChunkStream,
        target: Writable,
        end: bool,
        signal: AbortSignal,
        reports: Sender<StageReport>,
    ) -> Self {
        Self {
            stage,
            feed,
            target,
            end,
            signal,
            reports,
        }
    }

    async fn pump(&mut self) -> Result<(), StreamError> {
        let connected = tokio::select! {
            biased;
            _ = self.signal.cancelled() => None,
            outcome = connect(&mut self.feed, &self.target, self.end) => Some(outcome),
        };
        match connected {
            Some(outcome) => outcome,
            None => {
                trace!("✋ stage {} stops pulling, waiting for its writable to settle", self.stage);
                self.target.finished().await
            }
        }
    }
}

async fn connect(feed: &mut ChunkStream, target: &Writable, end: bool) -> Result<(), StreamError> {
    loop {
        let next = tokio::select! {
            biased;
            gone = target.finished() => return Err(gone.err().unwrap_or(StreamError::PrematureClose)),
            next = feed.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                if !target.write(chunk)? {
                    target.drained().await?;
                }
            }
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }
    if !end {
        return Ok(());
    }
    if let Err(err) = target.end() {
        return Err(target.errored().unwrap_or(err));
    }
    target.finished().await
}

impl Worker for PumpWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let outcome = self.pump().await;
            trace!("📬 stage {} pump done: {:?}", self.stage, outcome.as_ref().err().map(StreamError::code));
            let report = StageReport {
                stage: Some(self.stage),
                outcome: outcome.map(|()| None),
            };
            if self.reports.send(report).await.is_err() {
                trace!("👻 stage {}: nobody is waiting for the report anymore", self.stage);
            }
            Ok(())
        })
    }
}
