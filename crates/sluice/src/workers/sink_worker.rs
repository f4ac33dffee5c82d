// ai
//! 🎬 *[a chunk lands in the queue. somewhere, a dispatcher wakes up.]*
//!
//! 🗑️ The SinkWorker: the only task that ever talks to a writable's `Sink`.
//!
//! 🧠 Knowledge graph:
//! - Loop: ask the state machine for the next job, run it against the sink, report back.
//!   No job? Park on the `Notify` until a public call pokes us.
//! - Writes and the finalizer race against teardown. Destroy wins: the sink future is
//!   dropped and the machine fails that work's callbacks instead.
//! - The construct and destroy hooks are never raced. Each runs to completion, exactly once.
//! - Holds only a `Weak` while parked, so dropping every `Writable` handle lets us exit.

use std::future::Future;
use std::sync::{Arc, Weak};

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Worker;
use crate::backends::Sink;
use crate::error::StreamError;
use crate::state::{Job, Teardown};
use crate::writable::WritableCore;

pub(crate) struct SinkWorker {
    core: Weak<WritableCore>,
    wake: Arc<Notify>,
    sink: Box<dyn Sink>,
}

impl SinkWorker {
    pub(crate) fn new(core: Weak<WritableCore>, wake: Arc<Notify>, sink: Box<dyn Sink>) -> Self {
        Self { core, wake, sink }
    }
}

/// 🏁 Run `work` unless teardown starts first. `None` means teardown won.
async fn unless_torn_down<T>(core: &WritableCore, work: impl Future<Output = T>) -> Option<T> {
    let mut snapshot = core.subscribe();
    tokio::select! {
        biased;
        out = work => Some(out),
        _ = snapshot.wait_for(|s| s.teardown != Teardown::Live) => None,
    }
}

impl Worker for SinkWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            trace!("📥 SinkWorker reporting for duty");
            loop {
                let Some(core) = self.core.upgrade() else {
                    debug!("👋 SinkWorker: every handle is gone, clocking out");
                    return Ok(());
                };
                let Some(job) = core.update_quietly(|state, fx| state.next_job(fx)) else {
                    drop(core);
                    self.wake.notified().await;
                    continue;
                };

                match job {
                    Job::Construct => {
                        debug!("🏗️ running the construct hook");
                        let result = self.sink.construct().await;
                        core.update_quietly(|state, fx| {
                            state.on_construct_complete(result.map_err(StreamError::from), fx)
                        });
                    }
                    Job::Write(chunk) => {
                        trace!("✍️ dispatching one chunk");
                        let outcome = unless_torn_down(&core, self.sink.write(chunk)).await;
                        core.update_quietly(|state, fx| match outcome {
                            Some(result) => state.on_write_complete(result.map_err(StreamError::from), fx),
                            None => state.on_write_cancelled(fx),
                        });
                    }
                    Job::Writev(chunks) => {
                        trace!("📦 dispatching a batch of {}", chunks.len());
                        let outcome = unless_torn_down(&core, self.sink.writev(chunks)).await;
                        core.update_quietly(|state, fx| match outcome {
                            Some(result) => state.on_write_complete(result.map_err(StreamError::from), fx),
                            None => state.on_write_cancelled(fx),
                        });
                    }
                    Job::Finalize => {
                        debug!("🏁 running the finalizer");
                        let outcome = unless_torn_down(&core, self.sink.finalize()).await;
                        core.update_quietly(|state, fx| match outcome {
                            Some(result) => state.on_final_complete(result.map_err(StreamError::from), fx),
                            None => state.on_final_cancelled(),
                        });
                    }
                    Job::Destroy(err) => {
                        debug!("🗑️ running the destroy hook (cause: {:?})", err.as_ref().map(StreamError::code));
                        let result = self.sink.destroy(err.as_ref()).await;
                        core.update_quietly(|state, fx| {
                            state.on_destroy_complete(result.map_err(StreamError::from), fx)
                        });
                    }
                    Job::Exit => {
                        debug!("🏁 SinkWorker: closed. Shutting down.");
                        return Ok(());
                    }
                }
            }
        })
    }
}
