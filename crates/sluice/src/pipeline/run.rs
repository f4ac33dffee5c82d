// ai
//! 🧑‍✈️ The run supervisor — counts connections home and decides the one verdict.
//!
//! 🧠 Knowledge graph:
//! - Every connection (a pump, a drain, a terminal value, a rejected stage) sends exactly one
//!   [`StageReport`] over an `async_channel`. The supervisor waits for all of them.
//! - The first error aborts the run's own controller and tears down every tracked endpoint.
//!   Premature close is the exception twice over: it may be replaced by a later specific
//!   error, and endpoints are torn down *without* it, so their own errors can surface.
//! - Abort errors never replace anything. Once we pulled the plug ourselves, every
//!   connection reports an abort; those are echoes, not news.
//! - An external signal gets a small link task. It reports the external abort as a
//!   connection-less report and goes away once the run settled.

use async_channel::{Receiver, Sender};
use futures::StreamExt;
use futures::future::BoxFuture;
use tracing::{debug, info, trace};

use super::PipelineCallback;
use crate::abort::{AbortController, AbortSignal};
use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::readable::{ChunkStream, Readable};
use crate::workers::Worker;
use crate::workers::pump_worker::PumpWorker;
use crate::writable::Writable;

/// 📬 How one connection ended. `stage: None` is the external abort signal talking.
#[derive(Debug)]
pub(crate) struct StageReport {
    pub(crate) stage: Option<usize>,
    pub(crate) outcome: Result<Option<Chunk>, StreamError>,
}

/// 🎯 Something the run tears down when it fails.
#[derive(Debug, Clone)]
pub(crate) enum Endpoint {
    Readable(Readable),
    Writable(Writable),
    Duplex(Duplex),
}

impl Endpoint {
    fn destroy(&self, err: Option<StreamError>) {
        match self {
            Endpoint::Readable(r) => r.destroy(err),
            Endpoint::Writable(w) => w.destroy(err),
            Endpoint::Duplex(d) => d.destroy(err),
        }
    }
}

pub(crate) struct PipelineRun {
    controller: AbortController,
    reports_tx: Sender<StageReport>,
    reports_rx: Receiver<StageReport>,
    endpoints: Vec<Endpoint>,
    connections: usize,
    error: Option<StreamError>,
    value: Option<Chunk>,
}

impl PipelineRun {
    pub(crate) fn new() -> Self {
        let (reports_tx, reports_rx) = async_channel::unbounded();
        Self {
            controller: AbortController::new(),
            reports_tx,
            reports_rx,
            endpoints: Vec::new(),
            connections: 0,
            error: None,
            value: None,
        }
    }

    pub(crate) fn signal(&self) -> AbortSignal {
        self.controller.signal()
    }

    pub(crate) fn track(&mut self, endpoint: Endpoint) {
        self.endpoints.push(endpoint);
    }

    pub(crate) fn spawn_pump(&mut self, make: impl FnOnce(Sender<StageReport>) -> PumpWorker) {
        self.connections += 1;
        make(self.reports_tx.clone()).start();
    }

    /// 🎁 A terminal function's value. Raced against the run's abort, since user futures
    /// are under no obligation to notice it.
    pub(crate) fn spawn_value(&mut self, stage: usize, value: BoxFuture<'static, Result<Option<Chunk>, StreamError>>) {
        self.connections += 1;
        let reports = self.reports_tx.clone();
        let signal = self.signal();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = signal.cancelled() => Err(signal.abort_error()),
                outcome = value => outcome,
            };
            let _ = reports.send(StageReport { stage: Some(stage), outcome }).await;
        });
    }

    /// 🕳️ Read a terminal sequence to the end. It produces no value.
    pub(crate) fn spawn_drain(&mut self, stage: usize, mut stream: ChunkStream) {
        let drain = async move {
            while let Some(item) = stream.next().await {
                item?;
            }
            Ok::<_, StreamError>(None)
        };
        self.spawn_value(stage, Box::pin(drain));
    }

    /// 🚫 A stage that cannot stand where it was put. Reported like any other failure.
    pub(crate) fn reject(&mut self, stage: usize, err: StreamError) {
        debug!("🚫 stage {stage} rejected: {err}");
        self.spawn_value(stage, Box::pin(async move { Err::<Option<Chunk>, _>(err) }));
    }

    fn fail(&mut self, err: StreamError) {
        match &self.error {
            None => {
                info!("💥 pipeline failed: {err}");
                self.error = Some(err.clone());
                self.controller.abort(Some(err.clone()));
                let cause = (!err.is_premature_close()).then_some(err);
                for endpoint in &self.endpoints {
                    endpoint.destroy(cause.clone());
                }
            }
            Some(current) if current.is_premature_close() && !err.is_premature_close() && !err.is_abort() => {
                debug!("🔁 premature close superseded by: {err}");
                self.error = Some(err);
            }
            Some(_) => trace!("🔇 later error ignored: {err}"),
        }
    }

    /// 🧑‍✈️ Hand the run to its supervisor. `callback` fires once everything reported.
    pub(crate) fn start(mut self, external: Option<AbortSignal>, callback: PipelineCallback) {
        let settled = AbortController::new();
        let fired_early = external.clone();
        if let Some(external) = external {
            let reports = self.reports_tx.clone();
            let settled = settled.signal();
            // -- ⏭️ even an already-fired signal is reported from a task, never synchronously
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = settled.cancelled() => {}
                    _ = external.cancelled() => {
                        let outcome = Err(external.abort_error());
                        let _ = reports.send(StageReport { stage: None, outcome }).await;
                    }
                }
            });
        }

        tokio::spawn(async move {
            // -- ⏭️ a signal that fired before we started beats whatever the stages report first
            if let Some(external) = fired_early.filter(AbortSignal::is_aborted) {
                self.fail(external.abort_error());
            }
            let mut remaining = self.connections;
            while remaining > 0 {
                let Ok(report) = self.reports_rx.recv().await else {
                    break;
                };
                if let Some(stage) = report.stage {
                    remaining -= 1;
                    trace!("📬 stage {stage} reported, {remaining} to go");
                }
                match report.outcome {
                    Ok(Some(value)) => self.value = Some(value),
                    Ok(None) => {}
                    Err(err) => self.fail(err),
                }
            }
            settled.abort(None);
            match self.error {
                Some(err) => callback(Err(err)),
                None => {
                    debug!("✅ pipeline finished");
                    callback(Ok(self.value));
                }
            }
        });
    }
}
