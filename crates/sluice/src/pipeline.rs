// ai
//! 🚰 Pipeline — chain a source, any number of middles, and a destination, then wait for
//! exactly one verdict.
//!
//! 🎬 *[five stages stand in a line. one of them trips. the whistle blows. everybody stops.]*
//! *[one callback rings. not two. not zero. one.] 🦆*
//!
//! 🧠 Knowledge graph:
//! - A [`Stage`] is one of: a pull sequence, a [`Readable`], a [`Writable`], a [`Duplex`],
//!   or a function from the previous stage's sequence (plus the run's [`AbortSignal`]) to a
//!   new sequence or a single eventual value. The kind is decided once, by the enum.
//! - Assembly is synchronous. Each push-style endpoint with a writable side gets a
//!   [`PumpWorker`] that pulls, writes, and pauses on backpressure. Terminal functions get
//!   their own connection. See [`run`] for the supervisor that counts them home.
//! - First error wins and aborts the shared signal, except that premature close is
//!   demoted: a more specific error arriving later replaces it.
//! - The last stage's value (if it produces one) is the run's value.
//!
//! ⚠️ Needs a tokio runtime: assembly spawns tasks.

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::backends::Source;
use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::operators::{self, OperatorOptions};
use crate::readable::{ChunkStream, Readable};
use crate::workers::pump_worker::PumpWorker;
use crate::writable::Writable;

pub(crate) mod run;

use run::{Endpoint, PipelineRun};

/// 🔚 What a function stage hands back.
pub enum StageOutput {
    /// 🌊 a new pull sequence for the next stage
    Stream(ChunkStream),
    /// 🎁 a single eventual value; only legal as the last stage
    Value(BoxFuture<'static, Result<Option<Chunk>, StreamError>>),
}

pub type StageFn = Box<dyn FnOnce(ChunkStream, AbortSignal) -> StageOutput + Send>;

/// 🧩 One participant in a pipeline or a compose.
pub enum Stage {
    Source(ChunkStream),
    Readable(Readable),
    Writable(Writable),
    Duplex(Duplex),
    Function(StageFn),
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Stage::Source(_) => "Source",
            Stage::Readable(_) => "Readable",
            Stage::Writable(_) => "Writable",
            Stage::Duplex(_) => "Duplex",
            Stage::Function(_) => "Function",
        };
        f.write_str(kind)
    }
}

impl From<Readable> for Stage {
    fn from(readable: Readable) -> Self {
        Stage::Readable(readable)
    }
}

impl From<Writable> for Stage {
    fn from(writable: Writable) -> Self {
        Stage::Writable(writable)
    }
}

impl From<Duplex> for Stage {
    fn from(duplex: Duplex) -> Self {
        Stage::Duplex(duplex)
    }
}

impl From<ChunkStream> for Stage {
    fn from(stream: ChunkStream) -> Self {
        Stage::Source(stream)
    }
}

fn into_json(chunk: Chunk) -> serde_json::Value {
    match chunk {
        Chunk::Value(value) => value,
        other => serde_json::Value::String(other.to_text_lossy()),
    }
}

/// 🚰 Pull a [`Source`] directly, without a readable buffer in between.
fn source_stream(source: impl Source) -> ChunkStream {
    stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        let pulled = source.next_chunk().await;
        let item = match pulled {
            Ok(Some(chunk)) => return Some((Ok(chunk), Some(source))),
            Ok(None) => None,
            Err(err) => Some((Err(StreamError::from(err)), None)),
        };
        if let Err(err) = source.close().await {
            warn!("⚠️ source refused to close quietly: {err:#}");
        }
        item
    })
    .boxed()
}

impl Stage {
    /// 🌊 A pull sequence over in-memory items.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk>,
        I::IntoIter: Send + 'static,
    {
        Stage::Source(operators::from_iter(items))
    }

    pub fn source(source: impl Source) -> Self {
        Stage::Source(source_stream(source))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: FnOnce(ChunkStream, AbortSignal) -> StageOutput + Send + 'static,
    {
        Stage::Function(Box::new(f))
    }

    /// 🎁 A terminal function that consumes the sequence and resolves to the run's value.
    pub fn consume<F, Fut>(f: F) -> Self
    where
        F: FnOnce(ChunkStream, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Chunk>, StreamError>> + Send + 'static,
    {
        Stage::function(move |input, signal| StageOutput::Value(f(input, signal).boxed()))
    }

    // ===== 🧰 operator stages =====

    pub fn map<F, Fut>(opts: OperatorOptions, f: F) -> Self
    where
        F: FnMut(Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Chunk>> + Send + 'static,
    {
        Stage::function(move |input, signal| StageOutput::Stream(operators::map(input, opts.joined(signal), f)))
    }

    pub fn filter<F, Fut>(opts: OperatorOptions, predicate: F) -> Self
    where
        F: FnMut(&Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Stage::function(move |input, signal| {
            StageOutput::Stream(operators::filter(input, opts.joined(signal), predicate))
        })
    }

    pub fn flat_map<F>(opts: OperatorOptions, f: F) -> Self
    where
        F: FnMut(Chunk) -> ChunkStream + Send + 'static,
    {
        Stage::function(move |input, signal| StageOutput::Stream(operators::flat_map(input, opts.joined(signal), f)))
    }

    pub fn take(limit: usize) -> Self {
        Stage::function(move |input, signal| StageOutput::Stream(operators::take(input, limit, Some(signal))))
    }

    pub fn drop(count: usize) -> Self {
        Stage::function(move |input, signal| StageOutput::Stream(operators::drop(input, count, Some(signal))))
    }

    pub fn for_each<F, Fut>(opts: OperatorOptions, f: F) -> Self
    where
        F: FnMut(Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Stage::consume(move |input, signal| async move {
            operators::for_each(input, opts.joined(signal), f).await.map(|()| None)
        })
    }

    /// 📦 Collects everything into one JSON array chunk. Text and bytes become strings.
    pub fn to_array() -> Self {
        Stage::consume(|input, signal| async move {
            let chunks = operators::to_array(input, Some(signal)).await?;
            let values = chunks.into_iter().map(into_json).collect();
            Ok(Some(Chunk::Value(serde_json::Value::Array(values))))
        })
    }

    pub fn reduce<F, Fut>(initial: Option<Chunk>, f: F) -> Self
    where
        F: FnMut(Chunk, Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Chunk>> + Send + 'static,
    {
        Stage::consume(move |input, signal| async move {
            operators::reduce(input, initial, Some(signal), f).await.map(Some)
        })
    }

    pub fn some<F, Fut>(predicate: F) -> Self
    where
        F: FnMut(&Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Stage::consume(move |input, signal| async move {
            let hit = operators::some(input, Some(signal), predicate).await?;
            Ok(Some(Chunk::Value(serde_json::Value::Bool(hit))))
        })
    }

    pub fn every<F, Fut>(predicate: F) -> Self
    where
        F: FnMut(&Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Stage::consume(move |input, signal| async move {
            let all = operators::every(input, Some(signal), predicate).await?;
            Ok(Some(Chunk::Value(serde_json::Value::Bool(all))))
        })
    }

    pub fn find<F, Fut>(predicate: F) -> Self
    where
        F: FnMut(&Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Stage::consume(move |input, signal| operators::find(input, Some(signal), predicate))
    }
}

/// 🎛️ Run-wide knobs.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// ✋ abort the whole run from outside
    pub signal: Option<AbortSignal>,
    /// 🏁 call `end()` on each writable once its input runs dry
    pub end: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { signal: None, end: true }
    }
}

pub type PipelineCallback = Box<dyn FnOnce(Result<Option<Chunk>, StreamError>) + Send>;

/// 🚰 Run `stages` with default options. See [`pipeline_with`].
pub fn pipeline(
    stages: Vec<Stage>,
    callback: impl FnOnce(Result<Option<Chunk>, StreamError>) + Send + 'static,
) -> Result<(), StreamError> {
    pipeline_with(stages, PipelineOptions::default(), callback)
}

/// 🚰 Assemble and start a run. `callback` fires exactly once, with the first real error
/// or the last stage's value.
///
/// Fewer than two stages is the only error returned directly; everything else, including
/// stages in positions they cannot fill, arrives through the callback.
pub fn pipeline_with(
    stages: Vec<Stage>,
    opts: PipelineOptions,
    callback: impl FnOnce(Result<Option<Chunk>, StreamError>) + Send + 'static,
) -> Result<(), StreamError> {
    if stages.len() < 2 {
        return Err(StreamError::MissingArgs("streams"));
    }
    let mut run = PipelineRun::new();
    let signal = run.signal();
    let last = stages.len() - 1;
    debug!("🚰 assembling a pipeline of {} stages", stages.len());

    let mut feed: Option<ChunkStream> = None;
    for (index, stage) in stages.into_iter().enumerate() {
        let is_last = index == last;
        if index == 0 {
            feed = match stage {
                Stage::Source(source) => Some(source),
                Stage::Readable(readable) => {
                    run.track(Endpoint::Readable(readable.clone()));
                    Some(readable.into_stream())
                }
                Stage::Duplex(duplex) => {
                    run.track(Endpoint::Duplex(duplex.clone()));
                    Some(duplex.into_stream())
                }
                Stage::Function(f) => match f(stream::empty().boxed(), signal.clone()) {
                    StageOutput::Stream(out) => Some(out),
                    StageOutput::Value(_) => {
                        run.reject(index, StreamError::InvalidReturnValue {
                            name: "streams[0]".into(),
                            expected: "a stream",
                        });
                        None
                    }
                },
                Stage::Writable(writable) => {
                    run.track(Endpoint::Writable(writable));
                    run.reject(index, StreamError::InvalidArgType {
                        name: "streams[0]",
                        expected: "a readable stream or a pull sequence",
                    });
                    None
                }
            };
            continue;
        }

        let Some(input) = feed.take() else {
            // -- 🧟 an earlier stage was rejected; keep the endpoints so the failure tears them down
            match stage {
                Stage::Readable(r) => run.track(Endpoint::Readable(r)),
                Stage::Writable(w) => run.track(Endpoint::Writable(w)),
                Stage::Duplex(d) => run.track(Endpoint::Duplex(d)),
                Stage::Source(_) | Stage::Function(_) => {}
            }
            continue;
        };

        feed = match stage {
            Stage::Function(f) => {
                let guarded = operators::abortable(input, Some(signal.clone()));
                match f(guarded, signal.clone()) {
                    StageOutput::Stream(out) if is_last => {
                        run.spawn_drain(index, out);
                        None
                    }
                    StageOutput::Stream(out) => Some(out),
                    StageOutput::Value(value) if is_last => {
                        run.spawn_value(index, value);
                        None
                    }
                    StageOutput::Value(_) => {
                        run.reject(index, StreamError::InvalidReturnValue {
                            name: format!("streams[{index}]"),
                            expected: "a stream",
                        });
                        None
                    }
                }
            }
            Stage::Writable(writable) => {
                run.track(Endpoint::Writable(writable.clone()));
                run.spawn_pump(|reports| PumpWorker::new(index, input, writable, opts.end, signal.clone(), reports));
                if !is_last {
                    run.reject(index, StreamError::InvalidArgType {
                        name: "streams",
                        expected: "a readable stream in every position but the last",
                    });
                }
                None
            }
            Stage::Duplex(duplex) => {
                run.track(Endpoint::Duplex(duplex.clone()));
                match duplex.writable() {
                    Some(writable) => {
                        let writable = writable.clone();
                        run.spawn_pump(|reports| {
                            PumpWorker::new(index, input, writable, opts.end, signal.clone(), reports)
                        });
                    }
                    None => run.reject(index, StreamError::InvalidArgType {
                        name: "streams",
                        expected: "a writable stream after the first position",
                    }),
                }
                match (duplex.readable().is_some(), is_last) {
                    (true, true) => {
                        run.spawn_drain(index, duplex.into_stream());
                        None
                    }
                    (true, false) => Some(duplex.into_stream()),
                    (false, true) => None,
                    (false, false) => {
                        run.reject(index, StreamError::InvalidArgType {
                            name: "streams",
                            expected: "a readable stream in every position but the last",
                        });
                        None
                    }
                }
            }
            Stage::Readable(readable) => {
                run.track(Endpoint::Readable(readable));
                run.reject(index, StreamError::InvalidArgType {
                    name: "streams",
                    expected: "a writable stream or a function after the first position",
                });
                None
            }
            Stage::Source(_) => {
                run.reject(index, StreamError::InvalidArgType {
                    name: "streams",
                    expected: "a writable stream or a function after the first position",
                });
                None
            }
        };
    }

    run.start(opts.signal, Box::new(callback));
    Ok(())
}

/// ⏳ [`pipeline_with`] as a future. Resolves to the last stage's value.
pub async fn pipeline_async(stages: Vec<Stage>, opts: PipelineOptions) -> Result<Option<Chunk>, StreamError> {
    let (tx, rx) = oneshot::channel();
    pipeline_with(stages, opts, move |outcome| {
        let _ = tx.send(outcome);
    })?;
    rx.await.unwrap_or(Err(StreamError::PrematureClose))
}
