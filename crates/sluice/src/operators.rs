// ai
//! 🧰 Operators — the higher-order helpers over pull sequences.
//!
//! 🎬 *[a chunk stream walks into a `map`. it comes out doubled. nobody is surprised.]*
//!
//! 🧠 Knowledge graph:
//! - Everything here takes and returns a [`ChunkStream`]: boxed, `'static`, fallible items.
//! - The first `Err` item ends the sequence. Nothing is pulled after a failure.
//! - An [`AbortSignal`] in [`OperatorOptions`] ends the sequence with an abort error at the
//!   next pull. [`abortable`] is the one place that logic lives.
//! - `map`, `filter` and `for_each` run up to `concurrency` user futures at once and still
//!   hand results back in input order (`buffered`, never `buffer_unordered`).
//! - The terminal helpers (`to_array`, `reduce`, `some`, `every`, `find`) consume the
//!   sequence and return a plain future.

use std::future::Future;

use futures::future::{self, Either};
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::abort::AbortSignal;
use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::readable::ChunkStream;

/// 🎛️ Knobs shared by every operator.
#[derive(Debug, Clone, Default)]
pub struct OperatorOptions {
    /// 🧵 user futures in flight at once; zero is treated as one
    pub concurrency: usize,
    pub signal: Option<AbortSignal>,
}

impl OperatorOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// 🔗 Also listen to `signal`, on top of whatever signal is already set.
    pub(crate) fn joined(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(match self.signal.take() {
            Some(own) => AbortSignal::any(&[own, signal]),
            None => signal,
        });
        self
    }

    fn width(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// ✋ End the sequence after its first error, or with an abort error once `signal` fires.
pub fn abortable(stream: ChunkStream, signal: Option<AbortSignal>) -> ChunkStream {
    stream::unfold(Some((stream, signal)), |state| async move {
        let (mut stream, signal) = state?;
        let next = match &signal {
            Some(signal) if signal.is_aborted() => Some(Err(signal.abort_error())),
            Some(signal) => tokio::select! {
                biased;
                _ = signal.cancelled() => Some(Err(signal.abort_error())),
                item = stream.next() => item,
            },
            None => stream.next().await,
        };
        match next {
            Some(Ok(chunk)) => Some((Ok(chunk), Some((stream, signal)))),
            Some(Err(err)) => Some((Err(err), None)),
            None => None,
        }
    })
    .boxed()
}

/// 🪄 Transform every chunk with an async function.
pub fn map<F, Fut>(input: ChunkStream, opts: OperatorOptions, mut f: F) -> ChunkStream
where
    F: FnMut(Chunk) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Chunk>> + Send + 'static,
{
    let width = opts.width();
    let mapped = abortable(input, opts.signal.clone())
        .map(move |item| match item {
            Ok(chunk) => {
                let fut = f(chunk);
                Either::Left(async move { fut.await.map_err(StreamError::from) })
            }
            Err(err) => Either::Right(future::ready(Err(err))),
        })
        .buffered(width);
    abortable(mapped.boxed(), opts.signal)
}

/// 🧹 Keep the chunks the predicate likes.
pub fn filter<F, Fut>(input: ChunkStream, opts: OperatorOptions, mut predicate: F) -> ChunkStream
where
    F: FnMut(&Chunk) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    let width = opts.width();
    let kept = abortable(input, opts.signal.clone())
        .map(move |item| match item {
            Ok(chunk) => {
                let verdict = predicate(&chunk);
                Either::Left(async move {
                    match verdict.await {
                        Ok(true) => Ok(Some(chunk)),
                        Ok(false) => Ok(None),
                        Err(err) => Err(StreamError::from(err)),
                    }
                })
            }
            Err(err) => Either::Right(future::ready(Err(err))),
        })
        .buffered(width)
        .filter_map(|item| future::ready(item.transpose()));
    abortable(kept.boxed(), opts.signal)
}

/// 🎆 Turn every chunk into a sequence of chunks, and flatten.
pub fn flat_map<F>(input: ChunkStream, opts: OperatorOptions, mut f: F) -> ChunkStream
where
    F: FnMut(Chunk) -> ChunkStream + Send + 'static,
{
    let flattened = abortable(input, opts.signal.clone())
        .map(move |item| match item {
            Ok(chunk) => f(chunk),
            Err(err) => stream::once(future::ready(Err(err))).boxed(),
        })
        .flatten();
    abortable(flattened.boxed(), opts.signal)
}

/// ✂️ The first `limit` chunks. Stops pulling once it has them.
pub fn take(input: ChunkStream, limit: usize, signal: Option<AbortSignal>) -> ChunkStream {
    abortable(input, signal).take(limit).boxed()
}

/// ✂️ Everything after the first `count` chunks.
pub fn drop(input: ChunkStream, count: usize, signal: Option<AbortSignal>) -> ChunkStream {
    abortable(input, signal).skip(count).boxed()
}

/// 🔁 Run `f` for every chunk. Resolves once the sequence is done, or with the first error.
pub async fn for_each<F, Fut>(input: ChunkStream, opts: OperatorOptions, mut f: F) -> Result<(), StreamError>
where
    F: FnMut(Chunk) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let width = opts.width();
    abortable(input, opts.signal)
        .map(move |item| match item {
            Ok(chunk) => {
                let fut = f(chunk);
                Either::Left(async move { fut.await.map_err(StreamError::from) })
            }
            Err(err) => Either::Right(future::ready(Err(err))),
        })
        .buffered(width)
        .try_collect::<()>()
        .await
}

/// 📦 Everything, in a `Vec`.
pub async fn to_array(input: ChunkStream, signal: Option<AbortSignal>) -> Result<Vec<Chunk>, StreamError> {
    abortable(input, signal).try_collect().await
}

/// 🧮 Fold the sequence. Without `initial`, the first chunk is the starting accumulator,
/// and an empty sequence is an error.
pub async fn reduce<F, Fut>(
    input: ChunkStream,
    initial: Option<Chunk>,
    signal: Option<AbortSignal>,
    mut f: F,
) -> Result<Chunk, StreamError>
where
    F: FnMut(Chunk, Chunk) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<Chunk>> + Send,
{
    let mut input = abortable(input, signal);
    let mut acc = match initial {
        Some(acc) => acc,
        None => match input.next().await {
            Some(first) => first?,
            None => {
                return Err(StreamError::InvalidArgValue {
                    name: "initial",
                    reason: "reduce of an empty stream requires an initial value".into(),
                });
            }
        },
    };
    while let Some(chunk) = input.next().await {
        acc = f(acc, chunk?).await?;
    }
    Ok(acc)
}

/// 🔍 The first chunk the predicate likes. Stops pulling as soon as it finds one.
pub async fn find<F, Fut>(
    input: ChunkStream,
    signal: Option<AbortSignal>,
    mut predicate: F,
) -> Result<Option<Chunk>, StreamError>
where
    F: FnMut(&Chunk) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    let mut input = abortable(input, signal);
    while let Some(chunk) = input.next().await {
        let chunk = chunk?;
        if predicate(&chunk).await? {
            return Ok(Some(chunk));
        }
    }
    Ok(None)
}

/// ✅ Does any chunk satisfy the predicate?
pub async fn some<F, Fut>(input: ChunkStream, signal: Option<AbortSignal>, predicate: F) -> Result<bool, StreamError>
where
    F: FnMut(&Chunk) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    Ok(find(input, signal, predicate).await?.is_some())
}

/// ✅ Does every chunk satisfy the predicate? Vacuously true for an empty sequence.
pub async fn every<F, Fut>(input: ChunkStream, signal: Option<AbortSignal>, mut predicate: F) -> Result<bool, StreamError>
where
    F: FnMut(&Chunk) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    let mut input = abortable(input, signal);
    while let Some(chunk) = input.next().await {
        if !predicate(&chunk?).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// 🌊 A `ChunkStream` over anything that turns into chunks.
pub fn from_iter<I>(items: I) -> ChunkStream
where
    I: IntoIterator,
    I::Item: Into<Chunk>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items.into_iter().map(|item| Ok(item.into()))).boxed()
}
