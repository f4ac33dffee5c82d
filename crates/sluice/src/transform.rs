// ai
//! 🔄 Transform — a duplex whose writable side feeds its readable side through a step.
//!
//! 🧠 Knowledge graph:
//! - A [`TransformStep`] sees every written chunk and pushes zero or more chunks out
//!   through a [`Pusher`]. The pusher waits whenever the readable side is full, which
//!   stalls the write, which fills the writable buffer, which makes `write` return `false`.
//!   Backpressure, end to end, for free.
//! - `flush` runs as the writable side's finalizer, then the readable side is ended.
//! - `destroy` is the step's teardown hook.
//!
//! "A transform that never pushes is a very expensive `/dev/null`." 🦆

use anyhow::Result;
use async_trait::async_trait;
use tracing::trace;

use crate::backends::Sink;
use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::options::StreamOptions;
use crate::readable::Readable;

/// 📤 The readable side, as seen from inside a transform.
#[derive(Debug, Clone)]
pub struct Pusher {
    readable: Readable,
}

impl Pusher {
    /// 📤 Push one chunk out, waiting for room if the readable side is full.
    pub async fn push(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        if !self.readable.push(chunk)? {
            self.readable.wait_for_space().await?;
        }
        Ok(())
    }
}

/// 🔄 The per-chunk logic of a transform.
#[async_trait]
pub trait TransformStep: Send + 'static {
    async fn transform(&mut self, chunk: Chunk, out: &Pusher) -> Result<()>;

    async fn flush(&mut self, _out: &Pusher) -> Result<()> {
        Ok(())
    }

    async fn destroy(&mut self, _err: Option<&StreamError>) -> Result<()> {
        Ok(())
    }
}

struct TransformSink<T> {
    step: T,
    out: Pusher,
}

#[async_trait]
impl<T: TransformStep> Sink for TransformSink<T> {
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        self.step.transform(chunk, &self.out).await
    }

    async fn finalize(&mut self) -> Result<()> {
        self.step.flush(&self.out).await?;
        trace!("🏁 transform flushed, ending the readable side");
        self.out.readable.push_end();
        Ok(())
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> Result<()> {
        self.step.destroy(err).await
    }
}

struct MapStep<F> {
    map: F,
}

#[async_trait]
impl<F> TransformStep for MapStep<F>
where
    F: FnMut(Chunk) -> Result<Option<Chunk>> + Send + 'static,
{
    async fn transform(&mut self, chunk: Chunk, out: &Pusher) -> Result<()> {
        if let Some(mapped) = (self.map)(chunk)? {
            out.push(mapped).await?;
        }
        Ok(())
    }
}

/// 🏭 Constructors. A transform *is* a [`Duplex`]; this type only names the recipes.
pub struct Transform;

impl Transform {
    pub fn new(step: impl TransformStep, opts: StreamOptions) -> Result<Duplex, StreamError> {
        Duplex::new(opts, move |readable| TransformSink {
            step,
            out: Pusher { readable },
        })
    }

    /// 🪄 A synchronous one-in, zero-or-one-out transform. `Ok(None)` drops the chunk.
    pub fn map<F>(opts: StreamOptions, map: F) -> Result<Duplex, StreamError>
    where
        F: FnMut(Chunk) -> Result<Option<Chunk>> + Send + 'static,
    {
        Self::new(MapStep { map }, opts)
    }

    /// 🚿 Everything in comes out unchanged.
    pub fn passthrough(opts: StreamOptions) -> Result<Duplex, StreamError> {
        Self::map(opts, |chunk| Ok(Some(chunk)))
    }
}
