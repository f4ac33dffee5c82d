// ai
//! 📖 Readable — the push-source endpoint. Producers `push`, consumers `read`.
//!
//! 🎬 *[a producer pushes three chunks into a readable with room for two.]*
//! *["false," says the readable on the second one. the producer waits for space. 🦆]*
//!
//! 🧠 Knowledge graph:
//! - Same shape as `Writable`: one shared core, a short `std::sync::Mutex` around the
//!   state, a `watch` snapshot for the waiters, events delivered after the lock is gone.
//! - `push` returns `false` once the buffered size reaches the high-water mark;
//!   [`Readable::wait_for_space`] is how a producer waits that out.
//! - `end` fires once, when a reader drains the buffer after `push_end`.
//! - Teardown has no async hook here: an optional synchronous destroy hook, then
//!   `error` (once) and `close`.
//! - A reader sees a stored error exactly once, then end-of-stream. A reader that finds the
//!   endpoint torn down without an error and without `end` sees premature close, once.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tracing::debug;

use crate::abort::destroy_on_abort;
use crate::backends::Source;
use crate::chunk::{Chunk, Encoding};
use crate::error::StreamError;
use crate::events::{EventHub, lock};
use crate::options::{Side, StreamOptions};
use crate::state::Teardown;
use crate::workers::Worker;
use crate::workers::source_worker::{SourceWorker, StreamSource};

/// 🌊 A pull sequence of chunks. What pipelines and operators pass around.
pub type ChunkStream = BoxStream<'static, Result<Chunk, StreamError>>;

type DestroyHook = Box<dyn FnOnce(Option<&StreamError>) + Send>;

/// 📣 What a readable endpoint can announce.
#[derive(Debug, Clone)]
pub enum ReadableEvent {
    End,
    Error(StreamError),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    has_data: bool,
    has_space: bool,
    eof: bool,
    end_emitted: bool,
    teardown: Teardown,
    errored: bool,
}

struct ReadableState {
    object_mode: bool,
    high_water_mark: usize,
    default_encoding: Encoding,
    auto_destroy_on_end: bool,
    emit_close: bool,

    buffer: VecDeque<Chunk>,
    length: usize,
    eof: bool,
    end_emitted: bool,
    teardown: Teardown,
    errored: Option<StreamError>,
    error_emitted: bool,
    error_seen_by_reader: bool,
    premature_seen_by_reader: bool,
    destroy_hook: Option<DestroyHook>,
}

enum ReadStep {
    Item(Result<Chunk, StreamError>),
    Done { destroy_now: bool },
    Wait,
}

impl ReadableState {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            has_data: !self.buffer.is_empty(),
            has_space: self.length < self.high_water_mark || self.length == 0,
            eof: self.eof,
            end_emitted: self.end_emitted,
            teardown: self.teardown,
            errored: self.errored.is_some(),
        }
    }

    fn try_read(&mut self, events: &mut Vec<ReadableEvent>) -> ReadStep {
        if let Some(err) = &self.errored {
            if self.error_seen_by_reader {
                return ReadStep::Done { destroy_now: false };
            }
            self.error_seen_by_reader = true;
            return ReadStep::Item(Err(err.clone()));
        }
        if self.teardown != Teardown::Live {
            if self.end_emitted || self.premature_seen_by_reader {
                return ReadStep::Done { destroy_now: false };
            }
            self.premature_seen_by_reader = true;
            return ReadStep::Item(Err(StreamError::PrematureClose));
        }
        if let Some(chunk) = self.buffer.pop_front() {
            self.length -= chunk.size(self.object_mode);
            return ReadStep::Item(Ok(chunk));
        }
        if self.eof {
            if self.end_emitted {
                return ReadStep::Done { destroy_now: false };
            }
            self.end_emitted = true;
            events.push(ReadableEvent::End);
            return ReadStep::Done {
                destroy_now: self.auto_destroy_on_end,
            };
        }
        ReadStep::Wait
    }
}

struct ReadableCore {
    state: Mutex<ReadableState>,
    events: EventHub<ReadableEvent>,
    snapshot: watch::Sender<Snapshot>,
}

impl ReadableCore {
    fn update<R>(&self, f: impl FnOnce(&mut ReadableState, &mut Vec<ReadableEvent>) -> R) -> R {
        let mut events = Vec::new();
        let out = {
            let mut state = lock(&self.state);
            let out = f(&mut state, &mut events);
            let now = state.snapshot();
            self.snapshot.send_if_modified(|seen| {
                if *seen == now {
                    return false;
                }
                *seen = now;
                true
            });
            out
        };
        for event in events {
            debug!("📣 readable event: {event:?}");
            let closing = matches!(event, ReadableEvent::Close);
            self.events.emit(&event);
            if closing {
                self.events.clear();
            }
        }
        out
    }
}

/// 📖 A buffered push source.
#[derive(Clone)]
pub struct Readable {
    core: Arc<ReadableCore>,
}

impl fmt::Debug for Readable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = *self.core.snapshot.borrow();
        f.debug_struct("Readable").field("state", &snapshot).finish()
    }
}

/// 🪶 The readable counterpart of `WeakWritable`.
#[derive(Clone)]
pub(crate) struct WeakReadable(Weak<ReadableCore>);

impl WeakReadable {
    pub(crate) fn upgrade(&self) -> Option<Readable> {
        self.0.upgrade().map(|core| Readable { core })
    }
}

impl Readable {
    /// 🏗️ An empty readable. With `opts.signal` set, call this inside a tokio runtime.
    pub fn new(opts: StreamOptions) -> Result<Self, StreamError> {
        Self::build(&opts, false)
    }

    pub(crate) fn build(opts: &StreamOptions, duplex_side: bool) -> Result<Self, StreamError> {
        opts.validate()?;
        let state = ReadableState {
            object_mode: opts.object_mode_for(Side::Readable),
            high_water_mark: opts.high_water_mark_for(Side::Readable),
            default_encoding: opts.default_encoding,
            auto_destroy_on_end: opts.auto_destroy && !duplex_side,
            emit_close: opts.emit_close,
            buffer: VecDeque::new(),
            length: 0,
            eof: false,
            end_emitted: false,
            teardown: Teardown::Live,
            errored: None,
            error_emitted: false,
            error_seen_by_reader: false,
            premature_seen_by_reader: false,
            destroy_hook: None,
        };
        let (snapshot, _) = watch::channel(state.snapshot());
        let readable = Self {
            core: Arc::new(ReadableCore {
                state: Mutex::new(state),
                events: EventHub::default(),
                snapshot,
            }),
        };
        if let Some(signal) = opts.signal.clone() {
            let weak = readable.downgrade();
            let mut snapshot = readable.core.snapshot.subscribe();
            let closed = async move {
                let _ = snapshot.wait_for(|s| s.teardown == Teardown::Closed).await;
            };
            destroy_on_abort(signal, closed, move |err| {
                if let Some(readable) = weak.upgrade() {
                    readable.destroy(Some(err));
                }
            });
        }
        Ok(readable)
    }

    pub(crate) fn downgrade(&self) -> WeakReadable {
        WeakReadable(Arc::downgrade(&self.core))
    }

    /// 🚰 A readable fed by a [`Source`] on its own worker task.
    pub fn from_source(source: impl Source, opts: StreamOptions) -> Result<Self, StreamError> {
        let readable = Self::new(opts)?;
        SourceWorker::new(readable.clone(), Box::new(source)).start();
        Ok(readable)
    }

    /// 🚰 A readable fed by a pull sequence.
    pub fn from_stream(stream: ChunkStream, opts: StreamOptions) -> Result<Self, StreamError> {
        Self::from_source(StreamSource::new(stream), opts)
    }

    /// 🪝 Runs once during teardown, before `error`/`close`.
    pub fn set_destroy_hook(&self, hook: impl FnOnce(Option<&StreamError>) + Send + 'static) {
        self.core.update(|state, _| state.destroy_hook = Some(Box::new(hook)));
    }

    // ===== 📤 producing =====

    /// 📤 Buffer a chunk for readers. `Ok(false)` means: full, wait for space.
    ///
    /// Pushing into a torn-down readable is a quiet no-op that returns `Ok(false)`.
    pub fn push(&self, chunk: impl Into<Chunk>) -> Result<bool, StreamError> {
        let chunk = chunk.into();
        self.core.update(|state, _| {
            if state.teardown != Teardown::Live {
                return Ok(false);
            }
            if state.eof {
                return Err(StreamError::PushAfterEof);
            }
            let chunk = chunk.normalize(state.object_mode, true, state.default_encoding)?;
            state.length += chunk.size(state.object_mode);
            state.buffer.push_back(chunk);
            Ok(state.length < state.high_water_mark)
        })
    }

    /// 🏁 No more pushes. Readers get `end` once the buffer is drained.
    pub fn push_end(&self) {
        self.core.update(|state, _| {
            if state.teardown == Teardown::Live {
                state.eof = true;
            }
        });
    }

    /// ⏳ Resolves once there is room below the high-water mark again.
    /// Fails if the endpoint was torn down or errored meanwhile.
    pub async fn wait_for_space(&self) -> Result<(), StreamError> {
        let mut rx = self.core.snapshot.subscribe();
        let seen = match rx
            .wait_for(|s| s.has_space || s.teardown != Teardown::Live || s.errored)
            .await
        {
            Ok(seen) => *seen,
            Err(_) => return Err(StreamError::PrematureClose),
        };
        if seen.teardown != Teardown::Live || seen.errored {
            return Err(self.errored().unwrap_or(StreamError::Destroyed("push")));
        }
        Ok(())
    }

    // ===== 📥 consuming =====

    /// 📥 Next chunk, a one-time error, or `None` at end-of-stream.
    pub async fn read(&self) -> Option<Result<Chunk, StreamError>> {
        loop {
            // -- 👂 subscribe before looking, so a push between look and wait is never missed
            let mut rx = self.core.snapshot.subscribe();
            match self.core.update(|state, events| state.try_read(events)) {
                ReadStep::Item(item) => return Some(item),
                ReadStep::Done { destroy_now } => {
                    if destroy_now {
                        self.destroy(None);
                    }
                    return None;
                }
                ReadStep::Wait => {
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// 🌊 Turn this endpoint into a pull sequence.
    pub fn into_stream(self) -> ChunkStream {
        futures::stream::unfold(self, |readable| async move {
            let item = readable.read().await?;
            Some((item, readable))
        })
        .boxed()
    }

    // ===== 🗑️ teardown =====

    /// 🗑️ Tear down. Idempotent. Buffered chunks are dropped.
    pub fn destroy(&self, err: Option<StreamError>) {
        let started = self.core.update(|state, _| {
            if state.teardown != Teardown::Live {
                return None;
            }
            state.teardown = Teardown::Destroying;
            if state.errored.is_none() {
                state.errored = err;
            }
            state.buffer.clear();
            state.length = 0;
            Some((state.destroy_hook.take(), state.errored.clone()))
        });
        let Some((hook, errored)) = started else {
            return;
        };
        debug!("🗑️ readable destroyed (cause: {:?})", errored.as_ref().map(StreamError::code));
        if let Some(hook) = hook {
            hook(errored.as_ref());
        }
        self.core.update(|state, events| {
            state.teardown = Teardown::Closed;
            if let Some(err) = &state.errored
                && !state.error_emitted
            {
                state.error_emitted = true;
                events.push(ReadableEvent::Error(err.clone()));
            }
            if state.emit_close {
                events.push(ReadableEvent::Close);
            }
        });
    }

    // ===== 📣 listeners =====

    pub fn on_end(&self, mut listener: impl FnMut() + Send + 'static) {
        self.core
            .events
            .on(|e| matches!(e, ReadableEvent::End), move |_| listener());
    }

    pub fn on_close(&self, mut listener: impl FnMut() + Send + 'static) {
        self.core
            .events
            .on(|e| matches!(e, ReadableEvent::Close), move |_| listener());
    }

    pub fn on_error(&self, mut listener: impl FnMut(&StreamError) + Send + 'static) {
        self.core.events.on(
            |e| matches!(e, ReadableEvent::Error(_)),
            move |e| {
                if let ReadableEvent::Error(err) = e {
                    listener(err);
                }
            },
        );
    }

    // ===== 🔍 observers =====

    fn peek<R>(&self, f: impl FnOnce(&ReadableState) -> R) -> R {
        f(&lock(&self.core.state))
    }

    pub fn readable_ended(&self) -> bool {
        self.peek(|s| s.end_emitted)
    }

    pub fn readable_length(&self) -> usize {
        self.peek(|s| s.length)
    }

    pub fn readable_high_water_mark(&self) -> usize {
        self.peek(|s| s.high_water_mark)
    }

    pub fn readable_object_mode(&self) -> bool {
        self.peek(|s| s.object_mode)
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.peek(|s| s.errored.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.peek(|s| s.teardown != Teardown::Live)
    }

    pub fn is_closed(&self) -> bool {
        self.peek(|s| s.teardown == Teardown::Closed)
    }

    // ===== ⏳ waiters =====

    /// ⏳ End-of-stream for the read side: `Ok` after `end`, the stored error, or premature close.
    pub async fn ended(&self) -> Result<(), StreamError> {
        let mut rx = self.core.snapshot.subscribe();
        let seen = match rx
            .wait_for(|s| s.end_emitted || s.errored || s.teardown == Teardown::Closed)
            .await
        {
            Ok(seen) => *seen,
            Err(_) => return Err(StreamError::PrematureClose),
        };
        if seen.end_emitted {
            return Ok(());
        }
        Err(self.errored().unwrap_or(StreamError::PrematureClose))
    }

    /// ⏳ Resolves after teardown. Hands back the error it closed with, if any.
    pub async fn closed(&self) -> Option<StreamError> {
        let mut rx = self.core.snapshot.subscribe();
        let _ = rx.wait_for(|s| s.teardown == Teardown::Closed).await;
        self.errored()
    }

    /// ⏳ Resolves as soon as teardown starts.
    pub(crate) async fn torn_down(&self) {
        let mut rx = self.core.snapshot.subscribe();
        let _ = rx.wait_for(|s| s.teardown != Teardown::Live).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_push_says_when_it_is_full() -> Result<(), StreamError> {
        let readable = Readable::new(StreamOptions::object_mode().with_high_water_mark(2))?;
        assert!(readable.push("a")?);
        assert!(!readable.push("b")?);
        readable.push_end();
        assert_eq!(readable.push("c").unwrap_err().code(), "ERR_STREAM_PUSH_AFTER_EOF");

        assert_eq!(readable.read().await.transpose()?, Some(Chunk::from("a")));
        readable.wait_for_space().await?;
        assert_eq!(readable.read().await.transpose()?, Some(Chunk::from("b")));
        assert!(readable.read().await.is_none());
        assert!(readable.readable_ended());
        // 🗑️ standalone readables tear themselves down after end
        assert!(readable.closed().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_reader_hears_the_error_once() -> Result<(), StreamError> {
        let readable = Readable::new(StreamOptions::default())?;
        readable.push("lost")?;
        readable.destroy(Some(StreamError::io(anyhow::anyhow!("upstream melted"))));
        let first = readable.read().await;
        assert!(matches!(first, Some(Err(StreamError::Io(_)))));
        assert!(readable.read().await.is_none());
        assert!(readable.ended().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_silent_teardown_reads_as_premature() -> Result<(), StreamError> {
        let readable = Readable::new(StreamOptions::default())?;
        readable.destroy(None);
        let first = readable.read().await;
        assert!(matches!(first, Some(Err(StreamError::PrematureClose))));
        assert!(readable.read().await.is_none());
        Ok(())
    }
}
