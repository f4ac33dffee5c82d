// ai
//! ✍️ Writable — the buffered sink endpoint everybody writes into.
//!
//! 🎬 *[a producer writes. the endpoint nods, takes the chunk, and says "true" or "false".]*
//! *["false?" says the producer. "drain first," says the endpoint. the producer waits. 🦆]*
//!
//! 🧠 Knowledge graph:
//! - `Writable` is a cheap `Clone` handle around one shared core: the [`WritableState`]
//!   behind a short-lived `std::sync::Mutex`, an event hub, and a `watch` channel that
//!   publishes a small lifecycle snapshot for the async waiters.
//! - Every public call locks, mutates, publishes the snapshot, unlocks, wakes the
//!   dispatcher, and only then runs the callbacks and events the machine asked for.
//! - The dispatcher is a [`SinkWorker`] task. It is the only thing that ever touches the
//!   `Sink`, so the sink sees at most one call at a time.
//! - A sink that needs constructing gets its `construct` hook as the dispatcher's first job.
//!   Writes are accepted meanwhile and wait in the buffer.
//! - The worker holds a `Weak` to the core. Drop every handle and it exits after its
//!   current job.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, oneshot, watch};
use tracing::debug;

use crate::abort::destroy_on_abort;
use crate::backends::Sink;
use crate::chunk::{Chunk, Encoding};
use crate::error::StreamError;
use crate::events::{EventHub, lock};
use crate::options::StreamOptions;
use crate::state::{Effect, Effects, Phase, Rejected, Teardown, WritableEvent, WritableState, WriteCallback};
use crate::workers::Worker;
use crate::workers::sink_worker::SinkWorker;

/// 📸 What the async waiters get to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) need_drain: bool,
    pub(crate) phase: Phase,
    pub(crate) teardown: Teardown,
    pub(crate) errored: bool,
}

impl Snapshot {
    fn of(state: &WritableState) -> Self {
        Self {
            need_drain: state.need_drain(),
            phase: state.phase(),
            teardown: state.teardown(),
            errored: state.errored().is_some(),
        }
    }
}

pub(crate) struct WritableCore {
    state: Mutex<WritableState>,
    events: EventHub<WritableEvent>,
    snapshot: watch::Sender<Snapshot>,
    wake: Arc<Notify>,
}

impl Drop for WritableCore {
    fn drop(&mut self) {
        // -- 👋 let a parked dispatcher notice that nobody is left
        self.wake.notify_one();
    }
}

impl WritableCore {
    /// 🔒 Mutate, publish, unlock, then deliver. `wake` pokes the dispatcher.
    fn transact<R>(&self, wake: bool, f: impl FnOnce(&mut WritableState, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let out = {
            let mut state = lock(&self.state);
            let out = f(&mut state, &mut fx);
            let now = Snapshot::of(&state);
            self.snapshot.send_if_modified(|seen| {
                if *seen == now {
                    return false;
                }
                *seen = now;
                true
            });
            out
        };
        if wake {
            self.wake.notify_one();
        }
        self.deliver(fx);
        out
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut WritableState, &mut Effects) -> R) -> R {
        self.transact(true, f)
    }

    /// 🤫 Same as `update`, minus the self-poke. The dispatcher uses this one.
    pub(crate) fn update_quietly<R>(&self, f: impl FnOnce(&mut WritableState, &mut Effects) -> R) -> R {
        self.transact(false, f)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    fn deliver(&self, fx: Effects) {
        for effect in fx.into_vec() {
            match effect {
                Effect::Call(callback, err) => callback(err),
                Effect::Emit(event) => {
                    debug!("📣 writable event: {event:?}");
                    let closing = matches!(event, WritableEvent::Close);
                    self.events.emit(&event);
                    if closing {
                        self.events.clear();
                    }
                }
            }
        }
    }
}

/// ✍️ A buffered, backpressure-aware sink endpoint.
#[derive(Clone)]
pub struct Writable {
    core: Arc<WritableCore>,
}

impl fmt::Debug for Writable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = *self.core.snapshot.borrow();
        f.debug_struct("Writable")
            .field("state", &snapshot)
            .field("length", &self.writable_length())
            .finish()
    }
}

/// 🪶 A handle that does not keep the endpoint alive. Listeners that point across
/// endpoints hold these, so two endpoints never keep each other around.
#[derive(Clone)]
pub(crate) struct WeakWritable(Weak<WritableCore>);

impl WeakWritable {
    pub(crate) fn upgrade(&self) -> Option<Writable> {
        self.0.upgrade().map(|core| Writable { core })
    }
}

impl Writable {
    /// 🏗️ Wrap a sink. Spawns the dispatcher, so call this inside a tokio runtime.
    pub fn new(sink: impl Sink, opts: StreamOptions) -> Result<Self, StreamError> {
        Self::build(Box::new(sink), &opts, false)
    }

    pub(crate) fn build(sink: Box<dyn Sink>, opts: &StreamOptions, duplex_side: bool) -> Result<Self, StreamError> {
        opts.validate()?;
        let mut state = WritableState::new(opts, sink.supports_writev(), sink.needs_construct());
        if duplex_side {
            state.defer_finish_destroy();
        }
        let (snapshot, _) = watch::channel(Snapshot::of(&state));
        let wake = Arc::new(Notify::new());
        let core = Arc::new(WritableCore {
            state: Mutex::new(state),
            events: EventHub::default(),
            snapshot,
            wake: wake.clone(),
        });
        SinkWorker::new(Arc::downgrade(&core), wake, sink).start();
        let writable = Self { core };
        if let Some(signal) = opts.signal.clone() {
            let weak = writable.downgrade();
            let mut snapshot = writable.core.subscribe();
            let closed = async move {
                let _ = snapshot.wait_for(|s| s.teardown == Teardown::Closed).await;
            };
            destroy_on_abort(signal, closed, move |err| {
                if let Some(writable) = weak.upgrade() {
                    writable.destroy(Some(err));
                }
            });
        }
        Ok(writable)
    }

    pub(crate) fn downgrade(&self) -> WeakWritable {
        WeakWritable(Arc::downgrade(&self.core))
    }

    // ===== ✍️ writing =====

    /// ✍️ Queue a chunk. `Ok(false)` means: stop and wait for `drain`.
    ///
    /// A bad chunk (null in object mode, an object in byte mode, an unknown encoding)
    /// fails right here. A write the endpoint can no longer take (after `end`, after
    /// `destroy`) returns `Ok(false)` and the error travels through the usual channels.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool, StreamError> {
        self.write_inner(chunk.into(), None)
    }

    /// ✍️ Like [`write`](Self::write), plus a callback for this chunk's own completion.
    pub fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        callback: impl FnOnce(Option<StreamError>) + Send + 'static,
    ) -> Result<bool, StreamError> {
        self.write_inner(chunk.into(), Some(Box::new(callback)))
    }

    fn write_inner(&self, chunk: Chunk, callback: Option<WriteCallback>) -> Result<bool, StreamError> {
        self.core.update(|state, fx| match state.write(chunk, callback, fx) {
            Ok(more) => Ok(more),
            Err(Rejected::Usage(err)) => Err(err),
            Err(Rejected::Refused(_)) => Ok(false),
        })
    }

    /// ⏳ Write and wait for this chunk's completion. Ignores backpressure; the await is the pacing.
    pub async fn write_and_wait(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        let (tx, rx) = oneshot::channel();
        self.write_with(chunk, move |err| {
            let _ = tx.send(err);
        })?;
        match rx.await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(StreamError::Destroyed("write")),
        }
    }

    // ===== 🏁 ending =====

    /// 🏁 No more writes. `finish` follows once everything queued has completed.
    pub fn end(&self) -> Result<(), StreamError> {
        self.core.update(|state, fx| state.end(None, None, fx))
    }

    /// 🏁 Write one last chunk, then end.
    pub fn end_with(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        self.core.update(|state, fx| state.end(Some(chunk.into()), None, fx))
    }

    /// 🏁 End, with a callback that fires on finish or with the error that prevented it.
    pub fn end_then(
        &self,
        chunk: Option<Chunk>,
        callback: impl FnOnce(Option<StreamError>) + Send + 'static,
    ) -> Result<(), StreamError> {
        self.core
            .update(|state, fx| state.end(chunk, Some(Box::new(callback)), fx))
    }

    // ===== 🧊 corking =====

    /// 🧊 Hold writes in the buffer until the matching `uncork`.
    pub fn cork(&self) {
        self.core.update(|state, _| state.cork());
    }

    pub fn uncork(&self) {
        self.core.update(|state, _| state.uncork());
    }

    // ===== 🗑️ teardown =====

    /// 🗑️ Tear down. Idempotent: only the first call does anything.
    pub fn destroy(&self, err: Option<StreamError>) {
        let started = self.core.update(|state, _| state.destroy(err));
        if started {
            debug!("🗑️ writable destroy requested");
        }
    }

    /// 🧹 Destroy with an abort error unless already finished, then wait for close.
    pub async fn dispose(&self) {
        if !self.writable_finished() {
            self.destroy(Some(StreamError::aborted()));
        }
        self.closed().await;
    }

    /// 🔡 Change the encoding used to decode text chunks from now on.
    pub fn set_default_encoding(&self, encoding: &str) -> Result<(), StreamError> {
        let encoding: Encoding = encoding.parse()?;
        self.core.update(|state, _| state.set_default_encoding(encoding));
        Ok(())
    }

    // ===== 📣 listeners =====

    pub fn on_drain(&self, mut listener: impl FnMut() + Send + 'static) {
        self.core
            .events
            .on(|e| matches!(e, WritableEvent::Drain), move |_| listener());
    }

    pub fn on_prefinish(&self, mut listener: impl FnMut() + Send + 'static) {
        self.core
            .events
            .on(|e| matches!(e, WritableEvent::Prefinish), move |_| listener());
    }

    pub fn on_finish(&self, mut listener: impl FnMut() + Send + 'static) {
        self.core
            .events
            .on(|e| matches!(e, WritableEvent::Finish), move |_| listener());
    }

    pub fn on_close(&self, mut listener: impl FnMut() + Send + 'static) {
        self.core
            .events
            .on(|e| matches!(e, WritableEvent::Close), move |_| listener());
    }

    pub fn on_error(&self, mut listener: impl FnMut(&StreamError) + Send + 'static) {
        self.core.events.on(
            |e| matches!(e, WritableEvent::Error(_)),
            move |e| {
                if let WritableEvent::Error(err) = e {
                    listener(err);
                }
            },
        );
    }

    // ===== 🔍 observers =====

    fn peek<R>(&self, f: impl FnOnce(&WritableState) -> R) -> R {
        f(&lock(&self.core.state))
    }

    /// 🏗️ The sink's construct hook has reported back (or there never was one).
    pub fn writable_constructed(&self) -> bool {
        self.peek(WritableState::constructed)
    }

    pub fn is_writable(&self) -> bool {
        self.peek(WritableState::is_writable)
    }

    /// 🏁 `end()` has been called.
    pub fn writable_ended(&self) -> bool {
        self.peek(|s| s.phase() != Phase::Active)
    }

    pub fn writable_finished(&self) -> bool {
        self.peek(|s| s.phase() == Phase::Finished)
    }

    pub fn writable_need_drain(&self) -> bool {
        self.peek(WritableState::need_drain)
    }

    pub fn writable_length(&self) -> usize {
        self.peek(WritableState::length)
    }

    pub fn writable_corked(&self) -> usize {
        self.peek(WritableState::corked)
    }

    pub fn writable_high_water_mark(&self) -> usize {
        self.peek(WritableState::high_water_mark)
    }

    pub fn writable_object_mode(&self) -> bool {
        self.peek(WritableState::object_mode)
    }

    /// 💥 Destroyed or errored before finishing.
    pub fn writable_aborted(&self) -> bool {
        self.peek(|s| {
            (s.teardown() != Teardown::Live || s.errored().is_some()) && s.phase() != Phase::Finished
        })
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.peek(WritableState::errored)
    }

    pub fn is_destroyed(&self) -> bool {
        self.peek(|s| s.teardown() != Teardown::Live)
    }

    pub fn is_closed(&self) -> bool {
        self.peek(|s| s.teardown() == Teardown::Closed)
    }

    /// 📦 Chunks waiting behind the one in flight.
    pub fn buffered_len(&self) -> usize {
        self.peek(WritableState::buffered_len)
    }

    // ===== ⏳ waiters =====

    /// ⏳ Resolves when it is fine to write again. Fails if the endpoint died meanwhile.
    pub async fn drained(&self) -> Result<(), StreamError> {
        let mut rx = self.core.subscribe();
        let seen = match rx
            .wait_for(|s| {
                !s.need_drain || s.phase != Phase::Active || s.teardown != Teardown::Live || s.errored
            })
            .await
        {
            Ok(seen) => *seen,
            Err(_) => return Err(StreamError::PrematureClose),
        };
        if seen.teardown != Teardown::Live || seen.errored {
            return Err(self.errored().unwrap_or(StreamError::PrematureClose));
        }
        Ok(())
    }

    /// ⏳ End-of-stream for the write side: `Ok` on finish, the error that stopped it,
    /// or premature close if it was torn down first.
    pub async fn finished(&self) -> Result<(), StreamError> {
        let mut rx = self.core.subscribe();
        let seen = match rx
            .wait_for(|s| s.phase == Phase::Finished || s.errored || s.teardown == Teardown::Closed)
            .await
        {
            Ok(seen) => *seen,
            Err(_) => return Err(StreamError::PrematureClose),
        };
        if seen.phase == Phase::Finished {
            return Ok(());
        }
        Err(self.errored().unwrap_or(StreamError::PrematureClose))
    }

    /// ⏳ Resolves after teardown completed. Hands back the error it closed with, if any.
    pub async fn closed(&self) -> Option<StreamError> {
        let mut rx = self.core.subscribe();
        let _ = rx.wait_for(|s| s.teardown == Teardown::Closed).await;
        self.errored()
    }
}
