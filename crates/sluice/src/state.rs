// ai
//! 🧠 The writable state machine. No I/O, no tasks, no clocks. Just bookkeeping.
//!
//! 🎬 *[a write comes in. a counter goes up. a flag flips. somewhere a callback waits its turn.]*
//!
//! Every mutating method takes an [`Effects`] accumulator and pushes the callbacks and
//! events it wants delivered into it. The owner runs them after it has let go of the lock,
//! so a callback that turns around and writes again never deadlocks and never observes a
//! half-updated machine.
//!
//! 🧠 Knowledge graph:
//! - Phase: `Active → Ending → Prefinishing → Finished`. Never backwards.
//! - Teardown: `Live → Destroying → Closed`. Orthogonal to the phase.
//! - A sink with a construct hook starts unconstructed: writes pile up in `buffered`, and
//!   neither finish nor the destroy hook happen until construction reported back.
//! - Destroy only flips the flag. Queued writes and `end` callbacks fail on the
//!   dispatcher's next turn, after every callback already on its way has been delivered.
//! - At most one unit of work (a single chunk or a batch) is in flight at any time.
//!   The dispatcher pulls it out with [`WritableState::next_job`] and reports back with
//!   `on_write_complete` / `on_final_complete` / `on_destroy_complete`.
//! - Write callbacks complete in FIFO order. Drain goes out before the callbacks of the
//!   write that emptied the queue.
//! - `length` counts everything accepted and not yet completed, in flight included.

use std::collections::VecDeque;

use crate::chunk::{Chunk, Encoding};
use crate::error::StreamError;
use crate::options::{Side, StreamOptions};

/// 📞 A completion callback. `None` means success.
pub type WriteCallback = Box<dyn FnOnce(Option<StreamError>) + Send + 'static>;

/// 📣 What a writable endpoint can announce.
#[derive(Debug, Clone)]
pub enum WritableEvent {
    Drain,
    Prefinish,
    Finish,
    Error(StreamError),
    Close,
}

/// 🏁 Where we are on the way to "finished".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Ending,
    Prefinishing,
    Finished,
}

/// 🗑️ Where we are on the way to "closed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Live,
    Destroying,
    Closed,
}

/// 📋 Deferred work produced by the machine, delivered in order by the owner.
pub(crate) enum Effect {
    Call(WriteCallback, Option<StreamError>),
    Emit(WritableEvent),
}

#[derive(Default)]
pub(crate) struct Effects(Vec<Effect>);

impl Effects {
    fn call(&mut self, callback: WriteCallback, err: Option<StreamError>) {
        self.0.push(Effect::Call(callback, err));
    }

    fn emit(&mut self, event: WritableEvent) {
        self.0.push(Effect::Emit(event));
    }

    pub(crate) fn into_vec(self) -> Vec<Effect> {
        self.0
    }
}

/// 🚚 A unit of work for the dispatcher.
#[derive(Debug)]
pub(crate) enum Job {
    Construct,
    Write(Chunk),
    Writev(Vec<Chunk>),
    Finalize,
    Destroy(Option<StreamError>),
    Exit,
}

struct Pending {
    chunk: Chunk,
    size: usize,
    callback: Option<WriteCallback>,
}

struct InFlight {
    size: usize,
    callbacks: Vec<Option<WriteCallback>>,
    // -- 📦 Some until the dispatcher picks it up
    payload: Option<Payload>,
}

enum Payload {
    One(Chunk),
    Many(Vec<Chunk>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstructJob {
    Queued,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalJob {
    Idle,
    Queued,
    Running,
    Done,
}

enum DestroyJob {
    Idle,
    Queued(Option<StreamError>),
    Running,
    Done,
}

/// 🚦 A write rejected before it was accepted.
pub(crate) enum Rejected {
    /// the chunk itself was bad; the caller hears about it right away
    Usage(StreamError),
    /// the endpoint is past accepting writes; the write's callback hears about it
    Refused(StreamError),
}

/// 🧠 The machine itself.
pub(crate) struct WritableState {
    object_mode: bool,
    high_water_mark: usize,
    decode_strings: bool,
    default_encoding: Encoding,
    /// 🗑️ destroy on error (and on finish, unless a duplex link owns that decision)
    auto_destroy: bool,
    auto_destroy_on_finish: bool,
    emit_close: bool,
    supports_writev: bool,

    phase: Phase,
    teardown: Teardown,
    length: usize,
    corked: usize,
    pending_callbacks: usize,
    need_drain: bool,
    errored: Option<StreamError>,
    error_emitted: bool,
    construct_job: ConstructJob,

    buffered: VecDeque<Pending>,
    in_flight: Option<InFlight>,
    on_finished: Vec<WriteCallback>,
    final_job: FinalJob,
    destroy_job: DestroyJob,
}

impl WritableState {
    pub(crate) fn new(opts: &StreamOptions, supports_writev: bool, needs_construct: bool) -> Self {
        Self {
            object_mode: opts.object_mode_for(Side::Writable),
            high_water_mark: opts.high_water_mark_for(Side::Writable),
            decode_strings: opts.decode_strings,
            default_encoding: opts.default_encoding,
            auto_destroy: opts.auto_destroy,
            auto_destroy_on_finish: opts.auto_destroy,
            emit_close: opts.emit_close,
            supports_writev,
            phase: Phase::Active,
            teardown: Teardown::Live,
            length: 0,
            corked: 0,
            pending_callbacks: 0,
            need_drain: false,
            errored: None,
            error_emitted: false,
            construct_job: if needs_construct {
                ConstructJob::Queued
            } else {
                ConstructJob::Done
            },
            buffered: VecDeque::new(),
            in_flight: None,
            on_finished: Vec::new(),
            final_job: FinalJob::Idle,
            destroy_job: DestroyJob::Idle,
        }
    }

    /// 🔗 A duplex decides for itself when both sides are done.
    pub(crate) fn defer_finish_destroy(&mut self) {
        self.auto_destroy_on_finish = false;
    }

    // ===== 🔍 observers =====

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn teardown(&self) -> Teardown {
        self.teardown
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub(crate) fn corked(&self) -> usize {
        self.corked
    }

    pub(crate) fn need_drain(&self) -> bool {
        self.need_drain
    }

    pub(crate) fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub(crate) fn object_mode(&self) -> bool {
        self.object_mode
    }

    pub(crate) fn errored(&self) -> Option<StreamError> {
        self.errored.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_callbacks(&self) -> usize {
        self.pending_callbacks
    }

    pub(crate) fn constructed(&self) -> bool {
        self.construct_job == ConstructJob::Done
    }

    /// ✍️ Writes would still be accepted.
    pub(crate) fn is_writable(&self) -> bool {
        self.phase == Phase::Active && self.teardown == Teardown::Live && self.errored.is_none()
    }

    fn writing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub(crate) fn set_default_encoding(&mut self, encoding: Encoding) {
        self.default_encoding = encoding;
    }

    // ===== ✍️ write =====

    /// ✍️ Accept a chunk. `Ok(true)` means "keep going", `Ok(false)` means "wait for drain".
    pub(crate) fn write(
        &mut self,
        chunk: Chunk,
        callback: Option<WriteCallback>,
        fx: &mut Effects,
    ) -> Result<bool, Rejected> {
        let chunk = chunk
            .normalize(self.object_mode, self.decode_strings, self.default_encoding)
            .map_err(Rejected::Usage)?;

        let refusal = if self.phase != Phase::Active {
            Some(StreamError::WriteAfterEnd)
        } else if self.teardown != Teardown::Live {
            Some(StreamError::Destroyed("write"))
        } else {
            None
        };
        if let Some(err) = refusal {
            if let Some(callback) = callback {
                fx.call(callback, Some(err.clone()));
            }
            self.error_or_destroy(err.clone(), fx);
            return Err(Rejected::Refused(err));
        }

        let size = chunk.size(self.object_mode);
        self.length += size;
        self.pending_callbacks += 1;

        if self.writing() || self.corked > 0 || self.errored.is_some() || !self.constructed() {
            self.buffered.push_back(Pending {
                chunk,
                size,
                callback,
            });
        } else {
            self.in_flight = Some(InFlight {
                size,
                callbacks: vec![callback],
                payload: Some(Payload::One(chunk)),
            });
        }

        // -- 🌊 a zero-length queue never asks for a drain, even with hwm 0
        let below = self.length < self.high_water_mark || self.length == 0;
        if !below {
            self.need_drain = true;
        }
        Ok(below && self.teardown == Teardown::Live && self.errored.is_none())
    }

    /// ✅ The dispatcher finished the in-flight unit of work.
    pub(crate) fn on_write_complete(&mut self, result: Result<(), StreamError>, fx: &mut Effects) {
        let Some(done) = self.in_flight.take() else {
            self.error_or_destroy(StreamError::MultipleCallback, fx);
            return;
        };
        self.length -= done.size;

        match result {
            Err(err) => {
                if self.errored.is_none() {
                    self.errored = Some(err.clone());
                }
                for callback in done.callbacks {
                    self.pending_callbacks -= 1;
                    if let Some(callback) = callback {
                        fx.call(callback, Some(err.clone()));
                    }
                }
                self.error_buffer(fx);
                self.error_or_destroy(err, fx);
            }
            Ok(()) => {
                if !self.buffered.is_empty() {
                    self.clear_buffer();
                }
                self.after_write(done.callbacks, fx);
            }
        }
    }

    /// 🪓 The in-flight write was abandoned because we are tearing down.
    pub(crate) fn on_write_cancelled(&mut self, fx: &mut Effects) {
        let Some(done) = self.in_flight.take() else {
            return;
        };
        self.length -= done.size;
        let err = self.errored.clone().unwrap_or(StreamError::Destroyed("write"));
        for callback in done.callbacks {
            self.pending_callbacks -= 1;
            if let Some(callback) = callback {
                fx.call(callback, Some(err.clone()));
            }
        }
        self.error_buffer(fx);
    }

    fn after_write(&mut self, callbacks: Vec<Option<WriteCallback>>, fx: &mut Effects) {
        if self.need_drain
            && self.length == 0
            && self.phase == Phase::Active
            && self.teardown == Teardown::Live
        {
            self.need_drain = false;
            fx.emit(WritableEvent::Drain);
        }
        for callback in callbacks {
            self.pending_callbacks -= 1;
            if let Some(callback) = callback {
                fx.call(callback, None);
            }
        }
        if self.teardown != Teardown::Live {
            self.error_buffer(fx);
        }
        self.finish_maybe();
    }

    /// 📤 Move the next unit of buffered work in flight.
    fn clear_buffer(&mut self) {
        if self.teardown != Teardown::Live
            || !self.constructed()
            || self.corked > 0
            || self.writing()
            || self.errored.is_some()
            || self.buffered.is_empty()
        {
            return;
        }
        if self.buffered.len() > 1 && self.supports_writev {
            let mut size = 0;
            let mut chunks = Vec::with_capacity(self.buffered.len());
            let mut callbacks = Vec::with_capacity(self.buffered.len());
            for pending in self.buffered.drain(..) {
                size += pending.size;
                chunks.push(pending.chunk);
                callbacks.push(pending.callback);
            }
            self.in_flight = Some(InFlight {
                size,
                callbacks,
                payload: Some(Payload::Many(chunks)),
            });
        } else if let Some(pending) = self.buffered.pop_front() {
            self.in_flight = Some(InFlight {
                size: pending.size,
                callbacks: vec![pending.callback],
                payload: Some(Payload::One(pending.chunk)),
            });
        }
    }

    /// 💀 Fail everything still queued, once nothing is in flight.
    fn error_buffer(&mut self, fx: &mut Effects) {
        if self.writing() {
            return;
        }
        let write_err = self.errored.clone().unwrap_or(StreamError::Destroyed("write"));
        for pending in std::mem::take(&mut self.buffered) {
            self.length -= pending.size;
            self.pending_callbacks -= 1;
            if let Some(callback) = pending.callback {
                fx.call(callback, Some(write_err.clone()));
            }
        }
        let end_err = self.errored.clone().unwrap_or(StreamError::Destroyed("end"));
        self.call_finished_callbacks(Some(end_err), fx);
    }

    fn call_finished_callbacks(&mut self, err: Option<StreamError>, fx: &mut Effects) {
        for callback in std::mem::take(&mut self.on_finished) {
            fx.call(callback, err.clone());
        }
    }

    // ===== 🧊 cork =====

    pub(crate) fn cork(&mut self) {
        self.corked += 1;
    }

    pub(crate) fn uncork(&mut self) {
        if self.corked == 0 {
            return;
        }
        self.corked -= 1;
        if self.corked == 0 && !self.writing() {
            self.clear_buffer();
        }
    }

    // ===== 🏗️ construct =====

    /// ✅ The construct hook reported back. Whatever piled up meanwhile can go now.
    pub(crate) fn on_construct_complete(&mut self, result: Result<(), StreamError>, fx: &mut Effects) {
        if self.construct_job != ConstructJob::Running {
            self.error_or_destroy(StreamError::MultipleCallback, fx);
            return;
        }
        self.construct_job = ConstructJob::Done;
        if let Err(err) = result {
            self.error_or_destroy(err, fx);
            return;
        }
        if !self.writing() {
            self.clear_buffer();
        }
        self.finish_maybe();
    }

    // ===== 🏁 end / finish =====

    /// 🏁 No more writes. Flushes whatever is corked and starts the finish protocol.
    pub(crate) fn end(
        &mut self,
        chunk: Option<Chunk>,
        callback: Option<WriteCallback>,
        fx: &mut Effects,
    ) -> Result<(), StreamError> {
        let mut err = None;
        if let Some(chunk) = chunk {
            match self.write(chunk, None, fx) {
                Ok(_) => {}
                Err(Rejected::Usage(e)) | Err(Rejected::Refused(e)) => err = Some(e),
            }
        }

        if self.corked > 0 {
            self.corked = 1;
            self.uncork();
        }

        if err.is_none() {
            if self.phase == Phase::Finished {
                err = Some(StreamError::AlreadyFinished("end"));
            } else if self.teardown != Teardown::Live {
                err = Some(StreamError::Destroyed("end"));
            } else if self.phase == Phase::Active && self.errored.is_none() {
                self.phase = Phase::Ending;
                self.finish_maybe();
            }
        }

        if let Some(callback) = callback {
            if let Some(e) = &err {
                fx.call(callback, Some(e.clone()));
            } else if let Some(e) = &self.errored {
                fx.call(callback, Some(e.clone()));
            } else if self.phase == Phase::Finished {
                fx.call(callback, None);
            } else {
                self.on_finished.push(callback);
            }
        }

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn need_finish(&self) -> bool {
        self.phase == Phase::Ending
            && self.teardown == Teardown::Live
            && self.constructed()
            && !self.writing()
            && self.buffered.is_empty()
            && self.length == 0
            && self.errored.is_none()
    }

    fn finish_maybe(&mut self) {
        if self.need_finish() && self.final_job == FinalJob::Idle {
            self.phase = Phase::Prefinishing;
            self.final_job = FinalJob::Queued;
        }
    }

    /// ✅ The finalizer hook reported back.
    pub(crate) fn on_final_complete(&mut self, result: Result<(), StreamError>, fx: &mut Effects) {
        if self.final_job != FinalJob::Running {
            self.error_or_destroy(StreamError::MultipleCallback, fx);
            return;
        }
        self.final_job = FinalJob::Done;
        match result {
            Err(err) => {
                self.call_finished_callbacks(Some(err.clone()), fx);
                self.error_or_destroy(err, fx);
            }
            Ok(()) => {
                fx.emit(WritableEvent::Prefinish);
                if self.teardown == Teardown::Live
                    && self.pending_callbacks == 0
                    && self.errored.is_none()
                {
                    self.finish(fx);
                }
            }
        }
    }

    /// 🪓 The finalizer was abandoned because we are tearing down.
    pub(crate) fn on_final_cancelled(&mut self) {
        if self.final_job == FinalJob::Running {
            self.final_job = FinalJob::Done;
        }
    }

    fn finish(&mut self, fx: &mut Effects) {
        self.phase = Phase::Finished;
        self.call_finished_callbacks(None, fx);
        fx.emit(WritableEvent::Finish);
        if self.auto_destroy_on_finish {
            self.destroy(None);
        }
    }

    // ===== 🗑️ destroy =====

    /// 💥 Route an error: destroy when configured to, otherwise record it and emit once.
    pub(crate) fn error_or_destroy(&mut self, err: StreamError, fx: &mut Effects) {
        if self.teardown != Teardown::Live {
            return;
        }
        if self.auto_destroy {
            self.destroy(Some(err));
            return;
        }
        if self.errored.is_none() {
            self.errored = Some(err.clone());
        }
        if !self.error_emitted {
            self.error_emitted = true;
            fx.emit(WritableEvent::Error(err));
        }
    }

    /// 🗑️ Start teardown. Returns `false` when teardown already started.
    pub(crate) fn destroy(&mut self, err: Option<StreamError>) -> bool {
        if self.teardown != Teardown::Live {
            return false;
        }
        self.teardown = Teardown::Destroying;
        if let Some(e) = &err
            && self.errored.is_none()
        {
            self.errored = Some(e.clone());
        }
        self.destroy_job = DestroyJob::Queued(err.or_else(|| self.errored.clone()));
        true
    }

    /// ✅ The destroy hook reported back. Error (maybe), then close.
    pub(crate) fn on_destroy_complete(&mut self, result: Result<(), StreamError>, fx: &mut Effects) {
        if !matches!(self.destroy_job, DestroyJob::Running) {
            return;
        }
        self.destroy_job = DestroyJob::Done;
        let reported = StreamError::aggregate(self.errored.take(), result.err());
        self.errored = reported.clone();
        self.error_buffer(fx);
        self.teardown = Teardown::Closed;
        if let Some(err) = reported
            && !self.error_emitted
        {
            self.error_emitted = true;
            fx.emit(WritableEvent::Error(err));
        }
        if self.emit_close {
            fx.emit(WritableEvent::Close);
        }
    }

    // ===== 🚚 dispatch =====

    /// 🚚 Hand the dispatcher its next unit of work, if any.
    pub(crate) fn next_job(&mut self, fx: &mut Effects) -> Option<Job> {
        match self.teardown {
            Teardown::Closed => return Some(Job::Exit),
            Teardown::Destroying => {
                // -- 🏗️ a half-built sink is not torn down; it finishes building first
                match self.construct_job {
                    ConstructJob::Queued => {
                        self.construct_job = ConstructJob::Running;
                        return Some(Job::Construct);
                    }
                    ConstructJob::Running => return None,
                    ConstructJob::Done => {}
                }
                if self
                    .in_flight
                    .as_ref()
                    .is_some_and(|work| work.payload.is_some())
                {
                    // -- 🪓 queued but never started; nothing to cancel but the callbacks
                    self.on_write_cancelled(fx);
                }
                if self.writing() {
                    return None;
                }
                self.error_buffer(fx);
                return match std::mem::replace(&mut self.destroy_job, DestroyJob::Running) {
                    DestroyJob::Queued(err) => Some(Job::Destroy(err)),
                    other => {
                        self.destroy_job = other;
                        None
                    }
                };
            }
            Teardown::Live => {}
        }

        if self.construct_job == ConstructJob::Queued {
            self.construct_job = ConstructJob::Running;
            return Some(Job::Construct);
        }
        if let Some(work) = self.in_flight.as_mut()
            && let Some(payload) = work.payload.take()
        {
            return Some(match payload {
                Payload::One(chunk) => Job::Write(chunk),
                Payload::Many(chunks) => Job::Writev(chunks),
            });
        }
        if self.final_job == FinalJob::Queued {
            self.final_job = FinalJob::Running;
            return Some(Job::Finalize);
        }
        None
    }
}
