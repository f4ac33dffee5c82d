// ai
//! 🔀 Duplex — a writable side and a readable side that live and die together.
//!
//! 🎬 *[the writable side finishes. it looks across the aisle.]*
//! *["you done?" "still reading." "I'll wait." the readable side ends. both leave together.] 🦆*
//!
//! 🧠 Knowledge graph:
//! - Either side may be absent. A missing side counts as done for every rule below.
//! - Auto-destroy fires only once the writable side finished AND the readable side ended.
//! - An error on either side tears down the other one with the same error. The duplex
//!   reports one `error`, the first.
//! - One side closing tears down the other; the duplex reports `close` once both did.
//! - Cross-side listeners hold weak handles, so a duplex never keeps itself alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::debug;

use crate::backends::Sink;
use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::events::EventHub;
use crate::options::StreamOptions;
use crate::readable::{ChunkStream, Readable};
use crate::writable::Writable;

/// 📣 What the duplex as a whole announces.
#[derive(Debug, Clone)]
pub enum DuplexEvent {
    Error(StreamError),
    Close,
}

struct DuplexLink {
    sides: usize,
    closes: AtomicUsize,
    error_emitted: AtomicBool,
    events: EventHub<DuplexEvent>,
}

impl DuplexLink {
    fn side_errored(&self, err: &StreamError) {
        if !self.error_emitted.swap(true, Ordering::SeqCst) {
            self.events.emit(&DuplexEvent::Error(err.clone()));
        }
    }

    fn side_closed(&self) {
        if self.closes.fetch_add(1, Ordering::SeqCst) + 1 == self.sides {
            debug!("🚪 duplex closed on both sides");
            self.events.emit(&DuplexEvent::Close);
            self.events.clear();
        }
    }
}

/// 🔀 A writable and a readable joined at the hip.
#[derive(Clone)]
pub struct Duplex {
    writable: Option<Writable>,
    readable: Option<Readable>,
    link: Arc<DuplexLink>,
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("writable", &self.writable)
            .field("readable", &self.readable)
            .finish()
    }
}

impl Duplex {
    /// 🏗️ Build both sides. `make_sink` gets the readable side, so whatever is written
    /// can be pushed out the other end.
    pub fn new<S, F>(opts: StreamOptions, make_sink: F) -> Result<Self, StreamError>
    where
        S: Sink,
        F: FnOnce(Readable) -> S,
    {
        let readable = Readable::build(&opts, true)?;
        let sink = make_sink(readable.clone());
        let writable = Writable::build(Box::new(sink), &opts, true)?;
        Ok(Self::from_parts(Some(writable), Some(readable), opts.auto_destroy))
    }

    /// 🔗 Wire two independently built sides into one lifecycle.
    pub(crate) fn from_parts(writable: Option<Writable>, readable: Option<Readable>, auto_destroy: bool) -> Self {
        let link = Arc::new(DuplexLink {
            sides: usize::from(writable.is_some()) + usize::from(readable.is_some()),
            closes: AtomicUsize::new(0),
            error_emitted: AtomicBool::new(false),
            events: EventHub::default(),
        });
        let weak_w = writable.as_ref().map(Writable::downgrade);
        let weak_r = readable.as_ref().map(Readable::downgrade);

        if let Some(w) = &writable {
            let other = weak_r.clone();
            let this = w.downgrade();
            w.on_finish(move || {
                if !auto_destroy {
                    return;
                }
                let readable = other.as_ref().and_then(|r| r.upgrade());
                if readable.as_ref().is_none_or(Readable::readable_ended) {
                    if let Some(w) = this.upgrade() {
                        w.destroy(None);
                    }
                    if let Some(r) = readable {
                        r.destroy(None);
                    }
                }
            });

            let other = weak_r.clone();
            let link_ref = Arc::downgrade(&link);
            w.on_error(move |err| {
                if let Some(link) = link_ref.upgrade() {
                    link.side_errored(err);
                }
                if auto_destroy && let Some(r) = other.as_ref().and_then(|r| r.upgrade()) {
                    r.destroy(Some(err.clone()));
                }
            });

            let other = weak_r.clone();
            let this = w.downgrade();
            let link_ref = Arc::downgrade(&link);
            w.on_close(move || {
                if let Some(r) = other.as_ref().and_then(|r| r.upgrade()) {
                    let cause = this.upgrade().and_then(|w| w.errored());
                    r.destroy(cause);
                }
                if let Some(link) = link_ref.upgrade() {
                    link.side_closed();
                }
            });
        }

        if let Some(r) = &readable {
            let other = weak_w.clone();
            let this = r.downgrade();
            r.on_end(move || {
                if !auto_destroy {
                    return;
                }
                let writable = other.as_ref().and_then(|w| w.upgrade());
                if writable.as_ref().is_none_or(Writable::writable_finished) {
                    if let Some(w) = writable {
                        w.destroy(None);
                    }
                    if let Some(r) = this.upgrade() {
                        r.destroy(None);
                    }
                }
            });

            let other = weak_w.clone();
            let link_ref = Arc::downgrade(&link);
            r.on_error(move |err| {
                if let Some(link) = link_ref.upgrade() {
                    link.side_errored(err);
                }
                if auto_destroy && let Some(w) = other.as_ref().and_then(|w| w.upgrade()) {
                    w.destroy(Some(err.clone()));
                }
            });

            let other = weak_w;
            let this = r.downgrade();
            let link_ref = Arc::downgrade(&link);
            r.on_close(move || {
                if let Some(w) = other.as_ref().and_then(|w| w.upgrade()) {
                    let cause = this.upgrade().and_then(|r| r.errored());
                    w.destroy(cause);
                }
                if let Some(link) = link_ref.upgrade() {
                    link.side_closed();
                }
            });
        }

        Self {
            writable,
            readable,
            link,
        }
    }

    // ===== 🧩 sides =====

    pub fn writable(&self) -> Option<&Writable> {
        self.writable.as_ref()
    }

    pub fn readable(&self) -> Option<&Readable> {
        self.readable.as_ref()
    }

    pub fn is_writable(&self) -> bool {
        self.writable.as_ref().is_some_and(Writable::is_writable)
    }

    pub fn is_readable(&self) -> bool {
        self.readable.as_ref().is_some_and(|r| !r.is_destroyed() && !r.readable_ended())
    }

    // ===== ✍️ write side =====

    fn write_side(&self) -> Result<&Writable, StreamError> {
        self.writable.as_ref().ok_or(StreamError::WriteAfterEnd)
    }

    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool, StreamError> {
        self.write_side()?.write(chunk)
    }

    pub fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        callback: impl FnOnce(Option<StreamError>) + Send + 'static,
    ) -> Result<bool, StreamError> {
        self.write_side()?.write_with(chunk, callback)
    }

    pub async fn write_and_wait(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        self.write_side()?.write_and_wait(chunk).await
    }

    pub fn end(&self) -> Result<(), StreamError> {
        match &self.writable {
            Some(w) => w.end(),
            None => Ok(()),
        }
    }

    pub fn end_with(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        self.write_side()?.end_with(chunk)
    }

    pub fn cork(&self) {
        if let Some(w) = &self.writable {
            w.cork();
        }
    }

    pub fn uncork(&self) {
        if let Some(w) = &self.writable {
            w.uncork();
        }
    }

    /// ⏳ See [`Writable::drained`]. A duplex without a writable side is always drained.
    pub async fn drained(&self) -> Result<(), StreamError> {
        match &self.writable {
            Some(w) => w.drained().await,
            None => Ok(()),
        }
    }

    // ===== 📖 read side =====

    pub async fn read(&self) -> Option<Result<Chunk, StreamError>> {
        self.readable.as_ref()?.read().await
    }

    /// 🌊 The readable side as a pull sequence. Empty if there is no readable side.
    pub fn into_stream(self) -> ChunkStream {
        match self.readable {
            Some(r) => r.into_stream(),
            None => Box::pin(futures::stream::empty()),
        }
    }

    // ===== 🗑️ teardown =====

    /// 🗑️ Tear down both sides. Idempotent.
    pub fn destroy(&self, err: Option<StreamError>) {
        if let Some(w) = &self.writable {
            w.destroy(err.clone());
        }
        if let Some(r) = &self.readable {
            r.destroy(err);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.writable.as_ref().is_none_or(Writable::is_destroyed)
            && self.readable.as_ref().is_none_or(Readable::is_destroyed)
    }

    pub fn errored(&self) -> Option<StreamError> {
        self.writable
            .as_ref()
            .and_then(Writable::errored)
            .or_else(|| self.readable.as_ref().and_then(Readable::errored))
    }

    // ===== 📣 listeners =====

    pub fn on_drain(&self, listener: impl FnMut() + Send + 'static) {
        if let Some(w) = &self.writable {
            w.on_drain(listener);
        }
    }

    pub fn on_finish(&self, listener: impl FnMut() + Send + 'static) {
        if let Some(w) = &self.writable {
            w.on_finish(listener);
        }
    }

    pub fn on_end(&self, listener: impl FnMut() + Send + 'static) {
        if let Some(r) = &self.readable {
            r.on_end(listener);
        }
    }

    /// 📣 Fires once, with the first error either side reported.
    pub fn on_error(&self, mut listener: impl FnMut(&StreamError) + Send + 'static) {
        self.link.events.on(
            |e| matches!(e, DuplexEvent::Error(_)),
            move |e| {
                if let DuplexEvent::Error(err) = e {
                    listener(err);
                }
            },
        );
    }

    /// 📣 Fires once, after both sides closed.
    pub fn on_close(&self, mut listener: impl FnMut() + Send + 'static) {
        self.link
            .events
            .on(|e| matches!(e, DuplexEvent::Close), move |_| listener());
    }

    // ===== ⏳ waiters =====

    /// ⏳ The writable side finished (or there is none).
    pub async fn finished(&self) -> Result<(), StreamError> {
        match &self.writable {
            Some(w) => w.finished().await,
            None => Ok(()),
        }
    }

    /// ⏳ The readable side ended (or there is none).
    pub async fn ended(&self) -> Result<(), StreamError> {
        match &self.readable {
            Some(r) => r.ended().await,
            None => Ok(()),
        }
    }

    /// ⏳ Both sides closed. Hands back the first error either side closed with.
    pub async fn closed(&self) -> Option<StreamError> {
        let from_writable = match &self.writable {
            Some(w) => w.closed().await,
            None => None,
        };
        let from_readable = match &self.readable {
            Some(r) => r.closed().await,
            None => None,
        };
        from_writable.or(from_readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sink_fn;
    use futures::FutureExt;
    use std::sync::Mutex;

    fn echo(opts: StreamOptions) -> Result<Duplex, StreamError> {
        Duplex::new(opts, |readable| {
            sink_fn(move |chunk| {
                let readable = readable.clone();
                async move {
                    readable.push(chunk)?;
                    Ok(())
                }
                .boxed()
            })
        })
    }

    #[tokio::test]
    async fn the_one_where_both_sides_have_to_be_done() -> Result<(), StreamError> {
        let duplex = echo(StreamOptions::object_mode())?;
        let (closes, mut closed) = tokio::sync::mpsc::unbounded_channel();
        duplex.on_close(move || {
            let _ = closes.send(());
        });

        duplex.write_and_wait("ping").await?;
        duplex.end()?;
        duplex.finished().await?;
        // -- 🧍 writable finished, readable not ended: still standing
        assert!(!duplex.is_destroyed());

        duplex.readable().expect("💀 echo has a readable side").push_end();
        assert_eq!(duplex.read().await.transpose()?, Some(Chunk::from("ping")));
        assert!(duplex.read().await.is_none());
        assert!(duplex.closed().await.is_none());
        assert!(duplex.is_destroyed());
        closed.recv().await.expect("💀 the duplex never said goodbye");
        assert!(closed.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_side_errors_and_takes_the_other_down() -> Result<(), StreamError> {
        let duplex = echo(StreamOptions::object_mode())?;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        duplex.on_error(move |e| seen.lock().expect("💀 error log poisoned").push(e.code()));

        duplex
            .readable()
            .expect("💀 echo has a readable side")
            .destroy(Some(StreamError::io(anyhow::anyhow!("reader fell over"))));
        let closed_with = duplex.closed().await;
        assert_eq!(closed_with.map(|e| e.code()), Some("ERR_IO"));
        assert!(duplex.writable().expect("💀 echo has a writable side").is_destroyed());
        assert_eq!(*errors.lock().expect("💀 error log poisoned"), vec!["ERR_IO"]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_missing_side_refuses_writes() {
        let readable = Readable::new(StreamOptions::default()).expect("💀 default options are fine");
        let duplex = Duplex::from_parts(None, Some(readable), true);
        assert_eq!(
            duplex.write("nope").map_err(|e| e.code()),
            Err("ERR_STREAM_WRITE_AFTER_END")
        );
        assert!(duplex.end().is_ok());
    }
}
