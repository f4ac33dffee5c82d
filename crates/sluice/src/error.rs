// ai
//! 💀 Errors — every way a stream can disappoint you, catalogued and labelled.
//!
//! 🎬 *[a write arrives after `end()`. the stream looks at it. the write looks back.]*
//! *["We're closed," says the stream. "Since when?" "Since you called end()." 🦆]*
//!
//! 🧠 Knowledge graph:
//! - Usage errors (write after end, null values, unknown encodings) are reported
//!   synchronously from the call or through that write's own callback.
//! - Underlying I/O errors come out of user `Sink`/`Source`/`TransformStep` impls as
//!   `anyhow::Error`; we park them in an `Arc` so one failure can be handed to every
//!   queued callback without cloning the world.
//! - `PrematureClose` is the low-priority one. Any more specific error arriving later
//!   takes its seat at the pipeline's table.
//! - `Aborted` is an error for propagation purposes, but callers can ask
//!   [`StreamError::is_abort`] and decide not to take it personally.

use std::sync::Arc;

use thiserror::Error;

/// 📦 The one error type to rule every stream, pipeline and compose in the crate.
///
/// `Clone` because a single failure fans out to N write callbacks, the error event,
/// the finished waiters and the pipeline callback. Nobody gets a photocopy of a photocopy,
/// everybody gets the same `Arc`.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// ✍️ Somebody wrote after `end()`. Classic.
    #[error("write after end")]
    WriteAfterEnd,

    /// 🗑️ Operation attempted on (or cut short by) a destroyed endpoint.
    #[error("cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    /// 🏁 `end()` after the endpoint already finished.
    #[error("cannot call {0} after a stream was finished")]
    AlreadyFinished(&'static str),

    /// 🔁 A completion fired twice for the same unit of work. Programming error.
    #[error("callback called multiple times")]
    MultipleCallback,

    /// 🕳️ `null` handed to an object-mode endpoint.
    #[error("may not write null values to stream")]
    NullValues,

    /// 🚫 Pushing after the readable side already signalled EOF.
    #[error("stream.push() after EOF")]
    PushAfterEof,

    /// 🧩 Wrong kind of chunk for this endpoint.
    #[error("the \"{name}\" argument must be {expected}")]
    InvalidArgType { name: &'static str, expected: &'static str },

    /// 🧩 Right kind, wrong value.
    #[error("the argument '{name}' is invalid: {reason}")]
    InvalidArgValue { name: &'static str, reason: String },

    /// 🔡 An encoding we have never heard of.
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    /// 🧮 Not enough stages to make a pipeline.
    #[error("the \"{0}\" argument must be specified")]
    MissingArgs(&'static str),

    /// 🔄 A stage handed back something the next stage can't consume.
    #[error("expected {expected} to be returned from the \"{name}\" function")]
    InvalidReturnValue { name: String, expected: &'static str },

    /// 🚪 A participant closed before it said it was done.
    #[error("premature close")]
    PrematureClose,

    /// ✋ Cancellation observed. `reason` is whatever the aborter passed along.
    #[error("the operation was aborted")]
    Aborted { reason: Option<Box<StreamError>> },

    /// 💥 The wrapped sink/source/transform failed.
    #[error("{0:#}")]
    Io(Arc<anyhow::Error>),

    /// 🧅 Two unrelated failures that both deserve to be heard.
    #[error("{first}; {second}")]
    Aggregate {
        first: Box<StreamError>,
        second: Box<StreamError>,
    },
}

impl StreamError {
    /// 🏷️ Stable machine-readable code. The string never changes; the message might.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::WriteAfterEnd => "ERR_STREAM_WRITE_AFTER_END",
            StreamError::Destroyed(_) => "ERR_STREAM_DESTROYED",
            StreamError::AlreadyFinished(_) => "ERR_STREAM_ALREADY_FINISHED",
            StreamError::MultipleCallback => "ERR_MULTIPLE_CALLBACK",
            StreamError::NullValues => "ERR_STREAM_NULL_VALUES",
            StreamError::PushAfterEof => "ERR_STREAM_PUSH_AFTER_EOF",
            StreamError::InvalidArgType { .. } => "ERR_INVALID_ARG_TYPE",
            StreamError::InvalidArgValue { .. } => "ERR_INVALID_ARG_VALUE",
            StreamError::UnknownEncoding(_) => "ERR_UNKNOWN_ENCODING",
            StreamError::MissingArgs(_) => "ERR_MISSING_ARGS",
            StreamError::InvalidReturnValue { .. } => "ERR_INVALID_RETURN_VALUE",
            StreamError::PrematureClose => "ERR_STREAM_PREMATURE_CLOSE",
            StreamError::Aborted { .. } => "ABORT_ERR",
            StreamError::Io(_) => "ERR_IO",
            StreamError::Aggregate { .. } => "ERR_AGGREGATE",
        }
    }

    /// 🌯 Wrap a user-side failure.
    pub fn io(err: anyhow::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }

    /// ✋ An abort with no reason attached. Sometimes people just leave.
    pub fn aborted() -> Self {
        StreamError::Aborted { reason: None }
    }

    /// ✋ An abort that remembers why.
    pub fn aborted_because(reason: StreamError) -> Self {
        StreamError::Aborted {
            reason: Some(Box::new(reason)),
        }
    }

    pub fn is_premature_close(&self) -> bool {
        matches!(self, StreamError::PrematureClose)
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, StreamError::Aborted { .. })
    }

    /// 🧅 Combine two possibly-present errors into one.
    ///
    /// Neither side is discarded. When both are present and describe the same thing
    /// (same code, same message) they collapse into one, because reading
    /// "premature close; premature close" helps nobody.
    pub fn aggregate(first: Option<StreamError>, second: Option<StreamError>) -> Option<StreamError> {
        match (first, second) {
            (None, None) => None,
            (Some(e), None) | (None, Some(e)) => Some(e),
            (Some(a), Some(b)) => {
                if a.same_as(&b) {
                    Some(a)
                } else {
                    Some(StreamError::Aggregate {
                        first: Box::new(a),
                        second: Box::new(b),
                    })
                }
            }
        }
    }

    fn same_as(&self, other: &StreamError) -> bool {
        match (self, other) {
            (StreamError::Io(a), StreamError::Io(b)) => Arc::ptr_eq(a, b),
            _ => self.code() == other.code() && self.to_string() == other.to_string(),
        }
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        // 🪆 don't double-wrap something that was ours to begin with
        match err.downcast::<StreamError>() {
            Ok(stream_err) => stream_err,
            Err(other) => StreamError::io(other),
        }
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
