// ai
//! 🚰 sluice — a backpressure-aware stream engine.
//!
//! 🎬 *[in a world where producers never slow down... one crate dared to say "please wait".]*
//!
//! 🧠 Knowledge graph:
//! - [`Writable`]: the buffered sink. `write` says `false` at the high-water mark, `drain`
//!   says "go again", `end` → finalizer → `finish`, `destroy` → teardown hook → `close`.
//! - [`Readable`], [`Duplex`], [`Transform`]: the other endpoint shapes, built on the same parts.
//! - [`pipeline`] / [`pipeline_async`]: chain stages, one verdict. [`compose`]: fuse stages
//!   into one duplex.
//! - [`operators`]: map/filter/reduce & co over pull sequences, all abortable.
//! - Every endpoint runs its I/O from its own tokio task. Construct endpoints inside a runtime.

pub mod abort;
pub mod app_config;
pub mod backends;
pub mod chunk;
pub mod compose;
pub mod duplex;
pub mod error;
pub mod operators;
pub mod options;
pub mod pipeline;
pub mod readable;
pub mod state;
pub mod transform;
pub mod writable;

mod events;
mod workers;

pub use abort::{AbortController, AbortSignal};
pub use chunk::{Chunk, Encoding};
pub use compose::compose;
pub use duplex::Duplex;
pub use error::{StreamError, StreamResult};
pub use operators::OperatorOptions;
pub use options::{StreamOptions, default_high_water_mark, set_default_high_water_mark};
pub use pipeline::{PipelineOptions, Stage, StageOutput, pipeline, pipeline_async, pipeline_with};
pub use readable::{ChunkStream, Readable};
pub use state::{Phase, Teardown, WritableEvent};
pub use transform::{Pusher, Transform, TransformStep};
pub use writable::Writable;
