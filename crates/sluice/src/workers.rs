// ai
//! 🧵 Workers — the tasks that actually move chunks while the endpoints do the paperwork.
//!
//! 🚀 Three kinds, one contract:
//! - [`SinkWorker`](sink_worker::SinkWorker): the dispatcher behind every `Writable`.
//!   Sole caller of its `Sink`.
//! - [`SourceWorker`](source_worker::SourceWorker): pulls from a `Source` into a `Readable`,
//!   pausing whenever the readable says it is full.
//! - [`PumpWorker`](pump_worker::PumpWorker): one pipeline connection. Reads from upstream,
//!   writes downstream, honours drain, and reports how it ended.
//!
//! ⚠️ Workers are crate-private minions. The public API hands out endpoints, never workers.

use anyhow::Result;
use tokio::task::JoinHandle;

pub(crate) mod pump_worker;
pub(crate) mod sink_worker;
pub(crate) mod source_worker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Spawn it. The handle is yours to await or to forget.
    fn start(self) -> JoinHandle<Result<()>>;
}
