// ai
//! 🧬 Compose — fuse a chain of stages into one duplex.
//!
//! 🎬 *[three transforms walk into a bar. one duplex walks out.]*
//!
//! 🧠 Knowledge graph:
//! - The fused writable side forwards into the head: a duplex head gets the writes directly
//!   (its backpressure becomes ours), a function head gets a feeder readable put in front
//!   of it. A source or readable head means there is no writable side at all.
//! - The fused readable side is fed by one extra terminal stage that pushes whatever the
//!   tail produces. A writable tail means there is no readable side.
//! - Inside, it is just a [`pipeline_with`] run on a private abort controller.
//!   The run failing destroys the fused duplex with that error. Destroying the fused duplex
//!   early aborts the run, which tears every inner stage down exactly once.
//! - The fused writable only reports `finish` once the inner run is done.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::debug;

use crate::abort::AbortController;
use crate::backends::Sink;
use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::options::StreamOptions;
use crate::pipeline::{PipelineOptions, Stage, pipeline_with};
use crate::readable::Readable;
use crate::writable::Writable;

type Settled = watch::Receiver<Option<Result<(), StreamError>>>;

enum HeadInput {
    Writable(Writable),
    Feeder(Readable),
}

/// 🚪 The fused writable's sink: everything goes into the head of the chain.
struct HeadSink {
    input: HeadInput,
    settled: Settled,
    controller: AbortController,
}

#[async_trait]
impl Sink for HeadSink {
    async fn write(&mut self, chunk: Chunk) -> Result<()> {
        match &self.input {
            HeadInput::Writable(head) => {
                if !head.write(chunk)? {
                    head.drained().await?;
                }
            }
            HeadInput::Feeder(feeder) => {
                if !feeder.push(chunk)? {
                    feeder.wait_for_space().await?;
                }
            }
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        match &self.input {
            HeadInput::Writable(head) => head.end()?,
            HeadInput::Feeder(feeder) => feeder.push_end(),
        }
        let outcome = match self.settled.wait_for(Option::is_some).await {
            Ok(seen) => seen.clone(),
            Err(_) => Some(Err(StreamError::PrematureClose)),
        };
        match outcome {
            Some(Err(err)) => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> Result<()> {
        if self.settled.borrow().is_none() {
            debug!("🧬 fused duplex destroyed early, aborting the inner run");
            self.controller.abort(err.cloned());
        }
        Ok(())
    }
}

/// 🧬 Fuse `stages` into one [`Duplex`]. Both sides run in object mode.
///
/// Needs at least two stages. A writable-only head is rejected right away; every other
/// misfit surfaces as an error on the fused duplex, the same way [`pipeline_with`] reports it.
pub fn compose(mut stages: Vec<Stage>) -> Result<Duplex, StreamError> {
    if stages.len() < 2 {
        return Err(StreamError::MissingArgs("streams"));
    }
    let opts = StreamOptions::object_mode();
    let controller = AbortController::new();
    let (settle, settled) = watch::channel(None);

    let head = match &stages[0] {
        Stage::Duplex(duplex) => duplex.writable().cloned().map(HeadInput::Writable),
        Stage::Source(_) | Stage::Readable(_) | Stage::Function(_) => None,
        Stage::Writable(_) => {
            return Err(StreamError::InvalidArgType {
                name: "streams[0]",
                expected: "a readable, a duplex, a function or a pull sequence",
            });
        }
    };
    let head = if matches!(stages[0], Stage::Function(_)) {
        // -- 🍼 a function head needs a sequence to chew on; the feeder is it
        let feeder = Readable::build(&opts, true)?;
        stages.insert(0, Stage::Readable(feeder.clone()));
        Some(HeadInput::Feeder(feeder))
    } else {
        head
    };

    let tail_readable = match stages.last() {
        Some(Stage::Writable(_)) => false,
        Some(Stage::Duplex(duplex)) => duplex.readable().is_some(),
        _ => true,
    };
    let output = if tail_readable {
        let output = Readable::build(&opts, true)?;
        stages.push(forward_into(output.clone()));
        Some(output)
    } else {
        None
    };

    let writable = match head {
        Some(input) => Some(Writable::build(
            Box::new(HeadSink {
                input,
                settled: settled.clone(),
                controller: controller.clone(),
            }),
            &opts,
            true,
        )?),
        None => None,
    };
    if let Some(output) = &output {
        let controller = controller.clone();
        let settled = settled.clone();
        output.set_destroy_hook(move |err| {
            if settled.borrow().is_none() {
                controller.abort(err.cloned());
            }
        });
    }

    let fused = Duplex::from_parts(writable, output, opts.auto_destroy);
    let on_settled = fused.clone();
    pipeline_with(
        stages,
        PipelineOptions {
            signal: Some(controller.signal()),
            end: true,
        },
        move |outcome| {
            let failed = outcome.as_ref().err().cloned();
            settle.send_replace(Some(outcome.map(|_| ())));
            if let Some(err) = failed {
                debug!("🧬 inner run failed: {err}");
                on_settled.destroy(Some(err));
            }
        },
    )?;
    Ok(fused)
}

/// 📤 The terminal stage that moves the tail's output into the fused readable side.
fn forward_into(output: Readable) -> Stage {
    Stage::consume(move |mut input, _signal| async move {
        while let Some(chunk) = input.next().await {
            if !output.push(chunk?)? {
                output.wait_for_space().await?;
            }
        }
        output.push_end();
        Ok(None)
    })
}
