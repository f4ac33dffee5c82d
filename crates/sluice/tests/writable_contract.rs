// ai
//! 🧪 The writable contract, poked from the outside the way a caller would.
//!
//! Backpressure threshold, FIFO completion, terminal events at most once, idempotent end.
//! Also: callbacks that turn around and poke the endpoint, async construction, abort signals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde_json::json;
use sluice::backends::{InMemorySink, Sink};
use sluice::{AbortController, AbortSignal, Chunk, Encoding, StreamError, StreamOptions, StreamResult, Writable};
use tokio::sync::oneshot;

/// 📣 Counts `close` and `error` notifications on a writable.
struct TerminalTally {
    closes: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl TerminalTally {
    fn watch(writable: &Writable) -> Self {
        let closes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let on_close = closes.clone();
        writable.on_close(move || {
            on_close.fetch_add(1, Ordering::SeqCst);
        });
        let on_error = errors.clone();
        writable.on_error(move |_| {
            on_error.fetch_add(1, Ordering::SeqCst);
        });
        Self { closes, errors }
    }

    async fn settle(&self, writable: &Writable) -> (usize, usize) {
        writable.closed().await;
        // -- 🕰️ give any straggler a few turns to misbehave
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        (self.closes.load(Ordering::SeqCst), self.errors.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn the_one_where_twelve_bytes_overflow_a_ten_byte_bucket() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let writable = Writable::new(sink.clone(), StreamOptions::default().with_high_water_mark(10))?;
    let drains = Arc::new(AtomicUsize::new(0));
    let counter = drains.clone();
    writable.on_drain(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let returns = vec![writable.write("aaaa")?, writable.write("bbbb")?, writable.write("cccc")?];
    assert_eq!(returns, vec![true, true, false]);
    assert!(writable.writable_need_drain());

    writable.drained().await?;
    writable.end()?;
    writable.finished().await?;

    assert_eq!(drains.load(Ordering::SeqCst), 1);
    assert_eq!(sink.received_text().await, "aaaabbbbcccc");
    Ok(())
}

#[tokio::test]
async fn the_one_where_write_says_false_exactly_at_the_threshold() -> StreamResult<()> {
    let cases: [(usize, &[usize]); 5] = [
        (10, &[4, 4, 4]),
        (10, &[10]),
        (10, &[9, 1, 1]),
        (16, &[1, 2, 3, 4, 5, 6]),
        (5, &[2, 2, 2, 2]),
    ];
    for (hwm, sizes) in cases {
        let writable = Writable::new(InMemorySink::new(), StreamOptions::default().with_high_water_mark(hwm))?;
        let mut cumulative = 0;
        for &size in sizes {
            cumulative += size;
            let more = writable.write("z".repeat(size))?;
            assert_eq!(more, cumulative < hwm, "💀 hwm {hwm}, sizes {sizes:?}, at cumulative {cumulative}");
        }
        writable.end()?;
        writable.finished().await?;
    }
    Ok(())
}

#[tokio::test]
async fn the_one_where_object_mode_counts_heads_not_bytes() -> StreamResult<()> {
    let writable = Writable::new(InMemorySink::new(), StreamOptions::object_mode().with_high_water_mark(2))?;
    assert!(writable.write(json!({ "a": "a very long string that would blow any byte budget" }))?);
    assert!(!writable.write(json!(2))?);
    assert_eq!(writable.writable_length(), 2);

    let null = writable.write(json!(null));
    assert_eq!(null.map_err(|e| e.code()), Err("ERR_STREAM_NULL_VALUES"));
    Ok(())
}

#[tokio::test]
async fn the_one_where_byte_mode_turns_objects_away() -> StreamResult<()> {
    let writable = Writable::new(InMemorySink::new(), StreamOptions::default())?;
    let refused = writable.write(json!({ "nope": true }));
    assert_eq!(refused.map_err(|e| e.code()), Err("ERR_INVALID_ARG_TYPE"));
    let unknown = writable.set_default_encoding("klingon");
    assert_eq!(unknown.map_err(|e| e.code()), Err("ERR_UNKNOWN_ENCODING"));
    // -- still perfectly healthy afterwards
    assert!(writable.is_writable());
    Ok(())
}

#[tokio::test]
async fn the_one_where_decoding_follows_the_encoding() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let writable = Writable::new(sink.clone(), StreamOptions::default())?;
    writable.set_default_encoding("hex")?;
    writable.write(Chunk::text("6869"))?;
    writable.end_with(Chunk::text_with("IQ==", "base64".parse::<Encoding>()?))?;
    writable.finished().await?;
    assert_eq!(sink.received_text().await, "hi!");
    Ok(())
}

#[tokio::test]
async fn the_one_where_callbacks_come_back_in_the_order_they_left() -> StreamResult<()> {
    for sink in [InMemorySink::new(), InMemorySink::new().with_writev()] {
        let writable = Writable::new(sink.clone(), StreamOptions::default().with_high_water_mark(8))?;
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 1..=25usize {
            let order = order.clone();
            writable.write_with(format!("{n},"), move |err| {
                assert!(err.is_none(), "💀 write {n} failed: {err:?}");
                order.lock().expect("💀 poisoned").push(n);
            })?;
            if n % 7 == 0 {
                // -- 🧊 let some of them pile up in the buffer
                writable.cork();
            }
            if n % 7 == 3 {
                writable.uncork();
            }
        }
        writable.end()?;
        writable.finished().await?;

        let order = order.lock().expect("💀 poisoned").clone();
        assert_eq!(order, (1..=25).collect::<Vec<_>>());
        let ledger = sink.ledger().await;
        assert_eq!(ledger.batches.iter().sum::<usize>(), 25);
        assert_eq!(ledger.finalized, 1);
    }
    Ok(())
}

#[tokio::test]
async fn the_one_where_terminal_events_refuse_an_encore() -> StreamResult<()> {
    // 🎬 destroy, then destroy again with an error, then end
    let writable = Writable::new(InMemorySink::new(), StreamOptions::default())?;
    let tally = TerminalTally::watch(&writable);
    writable.write("a")?;
    writable.destroy(None);
    writable.destroy(Some(StreamError::PrematureClose));
    assert!(writable.end().is_err());
    assert_eq!(tally.settle(&writable).await, (1, 0));

    // 🎬 a failing write racing an explicit destroy with its own error
    let writable = Writable::new(InMemorySink::new().failing_after(0), StreamOptions::default())?;
    let tally = TerminalTally::watch(&writable);
    writable.write("boom")?;
    writable.destroy(Some(StreamError::aborted()));
    let _ = writable.end();
    let (closes, errors) = tally.settle(&writable).await;
    assert_eq!(closes, 1);
    assert!(errors <= 1);

    // 🎬 a failing write on its own, then end racing the fallout
    let writable = Writable::new(InMemorySink::new().failing_after(0), StreamOptions::default())?;
    let tally = TerminalTally::watch(&writable);
    let failed = writable.write_and_wait("boom").await;
    assert_eq!(failed.map_err(|e| e.code()), Err("ERR_IO"));
    let _ = writable.end();
    writable.destroy(None);
    assert_eq!(tally.settle(&writable).await, (1, 1));
    assert_eq!(writable.errored().map(|e| e.code()), Some("ERR_IO"));

    // 🎬 a clean finish followed by a late destroy
    let writable = Writable::new(InMemorySink::new(), StreamOptions::default())?;
    let tally = TerminalTally::watch(&writable);
    writable.end_with("fin")?;
    writable.finished().await?;
    writable.destroy(Some(StreamError::PrematureClose));
    assert_eq!(tally.settle(&writable).await, (1, 0));
    Ok(())
}

#[tokio::test]
async fn the_one_where_ending_twice_is_already_finished() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let writable = Writable::new(sink.clone(), StreamOptions::default())?;
    let finishes = Arc::new(AtomicUsize::new(0));
    let counter = finishes.clone();
    writable.on_finish(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    writable.write("once")?;
    writable.end()?;
    writable.finished().await?;

    let again = writable.end();
    assert_eq!(again.map_err(|e| e.code()), Err("ERR_STREAM_ALREADY_FINISHED"));

    let (tx, rx) = tokio::sync::oneshot::channel();
    let _ = writable.end_then(None, move |err| {
        let _ = tx.send(err.map(|e| e.code()));
    });
    assert_eq!(rx.await.ok().flatten(), Some("ERR_STREAM_ALREADY_FINISHED"));

    writable.closed().await;
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert_eq!(sink.ledger().await.finalized, 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_late_write_is_told_off_through_its_callback() -> StreamResult<()> {
    let writable = Writable::new(InMemorySink::new(), StreamOptions::default().with_auto_destroy(false))?;
    writable.end()?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    let more = writable.write_with("too late", move |err| {
        let _ = tx.send(err.map(|e| e.code()));
    })?;
    assert!(!more);
    assert_eq!(rx.await.ok().flatten(), Some("ERR_STREAM_WRITE_AFTER_END"));
    assert_eq!(writable.errored().map(|e| e.code()), Some("ERR_STREAM_WRITE_AFTER_END"));
    Ok(())
}

#[tokio::test]
async fn the_one_where_dispose_tears_down_politely() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let writable = Writable::new(sink.clone(), StreamOptions::default())?;
    writable.write("half a thought")?;
    writable.dispose().await;
    assert!(writable.is_closed());
    assert!(writable.writable_aborted());
    let ledger = sink.ledger().await;
    assert_eq!(ledger.destroyed, 1);
    assert_eq!(ledger.destroy_error, Some("ABORT_ERR"));
    Ok(())
}

/// 📒 Pushes `label:ok` or `label:CODE` into a shared log.
fn logged(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> impl FnOnce(Option<StreamError>) + Send + 'static {
    let log = log.clone();
    move |err| {
        let entry = match err {
            Some(e) => format!("{label}:{}", e.code()),
            None => format!("{label}:ok"),
        };
        log.lock().expect("💀 poisoned").push(entry);
    }
}

#[tokio::test]
async fn the_one_where_destroy_from_a_batch_callback_keeps_the_line() -> StreamResult<()> {
    let writable = Writable::new(InMemorySink::new().with_writev(), StreamOptions::default())?;
    let log = Arc::new(Mutex::new(Vec::new()));

    writable.cork();
    let again = writable.clone();
    let first = logged(&log, "a1");
    writable.write_with("a1", move |err| {
        first(err);
        // -- 🔁 tear down from inside the first callback of the batch
        again.destroy(None);
    })?;
    writable.write_with("a2", logged(&log, "a2"))?;
    writable.uncork();
    writable.cork();
    writable.write_with("b", logged(&log, "b"))?;

    writable.closed().await;
    assert_eq!(
        *log.lock().expect("💀 poisoned"),
        vec!["a1:ok", "a2:ok", "b:ERR_STREAM_DESTROYED"]
    );
    Ok(())
}

#[tokio::test]
async fn the_one_where_callbacks_and_listeners_write_back_in() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let writable = Writable::new(sink.clone(), StreamOptions::default().with_high_water_mark(4))?;
    let tally = TerminalTally::watch(&writable);
    let drains = Arc::new(AtomicUsize::new(0));
    let counter = drains.clone();
    writable.on_drain(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let finisher = writable.clone();
    writable.on_finish(move || {
        // -- 🗑️ auto-destroy already started; this one is a no-op
        finisher.destroy(Some(StreamError::PrematureClose));
    });

    let inner = writable.clone();
    assert!(!writable.write_with("aaaa", move |err| {
        assert!(err.is_none(), "💀 first write failed: {err:?}");
        // -- 🔁 drain already went out, so this lands on a quiet queue
        let _ = inner.write("b");
        let _ = inner.end_with("c");
    })?);

    writable.finished().await?;
    assert_eq!(tally.settle(&writable).await, (1, 0));
    assert!(writable.closed().await.is_none());
    assert_eq!(drains.load(Ordering::SeqCst), 1);
    assert_eq!(sink.received_text().await, "aaaabc");
    Ok(())
}

/// 💣 A sink whose teardown fails too.
struct GrumpyTeardown;

#[async_trait]
impl Sink for GrumpyTeardown {
    async fn write(&mut self, _chunk: Chunk) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&mut self, _err: Option<&StreamError>) -> anyhow::Result<()> {
        bail!("teardown B")
    }
}

#[tokio::test]
async fn the_one_where_the_cause_and_the_teardown_both_get_a_word_in() -> StreamResult<()> {
    let writable = Writable::new(GrumpyTeardown, StreamOptions::default())?;
    let tally = TerminalTally::watch(&writable);
    writable.destroy(Some(StreamError::io(anyhow!("cause A"))));

    let (closes, errors) = tally.settle(&writable).await;
    assert_eq!((closes, errors), (1, 1));
    let reported = writable.errored().expect("💀 teardown should leave an error behind");
    assert_eq!(reported.code(), "ERR_AGGREGATE");
    assert_eq!(reported.to_string(), "cause A; teardown B");
    Ok(())
}

/// 🏗️ A sink that is not ready until somebody opens the gate.
struct SlowStart {
    inner: InMemorySink,
    gate: Option<oneshot::Receiver<Result<(), String>>>,
}

impl SlowStart {
    fn new(inner: InMemorySink) -> (Self, oneshot::Sender<Result<(), String>>) {
        let (open, gate) = oneshot::channel();
        (Self { inner, gate: Some(gate) }, open)
    }
}

#[async_trait]
impl Sink for SlowStart {
    async fn write(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        self.inner.write(chunk).await
    }

    fn needs_construct(&self) -> bool {
        true
    }

    async fn construct(&mut self) -> anyhow::Result<()> {
        let gate = self.gate.take().context("💀 constructed twice")?;
        match gate.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(anyhow!(reason)),
            Err(_) => bail!("the gate was dropped"),
        }
    }

    async fn finalize(&mut self) -> anyhow::Result<()> {
        self.inner.finalize().await
    }

    async fn destroy(&mut self, err: Option<&StreamError>) -> anyhow::Result<()> {
        self.inner.destroy(err).await
    }
}

async fn a_few_turns() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn the_one_where_writes_wait_for_the_sink_to_be_built() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let (slow, open) = SlowStart::new(sink.clone());
    let writable = Writable::new(slow, StreamOptions::default())?;

    writable.write("early ")?;
    writable.end_with("bird")?;
    a_few_turns().await;
    assert!(!writable.writable_constructed());
    assert!(!writable.writable_finished());
    assert!(sink.received().await.is_empty());

    let _ = open.send(Ok(()));
    writable.finished().await?;
    assert!(writable.writable_constructed());
    assert_eq!(sink.received_text().await, "early bird");
    assert_eq!(sink.ledger().await.finalized, 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_failed_build_takes_the_queue_with_it() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let (slow, open) = SlowStart::new(sink.clone());
    let writable = Writable::new(slow, StreamOptions::default())?;

    let (tx, rx) = oneshot::channel();
    writable.write_with("never", move |err| {
        let _ = tx.send(err.map(|e| e.to_string()));
    })?;
    let _ = open.send(Err("no socket for you".into()));

    assert!(rx.await.ok().flatten().is_some_and(|m| m.contains("no socket")));
    let closed = writable.closed().await;
    assert!(closed.is_some_and(|e| e.to_string().contains("no socket")));
    let ledger = sink.ledger().await;
    assert!(ledger.received.is_empty());
    assert_eq!(ledger.destroyed, 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_destroy_waits_for_the_sink_to_be_built() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let (slow, open) = SlowStart::new(sink.clone());
    let writable = Writable::new(slow, StreamOptions::default())?;

    writable.destroy(None);
    a_few_turns().await;
    assert!(!writable.is_closed());
    assert_eq!(sink.ledger().await.destroyed, 0);

    let _ = open.send(Ok(()));
    assert!(writable.closed().await.is_none());
    assert_eq!(sink.ledger().await.destroyed, 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_signal_pulls_the_plug_on_one_endpoint() -> StreamResult<()> {
    let controller = AbortController::new();
    let sink = InMemorySink::new();
    let (slow, open) = SlowStart::new(sink.clone());
    let writable = Writable::new(slow, StreamOptions::default().with_signal(controller.signal()))?;

    let (tx, rx) = oneshot::channel();
    writable.write_with("stuck", move |err| {
        let _ = tx.send(err.map(|e| e.code()));
    })?;
    controller.abort(None);
    a_few_turns().await;
    assert!(writable.is_destroyed());

    // -- 🏗️ the build still gets to finish before the teardown runs
    let _ = open.send(Ok(()));
    assert_eq!(rx.await.ok().flatten(), Some("ABORT_ERR"));
    let closed = writable.closed().await;
    assert!(closed.is_some_and(|e| e.is_abort()));
    assert_eq!(sink.ledger().await.destroy_error, Some("ABORT_ERR"));
    Ok(())
}

#[tokio::test]
async fn the_one_where_an_already_fired_signal_destroys_on_arrival() -> StreamResult<()> {
    let signal = AbortSignal::aborted_with(Some(StreamError::PrematureClose));
    let sink = InMemorySink::new();
    let writable = Writable::new(sink.clone(), StreamOptions::default().with_signal(signal))?;
    assert!(writable.is_destroyed());
    assert!(!writable.is_writable());

    let closed = writable.closed().await.expect("💀 an aborted endpoint closes with an error");
    assert_eq!(closed.code(), "ABORT_ERR");
    assert_eq!(sink.ledger().await.destroyed, 1);
    Ok(())
}
