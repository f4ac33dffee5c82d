// ai
//! 🧪 Compose from the outside: writes go in one end, results come out the other,
//! and tearing the fused duplex down tears every stage down exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sluice::backends::InMemorySink;
use sluice::{
    Chunk, Duplex, Pusher, Stage, StreamError, StreamOptions, StreamResult, Transform, TransformStep, Writable,
    compose,
};

/// 🔢 A transform that counts how many times it was torn down.
struct Tracked {
    destroys: Arc<AtomicUsize>,
    shout: bool,
}

#[async_trait]
impl TransformStep for Tracked {
    async fn transform(&mut self, chunk: Chunk, out: &Pusher) -> anyhow::Result<()> {
        let text = chunk.to_text_lossy();
        out.push(if self.shout { text.to_uppercase() } else { text }).await?;
        Ok(())
    }

    async fn destroy(&mut self, _err: Option<&StreamError>) -> anyhow::Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn tracked(shout: bool) -> StreamResult<(Duplex, Arc<AtomicUsize>)> {
    let destroys = Arc::new(AtomicUsize::new(0));
    let step = Tracked {
        destroys: destroys.clone(),
        shout,
    };
    Ok((Transform::new(step, StreamOptions::object_mode())?, destroys))
}

#[tokio::test]
async fn the_one_where_x_goes_in_and_x_comes_out_shouting() -> StreamResult<()> {
    let (stage_a, a_destroys) = tracked(false)?;
    let (stage_b, b_destroys) = tracked(true)?;
    let fused = compose(vec![stage_a.clone().into(), stage_b.clone().into()])?;

    fused.write("x")?;
    let first = fused.read().await.expect("💀 the fused duplex should produce something")?;
    assert_eq!(first.to_text_lossy(), "X");

    fused.destroy(None);
    fused.closed().await;
    stage_a.closed().await;
    stage_b.closed().await;

    assert_eq!(a_destroys.load(Ordering::SeqCst), 1);
    assert_eq!(b_destroys.load(Ordering::SeqCst), 1);
    assert!(fused.is_destroyed());
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_clean_end_flows_all_the_way_through() -> StreamResult<()> {
    let (stage_a, a_destroys) = tracked(false)?;
    let (stage_b, b_destroys) = tracked(true)?;
    let fused = compose(vec![stage_a.clone().into(), stage_b.clone().into()])?;

    fused.write("quiet")?;
    fused.end_with("please")?;
    let mut out = Vec::new();
    while let Some(chunk) = fused.read().await {
        out.push(chunk?.to_text_lossy());
    }
    assert_eq!(out, vec!["QUIET", "PLEASE"]);
    fused.finished().await?;
    assert!(fused.closed().await.is_none());

    // -- a normal ending still tears each stage down once, via auto-destroy
    stage_a.closed().await;
    stage_b.closed().await;
    assert_eq!(a_destroys.load(Ordering::SeqCst), 1);
    assert_eq!(b_destroys.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_writable_tail_makes_a_write_only_fusion() -> StreamResult<()> {
    let sink = InMemorySink::new();
    let (stage_a, _) = tracked(true)?;
    let tail = Writable::new(sink.clone(), StreamOptions::object_mode())?;
    let fused = compose(vec![stage_a.into(), Stage::Writable(tail.clone())])?;

    assert!(fused.is_writable());
    assert!(!fused.is_readable());

    fused.write("a")?;
    fused.end_with("b")?;
    fused.finished().await?;

    // -- finish on the fused side means the tail already finished too
    assert!(tail.writable_finished());
    assert_eq!(sink.received_text().await, "AB");
    Ok(())
}

#[tokio::test]
async fn the_one_where_an_inner_failure_surfaces_on_the_fused_duplex() -> StreamResult<()> {
    let angry = Transform::map(StreamOptions::object_mode(), |chunk| {
        if chunk.to_text_lossy() == "bad" {
            return Err(anyhow::anyhow!("bad chunk, bad"));
        }
        Ok(Some(chunk))
    })?;
    let fused = compose(vec![Transform::passthrough(StreamOptions::object_mode())?.into(), angry.into()])?;

    fused.write("fine")?;
    fused.write("bad")?;
    let closed_with = fused.closed().await;
    assert!(closed_with.is_some_and(|e| e.to_string().contains("bad chunk, bad")));
    Ok(())
}
