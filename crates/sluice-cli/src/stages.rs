// ai
//! 🧩 Stages — turning `[[stages]]` config entries into pipeline stages.
//!
//! 🧠 Knowledge graph:
//! - Line stages (`uppercase`, `lowercase`, `trim`) are `Stage::map` over the text of each line.
//! - Line filters (`grep`, `skip_empty`) are `Stage::filter`.
//! - `json_field` is a `Transform::map`, so lines without the field can simply vanish.
//! - `gzip` is a `Transform` with real state: a flate2 encoder that swallows lines and
//!   spits out compressed bytes whenever it has some. The trailer goes out in `flush`.

use std::io::Write;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use sluice::app_config::StageConfig;
use sluice::{Chunk, OperatorOptions, Pusher, Stage, StreamOptions, Transform, TransformStep};

/// 🏗️ One config entry → one stage.
pub(crate) fn build(config: &StageConfig, concurrency: usize) -> Result<Stage> {
    let opts = OperatorOptions::default().with_concurrency(concurrency);
    Ok(match config {
        StageConfig::Uppercase => line_map(opts, |line| line.to_uppercase()),
        StageConfig::Lowercase => line_map(opts, |line| line.to_lowercase()),
        StageConfig::Trim => line_map(opts, |line| line.trim().to_string()),
        StageConfig::Grep { pattern } => {
            let pattern = pattern.clone();
            line_filter(opts, move |line| line.contains(pattern.as_str()))
        }
        StageConfig::SkipEmpty => line_filter(opts, |line| !line.trim().is_empty()),
        StageConfig::JsonField { field } => json_field(field.clone())?,
        StageConfig::Gzip { level } => {
            if *level > 9 {
                return Err(anyhow!("💀 gzip level {level} is not a thing. Pick something between 0 and 9."));
            }
            Transform::new(GzipStep::new(*level), StreamOptions::default())?.into()
        }
    })
}

fn line_map(opts: OperatorOptions, f: impl Fn(&str) -> String + Send + 'static) -> Stage {
    Stage::map(opts, move |chunk| {
        let line = f(&chunk.to_text_lossy());
        async move { Ok(Chunk::from(line)) }
    })
}

fn line_filter(opts: OperatorOptions, keep: impl Fn(&str) -> bool + Send + 'static) -> Stage {
    Stage::filter(opts, move |chunk| {
        let kept = keep(&chunk.to_text_lossy());
        async move { Ok(kept) }
    })
}

/// 🪓 Pluck `field` out of every JSON line. Strings come out bare, everything else as JSON.
fn json_field(field: String) -> Result<Stage> {
    let transform = Transform::map(StreamOptions::default(), move |chunk| {
        let line = chunk.to_text_lossy();
        let parsed: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("💀 json_field: this line is not JSON: {line:.80}"))?;
        Ok(match parsed.get(field.as_str()) {
            Some(serde_json::Value::String(s)) => Some(Chunk::from(s.as_str())),
            Some(other) => Some(Chunk::from(other.to_string())),
            None => None,
        })
    })?;
    Ok(transform.into())
}

/// 🫁 Streaming gzip. Every line goes in with its newline; compressed bytes come out
/// whenever the encoder had enough to say.
struct GzipStep {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipStep {
    fn new(level: u32) -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::new(level))),
        }
    }
}

#[async_trait]
impl TransformStep for GzipStep {
    async fn transform(&mut self, chunk: Chunk, out: &Pusher) -> Result<()> {
        let encoder = self.encoder.as_mut().context("💀 gzip stage got a line after it was flushed")?;
        encoder.write_all(&chunk.into_bytes())?;
        encoder.write_all(b"\n")?;
        let ready = std::mem::take(encoder.get_mut());
        if !ready.is_empty() {
            out.push(ready).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, out: &Pusher) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish().context("💀 gzip could not write its trailer")?;
            out.push(tail).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice::backends::InMemorySink;
    use sluice::{PipelineOptions, Writable, pipeline_async};
    use std::io::Read;

    #[tokio::test]
    async fn the_one_where_the_line_stages_line_up() -> Result<()> {
        let plan = [
            StageConfig::Trim,
            StageConfig::SkipEmpty,
            StageConfig::Grep { pattern: "keep".into() },
            StageConfig::Uppercase,
        ];
        let mut stages = vec![Stage::iter(["  keep me  ", "", "drop me", "keep too"])];
        for config in &plan {
            stages.push(build(config, 2)?);
        }
        stages.push(Stage::to_array());

        let value = pipeline_async(stages, PipelineOptions::default()).await?;
        assert_eq!(value, Some(Chunk::from(serde_json::json!(["KEEP ME", "KEEP TOO"]))));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_json_field_plucks_and_skips() -> Result<()> {
        let value = pipeline_async(
            vec![
                Stage::iter([r#"{"level":"warn","n":1}"#, r#"{"n":2}"#, r#"{"level":{"deep":true}}"#]),
                build(&StageConfig::JsonField { field: "level".into() }, 1)?,
                Stage::to_array(),
            ],
            PipelineOptions::default(),
        )
        .await?;
        assert_eq!(value, Some(Chunk::from(serde_json::json!(["warn", r#"{"deep":true}"#]))));

        let broken = pipeline_async(
            vec![
                Stage::iter(["not json at all"]),
                build(&StageConfig::JsonField { field: "level".into() }, 1)?,
                Stage::to_array(),
            ],
            PipelineOptions::default(),
        )
        .await;
        assert!(broken.is_err_and(|e| e.to_string().contains("not JSON")));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_gzip_round_trips_through_flate2() -> Result<()> {
        let sink = InMemorySink::new();
        let writable = Writable::new(sink.clone(), StreamOptions::default())?;
        let lines: Vec<String> = (0..500).map(|n| format!("line number {n}")).collect();

        pipeline_async(
            vec![
                Stage::iter(lines.clone()),
                build(&StageConfig::Gzip { level: 6 }, 1)?,
                writable.into(),
            ],
            PipelineOptions::default(),
        )
        .await?;

        let compressed: Vec<u8> = sink.received().await.into_iter().flat_map(Chunk::into_bytes).collect();
        let mut unzipped = String::new();
        flate2::read::GzDecoder::new(compressed.as_slice()).read_to_string(&mut unzipped)?;
        assert_eq!(unzipped, lines.iter().map(|l| format!("{l}\n")).collect::<String>());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_gzip_level_eleven_is_not_a_thing() {
        let built = build(&StageConfig::Gzip { level: 11 }, 1);
        assert!(built.is_err());
    }
}
