// ai
//! 🏃 run.rs — config in, lines through, receipt out.
//!
//! 🎬 Source → tap (count what came in) → configured stages → tap (count what left) → sink.
//!
//! 🧠 Knowledge graph:
//! - The sink sits behind a `Writable`, so the stages feel real backpressure.
//! - The taps are plain `Stage::map`s that pass chunks through untouched.
//! - Progress is redrawn every `PROGRESS_EVERY` lines, plus once at the end for the stragglers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use sluice::app_config::{AppConfig, StageConfig};
use sluice::backends::{SinkBackend, SinkConfig, SourceBackend, SourceConfig};
use sluice::{OperatorOptions, PipelineOptions, Stage, Writable, pipeline_async};
use tracing::{debug, info};

use crate::progress::{ProgressMetrics, RunSummary};
use crate::stages;

const PROGRESS_EVERY: u64 = 1_024;

/// 🚀 One full run, start to receipt.
pub(crate) async fn run(config: AppConfig) -> Result<RunSummary> {
    refuse_mangled_gzip(&config)?;

    let (source_name, total_size) = match &config.source {
        SourceConfig::InMemory { .. } => ("memory".to_string(), 0),
        SourceConfig::File(file) => {
            // -- 📏 a missing size only costs us the percentage
            let size = tokio::fs::metadata(&file.file_name).await.map(|m| m.len()).unwrap_or(0);
            (file.file_name.clone(), size)
        }
    };
    let metrics = Arc::new(Mutex::new(ProgressMetrics::new(
        source_name.clone(),
        total_size,
        config.runtime.progress,
    )));

    let source = SourceBackend::from_config(&config.source)
        .await
        .with_context(|| format!("💀 could not open the source '{source_name}'"))?;
    let sink = SinkBackend::from_config(&config.sink)
        .await
        .context("💀 could not open the sink")?;
    let writable = Writable::new(sink, config.runtime.stream.clone())
        .context("💀 the [runtime.stream] options were not accepted")?;

    let lines_in = Arc::new(AtomicU64::new(0));
    let bytes_in = Arc::new(AtomicU64::new(0));
    let lines_out = Arc::new(AtomicU64::new(0));

    let mut plan = vec![Stage::source(source), tap_in(lines_in.clone(), bytes_in.clone(), metrics.clone())];
    for (index, stage) in config.stages.iter().enumerate() {
        let built = stages::build(stage, config.runtime.concurrency)
            .with_context(|| format!("💀 stage #{index} ({stage:?}) could not be built"))?;
        plan.push(built);
    }
    plan.push(tap_out(lines_out.clone()));
    plan.push(writable.into());

    info!("🚀 running {} configured stage(s) from '{source_name}'", config.stages.len());
    pipeline_async(plan, PipelineOptions::default())
        .await
        .context("💀 the pipeline did not make it to the end")?;

    let summary = {
        let mut metrics = metrics
            .lock()
            .map_err(|_| anyhow::anyhow!("💀 progress metrics were poisoned by a panicking tap"))?;
        let lines = lines_in.load(Ordering::SeqCst);
        let bytes = bytes_in.load(Ordering::SeqCst);
        // -- 🧹 the last partial batch never hit the redraw threshold
        let (seen_bytes, seen_lines) = (metrics.total_bytes(), metrics.total_lines());
        metrics.update(bytes.saturating_sub(seen_bytes), lines.saturating_sub(seen_lines));
        metrics.finish();
        RunSummary {
            lines_in: lines,
            lines_out: lines_out.load(Ordering::SeqCst),
            bytes_in: bytes,
            elapsed: metrics.elapsed(),
        }
    };
    info!("✅ done: {} line(s) in, {} line(s) out", summary.lines_in, summary.lines_out);
    Ok(summary)
}

/// 🫁 gzip output glued together with newlines is not gzip anymore.
fn refuse_mangled_gzip(config: &AppConfig) -> Result<()> {
    let gzips = config.stages.iter().any(|s| matches!(s, StageConfig::Gzip { .. }));
    match &config.sink {
        SinkConfig::File(file) if gzips && file.append_newline => bail!(
            "💀 a gzip stage writing into '{}' needs `append_newline = false` on the sink, \
            otherwise every compressed block gets a newline stapled to it",
            file.file_name
        ),
        _ => Ok(()),
    }
}

fn tap_in(lines: Arc<AtomicU64>, bytes: Arc<AtomicU64>, metrics: Arc<Mutex<ProgressMetrics>>) -> Stage {
    let mut batch_lines = 0u64;
    let mut batch_bytes = 0u64;
    Stage::map(OperatorOptions::default(), move |chunk| {
        let size = chunk.byte_len() as u64;
        lines.fetch_add(1, Ordering::SeqCst);
        bytes.fetch_add(size, Ordering::SeqCst);
        batch_lines += 1;
        batch_bytes += size;
        if batch_lines >= PROGRESS_EVERY {
            match metrics.lock() {
                Ok(mut metrics) => metrics.update(batch_bytes, batch_lines),
                Err(_) => debug!("🎨 progress metrics poisoned, skipping a redraw"),
            }
            batch_lines = 0;
            batch_bytes = 0;
        }
        async move { Ok(chunk) }
    })
}

fn tap_out(lines: Arc<AtomicU64>) -> Stage {
    Stage::map(OperatorOptions::default(), move |chunk| {
        lines.fetch_add(1, Ordering::SeqCst);
        async move { Ok(chunk) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice::app_config::RuntimeConfig;
    use sluice::backends::{FileSinkConfig, FileSourceConfig};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn quiet_runtime() -> RuntimeConfig {
        RuntimeConfig {
            progress: false,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn the_one_where_a_file_gets_shouted_into_another_file() -> Result<()> {
        let mut input = NamedTempFile::new()?;
        write!(input, "hello\n\nkeep calm\ndrop this\ncarry on\n")?;
        let output = NamedTempFile::new()?;

        let config = AppConfig {
            source: SourceConfig::File(FileSourceConfig {
                file_name: input.path().display().to_string(),
                skip_blank_lines: false,
            }),
            sink: SinkConfig::File(FileSinkConfig {
                file_name: output.path().display().to_string(),
                append_newline: true,
            }),
            runtime: quiet_runtime(),
            stages: vec![
                StageConfig::SkipEmpty,
                StageConfig::Grep { pattern: " ".into() },
                StageConfig::Uppercase,
            ],
        };

        let summary = run(config).await?;
        assert_eq!(summary.lines_in, 5);
        assert_eq!(summary.lines_out, 3);
        let written = std::fs::read_to_string(output.path())?;
        assert_eq!(written, "KEEP CALM\nDROP THIS\nCARRY ON\n");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_gzip_and_newlines_do_not_mix() {
        let config = AppConfig {
            source: SourceConfig::InMemory { lines: vec!["a".into()] },
            sink: SinkConfig::File(FileSinkConfig {
                file_name: "never-created.gz".into(),
                append_newline: true,
            }),
            runtime: quiet_runtime(),
            stages: vec![StageConfig::Gzip { level: 6 }],
        };
        let refused = run(config).await;
        assert!(refused.is_err_and(|e| e.to_string().contains("append_newline = false")));
    }

    #[tokio::test]
    async fn the_one_where_memory_in_memory_out_still_counts() -> Result<()> {
        let config = AppConfig {
            source: SourceConfig::InMemory {
                lines: (0..3_000).map(|n| format!("line {n}")).collect(),
            },
            sink: SinkConfig::InMemory,
            runtime: quiet_runtime(),
            stages: vec![StageConfig::Grep { pattern: "7".into() }],
        };
        let summary = run(config).await?;
        assert_eq!(summary.lines_in, 3_000);
        let sevens = (0..3_000).filter(|n: &i32| n.to_string().contains('7')).count() as u64;
        assert_eq!(summary.lines_out, sevens);
        Ok(())
    }
}
