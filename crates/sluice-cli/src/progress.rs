// ai
//! 📊 progress.rs — "Are we there yet?" asked once per batch of lines, forever.
//!
//! 🚀 A progress bar while the run is going, a comfy table when it is over.
//!
//! ⚠️  Watching this progress bar will not make it go faster. We've tried. Science says no.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

// -- 📏 one mebibyte. not a megabyte. there's a difference and I will die on this hill.
const MIB: u64 = 1024 * 1024;

/// 📦 Bytes, scaled to the size of the whole file so the units don't jitter.
fn format_bytes(bytes: u64, file_size: u64) -> String {
    if file_size >= 512 * MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if file_size >= MIB {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS for the long hauls.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📡 Throughput at one moment.
struct Rates {
    lines_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Tracks bytes and lines flowing in, and renders them onto an indicatif bar.
///
/// Rates come from a sliding 5-second window so one slow batch does not scare anybody.
pub(crate) struct ProgressMetrics {
    source_name: String,
    /// 📏 0 when we have no idea (in-memory sources)
    total_size: u64,
    total_bytes: u64,
    total_lines: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("source_name", &self.source_name)
            .field("total_size", &self.total_size)
            .field("total_bytes", &self.total_bytes)
            .field("total_lines", &self.total_lines)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 `visible = false` keeps the bookkeeping but never draws anything.
    pub(crate) fn new(source_name: String, total_size: u64, visible: bool) -> Self {
        let progress_bar = if visible {
            ProgressBar::new(total_size)
        } else {
            ProgressBar::hidden()
        };
        match ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            Ok(style) => progress_bar.set_style(style.progress_chars("=>-")),
            Err(err) => tracing::debug!("🎨 progress template rejected, keeping the default: {err}"),
        }

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));

        Self {
            source_name,
            total_size,
            total_bytes: 0,
            total_lines: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Account for another batch of lines and redraw.
    pub(crate) fn update(&mut self, bytes_read: u64, lines_read: u64) {
        self.total_bytes += bytes_read;
        self.total_lines += lines_read;
        let rates = self.calculate_rates();
        self.render(rates);
        self.progress_bar.set_position(self.total_bytes);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    pub(crate) fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.total_bytes, self.total_lines));

        if let Some(&(oldest_time, oldest_bytes, oldest_lines)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = self.total_bytes.saturating_sub(oldest_bytes);
                let lines_delta = self.total_lines.saturating_sub(oldest_lines);
                return Rates {
                    lines_per_sec: lines_delta as f64 / elapsed,
                    mib_per_sec: (bytes_delta as f64 / elapsed) / MIB as f64,
                };
            }
        }

        // -- 💤 not enough time has passed to say anything smart
        Rates {
            lines_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    /// 🎨 Two columns, right-aligned, no borders.
    fn render(&self, rates: Rates) {
        let percent = if self.total_size > 0 {
            (self.total_bytes as f64 / self.total_size as f64) * 100.0
        } else {
            0.0
        };
        let bytes_progress = format!(
            "{} / {}",
            format_bytes(self.total_bytes, self.total_size),
            format_bytes(self.total_size, self.total_size)
        );

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Lines/s", format_number(rates.lines_per_sec as u64))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Lines", format_number(self.total_lines))).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(bytes_progress).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(self.start_time.elapsed())))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}%", percent)).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("source: {}\n{}", self.source_name, table));
    }
}

/// 🧾 What one finished run amounted to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunSummary {
    pub(crate) lines_in: u64,
    pub(crate) lines_out: u64,
    pub(crate) bytes_in: u64,
    pub(crate) elapsed: Duration,
}

impl RunSummary {
    /// 🍽️ The end-of-run table, printed once and then forgotten like a receipt.
    pub(crate) fn table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        let rows = [
            ("lines in", format_number(self.lines_in)),
            ("lines out", format_number(self.lines_out)),
            ("bytes in", format_bytes(self.bytes_in, self.bytes_in)),
            ("elapsed", format_duration(self.elapsed)),
        ];
        for (label, value) in rows {
            table.add_row(vec![Cell::new(label), Cell::new(value).set_alignment(CellAlignment::Right)]);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_time_is_told_in_two_formats() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_a_hidden_bar_still_counts() {
        let mut metrics = ProgressMetrics::new("memory".into(), 0, false);
        metrics.update(10, 2);
        metrics.update(5, 1);
        metrics.finish();
        assert_eq!(metrics.total_bytes(), 15);
        assert_eq!(metrics.total_lines(), 3);
    }

    #[test]
    fn the_one_where_the_receipt_lists_everything() {
        let summary = RunSummary {
            lines_in: 1_500,
            lines_out: 12,
            bytes_in: 2_048,
            elapsed: Duration::from_secs(3),
        };
        let rendered = summary.table().to_string();
        assert!(rendered.contains("1,500"));
        assert!(rendered.contains("lines out"));
        assert!(rendered.contains("00:03"));
    }
}
