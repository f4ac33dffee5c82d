// ai
//! 🔧 Stream options — the knobs every endpoint is born with.
//!
//! 🧠 Knowledge graph:
//! - `StreamOptions` deserializes from TOML/env like every other config in the crate.
//! - Per-side keys (`writable_high_water_mark`, `readable_object_mode`, ...) win over
//!   the shared key for duplex endpoints; the shared key wins over the global default.
//! - `signal` ties an endpoint to an [`AbortSignal`]: it fires, the endpoint is destroyed
//!   with an abort error. Code-only; there is nothing to spell in TOML.
//! - The global default high-water marks live in two atomics. Changing them affects
//!   endpoints constructed afterwards, never the ones already swimming.
//!
//! "He who sets the high-water mark to zero, gets backpressure on every single write." 🦆

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

use crate::abort::AbortSignal;
use crate::chunk::Encoding;
use crate::error::StreamError;

// 📏 16 objects or 16 KiB. Round numbers, chosen by people who like round numbers.
static DEFAULT_OBJECT_HWM: AtomicUsize = AtomicUsize::new(16);
static DEFAULT_BYTE_HWM: AtomicUsize = AtomicUsize::new(16 * 1024);

/// 📏 The process-wide default high-water mark for the given mode.
pub fn default_high_water_mark(object_mode: bool) -> usize {
    if object_mode {
        DEFAULT_OBJECT_HWM.load(Ordering::Relaxed)
    } else {
        DEFAULT_BYTE_HWM.load(Ordering::Relaxed)
    }
}

/// 🔧 Change the process-wide default high-water mark for the given mode.
pub fn set_default_high_water_mark(object_mode: bool, value: usize) {
    if object_mode {
        DEFAULT_OBJECT_HWM.store(value, Ordering::Relaxed);
    } else {
        DEFAULT_BYTE_HWM.store(value, Ordering::Relaxed);
    }
}

/// 🎛️ Construction options for writable, readable and duplex endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// 📦 chunks are opaque values counted one by one
    pub object_mode: bool,
    pub readable_object_mode: Option<bool>,
    pub writable_object_mode: Option<bool>,
    /// 🌊 queued-size threshold; `None` means "whatever the global default is today"
    pub high_water_mark: Option<usize>,
    pub readable_high_water_mark: Option<usize>,
    pub writable_high_water_mark: Option<usize>,
    /// 🔡 turn `Text` chunks into bytes on the way in (byte mode only)
    pub decode_strings: bool,
    pub default_encoding: Encoding,
    /// 🗑️ tear down automatically after finishing or erroring
    pub auto_destroy: bool,
    /// 📣 emit `close` after teardown
    pub emit_close: bool,
    #[serde(skip)]
    pub signal: Option<AbortSignal>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            object_mode: false,
            readable_object_mode: None,
            writable_object_mode: None,
            high_water_mark: None,
            readable_high_water_mark: None,
            writable_high_water_mark: None,
            decode_strings: true,
            default_encoding: Encoding::Utf8,
            auto_destroy: true,
            emit_close: true,
            signal: None,
        }
    }
}

/// ↔️ Which side of a (possibly duplex) endpoint we are resolving options for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Readable,
    Writable,
}

impl StreamOptions {
    pub fn object_mode() -> Self {
        Self {
            object_mode: true,
            ..Self::default()
        }
    }

    pub fn with_high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn with_auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }

    pub fn with_emit_close(mut self, emit_close: bool) -> Self {
        self.emit_close = emit_close;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_decode_strings(mut self, decode_strings: bool) -> Self {
        self.decode_strings = decode_strings;
        self
    }

    pub fn with_default_encoding(mut self, encoding: Encoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// 📦 Object mode for one side: per-side flag, then the shared flag.
    pub fn object_mode_for(&self, side: Side) -> bool {
        let per_side = match side {
            Side::Readable => self.readable_object_mode,
            Side::Writable => self.writable_object_mode,
        };
        per_side.unwrap_or(self.object_mode)
    }

    /// 🌊 High-water mark for one side: shared key, then per-side key, then the global default.
    ///
    /// Mirrors the duplex rule: an explicit shared `high_water_mark` applies to both sides,
    /// a per-side key only applies when the shared one is absent.
    pub fn high_water_mark_for(&self, side: Side) -> usize {
        let per_side = match side {
            Side::Readable => self.readable_high_water_mark,
            Side::Writable => self.writable_high_water_mark,
        };
        self.high_water_mark
            .or(per_side)
            .unwrap_or_else(|| default_high_water_mark(self.object_mode_for(side)))
    }

    /// 🔍 Sanity check before anything gets built.
    pub fn validate(&self) -> Result<(), StreamError> {
        // -- hwm is unsigned so "≥ 0" is free; the only thing left to police is absurdity
        for (name, hwm) in [
            ("high_water_mark", self.high_water_mark),
            ("readable_high_water_mark", self.readable_high_water_mark),
            ("writable_high_water_mark", self.writable_high_water_mark),
        ] {
            if let Some(hwm) = hwm
                && hwm > isize::MAX as usize
            {
                return Err(StreamError::InvalidArgValue {
                    name,
                    reason: format!("{hwm} does not fit in memory, let alone a queue"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_defaults_depend_on_the_mode() {
        let bytes = StreamOptions::default();
        assert_eq!(bytes.high_water_mark_for(Side::Writable), 16 * 1024);
        let objects = StreamOptions::object_mode();
        assert_eq!(objects.high_water_mark_for(Side::Writable), 16);
        assert!(bytes.decode_strings);
        assert!(bytes.auto_destroy);
        assert!(bytes.emit_close);
    }

    #[test]
    fn the_one_where_per_side_keys_know_their_place() {
        let opts = StreamOptions {
            readable_object_mode: Some(true),
            writable_high_water_mark: Some(3),
            ..StreamOptions::default()
        };
        assert!(opts.object_mode_for(Side::Readable));
        assert!(!opts.object_mode_for(Side::Writable));
        assert_eq!(opts.high_water_mark_for(Side::Writable), 3);
        assert_eq!(opts.high_water_mark_for(Side::Readable), 16);

        let shared = opts.with_high_water_mark(7);
        assert_eq!(shared.high_water_mark_for(Side::Writable), 7);
        assert_eq!(shared.high_water_mark_for(Side::Readable), 7);
    }

    #[test]
    fn the_one_where_options_come_from_toml() {
        let opts: StreamOptions = toml::from_str(
            r#"
            object_mode = true
            high_water_mark = 4
            default_encoding = "HEX"
            auto_destroy = false
            "#,
        )
        .expect("💀 options should parse; serde and I had an agreement");
        assert!(opts.object_mode);
        assert_eq!(opts.high_water_mark, Some(4));
        assert_eq!(opts.default_encoding, Encoding::Hex);
        assert!(!opts.auto_destroy);
        assert!(opts.emit_close);

        let bad: Result<StreamOptions, _> = toml::from_str(r#"default_encoding = "klingon""#);
        assert!(bad.is_err());
    }
}
