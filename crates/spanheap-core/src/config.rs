//! Runtime heap configuration.
//!
//! Every address-space and growth threshold is a field of [`HeapConfig`]
//! rather than a constant. Values can be supplied through `SPANHEAP_*`
//! environment variables:
//! - `SPANHEAP_ARENA_BYTES`: logical arena ceiling (default 64 GiB).
//! - `SPANHEAP_INITIAL_RESERVATION`: arena bytes reserved at startup
//!   (default: the whole arena).
//! - `SPANHEAP_MIN_RESERVATION`: smallest fallback reservation (default 64 MiB).
//! - `SPANHEAP_GROWTH_RESERVATION`: arena growth granularity (default 256 MiB).
//! - `SPANHEAP_HEAP_CHUNK`: minimum page-heap growth (default 1 MiB).
//! - `SPANHEAP_STRAND_LIMIT`: largest gap abandoned on a non-contiguous
//!   mapping (default 16 MiB).
//! - `SPANHEAP_MIN_PHYS_PAGE`: smallest acceptable OS page (default 4096).
//! - `SPANHEAP_ADDRESS_HINTS`, `SPANHEAP_HINT_BASE`, `SPANHEAP_HINT_ATTEMPTS`.
//! - `SPANHEAP_LOG_LEVEL`, `SPANHEAP_LOG_CAPACITY`.
//!
//! Sizes parse loosely (`4096`, `0x1000`, `64k`, `64m`, `1g`). Garbled values
//! fall back to the default instead of failing; [`HeapConfig::validate`]
//! rejects combinations that cannot describe a working heap.

use std::sync::OnceLock;

use thiserror::Error;

use crate::PAGE_SIZE;
use crate::log::HeapLogLevel;

const KIB: usize = 1 << 10;
const MIB: usize = 1 << 20;
const GIB: usize = 1 << 30;

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("{field} = {value:#x} is not a multiple of the {align}-byte page")]
    NotPageAligned {
        field: &'static str,
        value: usize,
        align: usize,
    },
    #[error("{field} = {value} is not a power of two")]
    NotPowerOfTwo { field: &'static str, value: usize },
    #[error("arena of {bytes} bytes has more pages than a span index can name")]
    ArenaTooLarge { bytes: usize },
    #[error("inconsistent reservation sizes: {detail}")]
    Inconsistent { detail: String },
}

/// Heap policy knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Logical arena ceiling. Sizes the span-index and bitmap regions.
    pub arena_bytes: usize,
    /// Arena bytes reserved at startup.
    pub initial_reservation: usize,
    /// Smallest startup reservation tried before giving up.
    pub min_reservation: usize,
    /// Granularity of later arena reservations.
    pub growth_reservation: usize,
    /// Minimum page-heap growth step.
    pub heap_chunk: usize,
    /// Largest address gap abandoned when the OS maps non-contiguously.
    pub strand_limit: usize,
    /// Smallest acceptable physical page size.
    pub min_phys_page_size: usize,
    /// Try preferred base addresses before OS-chosen placement.
    pub address_hints: bool,
    /// Low bits of every preferred base address.
    pub hint_base: usize,
    /// Number of preferred base addresses tried.
    pub hint_attempts: usize,
    /// Lowest level retained in the lifecycle log ring.
    pub log_level: HeapLogLevel,
    /// Lifecycle log ring capacity (0 disables retention).
    pub log_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_bytes: 64 * GIB,
            initial_reservation: 64 * GIB,
            min_reservation: 64 * MIB,
            growth_reservation: 256 * MIB,
            heap_chunk: MIB,
            strand_limit: 16 * MIB,
            min_phys_page_size: 4096,
            address_hints: true,
            hint_base: 0x00c0 << 32,
            hint_attempts: 0x80,
            log_level: HeapLogLevel::Debug,
            log_capacity: 1024,
        }
    }
}

impl HeapConfig {
    /// Reads `SPANHEAP_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source; unset or garbled keys keep
    /// their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let bytes = |key: &str| lookup(key).and_then(|v| parse_bytes_loose(&v));

        if let Some(v) = bytes("SPANHEAP_ARENA_BYTES") {
            cfg = cfg.with_arena_bytes(v);
        }
        if let Some(v) = bytes("SPANHEAP_INITIAL_RESERVATION") {
            cfg.initial_reservation = v;
        }
        if let Some(v) = bytes("SPANHEAP_MIN_RESERVATION") {
            cfg.min_reservation = v;
        }
        if let Some(v) = bytes("SPANHEAP_GROWTH_RESERVATION") {
            cfg.growth_reservation = v;
        }
        if let Some(v) = bytes("SPANHEAP_HEAP_CHUNK") {
            cfg.heap_chunk = v;
        }
        if let Some(v) = bytes("SPANHEAP_STRAND_LIMIT") {
            cfg.strand_limit = v;
        }
        if let Some(v) = bytes("SPANHEAP_MIN_PHYS_PAGE") {
            cfg.min_phys_page_size = v;
        }
        if let Some(v) = lookup("SPANHEAP_ADDRESS_HINTS").and_then(|v| parse_bool_loose(&v)) {
            cfg.address_hints = v;
        }
        if let Some(v) = bytes("SPANHEAP_HINT_BASE") {
            cfg.hint_base = v;
        }
        if let Some(v) = bytes("SPANHEAP_HINT_ATTEMPTS") {
            cfg.hint_attempts = v;
        }
        if let Some(v) = lookup("SPANHEAP_LOG_LEVEL") {
            cfg.log_level = HeapLogLevel::from_str_loose(&v);
        }
        if let Some(v) = bytes("SPANHEAP_LOG_CAPACITY") {
            cfg.log_capacity = v;
        }
        cfg
    }

    /// Sets the arena ceiling and reserves all of it up front, shrinking the
    /// fallback floor if it would exceed the new ceiling.
    #[must_use]
    pub fn with_arena_bytes(mut self, bytes: usize) -> Self {
        self.arena_bytes = bytes;
        self.initial_reservation = bytes;
        self.min_reservation = self.min_reservation.min(bytes);
        self
    }

    /// Bytes of span-index metadata covering the whole arena.
    #[must_use]
    pub const fn spans_bytes(&self) -> usize {
        self.arena_bytes / PAGE_SIZE * std::mem::size_of::<usize>()
    }

    /// Bytes of collector bitmap covering the whole arena (2 bits per word).
    #[must_use]
    pub const fn bitmap_bytes(&self) -> usize {
        self.arena_bytes / (std::mem::size_of::<usize>() * 8 / 2)
    }

    /// Checks that the sizes describe a heap that can be laid out.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("arena_bytes", self.arena_bytes),
            ("initial_reservation", self.initial_reservation),
            ("min_reservation", self.min_reservation),
            ("growth_reservation", self.growth_reservation),
            ("heap_chunk", self.heap_chunk),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
            if value % PAGE_SIZE != 0 {
                return Err(ConfigError::NotPageAligned {
                    field,
                    value,
                    align: PAGE_SIZE,
                });
            }
        }
        if !self.min_phys_page_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "min_phys_page_size",
                value: self.min_phys_page_size,
            });
        }
        if self.min_phys_page_size > PAGE_SIZE {
            return Err(ConfigError::Inconsistent {
                detail: format!(
                    "min_phys_page_size {} exceeds the {PAGE_SIZE}-byte heap page",
                    self.min_phys_page_size
                ),
            });
        }
        if self.arena_bytes / PAGE_SIZE >= u32::MAX as usize {
            return Err(ConfigError::ArenaTooLarge {
                bytes: self.arena_bytes,
            });
        }
        if self.min_reservation > self.initial_reservation
            || self.initial_reservation > self.arena_bytes
        {
            return Err(ConfigError::Inconsistent {
                detail: format!(
                    "need min_reservation {} <= initial_reservation {} <= arena_bytes {}",
                    self.min_reservation, self.initial_reservation, self.arena_bytes
                ),
            });
        }
        Ok(())
    }
}

static GLOBAL_CONFIG: OnceLock<HeapConfig> = OnceLock::new();

/// Process-wide configuration read from the environment on first use.
#[must_use]
pub fn global() -> &'static HeapConfig {
    GLOBAL_CONFIG.get_or_init(HeapConfig::from_env)
}

/// Parses `4096`, `0x1000`, `64k`, `64KiB`, `16m`, `1g`, `2t`.
#[must_use]
pub fn parse_bytes_loose(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase().replace('_', "");
    if let Some(hex) = s.strip_prefix("0x") {
        return usize::from_str_radix(hex, 16).ok();
    }
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(digits_end);
    let base: usize = digits.parse().ok()?;
    let scale = match suffix.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => GIB << 10,
        _ => return None,
    };
    base.checked_mul(scale)
}

/// Parses the usual spellings of a boolean switch.
#[must_use]
pub fn parse_bool_loose(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let cfg = HeapConfig::default();
        assert_eq!(cfg.strand_limit, 16 * MIB);
        assert_eq!(cfg.hint_base, 0x00c0_0000_0000);
        assert_eq!(cfg.initial_reservation, cfg.arena_bytes);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn parse_sizes_loosely() {
        assert_eq!(parse_bytes_loose("4096"), Some(4096));
        assert_eq!(parse_bytes_loose("0x1000"), Some(4096));
        assert_eq!(parse_bytes_loose("64k"), Some(64 * KIB));
        assert_eq!(parse_bytes_loose(" 64MiB "), Some(64 * MIB));
        assert_eq!(parse_bytes_loose("1G"), Some(GIB));
        assert_eq!(parse_bytes_loose("1_048_576"), Some(MIB));
        assert_eq!(parse_bytes_loose("lots"), None);
        assert_eq!(parse_bytes_loose("12q"), None);
        assert_eq!(parse_bytes_loose(""), None);
    }

    #[test]
    fn lookup_overrides_and_falls_back() {
        let cfg = HeapConfig::from_lookup(lookup_from(&[
            ("SPANHEAP_ARENA_BYTES", "1g"),
            ("SPANHEAP_STRAND_LIMIT", "garbage"),
            ("SPANHEAP_ADDRESS_HINTS", "off"),
            ("SPANHEAP_LOG_LEVEL", "TRACE"),
        ]));
        assert_eq!(cfg.arena_bytes, GIB);
        assert_eq!(cfg.initial_reservation, GIB);
        assert_eq!(cfg.strand_limit, 16 * MIB);
        assert!(!cfg.address_hints);
        assert_eq!(cfg.log_level, HeapLogLevel::Trace);
        cfg.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_bad_combinations() {
        let cfg = HeapConfig {
            heap_chunk: 1000,
            ..HeapConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NotPageAligned { field: "heap_chunk", .. })
        ));

        let cfg = HeapConfig {
            min_phys_page_size: 3000,
            ..HeapConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NotPowerOfTwo { .. })));

        let cfg = HeapConfig {
            initial_reservation: 128 * GIB,
            ..HeapConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Inconsistent { .. })));
    }

    #[test]
    fn metadata_sizes_scale_with_arena() {
        let cfg = HeapConfig::default().with_arena_bytes(GIB);
        assert_eq!(cfg.spans_bytes(), GIB / PAGE_SIZE * 8);
        assert_eq!(cfg.bitmap_bytes(), GIB / 32);
        assert_eq!(cfg.min_reservation, 64 * MIB);
        let tiny = HeapConfig::default().with_arena_bytes(16 * MIB);
        assert_eq!(tiny.min_reservation, 16 * MIB);
    }
}
