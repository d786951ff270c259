//! Collector configuration.
//!
//! Two environment variables drive tuning, mirroring how embedders ship the
//! collector without recompiling:
//!
//! - `GENGC_PARAMS`: comma-separated `key=value` tuning options
//! - `GENGC_DEBUG`: comma-separated debug/verification flags
//!
//! Programmatic construction through [`GcConfig`] plus [`GcConfig::validate`]
//! is the path tests and embedders with their own option plumbing take.

use crate::error::{GcError, Result};

/// Default nursery size (4 MiB). Must be a power of two.
pub const DEFAULT_NURSERY_SIZE: usize = 4 * 1024 * 1024;

/// Granularity of the nursery scan-start table.
pub const SCAN_START_SIZE: usize = 4096;

/// Objects larger than this are routed to the large-object store.
pub const MAX_SMALL_OBJ_SIZE: usize = 8000;

/// Minimum object alignment. Forwarding words rely on the low bits being
/// free, so this may never drop below 8.
pub const ALLOC_ALIGN: usize = 8;

/// Card granularity for the card-table write barrier (512-byte cards).
pub const CARD_BITS: usize = 9;

/// Default per-thread allocation buffer size.
pub const DEFAULT_TLAB_SIZE: usize = 32 * 1024;

/// Smallest nursery gap worth handing back to the allocator as a fragment.
pub const FRAGMENT_MIN_SIZE: usize = 256;

/// Hard cap on parallel marking workers.
pub const MAX_WORKERS: usize = 16;

/// Old-generation backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorKind {
    /// Block-structured mark-sweep. `fixed` caps the heap at its initial
    /// block count; `parallel` enables concurrent marking into it.
    MarkSweep { fixed: bool, parallel: bool },
    /// Section-based copying old space.
    Copying,
}

impl MajorKind {
    pub fn is_parallel(self) -> bool {
        matches!(self, MajorKind::MarkSweep { parallel: true, .. })
    }
}

/// Write-barrier style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBarrierKind {
    /// Per-thread sequential store buffers with a global overflow list.
    Remset,
    /// Byte-per-card dirty table over the old generation.
    CardTable,
}

/// How mutator stacks are scanned during the pinning phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMark {
    /// Every word in the stack range is treated as a potential pointer.
    Conservative,
    /// Threads supply a marker callback enumerating exact reference slots.
    /// Threads registered without one fall back to conservative scanning.
    Precise,
}

/// Debug and verification flags (`GENGC_DEBUG`).
#[derive(Debug, Clone, Default)]
pub struct DebugFlags {
    /// Force a minor collection every N allocations.
    pub collect_before_allocs: Option<u64>,
    /// Run the heap consistency checker before and after minor collections.
    pub check_at_minor_collections: bool,
    /// Zero memory as soon as it is reclaimed, not lazily.
    pub clear_at_gc: bool,
    /// Parsed for compatibility; requires domain callbacks this crate does
    /// not consume, so enabling it only logs a warning.
    pub xdomain_checks: bool,
    /// Walk the nursery object-by-object before each minor collection.
    pub verify_nursery: bool,
    /// Log every nursery object before each minor collection.
    pub dump_nursery: bool,
    pub disable_minor: bool,
    pub disable_major: bool,
    /// Write a textual heap dump after every collection.
    pub heap_dump: Option<String>,
    /// Log the minor-collection allowance after each major collection.
    pub print_allowance: bool,
    /// Log per-collection pinning statistics.
    pub print_pinning: bool,
}

/// Main configuration for the collector.
///
/// # Examples
///
/// ```
/// use gengc::GcConfig;
///
/// let config = GcConfig {
///     nursery_size: 1 << 22,
///     workers: 1,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Nursery size in bytes. Power of two.
    pub nursery_size: usize,

    /// Hard upper bound for the old generation reservation.
    pub max_heap_size: usize,

    /// Soft target the allowance computation steers the heap towards.
    pub soft_heap_limit: usize,

    /// Old-generation backend.
    pub major: MajorKind,

    /// Write-barrier style.
    pub wbarrier: WriteBarrierKind,

    /// Stack scanning mode.
    pub stack_mark: StackMark,

    /// Parallel marking worker count, `1..=16`. `1` disables the pool.
    pub workers: usize,

    /// Per-thread allocation buffer size.
    pub tlab_size: usize,

    /// Debug flags.
    pub debug: DebugFlags,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            nursery_size: DEFAULT_NURSERY_SIZE,
            max_heap_size: 512 * 1024 * 1024,
            soft_heap_limit: 512 * 1024 * 1024,
            major: MajorKind::MarkSweep {
                fixed: false,
                parallel: false,
            },
            wbarrier: WriteBarrierKind::Remset,
            stack_mark: StackMark::Conservative,
            workers: num_cpus::get().min(MAX_WORKERS),
            tlab_size: DEFAULT_TLAB_SIZE,
            debug: DebugFlags::default(),
        }
    }
}

impl GcConfig {
    /// Check that all values are in valid ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.nursery_size.is_power_of_two() {
            return Err(GcError::Configuration(format!(
                "nursery-size ({}) must be a power of two",
                self.nursery_size
            )));
        }
        if self.nursery_size < 16 * SCAN_START_SIZE {
            return Err(GcError::Configuration(format!(
                "nursery-size ({}) is below the minimum of {}",
                self.nursery_size,
                16 * SCAN_START_SIZE
            )));
        }
        if self.max_heap_size < 4 * self.nursery_size {
            return Err(GcError::Configuration(
                "max-heap-size must be at least 4 times larger than nursery size".into(),
            ));
        }
        if self.max_heap_size % page_size() != 0 {
            return Err(GcError::Configuration(format!(
                "max-heap-size must be a multiple of the page size ({})",
                page_size()
            )));
        }
        if self.soft_heap_limit > self.max_heap_size {
            return Err(GcError::Configuration(
                "max-heap-size must be at least as large as soft-heap-limit".into(),
            ));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(GcError::Configuration(format!(
                "workers must be between 1 and {}",
                MAX_WORKERS
            )));
        }
        if self.tlab_size < 2 * ALLOC_ALIGN || self.tlab_size > self.nursery_size / 4 {
            return Err(GcError::Configuration(format!(
                "tlab size ({}) out of range",
                self.tlab_size
            )));
        }
        Ok(())
    }

    /// Build a configuration from `GENGC_PARAMS` and `GENGC_DEBUG`.
    ///
    /// A malformed option prints the usage text to stderr and terminates the
    /// process: the collector cannot start in a half-configured state.
    pub fn from_env() -> Self {
        let mut config = GcConfig::default();
        if let Ok(params) = std::env::var("GENGC_PARAMS") {
            if let Err(err) = config.apply_params(&params) {
                eprintln!("{}", err);
                print_params_usage();
                std::process::exit(1);
            }
        }
        if let Ok(flags) = std::env::var("GENGC_DEBUG") {
            if let Err(err) = config.apply_debug_flags(&flags) {
                eprintln!("{}", err);
                print_debug_usage();
                std::process::exit(1);
            }
        }
        if let Err(err) = config.validate() {
            eprintln!("{}", err);
            print_params_usage();
            std::process::exit(1);
        }
        config
    }

    /// Apply a comma-separated `key=value` option list.
    pub fn apply_params(&mut self, params: &str) -> Result<()> {
        for opt in params.split(',').filter(|o| !o.is_empty()) {
            if let Some(value) = opt.strip_prefix("major=") {
                self.major = match value {
                    "marksweep" => MajorKind::MarkSweep {
                        fixed: false,
                        parallel: false,
                    },
                    "marksweep-par" => MajorKind::MarkSweep {
                        fixed: false,
                        parallel: true,
                    },
                    "marksweep-fixed" => MajorKind::MarkSweep {
                        fixed: true,
                        parallel: false,
                    },
                    "marksweep-fixed-par" => MajorKind::MarkSweep {
                        fixed: true,
                        parallel: true,
                    },
                    "copying" => MajorKind::Copying,
                    other => {
                        return Err(GcError::Configuration(format!(
                            "unknown major collector `{}`",
                            other
                        )))
                    }
                };
            } else if let Some(value) = opt.strip_prefix("wbarrier=") {
                self.wbarrier = match value {
                    "remset" => WriteBarrierKind::Remset,
                    "cardtable" => WriteBarrierKind::CardTable,
                    other => {
                        return Err(GcError::Configuration(format!(
                            "unknown write barrier `{}`",
                            other
                        )))
                    }
                };
            } else if let Some(value) = opt.strip_prefix("max-heap-size=") {
                self.max_heap_size = parse_byte_size(value)?;
            } else if let Some(value) = opt.strip_prefix("soft-heap-limit=") {
                self.soft_heap_limit = parse_byte_size(value)?;
            } else if let Some(value) = opt.strip_prefix("nursery-size=") {
                self.nursery_size = parse_byte_size(value)?;
            } else if let Some(value) = opt.strip_prefix("stack-mark=") {
                self.stack_mark = match value {
                    "precise" => StackMark::Precise,
                    "conservative" => StackMark::Conservative,
                    other => {
                        return Err(GcError::Configuration(format!(
                            "invalid value `{}` for stack-mark",
                            other
                        )))
                    }
                };
            } else if let Some(value) = opt.strip_prefix("workers=") {
                self.workers = value.parse::<usize>().map_err(|_| {
                    GcError::Configuration("workers must be an integer".into())
                })?;
            } else {
                return Err(GcError::Configuration(format!(
                    "unknown option `{}`",
                    opt
                )));
            }
        }
        Ok(())
    }

    /// Apply a comma-separated debug flag list.
    pub fn apply_debug_flags(&mut self, flags: &str) -> Result<()> {
        for opt in flags.split(',').filter(|o| !o.is_empty()) {
            match opt {
                "collect-before-allocs" => {
                    self.debug.collect_before_allocs = Some(1);
                }
                "check-at-minor-collections" => self.debug.check_at_minor_collections = true,
                "clear-at-gc" => self.debug.clear_at_gc = true,
                "xdomain-checks" => self.debug.xdomain_checks = true,
                "verify-nursery-at-minor-gc" => self.debug.verify_nursery = true,
                "dump-nursery-at-minor-gc" => self.debug.dump_nursery = true,
                "disable-minor" => self.debug.disable_minor = true,
                "disable-major" => self.debug.disable_major = true,
                "print-allowance" => self.debug.print_allowance = true,
                "print-pinning" => self.debug.print_pinning = true,
                other => {
                    if let Some(value) = other.strip_prefix("collect-before-allocs=") {
                        let n = value.parse::<u64>().map_err(|_| {
                            GcError::Configuration(
                                "collect-before-allocs expects an integer".into(),
                            )
                        })?;
                        self.debug.collect_before_allocs = Some(n.max(1));
                    } else if let Some(path) = other.strip_prefix("heap-dump=") {
                        self.debug.heap_dump = Some(path.to_string());
                    } else {
                        return Err(GcError::Configuration(format!(
                            "unknown debug flag `{}`",
                            other
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse `N`, `Nk`, `Nm` or `Ng` into a byte count.
fn parse_byte_size(value: &str) -> Result<usize> {
    let (digits, factor) = match value.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 1024),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let n = digits
        .parse::<usize>()
        .map_err(|_| GcError::Configuration(format!("`{}` is not a byte size", value)))?;
    n.checked_mul(factor)
        .ok_or_else(|| GcError::Configuration(format!("`{}` overflows", value)))
}

/// OS page size.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn print_params_usage() {
    eprintln!("GENGC_PARAMS must be a comma-delimited list of one or more of the following:");
    eprintln!("  max-heap-size=N (where N is an integer, possibly with a k, m or a g suffix)");
    eprintln!("  soft-heap-limit=N (where N is an integer, possibly with a k, m or a g suffix)");
    eprintln!("  nursery-size=N (where N is an integer, possibly with a k, m or a g suffix)");
    eprintln!("  major=COLLECTOR (marksweep, marksweep-par, marksweep-fixed, marksweep-fixed-par or copying)");
    eprintln!("  wbarrier=WBARRIER (remset or cardtable)");
    eprintln!("  stack-mark=MARK-METHOD (precise or conservative)");
    eprintln!("  workers=N (1..16)");
}

fn print_debug_usage() {
    eprintln!("GENGC_DEBUG must be a comma-delimited list of one or more of the following:");
    eprintln!("  collect-before-allocs[=N]");
    eprintln!("  check-at-minor-collections");
    eprintln!("  clear-at-gc");
    eprintln!("  xdomain-checks");
    eprintln!("  verify-nursery-at-minor-gc");
    eprintln!("  dump-nursery-at-minor-gc");
    eprintln!("  disable-minor");
    eprintln!("  disable-major");
    eprintln!("  heap-dump=FILE");
    eprintln!("  print-allowance");
    eprintln!("  print-pinning");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_byte_size_suffixes() {
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("16k").unwrap(), 16 * 1024);
        assert_eq!(parse_byte_size("4m").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_byte_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_byte_size("lots").is_err());
    }

    #[test]
    fn test_apply_params() {
        let mut config = GcConfig::default();
        config
            .apply_params("major=marksweep-par,wbarrier=cardtable,nursery-size=8m,workers=4")
            .unwrap();
        assert_eq!(
            config.major,
            MajorKind::MarkSweep {
                fixed: false,
                parallel: true
            }
        );
        assert_eq!(config.wbarrier, WriteBarrierKind::CardTable);
        assert_eq!(config.nursery_size, 8 * 1024 * 1024);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_reject_unknown_option() {
        let mut config = GcConfig::default();
        assert!(config.apply_params("frobnicate=yes").is_err());
    }

    #[test]
    fn test_nursery_must_be_power_of_two() {
        let config = GcConfig {
            nursery_size: 3 * 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_flags() {
        let mut config = GcConfig::default();
        config
            .apply_debug_flags("collect-before-allocs=7,print-pinning,heap-dump=/tmp/h.dump")
            .unwrap();
        assert_eq!(config.debug.collect_before_allocs, Some(7));
        assert!(config.debug.print_pinning);
        assert_eq!(config.debug.heap_dump.as_deref(), Some("/tmp/h.dump"));
    }
}
