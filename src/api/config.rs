//! Allocator configuration.
//!
//! Built programmatically in the builder style, or parsed from a
//! `name:value,name:value` option string (`SHARDALLOC_CONF` in the
//! environment). Parse errors are accumulated so every problem in the
//! string gets reported; with `abort_conf` the process aborts after the
//! whole string has been examined.

use std::fmt;

use crate::core::classes::{SlabSizeRule, PAGE};
use crate::util::size::mb;

/// Per-CPU arena binding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercpuArena {
    Disabled,
    /// One arena per logical CPU.
    Percpu,
    /// One arena per physical core (hyperthread pairs share).
    Phycpu,
}

/// Extent source preference. Only `Disabled` is operative; the sbrk
/// source of the original design has no portable Rust equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dss {
    Disabled,
    Primary,
    Secondary,
}

/// Debug fill of allocated/freed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunkMode {
    Off,
    /// Fill on both paths.
    On,
    /// Fill fresh allocations only.
    Alloc,
    /// Fill freed regions only.
    Free,
}

impl JunkMode {
    #[inline]
    pub fn on_alloc(self) -> bool {
        matches!(self, JunkMode::On | JunkMode::Alloc)
    }

    #[inline]
    pub fn on_free(self) -> bool {
        matches!(self, JunkMode::On | JunkMode::Free)
    }
}

/// Behavior of `realloc(p, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroRealloc {
    /// Free the pointer and return null.
    Free,
    /// Return a minimal allocation.
    Alloc,
}

/// A rule overriding the shard count for a range of class sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinShardRule {
    pub start: usize,
    pub end: usize,
    pub shards: usize,
}

/// Largest permitted shard count per bin.
pub const MAX_BIN_SHARDS: usize = 256;

/// Configuration for one allocator instance.
#[derive(Debug, Clone)]
pub struct AllocConfig {
    /// Abort on fatal runtime errors instead of unwinding.
    pub abort: bool,
    /// Abort after config parsing when the option string had errors.
    pub abort_conf: bool,
    /// Number of auto-arenas; 0 means `4 x ncpus`.
    pub narenas: usize,
    pub percpu_arena: PercpuArena,
    /// Dirty page decay half-life in ms; 0 purges eagerly, -1 disables.
    pub dirty_decay_ms: i64,
    /// Muzzy page decay half-life in ms; 0 purges eagerly, -1 disables.
    pub muzzy_decay_ms: i64,
    /// Enable per-thread caches.
    pub tcache: bool,
    /// log2 of the largest tcached size.
    pub lg_tcache_max: usize,
    /// Requests above this route to the dedicated huge arena.
    pub oversize_threshold: usize,
    /// Keep address space in the retained cache instead of unmapping.
    pub retain: bool,
    pub dss: Dss,
    pub junk: JunkMode,
    /// Zero all returned memory.
    pub zero: bool,
    /// Abort instead of returning null on OOM.
    pub xmalloc: bool,
    pub zero_realloc: ZeroRealloc,
    /// Cap, in bytes, on the retained cache and the growth step.
    pub retain_grow_limit: usize,
    pub slab_sizes: Vec<SlabSizeRule>,
    pub bin_shards: Vec<BinShardRule>,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            abort: false,
            abort_conf: false,
            narenas: 0,
            percpu_arena: PercpuArena::Disabled,
            dirty_decay_ms: 10_000,
            muzzy_decay_ms: 0,
            tcache: true,
            lg_tcache_max: 15,
            oversize_threshold: mb(8),
            retain: true,
            dss: Dss::Disabled,
            junk: JunkMode::Off,
            zero: false,
            xmalloc: false,
            zero_realloc: ZeroRealloc::Free,
            retain_grow_limit: mb(1024),
            slab_sizes: Vec::new(),
            bin_shards: Vec::new(),
        }
    }
}

/// One rejected option.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "option '{}:{}': {}", self.key, self.value, self.reason)
    }
}

/// All rejected options from one parse.
#[derive(Debug, Clone)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl AllocConfig {
    /// Parse an option string, applying every valid option. Errors are
    /// accumulated and reported together; `abort_conf` aborts the
    /// process once the whole string has been parsed.
    pub fn parse(input: &str) -> Result<Self, ConfigErrors> {
        let (cfg, errors) = Self::parse_lenient(input);
        if errors.0.is_empty() {
            Ok(cfg)
        } else {
            Err(errors)
        }
    }

    /// Parse, keeping the valid options when some are rejected. The
    /// environment path uses this so one typo does not discard the rest
    /// of the string.
    pub fn parse_lenient(input: &str) -> (Self, ConfigErrors) {
        let mut cfg = Self::default();
        let mut errors = Vec::new();

        for pair in input.split(',') {
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once(':') else {
                errors.push(ConfigError {
                    key: pair.to_string(),
                    value: String::new(),
                    reason: "expected name:value",
                });
                continue;
            };
            if let Err(reason) = cfg.apply(key, value) {
                errors.push(ConfigError {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason,
                });
            }
        }

        for err in &errors {
            log::warn!("config: {}", err);
        }
        if cfg.abort_conf && !errors.is_empty() {
            std::process::abort();
        }
        (cfg, ConfigErrors(errors))
    }

    /// Parse `SHARDALLOC_CONF` from the environment, leniently.
    pub fn from_env() -> Self {
        match std::env::var("SHARDALLOC_CONF") {
            Ok(s) => Self::parse_lenient(&s).0,
            Err(_) => Self::default(),
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), &'static str> {
        match key {
            "abort" => self.abort = parse_bool(value)?,
            "abort_conf" => self.abort_conf = parse_bool(value)?,
            "narenas" => self.narenas = parse_num(value)?,
            "percpu_arena" => {
                self.percpu_arena = match value {
                    "disabled" => PercpuArena::Disabled,
                    "percpu" => PercpuArena::Percpu,
                    "phycpu" => PercpuArena::Phycpu,
                    _ => return Err("expected disabled/percpu/phycpu"),
                }
            }
            "dirty_decay_ms" => self.dirty_decay_ms = parse_ms(value)?,
            "muzzy_decay_ms" => self.muzzy_decay_ms = parse_ms(value)?,
            "tcache" => self.tcache = parse_bool(value)?,
            "lg_tcache_max" => {
                let lg: usize = parse_num(value)?;
                if lg >= usize::BITS as usize - 1 {
                    return Err("shift out of range");
                }
                self.lg_tcache_max = lg;
            }
            "oversize_threshold" => self.oversize_threshold = parse_num(value)?,
            "retain" => self.retain = parse_bool(value)?,
            "dss" => {
                self.dss = match value {
                    "disabled" => Dss::Disabled,
                    "primary" => Dss::Primary,
                    "secondary" => Dss::Secondary,
                    _ => return Err("expected disabled/primary/secondary"),
                };
                if self.dss != Dss::Disabled {
                    // Recognized for compatibility; there is no sbrk
                    // extent source here.
                    log::warn!("config: dss:{} has no effect", value);
                }
            }
            "junk" => {
                self.junk = match value {
                    "true" => JunkMode::On,
                    "false" => JunkMode::Off,
                    "alloc" => JunkMode::Alloc,
                    "free" => JunkMode::Free,
                    _ => return Err("expected true/false/alloc/free"),
                }
            }
            "zero" => self.zero = parse_bool(value)?,
            "xmalloc" => self.xmalloc = parse_bool(value)?,
            "zero_realloc" => {
                self.zero_realloc = match value {
                    "free" => ZeroRealloc::Free,
                    "alloc" => ZeroRealloc::Alloc,
                    _ => return Err("expected free/alloc"),
                }
            }
            "retain_grow_limit" => {
                let bytes: usize = parse_num(value)?;
                if bytes < PAGE {
                    return Err("below page size");
                }
                self.retain_grow_limit = bytes;
            }
            "slab_sizes" => {
                for (start, end, pages) in parse_tuples(value)? {
                    let rule = SlabSizeRule { start, end, pages };
                    if !rule.is_valid() {
                        return Err("slab geometry out of range");
                    }
                    self.slab_sizes.push(rule);
                }
            }
            "bin_shards" => {
                for (start, end, shards) in parse_tuples(value)? {
                    if shards == 0 || shards > MAX_BIN_SHARDS || start == 0 || start > end {
                        return Err("shard count out of range");
                    }
                    self.bin_shards.push(BinShardRule { start, end, shards });
                }
            }
            _ => return Err("unknown option"),
        }
        Ok(())
    }

    /// Shard count serving a class of `size` bytes.
    pub fn shards_for(&self, size: usize) -> usize {
        let mut shards = 1;
        for rule in &self.bin_shards {
            if rule.start <= size && size <= rule.end {
                shards = rule.shards;
            }
        }
        shards
    }

    /// Number of auto-arenas after applying the `4 x ncpus` default.
    pub fn narenas_effective(&self) -> usize {
        if self.narenas > 0 {
            return self.narenas;
        }
        let ncpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        4 * ncpus
    }

    /// Largest tcached size in bytes.
    pub fn tcache_maxclass(&self) -> usize {
        1 << self.lg_tcache_max
    }

    // Builder-style setters.

    pub fn with_narenas(mut self, narenas: usize) -> Self {
        self.narenas = narenas;
        self
    }

    pub fn with_tcache(mut self, enabled: bool) -> Self {
        self.tcache = enabled;
        self
    }

    pub fn with_decay_ms(mut self, dirty: i64, muzzy: i64) -> Self {
        self.dirty_decay_ms = dirty;
        self.muzzy_decay_ms = muzzy;
        self
    }

    pub fn with_junk(mut self, junk: JunkMode) -> Self {
        self.junk = junk;
        self
    }

    pub fn with_zero(mut self, zero: bool) -> Self {
        self.zero = zero;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_oversize_threshold(mut self, bytes: usize) -> Self {
        self.oversize_threshold = bytes;
        self
    }

    pub fn with_zero_realloc(mut self, policy: ZeroRealloc) -> Self {
        self.zero_realloc = policy;
        self
    }

    pub fn with_percpu_arena(mut self, policy: PercpuArena) -> Self {
        self.percpu_arena = policy;
        self
    }
}

fn parse_bool(value: &str) -> Result<bool, &'static str> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("expected true/false"),
    }
}

fn parse_num(value: &str) -> Result<usize, &'static str> {
    value.parse().map_err(|_| "expected a number")
}

fn parse_ms(value: &str) -> Result<i64, &'static str> {
    match value.parse::<i64>() {
        Ok(ms) if ms >= -1 => Ok(ms),
        _ => Err("expected -1 or a non-negative ms count"),
    }
}

/// Parse `start-end:n` tuples separated by `|` (the option separator is
/// the comma, so tuples use the pipe).
fn parse_tuples(value: &str) -> Result<Vec<(usize, usize, usize)>, &'static str> {
    let mut out = Vec::new();
    for tuple in value.split('|') {
        let (range, n) = tuple.split_once(':').ok_or("expected start-end:n")?;
        let (start, end) = range.split_once('-').ok_or("expected start-end:n")?;
        out.push((
            start.parse().map_err(|_| "expected a number")?,
            end.parse().map_err(|_| "expected a number")?,
            n.parse().map_err(|_| "expected a number")?,
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AllocConfig::default();
        assert!(cfg.tcache);
        assert_eq!(cfg.dirty_decay_ms, 10_000);
        assert!(cfg.narenas_effective() >= 4);
        assert_eq!(cfg.shards_for(64), 1);
    }

    #[test]
    fn test_parse_basics() {
        let cfg = AllocConfig::parse(
            "narenas:2,tcache:false,dirty_decay_ms:0,muzzy_decay_ms:-1,junk:alloc,xmalloc:true",
        )
        .unwrap();
        assert_eq!(cfg.narenas, 2);
        assert!(!cfg.tcache);
        assert_eq!(cfg.dirty_decay_ms, 0);
        assert_eq!(cfg.muzzy_decay_ms, -1);
        assert_eq!(cfg.junk, JunkMode::Alloc);
        assert!(cfg.xmalloc);
    }

    #[test]
    fn test_parse_accumulates_errors() {
        let err = AllocConfig::parse("bogus:1,narenas:x,tcache:true").unwrap_err();
        assert_eq!(err.0.len(), 2);
        // The valid option still applied.
        let (cfg, _) = AllocConfig::parse_lenient("bogus:1,narenas:3");
        assert_eq!(cfg.narenas, 3);
    }

    #[test]
    fn test_parse_tuple_options() {
        let cfg =
            AllocConfig::parse("slab_sizes:1-4096:1|8192-8192:4,bin_shards:1-160:8").unwrap();
        assert_eq!(cfg.slab_sizes.len(), 2);
        assert_eq!(cfg.slab_sizes[1].pages, 4);
        assert_eq!(cfg.shards_for(96), 8);
        assert_eq!(cfg.shards_for(320), 1);
    }

    #[test]
    fn test_parse_rejects_bad_slab_geometry() {
        // One page cannot hold an 8192-byte region.
        assert!(AllocConfig::parse("slab_sizes:8192-8192:1").is_err());
    }

    #[test]
    fn test_parse_decay_range() {
        assert!(AllocConfig::parse("dirty_decay_ms:-2").is_err());
        assert!(AllocConfig::parse("dirty_decay_ms:-1").is_ok());
    }

    #[test]
    fn test_percpu_values() {
        let cfg = AllocConfig::parse("percpu_arena:phycpu").unwrap();
        assert_eq!(cfg.percpu_arena, PercpuArena::Phycpu);
        assert!(AllocConfig::parse("percpu_arena:sometimes").is_err());
    }
}
