//! Runtime-tunable constants, settable via `MPGC_`-prefixed environment
//! variables. Grounded in `util/options.rs`'s `MMTKOption<T>`: a validated,
//! defaulted value that can be overridden by an env var, falling back to its
//! default (with a `warn!`) rather than panicking on a bad value, since a
//! misconfigured tunable is not an "unrecoverable environment" error.

use std::fmt::Debug;
use std::str::FromStr;

/// A single tunable: its current value plus the validator that guards any
/// attempt to change it.
#[derive(Clone)]
pub struct MpgcOption<T: Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
}

impl<T: Debug + Clone + FromStr> MpgcOption<T> {
    fn new(value: T, validator: fn(&T) -> bool) -> Self {
        debug_assert!(validator(&value), "default value fails its own validator");
        MpgcOption { value, validator }
    }

    pub fn get(&self) -> T {
        self.value.clone()
    }

    /// Overwrites the value if it passes the validator. Returns whether it
    /// was accepted.
    fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            true
        } else {
            false
        }
    }

    /// Looks up `env_var`, and if present and parseable and valid, applies
    /// it; otherwise keeps the built-in default and warns (unless the var
    /// is simply absent).
    fn apply_env_var(&mut self, env_var: &str) {
        let Ok(raw) = std::env::var(env_var) else {
            return;
        };
        match raw.parse::<T>() {
            Ok(parsed) => {
                if !self.set(parsed) {
                    log::warn!(
                        "{env_var}={raw:?} failed validation; keeping default {:?}",
                        self.value
                    );
                }
            }
            Err(_) => {
                log::warn!("{env_var}={raw:?} could not be parsed; keeping default {:?}", self.value);
            }
        }
    }
}

fn is_positive(v: &u64) -> bool {
    *v > 0
}

fn is_power_of_two(v: &u64) -> bool {
    *v > 0 && (*v & (*v - 1)) == 0
}

/// Collector-wide tunables. One process-global `Options` is built once, at
/// attach time, from built-in defaults overlaid with environment variables;
/// see `Options::from_env`.
#[derive(Clone)]
pub struct Options {
    /// §4.1: interval of non-progress after which the driver consults the OS
    /// about a stalled process's liveness. Default 2000ms, from
    /// `MPGC_LIVENESS_TIMEOUT_MS`.
    pub liveness_timeout_ms: MpgcOption<u64>,
    /// §4.1: bounded number of steal attempts a marking worker makes against
    /// peers before reporting its queue empty for barrier purposes. Default
    /// 8, from `MPGC_STEAL_ATTEMPTS`.
    pub steal_attempts: MpgcOption<u64>,
    /// §4.2/GLOSSARY "logical chunk": mark-bitmap words per sweep claim unit.
    /// Default 1024 (the original's `chunk_size_log_bits = 10`), from
    /// `MPGC_LOGICAL_CHUNK_WORDS`. Must be a power of two.
    pub logical_chunk_words: MpgcOption<u64>,
    /// §4.3: entries in the process-wide weak-reference cache. Default
    /// `1 << 20`, from `MPGC_GLOBAL_CACHE_SIZE`. Must be a power of two
    /// (used as an index mask).
    pub global_cache_size: MpgcOption<u64>,
    /// §4.3: entries in each thread's local weak-reference cache. Default
    /// `1 << 12`, from `MPGC_LOCAL_CACHE_SIZE`. Must be a power of two.
    pub local_cache_size: MpgcOption<u64>,
    /// §4.3 spine: slots per external-reference-table block. Default 10000,
    /// from `MPGC_XRT_BLOCK_SIZE`.
    pub xrt_block_size: MpgcOption<u64>,
    /// §4.3 spine: maximum number of blocks the table's spine can grow to.
    /// Default 100000, from `MPGC_XRT_N_BLOCKS`.
    pub xrt_n_blocks: MpgcOption<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            liveness_timeout_ms: MpgcOption::new(2000, is_positive),
            steal_attempts: MpgcOption::new(8, is_positive),
            logical_chunk_words: MpgcOption::new(1024, is_power_of_two),
            global_cache_size: MpgcOption::new(1 << 20, is_power_of_two),
            local_cache_size: MpgcOption::new(1 << 12, is_power_of_two),
            xrt_block_size: MpgcOption::new(10_000, is_positive),
            xrt_n_blocks: MpgcOption::new(100_000, is_positive),
        }
    }
}

impl Options {
    /// Built-in defaults overlaid with any recognized `MPGC_*` environment
    /// variables, mirroring `Options::read_env_var_settings`'s "if set and
    /// valid, override; otherwise keep default" behavior.
    pub fn from_env() -> Self {
        let mut opts = Options::default();
        opts.liveness_timeout_ms.apply_env_var("MPGC_LIVENESS_TIMEOUT_MS");
        opts.steal_attempts.apply_env_var("MPGC_STEAL_ATTEMPTS");
        opts.logical_chunk_words.apply_env_var("MPGC_LOGICAL_CHUNK_WORDS");
        opts.global_cache_size.apply_env_var("MPGC_GLOBAL_CACHE_SIZE");
        opts.local_cache_size.apply_env_var("MPGC_LOCAL_CACHE_SIZE");
        opts.xrt_block_size.apply_env_var("MPGC_XRT_BLOCK_SIZE");
        opts.xrt_n_blocks.apply_env_var("MPGC_XRT_N_BLOCKS");
        opts
    }
}

/// Resolves `MPGC_HEAPS_DIR` (default `heaps`).
pub fn heaps_dir() -> std::path::PathBuf {
    std::env::var("MPGC_HEAPS_DIR")
        .unwrap_or_else(|_| "heaps".to_string())
        .into()
}

/// Resolves a heap file path: the override env var if set, else
/// `<heaps_dir>/<default_name>`.
pub fn heap_file(env_var: &str, default_name: &str) -> std::path::PathBuf {
    match std::env::var(env_var) {
        Ok(path) => path.into(),
        Err(_) => heaps_dir().join(default_name),
    }
}

/// `MPGC_GC_HEAP`, defaulting to `<heaps_dir>/gc_heap`.
pub fn gc_heap_file() -> std::path::PathBuf {
    heap_file("MPGC_GC_HEAP", "gc_heap")
}

/// `MPGC_CONTROL_HEAP`, defaulting to `<heaps_dir>/managed_heap`.
pub fn control_heap_file() -> std::path::PathBuf {
    heap_file("MPGC_CONTROL_HEAP", "managed_heap")
}
