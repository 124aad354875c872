//! Per-process liveness record (§3 `liveness`, §4.1 "Liveness detection").
//!
//! Grounded in `original_source/include/mpgc/gc_thread.h`'s
//! `per_process_struct::liveness`, an `alignas(16)` struct of
//! `{creation_time, pid, Alive}` updated by a double-word compare-and-swap.
//! Rust has no native 128-bit-wide atomic, so — exactly as
//! `ruts::default_atomic<T>` reinterprets a same-width shadow integer to get
//! an atomic of arbitrary size — we store `Liveness` in the `atomic` crate's
//! `Atomic<T>`, which is already part of the teacher's dependency stack and
//! falls back to a spinlock for widths the platform has no native CAS for.

use bytemuck::NoUninit;

use crate::config;

/// Whether the owning process is still considered live.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, NoUninit)]
pub enum Alive {
    Live = 0,
    Dead = 1,
}

/// A 16-byte, CAS-able liveness record (§3, §5 "Death takeover is arbitrated
/// by 16-byte CAS on `liveness`"). `NoUninit` so it can live in `atomic::Atomic`
/// (§"atomic 0.6 bounds `load`/`store`/`compare_exchange` on `T: NoUninit`).
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Debug, NoUninit)]
pub struct Liveness {
    pub creation_time: u64,
    pub pid: u32,
    pub alive: Alive,
}

static_assertions::assert_eq_size!(Liveness, u128);

impl Liveness {
    /// Builds the liveness record for the calling process, reading its own
    /// PID-creation-time from the OS (§6 "publish the current liveness
    /// record").
    pub fn for_current_process() -> Self {
        let pid = std::process::id();
        Liveness { creation_time: creation_time(pid), pid, alive: Alive::Live }
    }

    pub fn is_live(&self) -> bool {
        self.alive == Alive::Live
    }

    /// Returns a copy of this record with `alive` set to `Dead`, for use as
    /// the `desired` value in a `liveness` CAS (§4.1).
    pub fn as_dead(&self) -> Liveness {
        Liveness { alive: Alive::Dead, ..*self }
    }
}

/// Reads `pid`'s start time from `/proc/<pid>/stat` (field 22, `starttime`),
/// the same mechanism `get_creation_time` in the original uses (§11.4).
/// Returns `u64::MAX` (never a valid creation time) if the PID does not
/// exist or the stat file cannot be parsed.
#[cfg(target_os = "linux")]
pub fn creation_time(pid: u32) -> u64 {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(contents) => parse_starttime(&contents).unwrap_or(u64::MAX),
        Err(e) => {
            log::debug!("creation_time({pid}): could not read /proc/{pid}/stat: {e}");
            u64::MAX
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn creation_time(_pid: u32) -> u64 {
    u64::MAX
}

/// `/proc/<pid>/stat` starts with `pid (comm) state ...`; `comm` may itself
/// contain spaces or parentheses, so we split on the *last* `)` rather than
/// tokenizing naively, then count forward from the `state` field.
fn parse_starttime(stat: &str) -> Option<u64> {
    let after_comm = stat.rsplit_once(')')?.1;
    // fields after comm, 0-indexed: state=0 ... starttime=19 (field 22 overall).
    after_comm.split_whitespace().nth(19)?.parse().ok()
}

/// Consults the OS to determine whether `pid` still exists with the same
/// creation time as when its liveness record was published (§4.1). A PID
/// reuse after the tunable timeout (§10.3 `MPGC_LIVENESS_TIMEOUT_MS`) is
/// distinguished from genuine liveness because the new process's start time
/// will differ.
pub fn is_process_alive(recorded: &Liveness) -> bool {
    creation_time(recorded.pid) == recorded.creation_time
}

/// How long a process may go without progress before the driver consults
/// the OS about its liveness (§4.1, §10.3).
pub fn liveness_timeout(opts: &config::Options) -> std::time::Duration {
    std::time::Duration::from_millis(opts.liveness_timeout_ms.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_reported_alive() {
        let live = Liveness::for_current_process();
        assert!(live.is_live());
        assert!(is_process_alive(&live));
    }

    #[test]
    fn bogus_pid_and_creation_time_is_reported_dead() {
        let bogus = Liveness { creation_time: 0xDEAD_BEEF, pid: u32::MAX, alive: Alive::Live };
        assert!(!is_process_alive(&bogus));
    }

    #[test]
    fn as_dead_preserves_identity_fields() {
        let live = Liveness::for_current_process();
        let dead = live.as_dead();
        assert_eq!(dead.pid, live.pid);
        assert_eq!(dead.creation_time, live.creation_time);
        assert!(!dead.is_live());
    }

    #[test]
    fn parses_stat_with_spaces_in_comm() {
        // comm `(weird proc name)` contains a space and inner parens-safe text.
        let synthetic = "123 (weird proc name) S 1 123 123 0 -1 4194304 100 0 0 0 2 3 0 0 20 0 1 0 456789 0 0";
        assert_eq!(parse_starttime(synthetic), Some(456789));
    }
}
