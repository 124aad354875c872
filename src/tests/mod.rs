//! End-to-end scenarios (§8), run against the public API the way a process
//! attached to a real heap would use it.

mod scenarios;
