//! Per-process state (§3): the split between what genuinely lives in shared
//! memory (`shared`) and the richer, process-local runtime collections each
//! process keeps about itself (`block`). See `DESIGN.md` for why the split
//! exists.

pub mod block;
pub mod liveness;
pub mod shared;

pub use block::{BarrierInfo, BarrierStage, Block, SweepOrMarking};
pub use liveness::{Alive, Liveness};
pub use shared::{SharedProcessRecord, SharedProcessTable};
