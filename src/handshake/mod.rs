//! The handshake/phase engine (§4.1): the eight-phase cycle, the versioned
//! barrier protocol each process participates in, and liveness-driven
//! takeover of a peer's buffered work.

pub mod driver;
pub mod phase;

pub use driver::Collective;
pub use phase::{BarrierMode, ObservedPhase, Phase};
