//! The external-reference table (§4.3): anchors that keep a heap object
//! alive for as long as a transient process-memory handle to it exists.

pub mod anchor;
pub mod cache;
pub mod slot;
pub mod table;

pub use anchor::{Anchor, SubAnchor};
pub use table::XrtTable;
