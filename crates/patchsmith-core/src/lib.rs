//! Core domain model and contracts for patchsmith.

pub mod authz;
pub mod patch;
pub mod plan;
pub mod protocol;

pub use protocol::*;
pub use plan::{ContextBundle, FileSlice, Plan, SliceRole};
