//! Window bookkeeping
//!
//! - [`frames`]: camera, point and observation records
//! - [`ledger`]: lifecycle-tracked maps (active, linearized, marginalized)
//! - [`registry`]: stable UUIDs for every scalar unknown
//! - [`window`]: the mutable state the scheduler and builder work on

pub mod frames;
pub mod ledger;
pub mod registry;
pub mod window;
