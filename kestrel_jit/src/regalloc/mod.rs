//! Register Allocation Module
//!
//! Implements the StraightForward allocator used by the Kestrel optimizing
//! tier: a single pass over the SSA graph in program order, with no live
//! range splitting or coalescing. What it lacks in global optimality it
//! makes up for in compile speed, which is what a mid-tier wants.
//!
//! # Architecture
//!
//! - `hole.rs`: post-dominating hole analysis over the control-flow graph
//! - `state.rs`: live-value bookkeeping and per-block merge snapshots
//! - `allocator.rs`: the single-pass allocator itself
//!
//! # Usage
//!
//! ```ignore
//! let mut allocator = StraightForwardAllocator::new(&flags, None);
//! let stack_slots = allocator.allocate(&mut graph);
//! ```

pub mod allocator;
pub mod hole;
pub mod state;

pub use allocator::StraightForwardAllocator;
pub use hole::{compute_post_dominating_holes, nearest_post_dominating_hole};
pub use state::{LiveNodeInfo, MergePointRegisterState, RegisterMerge, RegisterState};
