//! Beam record buffer protocol.
//!
//! Layout shared by the device buffers and the host [`FrameArena`]:
//!
//! ```text
//! record buffer:   [CounterHeader 32B][BeamRecord 64B x max_num_beams]
//! instance buffer: [InstanceDescriptor 64B x max_num_sub_beams]
//! ```
//!
//! Per frame: the header and instance region are zero-filled, emission
//! appends through the counters, the top level build reads the sub-beam
//! counter as its primitive count, and rendering reads records by the
//! index carried in each instance's custom index.

mod arena;
mod capacity;
mod instance;
mod record;

pub use arena::FrameArena;
pub use capacity::{BufferSizes, CapacityBudget};
pub use instance::*;
pub use record::*;
