//! Acceleration structure policy and the host BVH.
//!
//! The beam/photon top level is rebuilt every frame from a primitive count
//! that only exists on the executing side (the counter header). These types
//! describe how that build is issued; [`Bvh`] is the host implementation.

mod bvh;

pub use bvh::{Bvh, BvhNode};

use serde::{Deserialize, Serialize};

/// How the per-frame top level is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlasBuildMode {
    /// Fresh build with fast-build flags every frame.
    #[default]
    Rebuild,
    /// In-place update when the instance count did not change.
    Update,
}

/// Where the build reads its primitive count from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildRangeSource {
    /// Indirect build if the device supports it, padded otherwise.
    #[default]
    Auto,
    /// Count read from the counter header at execution time.
    DeviceIndirect,
    /// Build over the whole capacity; zero-filled instances are inactive.
    CapacityPadded,
}

/// Statistics of one top level build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Instances referenced by leaves.
    pub leaf_instances: u32,
    pub nodes: u32,
    pub depth: u32,
    /// True when the previous structure was refitted instead of rebuilt.
    pub refit: bool,
}

impl BuildStats {
    pub fn of(bvh: &Bvh, refit: bool) -> Self {
        Self {
            leaf_instances: bvh.leaf_primitives() as u32,
            nodes: bvh.nodes.len() as u32,
            depth: bvh.depth(),
            refit,
        }
    }
}
