//! Declarative per-frame command list and its hazard validator.
//!
//! Both backends run the same [`FrameSchedule`]. The Vulkan backend lowers
//! each [`Barrier`] to a pipeline barrier; the host backend executes the
//! stages in order, where every stage is a full join.
//!
//! Validation simulates two back-to-back frames without any host wait in
//! between, so read-then-write ordering across frames must be expressed
//! with barriers too.

use crate::util::{Error, Result};
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Execution stage of a frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Transfer,
    Emission,
    AccelBuild,
    Render,
}

impl Stage {
    #[inline]
    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Tracked sub-region of the frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Counter header (also the indirect build range).
    Counters,
    /// Instance descriptor array.
    Instances,
    /// Beam/photon records.
    Records,
    /// Beam/photon top level structure.
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

pub type Regions = SmallVec<[Region; 4]>;

/// Execution and memory dependency from `src` to `dst` over `regions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub src: Stage,
    pub dst: Stage,
    pub regions: Regions,
}

/// One entry of the frame command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCommand {
    /// Transfer-fill the given regions with zeros.
    ZeroFill(Regions),
    Barrier(Barrier),
    /// Emission pass over the static scene.
    Emit,
    /// Top level build from the device-side instance count.
    BuildTopLevel,
    /// Camera pass over both structures.
    Render,
}

impl FrameCommand {
    /// Stage and region accesses of a non-barrier command.
    pub fn accesses(&self) -> Option<(Stage, SmallVec<[(Region, Access); 6]>)> {
        use Access::*;
        use Region::*;
        match self {
            Self::Barrier(_) => None,
            Self::ZeroFill(regions) => Some((Stage::Transfer, regions.iter().map(|r| (*r, Write)).collect())),
            // Atomics read and write the counters
            Self::Emit => Some((
                Stage::Emission,
                smallvec![(Counters, Read), (Counters, Write), (Instances, Write), (Records, Write)],
            )),
            Self::BuildTopLevel => Some((
                Stage::AccelBuild,
                smallvec![(Counters, Read), (Instances, Read), (TopLevel, Write)],
            )),
            // Instance descriptors are decoded for the record index and sub-beam transform
            Self::Render => Some((
                Stage::Render,
                smallvec![(TopLevel, Read), (Instances, Read), (Records, Read)],
            )),
        }
    }
}

impl fmt::Display for FrameCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroFill(r) => write!(f, "zero-fill {r:?}"),
            Self::Barrier(b) => write!(f, "barrier {:?} -> {:?} {:?}", b.src, b.dst, b.regions),
            Self::Emit => f.write_str("emit"),
            Self::BuildTopLevel => f.write_str("build top level"),
            Self::Render => f.write_str("render"),
        }
    }
}

/// Ordered command list for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSchedule {
    pub commands: Vec<FrameCommand>,
}

fn barrier(src: Stage, dst: Stage, regions: &[Region]) -> FrameCommand {
    FrameCommand::Barrier(Barrier {
        src,
        dst,
        regions: regions.iter().copied().collect(),
    })
}

impl FrameSchedule {
    /// Zero-fill, emit, build, render with the barriers between them.
    pub fn standard() -> Self {
        use Region::*;
        use Stage::*;
        Self {
            commands: vec![
                // Previous frame's reads before this frame's zero-fill
                barrier(Render, Transfer, &[Counters, Instances, Records]),
                FrameCommand::ZeroFill(smallvec![Counters, Instances]),
                barrier(Transfer, Emission, &[Counters, Instances, Records]),
                FrameCommand::Emit,
                barrier(Emission, AccelBuild, &[Counters, Instances, Records]),
                // Previous frame's traversal before the rebuild
                barrier(Render, AccelBuild, &[TopLevel]),
                FrameCommand::BuildTopLevel,
                barrier(AccelBuild, Render, &[Counters, Instances, Records, TopLevel]),
                FrameCommand::Render,
            ],
        }
    }

    /// Schedule with the barrier at `index` removed.
    pub fn without_command(&self, index: usize) -> Self {
        let mut commands = self.commands.clone();
        commands.remove(index);
        Self { commands }
    }

    pub fn barriers(&self) -> impl Iterator<Item = &Barrier> {
        self.commands.iter().filter_map(|c| match c {
            FrameCommand::Barrier(b) => Some(b),
            _ => None,
        })
    }

    /// Check that every cross-stage access pair is ordered by a barrier.
    pub fn validate(&self) -> Result<()> {
        #[derive(Clone, Copy)]
        struct Pending {
            command: usize,
            stage: Stage,
            access: Access,
            visible_to: u8,
        }

        fn slot(region: Region) -> usize {
            region as usize
        }

        let mut pending: [Vec<Pending>; 4] = Default::default();
        let len = self.commands.len();

        for step in 0..2 * len {
            let command = &self.commands[step % len];
            let frame = step / len;

            if let FrameCommand::Barrier(b) = command {
                // Chained: anything already visible to `src` becomes visible to `dst`
                for region in &b.regions {
                    for p in pending[slot(*region)].iter_mut() {
                        if p.stage == b.src || p.visible_to & b.src.bit() != 0 {
                            p.visible_to |= b.dst.bit();
                        }
                    }
                }
                continue;
            }

            let Some((stage, accesses)) = command.accesses() else {
                continue;
            };
            for (region, access) in accesses {
                let list = &mut pending[slot(region)];
                for p in list.iter() {
                    if p.command == step {
                        continue;
                    }
                    let conflicting = p.access == Access::Write || access == Access::Write;
                    if conflicting && p.visible_to & stage.bit() == 0 {
                        let prev = &self.commands[p.command % len];
                        return Err(Error::Schedule(format!(
                            "{:?} after {:?} on {region:?}: '{command}' (frame {frame}) is not ordered after '{prev}'",
                            access, p.access
                        )));
                    }
                }
                if access == Access::Write {
                    list.retain(|p| p.command == step);
                }
                list.push(Pending {
                    command: step,
                    stage,
                    access,
                    visible_to: 0,
                });
            }
        }
        Ok(())
    }
}

impl Default for FrameSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_schedule_validates() {
        FrameSchedule::standard().validate().unwrap();
    }

    #[test]
    fn test_every_barrier_is_required() {
        let schedule = FrameSchedule::standard();
        for (i, cmd) in schedule.commands.iter().enumerate() {
            if let FrameCommand::Barrier(_) = cmd {
                let broken = schedule.without_command(i);
                let err = broken.validate().unwrap_err();
                assert!(matches!(err, Error::Schedule(_)), "removing '{cmd}' went unnoticed");
            }
        }
    }

    #[test]
    fn test_region_mismatch_detected() {
        let mut schedule = FrameSchedule::standard();
        // Emission -> build barrier that forgets the counters
        schedule.commands[4] = barrier(Stage::Emission, Stage::AccelBuild, &[Region::Instances, Region::Records]);
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_render_instance_reads_are_ordered() {
        let (stage, accesses) = FrameCommand::Render.accesses().unwrap();
        assert_eq!(stage, Stage::Render);
        assert!(accesses.contains(&(Region::Instances, Access::Read)));

        // Build -> render barrier without the instances
        let mut schedule = FrameSchedule::standard();
        schedule.commands[7] = barrier(
            Stage::AccelBuild,
            Stage::Render,
            &[Region::Counters, Region::Records, Region::TopLevel],
        );
        assert!(schedule.validate().is_err());

        // Render -> zero-fill barrier without the instances
        let mut schedule = FrameSchedule::standard();
        schedule.commands[0] = barrier(Stage::Render, Stage::Transfer, &[Region::Counters, Region::Records]);
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_stage_order() {
        let schedule = FrameSchedule::standard();
        let order: Vec<Stage> = schedule
            .commands
            .iter()
            .filter_map(|c| c.accesses().map(|(s, _)| s))
            .collect();
        assert_eq!(order, vec![Stage::Transfer, Stage::Emission, Stage::AccelBuild, Stage::Render]);
        assert_eq!(schedule.barriers().count(), 5);
    }
}
