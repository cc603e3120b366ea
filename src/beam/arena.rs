//! Frame arena: host mirror of the device record and instance buffers.
//!
//! Appends go through atomic counters exactly like the emission shaders:
//! a slot is reserved with a fetch-add and written once. Slots at or past
//! capacity are released again (reserve-and-release clamp) and counted as
//! dropped, so the final count is `min(requested, capacity)` and every
//! in-bounds slot is written by exactly one invocation.

use super::capacity::CapacityBudget;
use super::instance::InstanceDescriptor;
use super::record::{BeamRecord, CounterHeader};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

/// Reserve a slot below `capacity` or release it and count a drop.
#[inline]
fn reserve(counter: &AtomicU32, capacity: u32, dropped: &AtomicU32) -> Option<u32> {
    let slot = counter.fetch_add(1, Ordering::Relaxed);
    if slot < capacity {
        Some(slot)
    } else {
        // The counter never drops below capacity once it got there
        counter.fetch_sub(1, Ordering::Relaxed);
        dropped.fetch_add(1, Ordering::Relaxed);
        None
    }
}

/// Per-frame append buffers with device-style counters.
pub struct FrameArena {
    sub_beam_count: AtomicU32,
    beam_count: AtomicU32,
    dropped_sub_beams: AtomicU32,
    dropped_beams: AtomicU32,
    records: Box<[OnceLock<BeamRecord>]>,
    instances: Box<[OnceLock<InstanceDescriptor>]>,
}

impl FrameArena {
    pub fn new(budget: &CapacityBudget) -> Self {
        Self::with_capacity(budget.max_num_beams(), budget.max_num_sub_beams())
    }

    pub fn with_capacity(max_beams: u32, max_sub_beams: u32) -> Self {
        Self {
            sub_beam_count: AtomicU32::new(0),
            beam_count: AtomicU32::new(0),
            dropped_sub_beams: AtomicU32::new(0),
            dropped_beams: AtomicU32::new(0),
            records: (0..max_beams).map(|_| OnceLock::new()).collect(),
            instances: (0..max_sub_beams).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn max_beams(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn max_sub_beams(&self) -> u32 {
        self.instances.len() as u32
    }

    /// Zero-fill counters and the used part of both regions.
    ///
    /// Takes `&mut self`: no append can be in flight while resetting.
    pub fn reset(&mut self) {
        let header = self.header();
        for slot in self.records[..header.beam_count as usize].iter_mut() {
            slot.take();
        }
        for slot in self.instances[..header.sub_beam_count as usize].iter_mut() {
            slot.take();
        }
        *self.sub_beam_count.get_mut() = 0;
        *self.beam_count.get_mut() = 0;
        *self.dropped_sub_beams.get_mut() = 0;
        *self.dropped_beams.get_mut() = 0;
    }

    /// Append a record. Returns its index, or `None` when clamped.
    pub fn push_record(&self, record: BeamRecord) -> Option<u32> {
        let slot = reserve(&self.beam_count, self.max_beams(), &self.dropped_beams)?;
        // Slots are unique, so the cell is always empty here
        let _ = self.records[slot as usize].set(record);
        Some(slot)
    }

    /// Append an instance descriptor. Returns its slot, or `None` when clamped.
    pub fn push_instance(&self, instance: InstanceDescriptor) -> Option<u32> {
        let slot = reserve(&self.sub_beam_count, self.max_sub_beams(), &self.dropped_sub_beams)?;
        let _ = self.instances[slot as usize].set(instance);
        Some(slot)
    }

    /// Snapshot of the counter header.
    pub fn header(&self) -> CounterHeader {
        CounterHeader {
            sub_beam_count: self.sub_beam_count.load(Ordering::Acquire),
            beam_count: self.beam_count.load(Ordering::Acquire),
            dropped_sub_beams: self.dropped_sub_beams.load(Ordering::Acquire),
            dropped_beams: self.dropped_beams.load(Ordering::Acquire),
            ..Default::default()
        }
    }

    #[inline]
    pub fn record(&self, index: u32) -> Option<&BeamRecord> {
        self.records.get(index as usize).and_then(OnceLock::get)
    }

    /// Descriptor at `slot`; unwritten slots read as zero-filled.
    #[inline]
    pub fn instance(&self, slot: u32) -> InstanceDescriptor {
        self.instances
            .get(slot as usize)
            .and_then(OnceLock::get)
            .copied()
            .unwrap_or_default()
    }

    /// Written records, in slot order.
    pub fn records(&self) -> impl Iterator<Item = &BeamRecord> + '_ {
        let count = self.beam_count.load(Ordering::Acquire) as usize;
        self.records[..count].iter().filter_map(OnceLock::get)
    }
}

impl std::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("header", &self.header())
            .field("max_beams", &self.max_beams())
            .field("max_sub_beams", &self.max_sub_beams())
            .finish()
    }
}
