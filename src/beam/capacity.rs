//! Fixed buffer capacities derived from worst-case sample counts.

use super::instance::RECORD_INDEX_MASK;
use super::record::{BeamRecord, HEADER_SIZE};
use super::InstanceDescriptor;
use crate::settings::VolumeParams;
use crate::util::{Error, Result};
use serde::{Deserialize, Serialize};
use std::mem::size_of;

/// Sample budget the record and instance buffers are sized for.
///
/// `max_num_beams = max(beam, photon samples) * beams_per_sample` and
/// `max_num_sub_beams = beam samples * sub_beams_per_beam_sample + photon samples`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityBudget {
    pub max_beam_samples: u32,
    pub max_photon_samples: u32,
    /// Expected records per emission sample.
    pub beams_per_sample: u32,
    /// Expected sub-beam instances per beam sample.
    pub sub_beams_per_beam_sample: u32,
}

impl Default for CapacityBudget {
    fn default() -> Self {
        Self {
            max_beam_samples: 2048,
            max_photon_samples: 65536,
            beams_per_sample: 32,
            sub_beams_per_beam_sample: 48,
        }
    }
}

/// Byte sizes of the per-frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    /// Header + records.
    pub record_buffer: u64,
    /// Instance descriptor array.
    pub instance_buffer: u64,
}

impl CapacityBudget {
    /// Small budget, handy for tests and previews.
    pub fn with_samples(max_beam_samples: u32, max_photon_samples: u32) -> Self {
        Self {
            max_beam_samples,
            max_photon_samples,
            ..Self::default()
        }
    }

    pub fn max_num_beams(&self) -> u32 {
        self.max_beam_samples
            .max(self.max_photon_samples)
            .saturating_mul(self.beams_per_sample)
    }

    pub fn max_num_sub_beams(&self) -> u32 {
        self.max_beam_samples
            .saturating_mul(self.sub_beams_per_beam_sample)
            .saturating_add(self.max_photon_samples)
    }

    pub fn sizes(&self) -> BufferSizes {
        BufferSizes {
            record_buffer: HEADER_SIZE + self.max_num_beams() as u64 * size_of::<BeamRecord>() as u64,
            instance_buffer: self.max_num_sub_beams() as u64 * size_of::<InstanceDescriptor>() as u64,
        }
    }

    /// Reject budgets the instance encoding cannot address.
    pub fn validate(&self) -> Result<()> {
        if self.beams_per_sample == 0 || self.sub_beams_per_beam_sample == 0 {
            return Err(Error::CapacityBudget("per-sample multipliers must be non-zero".into()));
        }
        let beams = self.max_num_beams();
        if beams > RECORD_INDEX_MASK {
            return Err(Error::CapacityBudget(format!(
                "{beams} records exceed the 23-bit record index (max {RECORD_INDEX_MASK})"
            )));
        }
        if self.max_num_sub_beams() == 0 {
            return Err(Error::CapacityBudget("instance capacity is zero".into()));
        }
        if self.max_num_sub_beams() == u32::MAX {
            return Err(Error::CapacityBudget("instance capacity overflows u32".into()));
        }
        Ok(())
    }

    /// Sample counts must fit the budget the buffers were sized for.
    pub fn check_samples(&self, volume: &VolumeParams) -> Result<()> {
        if volume.num_beam_samples > self.max_beam_samples {
            return Err(Error::CapacityBudget(format!(
                "num_beam_samples {} exceeds max_beam_samples {}",
                volume.num_beam_samples, self.max_beam_samples
            )));
        }
        if volume.num_photon_samples > self.max_photon_samples {
            return Err(Error::CapacityBudget(format!(
                "num_photon_samples {} exceeds max_photon_samples {}",
                volume.num_photon_samples, self.max_photon_samples
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacities() {
        let b = CapacityBudget::default();
        assert_eq!(b.max_num_beams(), 65536 * 32);
        assert_eq!(b.max_num_sub_beams(), 2048 * 48 + 65536);
        b.validate().unwrap();
    }

    #[test]
    fn test_sizes() {
        let b = CapacityBudget::with_samples(4, 8);
        let s = b.sizes();
        assert_eq!(s.record_buffer, 32 + 8 * 32 * 64);
        assert_eq!(s.instance_buffer, (4 * 48 + 8) * 64);
    }

    #[test]
    fn test_rejects_unencodable_budget() {
        let b = CapacityBudget::with_samples(1, 1 << 20);
        assert!(matches!(b.validate(), Err(Error::CapacityBudget(_))));
    }

    #[test]
    fn test_samples_must_fit() {
        let b = CapacityBudget::with_samples(16, 16);
        let mut v = VolumeParams::default();
        v.num_beam_samples = 16;
        v.num_photon_samples = 17;
        assert!(b.check_samples(&v).is_err());
        v.num_photon_samples = 16;
        b.check_samples(&v).unwrap();
    }
}
