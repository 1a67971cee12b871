//! Virtual blocks: the core suballocation algorithms without any device
//! memory behind them.
//!
//! Useful for carving up a buffer you manage yourself, a memory range of a
//! foreign API, or anything else addressed by plain offsets. Not internally
//! synchronized: methods take `&mut self` and the caller owns the locking
//! story, if any.

use crate::api::config::{
    VirtualAllocationDesc, VirtualAllocationFlags, VirtualBlockDesc, VirtualBlockFlags,
};
use crate::core::stats::{DetailedStatistics, Statistics};
use crate::error::{Error, Result};
use crate::json::JsonWriter;
use crate::metadata::{AllocHandle, BlockMetadata, Strategy};

/// A single allocation inside a [`VirtualBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualAllocation(pub(crate) AllocHandle);

/// Properties of a virtual allocation.
#[derive(Debug, Clone, Copy)]
pub struct VirtualAllocationInfo {
    pub offset: u64,
    pub size: u64,
    pub private_data: u64,
}

/// A software-only suballocator over an abstract `[0, size)` byte range.
pub struct VirtualBlock {
    metadata: BlockMetadata,
    linear: bool,
}

impl VirtualBlock {
    pub fn new(desc: &VirtualBlockDesc) -> Result<Self> {
        if desc.size == 0 {
            return Err(Error::InvalidArgument("virtual block size must not be zero"));
        }
        let linear = desc.flags.contains(VirtualBlockFlags::ALGORITHM_LINEAR);
        let metadata = if linear {
            BlockMetadata::new_linear(desc.size)
        } else {
            BlockMetadata::new_tlsf(desc.size, true)
        };
        Ok(Self { metadata, linear })
    }

    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Reserve a range. Returns the allocation handle and its offset.
    pub fn allocate(
        &mut self,
        desc: &VirtualAllocationDesc,
    ) -> Result<(VirtualAllocation, u64)> {
        if desc.size == 0 {
            return Err(Error::InvalidArgument("allocation size must not be zero"));
        }
        let alignment = if desc.alignment == 0 { 1 } else { desc.alignment };
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(
                "allocation alignment must be a power of two",
            ));
        }
        let upper_address = desc.flags.contains(VirtualAllocationFlags::UPPER_ADDRESS);
        if upper_address && !self.linear {
            return Err(Error::InvalidArgument(
                "upper-address allocation requires the linear algorithm",
            ));
        }
        let strategy = decode_strategy(desc.flags);
        let request = self
            .metadata
            .create_allocation_request(desc.size, alignment, upper_address, strategy)
            .ok_or(Error::OutOfMemory)?;
        self.metadata.alloc(&request, desc.private_data);
        self.metadata.validate_heavy();
        let offset = self.metadata.allocation_offset(request.handle);
        Ok((VirtualAllocation(request.handle), offset))
    }

    pub fn free_allocation(&mut self, allocation: VirtualAllocation) {
        self.metadata.free(allocation.0);
        self.metadata.validate_heavy();
    }

    /// Free everything at once.
    pub fn clear(&mut self) {
        self.metadata.clear();
    }

    pub fn allocation_info(&self, allocation: VirtualAllocation) -> VirtualAllocationInfo {
        let info = self.metadata.allocation_info(allocation.0);
        VirtualAllocationInfo {
            offset: info.offset,
            size: info.size,
            private_data: info.user_data,
        }
    }

    pub fn set_allocation_private_data(
        &mut self,
        allocation: VirtualAllocation,
        private_data: u64,
    ) {
        self.metadata.set_allocation_user_data(allocation.0, private_data);
    }

    /// Cheap counters.
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        self.metadata.add_statistics(&mut stats);
        stats
    }

    /// Exhaustive statistics including free-range distribution.
    pub fn calculate_statistics(&self) -> DetailedStatistics {
        let mut detailed = DetailedStatistics::default();
        self.metadata.add_detailed_statistics(&mut detailed);
        detailed
    }

    /// Serialize the block's state to JSON (UTF-8 with a BOM prefix).
    pub fn build_stats_string(&self) -> String {
        let mut out = String::from('\u{feff}');
        let mut json = JsonWriter::new(&mut out);
        json.begin_object();
        json.write_key("Stats");
        self.calculate_statistics().write_json(&mut json);
        json.write_key("Block");
        self.metadata
            .write_allocation_info_json(&mut json, &|json, private_data| {
                if private_data != 0 {
                    json.write_key("PrivateData");
                    json.write_u64(private_data);
                }
            });
        json.end_object();
        drop(json);
        out
    }

    #[cfg(test)]
    pub(crate) fn validate(&self) {
        self.metadata.validate();
    }
}

impl Drop for VirtualBlock {
    fn drop(&mut self) {
        debug_assert!(
            self.metadata.is_empty(),
            "virtual block destroyed with live allocations; free them or call clear()"
        );
    }
}

fn decode_strategy(flags: VirtualAllocationFlags) -> Strategy {
    if flags.contains(VirtualAllocationFlags::STRATEGY_MIN_TIME) {
        Strategy::MinTime
    } else if flags.contains(VirtualAllocationFlags::STRATEGY_MIN_MEMORY) {
        Strategy::MinMemory
    } else if flags.contains(VirtualAllocationFlags::STRATEGY_MIN_OFFSET) {
        Strategy::MinOffset
    } else {
        Strategy::Default
    }
}
