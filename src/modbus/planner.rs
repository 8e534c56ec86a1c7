//! Read planner: coalesces enabled data points into contiguous block reads

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::MODBUS_MAX_READ;
use crate::registers::{Address, AddressSpace, DataPoint};

/// Coalescing limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Largest distance between neighbouring addresses merged into one block
    pub max_gap: u32,
    /// A block's span stays strictly below this, capped by the 125-register
    /// response limit
    pub max_block_size: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_gap: 5,
            max_block_size: 122,
        }
    }
}

/// One contiguous read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub space: AddressSpace,
    /// Published number of the first address
    pub start: u32,
    /// Registers (or bits) to read
    pub count: u16,
    /// Wire address of `start`
    pub wire_start: u16,
    /// Data point ids inside the block, by ascending address
    pub members: Vec<String>,
}

impl ReadBlock {
    /// Offset of `address` in this block's response
    pub fn offset_of(&self, address: &Address) -> Option<usize> {
        if address.space != self.space {
            return None;
        }
        address
            .wire()
            .checked_sub(self.wire_start)
            .map(usize::from)
            .filter(|&offset| offset < usize::from(self.count))
    }
}

struct OpenBlock {
    start: Address,
    last: u16,
    members: Vec<String>,
}

impl OpenBlock {
    fn new(address: Address, id: &str) -> Self {
        Self {
            start: address,
            last: address.wire(),
            members: vec![id.to_string()],
        }
    }

    /// Span of the block if `wire` joined it
    fn span_to(&self, wire: u16) -> u32 {
        u32::from(wire) - u32::from(self.start.wire()) + 1
    }

    fn close(self) -> ReadBlock {
        ReadBlock {
            space: self.start.space,
            start: self.start.number,
            count: self.last - self.start.wire() + 1,
            wire_start: self.start.wire(),
            members: self.members,
        }
    }
}

/// Plan block reads for `points`.
///
/// Points are grouped by address space and sorted by wire address. The
/// next address joins the open block while its distance to the block's
/// last address is at most `max_gap` and the resulting span stays below
/// `max_block_size`. Derived points have no address and are skipped.
/// Blocks come out ordered by space, then wire address.
pub fn plan_blocks(points: &[Arc<DataPoint>], config: PlannerConfig) -> Vec<ReadBlock> {
    let max_block_size = config.max_block_size.min(MODBUS_MAX_READ);
    let mut by_space: BTreeMap<AddressSpace, Vec<(Address, &str)>> = BTreeMap::new();
    for point in points {
        if let Some(address) = point.address() {
            by_space
                .entry(address.space)
                .or_default()
                .push((address, point.id.as_str()));
        }
    }

    let mut blocks = Vec::new();
    for (_space, mut addresses) in by_space {
        addresses.sort_by_key(|(address, _)| address.wire());

        let mut open: Option<OpenBlock> = None;
        for (address, id) in addresses {
            let wire = address.wire();
            match open.as_mut() {
                Some(block)
                    if u32::from(wire - block.last) <= config.max_gap
                        && block.span_to(wire) < max_block_size =>
                {
                    block.last = wire;
                    block.members.push(id.to_string());
                }
                _ => {
                    if let Some(block) = open.replace(OpenBlock::new(address, id)) {
                        blocks.push(block.close());
                    }
                }
            }
        }
        if let Some(block) = open {
            blocks.push(block.close());
        }
    }

    blocks
}
