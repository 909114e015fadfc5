//! Per-cycle occupancy of machine resources.
//!
//! Each cell holds the owners currently using a resource in one slot. With a
//! non-zero initiation interval the slot is the cycle modulo the interval, so
//! a placement blocks the same resource in every iteration.

use crate::machine::{BusId, FuId, IuId, RfId};
use crate::program::{NodeId, PoId};
use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Bus(BusId),
    /// Operation start on a unit.
    Trigger(FuId),
    /// Write into an operand port.
    PortWrite(FuId, u8),
    /// Operand value waiting in its port for the trigger.
    InputHold(FuId, u8),
    /// Result value waiting in its port for the last read.
    ResultHold(FuId, u8),
    /// Result written into its port.
    ResultArrival(FuId, u8),
    RegisterRead(RfId),
    RegisterWrite(RfId),
    ImmediateWrite(IuId),
    ImmediateRegister(IuId, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Node(NodeId),
    Operation(PoId),
}

/// One occupancy entry, as added by an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    pub key: ResourceKey,
    pub slot: i32,
    pub owner: Owner,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    ii: i32,
    cells: HashMap<(ResourceKey, i32), Vec<Owner>>,
}

impl ResourceTable {
    pub fn new(ii: i32) -> Self {
        Self {
            ii,
            cells: HashMap::new(),
        }
    }

    pub fn slot(&self, cycle: i32) -> i32 {
        if self.ii > 0 {
            cycle.rem_euclid(self.ii)
        } else {
            cycle
        }
    }

    pub fn owners(&self, key: ResourceKey, cycle: i32) -> &[Owner] {
        self.cells
            .get(&(key, self.slot(cycle)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count(&self, key: ResourceKey, cycle: i32) -> usize {
        self.owners(key, cycle).len()
    }

    /// True if nobody but `owner` uses the resource at `cycle`.
    pub fn free_for(&self, key: ResourceKey, cycle: i32, owner: Owner) -> bool {
        self.owners(key, cycle).iter().all(|o| *o == owner)
    }

    /// True if `free_for` holds over the closed interval `[from, to]`.
    pub fn interval_free_for(&self, key: ResourceKey, from: i32, to: i32, owner: Owner) -> bool {
        (from..=to).all(|c| self.free_for(key, c, owner))
    }

    pub fn mark(&mut self, key: ResourceKey, cycle: i32, owner: Owner) -> Mark {
        let slot = self.slot(cycle);
        self.cells.entry((key, slot)).or_default().push(owner);
        Mark { key, slot, owner }
    }

    pub fn unmark(&mut self, mark: &Mark) {
        let cell = (mark.key, mark.slot);
        if let Some(owners) = self.cells.get_mut(&cell) {
            if let Some(pos) = owners.iter().position(|o| *o == mark.owner) {
                owners.remove(pos);
            }
            if owners.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Sorted copy of every non-empty cell.
    pub fn snapshot(&self) -> Vec<((ResourceKey, i32), Vec<Owner>)> {
        let mut cells: Vec<_> = self
            .cells
            .iter()
            .map(|(k, v)| {
                let mut owners = v.clone();
                owners.sort();
                (*k, owners)
            })
            .collect();
        cells.sort();
        cells
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
