//! deBras broadcast-cell layout.
//!
//! With the deBras allocator, every mote installs the same grid of
//! SHARED cells at boot: `num_broadcast_cells` evenly spaced timeslots,
//! one cell per channel at each, every cell carrying a distinct
//! broadcast id. Each mote is assigned to exactly one of those cells
//! (`id mod slots`) and takes turns gossiping its schedule there; the
//! waiting-counter round-robin lives in the MAC activation path. Gossip
//! is received opportunistically on all SHARED cells.

use crate::schedule::{Cell, CellKey};
use crate::sim::{SimError, Simulation};

impl Simulation {
    /// The common broadcast-cell grid: `(key, broadcast_id)` pairs.
    pub(crate) fn broadcast_layout(&self) -> Vec<(CellKey, u16)> {
        let frame = self.settings.slotframe_length;
        let per_channel = self.settings.num_broadcast_cells;
        let mut layout = Vec::new();
        for b in 0..per_channel {
            let slot = ((b as u32 * frame as u32) / per_channel as u32) as u16;
            for channel in 0..self.settings.num_chans {
                let broadcast_id = b * self.settings.num_chans as u16 + channel as u16;
                layout.push((CellKey::new(slot, channel), broadcast_id));
            }
        }
        layout
    }

    /// Number of distinct broadcast cells in the grid.
    pub(crate) fn num_broadcast_slots(&self) -> u16 {
        self.settings.num_broadcast_cells * self.settings.num_chans as u16
    }

    /// Slotframes a mote waits between gossip turns on its assigned
    /// cell: enough for every mote sharing the cell to get a turn.
    pub(crate) fn broadcast_max_win(&self) -> u32 {
        let slots = self.num_broadcast_slots() as u32;
        if slots == 0 {
            return 0;
        }
        (self.settings.num_motes as u32).div_ceil(slots)
    }

    /// Install the SHARED grid on every mote and assign gossip turns.
    pub(crate) fn install_broadcast_cells(&mut self) -> Result<(), SimError> {
        let layout = self.broadcast_layout();
        let slots = self.num_broadcast_slots();
        for mote in &mut self.motes {
            for &(key, broadcast_id) in &layout {
                mote.schedule.add(key, Cell::shared(broadcast_id))?;
            }
            mote.assigned_broadcast_id = Some(mote.id.0 % slots);
            mote.broadcast_wait = (mote.id.0 / slots) as u32;
        }
        Ok(())
    }
}
