//! Per-mote cell table.
//!
//! A schedule maps `(timeslot, channel)` keys to cells. Cells are created
//! by 6top reservations, mutated only by their owning mote, and deleted
//! in pairs; SHARED cells are installed at boot and never removed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tschsim_common::consts::CELL_HISTORY_LEN;
use tschsim_common::{Asn, ChannelOffset, MoteId, SlotOffset};

/// Key of one cell within the slotframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    /// Timeslot offset within the slotframe.
    pub slot: SlotOffset,
    /// Channel offset.
    pub channel: ChannelOffset,
}

impl CellKey {
    /// Convenience constructor.
    pub fn new(slot: SlotOffset, channel: ChannelOffset) -> Self {
        CellKey { slot, channel }
    }
}

/// Direction of a cell from its owner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellDirection {
    /// Owner transmits to the bound neighbor.
    Tx,
    /// Owner listens for the bound neighbor.
    Rx,
    /// Broadcast cell shared by the whole network (deBras gossip).
    Shared,
}

/// The neighbor a cell is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellPeer {
    /// A specific mote.
    Mote(MoteId),
    /// Anyone in range.
    Broadcast,
}

impl CellPeer {
    /// The bound mote, if unicast.
    pub fn mote(self) -> Option<MoteId> {
        match self {
            CellPeer::Mote(id) => Some(id),
            CellPeer::Broadcast => None,
        }
    }
}

/// One `(timeslot, channel)` entry in a mote's schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// TX, RX, or SHARED.
    pub direction: CellDirection,
    /// Bound neighbor.
    pub peer: CellPeer,
    /// Identity of the broadcast slot (SHARED cells only).
    pub broadcast_id: Option<u16>,
    /// Transmission attempts on this cell.
    pub num_tx: u32,
    /// Acknowledged attempts.
    pub num_tx_ack: u32,
    /// Frames received on this cell.
    pub num_rx: u32,
    /// Outcome of the last attempts, newest last; bounded ring.
    pub history: VecDeque<bool>,
    /// Set when the receiver decoded an interferer instead of its own
    /// traffic; consumed by 6top RX housekeeping.
    pub rx_detected_collision: bool,
    /// Transient activation marker, cleared on the radio callback.
    pub waiting_for: Option<CellDirection>,
}

impl Cell {
    /// A fresh cell with zeroed statistics.
    pub fn new(direction: CellDirection, peer: CellPeer) -> Self {
        Cell {
            direction,
            peer,
            broadcast_id: None,
            num_tx: 0,
            num_tx_ack: 0,
            num_rx: 0,
            history: VecDeque::with_capacity(CELL_HISTORY_LEN),
            rx_detected_collision: false,
            waiting_for: None,
        }
    }

    /// A SHARED broadcast cell with its slot identity.
    pub fn shared(broadcast_id: u16) -> Self {
        Cell {
            broadcast_id: Some(broadcast_id),
            ..Cell::new(CellDirection::Shared, CellPeer::Broadcast)
        }
    }

    /// Record one attempt outcome into the bounded history ring.
    pub fn record_attempt(&mut self, acked: bool) {
        if self.history.len() == CELL_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(acked);
    }

    /// PDR measured over the history ring, if any attempts are recorded.
    pub fn measured_pdr(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let acked = self.history.iter().filter(|&&a| a).count();
        Some(acked as f64 / self.history.len() as f64)
    }
}

/// Errors from schedule mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// The key already holds a cell.
    #[error("cell ({}, {}) is already occupied", key.slot, key.channel)]
    CellOccupied {
        /// The contested key.
        key: CellKey,
    },

    /// SHARED cells are permanent.
    #[error("cell ({}, {}) is SHARED and cannot be removed", key.slot, key.channel)]
    SharedCellRemoval {
        /// The refused key.
        key: CellKey,
    },

    /// No cell at the key.
    #[error("no cell at ({}, {})", key.slot, key.channel)]
    MissingCell {
        /// The queried key.
        key: CellKey,
    },
}

/// A mote's cell table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    cells: BTreeMap<CellKey, Cell>,
}

impl Schedule {
    /// Empty schedule.
    pub fn new() -> Self {
        Schedule::default()
    }

    /// Install a cell; rejects occupied keys.
    pub fn add(&mut self, key: CellKey, cell: Cell) -> Result<(), ScheduleError> {
        match self.cells.entry(key) {
            std::collections::btree_map::Entry::Occupied(_) => {
                Err(ScheduleError::CellOccupied { key })
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(cell);
                Ok(())
            }
        }
    }

    /// Remove a cell; SHARED cells are refused.
    pub fn remove(&mut self, key: CellKey) -> Result<Cell, ScheduleError> {
        match self.cells.remove(&key) {
            None => Err(ScheduleError::MissingCell { key }),
            Some(cell) if cell.direction == CellDirection::Shared => {
                self.cells.insert(key, cell);
                Err(ScheduleError::SharedCellRemoval { key })
            }
            Some(cell) => Ok(cell),
        }
    }

    /// Look up a cell.
    pub fn get(&self, key: CellKey) -> Option<&Cell> {
        self.cells.get(&key)
    }

    /// Look up a cell mutably.
    pub fn get_mut(&mut self, key: CellKey) -> Option<&mut Cell> {
        self.cells.get_mut(&key)
    }

    /// Whether the key is free.
    pub fn is_free(&self, key: CellKey) -> bool {
        !self.cells.contains_key(&key)
    }

    /// All cells in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, &Cell)> {
        self.cells.iter()
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the schedule is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Keys of cells scheduled at the given timeslot, channel-ascending.
    pub fn keys_at_slot(&self, slot: SlotOffset) -> Vec<CellKey> {
        self.cells
            .range(CellKey::new(slot, 0)..=CellKey::new(slot, ChannelOffset::MAX))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Keys of TX cells bound to `peer`, ascending.
    pub fn tx_cell_keys_to(&self, peer: MoteId) -> Vec<CellKey> {
        self.cells
            .iter()
            .filter(|(_, c)| c.direction == CellDirection::Tx && c.peer == CellPeer::Mote(peer))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Whether any RX cell is bound to `peer`.
    pub fn has_rx_cell_from(&self, peer: MoteId) -> bool {
        self.cells
            .values()
            .any(|c| c.direction == CellDirection::Rx && c.peer == CellPeer::Mote(peer))
    }

    /// Number of cells with the given direction.
    pub fn count_direction(&self, direction: CellDirection) -> usize {
        self.cells.values().filter(|c| c.direction == direction).count()
    }

    /// Slots until the next occupied timeslot strictly after the slot at
    /// `asn`, in 1..=slotframe_length. `None` when the schedule is empty.
    pub fn slots_until_next_active(&self, asn: Asn, slotframe_length: u16) -> Option<u64> {
        if self.cells.is_empty() {
            return None;
        }
        let current = (asn % slotframe_length as u64) as u16;
        let frame = slotframe_length as u64;
        self.cells
            .keys()
            .map(|key| {
                let delta = (key.slot as u64 + frame - current as u64) % frame;
                if delta == 0 {
                    frame
                } else {
                    delta
                }
            })
            .min()
    }

    /// An opaque copy of the schedule for gossiping.
    pub fn snapshot(&self, asn: Asn) -> ScheduleSnapshot {
        ScheduleSnapshot {
            asn,
            cells: self
                .cells
                .iter()
                .map(|(key, cell)| SnapshotCell {
                    key: *key,
                    direction: cell.direction,
                    peer: cell.peer,
                })
                .collect(),
        }
    }
}

/// One cell as seen in a gossiped snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCell {
    /// The cell's key.
    pub key: CellKey,
    /// Direction from the snapshot owner's point of view.
    pub direction: CellDirection,
    /// Bound neighbor.
    pub peer: CellPeer,
}

/// A neighbor's schedule as last gossiped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduleSnapshot {
    /// ASN at which the snapshot was taken by its owner.
    pub asn: Asn,
    /// The owner's cells at that time.
    pub cells: Vec<SnapshotCell>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_occupied() {
        let mut s = Schedule::new();
        let key = CellKey::new(3, 1);
        s.add(key, Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(1))))
            .unwrap();
        let err = s
            .add(key, Cell::new(CellDirection::Rx, CellPeer::Mote(MoteId(2))))
            .unwrap_err();
        assert_eq!(err, ScheduleError::CellOccupied { key });
    }

    #[test]
    fn shared_cells_are_permanent() {
        let mut s = Schedule::new();
        let key = CellKey::new(0, 0);
        s.add(key, Cell::shared(0)).unwrap();
        assert_eq!(
            s.remove(key).unwrap_err(),
            ScheduleError::SharedCellRemoval { key }
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut cell = Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(1)));
        for i in 0..40 {
            cell.record_attempt(i % 2 == 0);
        }
        assert_eq!(cell.history.len(), CELL_HISTORY_LEN);
        let pdr = cell.measured_pdr().unwrap();
        assert!((pdr - 0.5).abs() < 1e-9);
    }

    #[test]
    fn next_active_slot_wraps() {
        let mut s = Schedule::new();
        s.add(
            CellKey::new(5, 0),
            Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(1))),
        )
        .unwrap();
        s.add(
            CellKey::new(20, 2),
            Cell::new(CellDirection::Rx, CellPeer::Mote(MoteId(2))),
        )
        .unwrap();
        // From slot 0: next is 5.
        assert_eq!(s.slots_until_next_active(0, 101), Some(5));
        // From slot 5: next is 20.
        assert_eq!(s.slots_until_next_active(5, 101), Some(15));
        // From slot 20: wraps to 5 in the next frame.
        assert_eq!(s.slots_until_next_active(20, 101), Some(86));
        // Same-slot cells count only a full frame later.
        let mut one = Schedule::new();
        one.add(
            CellKey::new(7, 0),
            Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(1))),
        )
        .unwrap();
        assert_eq!(one.slots_until_next_active(7, 101), Some(101));
    }

    #[test]
    fn keys_at_slot_orders_by_channel() {
        let mut s = Schedule::new();
        for ch in [3u8, 0, 1] {
            s.add(
                CellKey::new(9, ch),
                Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(1))),
            )
            .unwrap();
        }
        s.add(
            CellKey::new(10, 0),
            Cell::new(CellDirection::Rx, CellPeer::Mote(MoteId(2))),
        )
        .unwrap();
        let keys = s.keys_at_slot(9);
        assert_eq!(
            keys,
            vec![CellKey::new(9, 0), CellKey::new(9, 1), CellKey::new(9, 3)]
        );
    }

    #[test]
    fn snapshot_copies_shape() {
        let mut s = Schedule::new();
        s.add(
            CellKey::new(2, 1),
            Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(4))),
        )
        .unwrap();
        let snap = s.snapshot(77);
        assert_eq!(snap.asn, 77);
        assert_eq!(snap.cells.len(), 1);
        assert_eq!(snap.cells[0].peer, CellPeer::Mote(MoteId(4)));
    }
}
