//! Per-mote state.
//!
//! A mote owns its schedule, transmit queue, routing state, and traffic
//! counters. All references to other motes are [`MoteId`]s; cross-mote
//! operations (propagation, cell reservation) live on the simulation,
//! which owns the arena.

use crate::packet::Packet;
use crate::schedule::{Schedule, ScheduleSnapshot};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tschsim_common::{Asn, MoteId};

/// Why an enqueue was refused.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum EnqueueError {
    /// The mote has no preferred parent yet.
    #[error("no preferred parent")]
    NoRoute,
    /// No TX cell to any parent exists.
    #[error("no TX cells to any parent")]
    NoTxCells,
    /// The bounded queue is full.
    #[error("transmit queue full")]
    QueueFull,
}

/// Per-mote counters reported in the run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoteStats {
    /// Application packets generated over the whole run.
    pub app_generated: u64,
    /// Packets generated during the instrumented window.
    pub probe_packets_generated: u64,
    /// Packets received during the instrumented window (root only).
    pub probe_num_packet_received: u64,
    /// Preferred-parent changes, counting the initial selection.
    pub rpl_churn_pref_parent: u64,
    /// Sum of queueing delays of acknowledged packets, slots.
    pub queue_delay_slots: u64,
    /// Acknowledged packets contributing to `queue_delay_slots`.
    pub queue_delay_samples: u64,
}

/// One simulated node.
#[derive(Debug, Clone)]
pub struct Mote {
    /// Identity; 0 is the DAG root.
    pub id: MoteId,
    /// Deployment position, km.
    pub position: (f64, f64),
    /// RPL rank; `None` until the mote joins the DAG. The root is 0.
    pub rank: Option<f64>,
    /// `floor(rank / MIN_HOP_RANK_INCREASE)`.
    pub dag_rank: Option<u16>,
    /// Current preferred parent.
    pub preferred_parent: Option<MoteId>,
    /// Parent set, best first; bounded by `parent_set_size`.
    pub parent_set: Vec<MoteId>,
    /// Last rank advertised by each neighbor.
    pub neighbor_rank: BTreeMap<MoteId, f64>,
    /// Last dagRank advertised by each neighbor.
    pub neighbor_dag_rank: BTreeMap<MoteId, u16>,
    /// DIOs heard per neighbor.
    pub neighbor_dio_count: BTreeMap<MoteId, u32>,
    /// Packets received per sender since the last OTF run; the entry for
    /// `self.id` counts locally generated packets.
    pub in_traffic: BTreeMap<MoteId, u32>,
    /// Exponentially smoothed inbound traffic per sender.
    pub in_traffic_avg: BTreeMap<MoteId, f64>,
    /// Normalized inverse-ETX weight per parent.
    pub traffic_portion: BTreeMap<MoteId, f64>,
    /// Bounded transmit queue.
    pub tx_queue: VecDeque<Packet>,
    /// The cell table.
    pub schedule: Schedule,
    /// Each neighbor's schedule as last gossiped (deBras).
    pub schedule_neighborhood: BTreeMap<MoteId, ScheduleSnapshot>,
    /// TX cells per neighbor (kept in lockstep with the schedule).
    pub cells_to: BTreeMap<MoteId, usize>,
    /// RX cells per neighbor (kept in lockstep with the schedule).
    pub cells_from: BTreeMap<MoteId, usize>,
    /// Clock drift, ppm.
    pub drift_ppm: f64,
    /// ASN of the last resynchronisation with the preferred parent.
    pub time_corrected_slot: Asn,
    /// Charge consumed so far, µC.
    pub charge_uc: f64,
    /// Slotframes to wait before gossiping on the assigned broadcast
    /// cell (deBras).
    pub broadcast_wait: u32,
    /// The broadcast slot this mote gossips on (deBras).
    pub assigned_broadcast_id: Option<u16>,
    /// Per-mote counters.
    pub stats: MoteStats,
}

impl Mote {
    /// A fresh mote; the root starts with rank 0, everyone else
    /// unjoined.
    pub fn new(id: MoteId, position: (f64, f64), drift_ppm: f64) -> Self {
        let (rank, dag_rank) = if id.is_root() {
            (Some(0.0), Some(0))
        } else {
            (None, None)
        };
        Mote {
            id,
            position,
            rank,
            dag_rank,
            preferred_parent: None,
            parent_set: Vec::new(),
            neighbor_rank: BTreeMap::new(),
            neighbor_dag_rank: BTreeMap::new(),
            neighbor_dio_count: BTreeMap::new(),
            in_traffic: BTreeMap::new(),
            in_traffic_avg: BTreeMap::new(),
            traffic_portion: BTreeMap::new(),
            tx_queue: VecDeque::new(),
            schedule: Schedule::new(),
            schedule_neighborhood: BTreeMap::new(),
            cells_to: BTreeMap::new(),
            cells_from: BTreeMap::new(),
            drift_ppm,
            time_corrected_slot: 0,
            charge_uc: 0.0,
            broadcast_wait: 0,
            assigned_broadcast_id: None,
            stats: MoteStats::default(),
        }
    }

    /// Whether a TX cell to any member of the parent set exists.
    pub fn has_tx_cells_to_parents(&self) -> bool {
        self.parent_set
            .iter()
            .any(|p| self.cells_to.get(p).copied().unwrap_or(0) > 0)
    }

    /// Append a packet to the transmit queue, or say why not.
    pub fn enqueue(&mut self, packet: Packet, capacity: usize) -> Result<(), EnqueueError> {
        if self.preferred_parent.is_none() {
            return Err(EnqueueError::NoRoute);
        }
        if !self.has_tx_cells_to_parents() {
            return Err(EnqueueError::NoTxCells);
        }
        if self.tx_queue.len() >= capacity {
            return Err(EnqueueError::QueueFull);
        }
        self.tx_queue.push_back(packet);
        Ok(())
    }

    /// Add `uc` microcoulombs to the charge accumulator.
    #[inline]
    pub fn charge(&mut self, uc: f64) {
        self.charge_uc += uc;
    }

    /// Bump the inbound traffic counter for `sender`.
    pub fn count_inbound(&mut self, sender: MoteId) {
        *self.in_traffic.entry(sender).or_insert(0) += 1;
    }
}
