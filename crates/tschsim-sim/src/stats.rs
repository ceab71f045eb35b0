//! Run statistics: global counters, per-cycle records, per-mote summary.

use serde::{Deserialize, Serialize};
use tschsim_common::MoteId;

/// Network-wide event counters, cumulative since run start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Application packets generated at sources.
    pub app_generated: u64,
    /// Data packets re-enqueued at relays.
    pub app_relayed: u64,
    /// Data packets delivered to the root.
    pub app_reaches_root: u64,
    /// Enqueue rejected: no preferred parent.
    pub dropped_no_route: u64,
    /// Enqueue rejected: no TX cell to any parent.
    pub dropped_no_tx_cells: u64,
    /// Enqueue rejected: queue at capacity.
    pub dropped_queue_full: u64,
    /// Dropped after exhausting MAC retries.
    pub dropped_mac_retries: u64,
    /// Unicast attempts lost to interference.
    pub drop_by_collision: u64,
    /// Unicast attempts lost to propagation alone.
    pub drop_by_propagation: u64,
    /// Unicast transmission attempts.
    pub num_tx: u64,
    /// Acknowledged unicast attempts.
    pub num_tx_ack: u64,
    /// Unicast frames received.
    pub num_rx: u64,
    /// Gossip broadcasts sent.
    pub tx_broadcast: u64,
    /// Gossip broadcasts received.
    pub rx_broadcast: u64,
    /// Cells added by the OTF controller.
    pub otf_add: u64,
    /// Cells released by the OTF controller.
    pub otf_remove: u64,
    /// Cells relocated by transmitter-side 6top housekeeping.
    pub top_tx_relocated_cells: u64,
    /// Bundle relocations triggered by 6top housekeeping.
    pub top_tx_relocated_bundles: u64,
    /// Cells relocated after receiver-side collision detection.
    pub top_rx_relocated_cells: u64,
    /// Preferred-parent changes (the initial selection counts).
    pub rpl_churn_pref_parent: u64,
    /// Rank changes.
    pub rpl_churn_rank: u64,
}

impl Counters {
    /// Field-wise difference `self − earlier`. Counters are monotone;
    /// `earlier` must be an older snapshot of the same run.
    pub fn since(&self, earlier: &Counters) -> Counters {
        Counters {
            app_generated: self.app_generated - earlier.app_generated,
            app_relayed: self.app_relayed - earlier.app_relayed,
            app_reaches_root: self.app_reaches_root - earlier.app_reaches_root,
            dropped_no_route: self.dropped_no_route - earlier.dropped_no_route,
            dropped_no_tx_cells: self.dropped_no_tx_cells - earlier.dropped_no_tx_cells,
            dropped_queue_full: self.dropped_queue_full - earlier.dropped_queue_full,
            dropped_mac_retries: self.dropped_mac_retries - earlier.dropped_mac_retries,
            drop_by_collision: self.drop_by_collision - earlier.drop_by_collision,
            drop_by_propagation: self.drop_by_propagation - earlier.drop_by_propagation,
            num_tx: self.num_tx - earlier.num_tx,
            num_tx_ack: self.num_tx_ack - earlier.num_tx_ack,
            num_rx: self.num_rx - earlier.num_rx,
            tx_broadcast: self.tx_broadcast - earlier.tx_broadcast,
            rx_broadcast: self.rx_broadcast - earlier.rx_broadcast,
            otf_add: self.otf_add - earlier.otf_add,
            otf_remove: self.otf_remove - earlier.otf_remove,
            top_tx_relocated_cells: self.top_tx_relocated_cells - earlier.top_tx_relocated_cells,
            top_tx_relocated_bundles: self.top_tx_relocated_bundles
                - earlier.top_tx_relocated_bundles,
            top_rx_relocated_cells: self.top_rx_relocated_cells - earlier.top_rx_relocated_cells,
            rpl_churn_pref_parent: self.rpl_churn_pref_parent - earlier.rpl_churn_pref_parent,
            rpl_churn_rank: self.rpl_churn_rank - earlier.rpl_churn_rank,
        }
    }
}

/// Counter deltas and gauges for one slotframe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Zero-based cycle index.
    pub cycle: u64,
    /// Counter deltas for this cycle.
    #[serde(flatten)]
    pub counters: Counters,
    /// Mean end-to-end latency of packets delivered this cycle, slots.
    pub mean_latency_slots: Option<f64>,
    /// Mean hop count of packets delivered this cycle.
    pub mean_hops: Option<f64>,
    /// TX cells installed network-wide at cycle end.
    pub used_cells: u64,
    /// Packets queued network-wide at cycle end.
    pub tx_queue_fill: u64,
    /// Charge consumed network-wide during this cycle, µC.
    pub charge_uc: f64,
}

/// Per-mote summary at end of run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoteSummary {
    /// The mote.
    pub id: MoteId,
    /// Packets generated during the instrumented window.
    pub probe_packets_generated: u64,
    /// Packets received during the instrumented window (root only).
    pub probe_num_packet_received: u64,
    /// Application packets generated over the whole run.
    pub app_generated: u64,
    /// Preferred-parent changes at this mote.
    pub rpl_churn_pref_parent: u64,
    /// Final rank, if joined.
    pub rank: Option<f64>,
    /// Final preferred parent.
    pub preferred_parent: Option<MoteId>,
    /// TX cells at end of run.
    pub tx_cells: u64,
    /// RX cells at end of run.
    pub rx_cells: u64,
    /// SHARED cells at end of run.
    pub shared_cells: u64,
    /// Packets still queued at end of run.
    pub queue_fill: u64,
    /// Charge consumed, µC.
    pub charge_uc: f64,
}

/// Complete result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Seed used for this run.
    pub seed: u64,
    /// Final ASN.
    pub final_asn: u64,
    /// Cumulative counters.
    pub totals: Counters,
    /// Mean end-to-end latency over the whole run, slots.
    pub mean_latency_slots: Option<f64>,
    /// Mean hop count over the whole run.
    pub mean_hops: Option<f64>,
    /// Per-cycle records.
    pub cycles: Vec<CycleRecord>,
    /// Per-mote summaries, id-ascending.
    pub motes: Vec<MoteSummary>,
}

/// Mutable statistics state carried by a running simulation.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Cumulative counters.
    pub counters: Counters,
    /// Latencies (slots) of every packet delivered to the root.
    pub latencies: Vec<u64>,
    /// Hop counts of every packet delivered to the root.
    pub hops: Vec<u8>,
    /// Finished per-cycle records.
    pub cycles: Vec<CycleRecord>,
    // Snapshots at the previous cycle boundary.
    counters_at_cycle_start: Counters,
    latency_mark: usize,
    hops_mark: usize,
    charge_mark: f64,
}

impl RunStats {
    /// Close the current cycle: compute deltas since the last boundary
    /// and append a record.
    pub fn close_cycle(
        &mut self,
        cycle: u64,
        used_cells: u64,
        tx_queue_fill: u64,
        total_charge_uc: f64,
    ) {
        let delta = self.counters.since(&self.counters_at_cycle_start);
        let latencies = &self.latencies[self.latency_mark..];
        let hops = &self.hops[self.hops_mark..];
        let mean_latency_slots = mean_u64(latencies);
        let mean_hops = mean_u8(hops);
        self.cycles.push(CycleRecord {
            cycle,
            counters: delta,
            mean_latency_slots,
            mean_hops,
            used_cells,
            tx_queue_fill,
            charge_uc: total_charge_uc - self.charge_mark,
        });
        self.counters_at_cycle_start = self.counters.clone();
        self.latency_mark = self.latencies.len();
        self.hops_mark = self.hops.len();
        self.charge_mark = total_charge_uc;
    }

    /// Mean latency over the whole run, slots.
    pub fn mean_latency(&self) -> Option<f64> {
        mean_u64(&self.latencies)
    }

    /// Mean hop count over the whole run.
    pub fn mean_hops(&self) -> Option<f64> {
        mean_u8(&self.hops)
    }
}

fn mean_u64(values: &[u64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<u64>() as f64 / values.len() as f64)
    }
}

fn mean_u8(values: &[u8]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().map(|&v| v as u64).sum::<u64>() as f64 / values.len() as f64)
    }
}
