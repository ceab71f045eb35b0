//! Slot activation and radio callbacks.
//!
//! At every ASN matching one of its cells' timeslots, a mote activates
//! (priority 0): SHARED cells run the gossip window protocol, RX cells
//! register listeners, TX cells pop distinct queue heads per channel.
//! After resolution (priority 1) the outcome handlers below apply MAC
//! accounting, retries, relaying, and charge.

use crate::packet::{Destination, Packet, PacketKind};
use crate::propagation::{Listener, Transmission, TxOutcome};
use crate::schedule::CellDirection;
use crate::sim::{SimError, Simulation};
use crate::EnqueueError;
use tracing::{debug, trace, warn};
use tschsim_common::consts::{
    CHARGE_RX_DATA_TX_ACK_UC, CHARGE_RX_DATA_UC, CHARGE_TX_DATA_RX_ACK_UC, CHARGE_TX_DATA_UC,
    PROBE_WINDOW_END_CYCLE, PROBE_WINDOW_START_CYCLE, SHARED_CELL_QUIET_SLOTFRAMES,
};
use tschsim_common::MoteId;
use tschsim_metrics::{metric_defs, metrics};

impl Simulation {
    /// Activate every cell of `id` scheduled at the current timeslot.
    pub(crate) fn activate_cells(&mut self, id: MoteId) -> Result<(), SimError> {
        let asn = self.asn();
        let slot = (asn % self.settings.slotframe_length as u64) as u16;
        let shared_quiet =
            asn < SHARED_CELL_QUIET_SLOTFRAMES * self.settings.slotframe_length as u64;
        let max_win = self.broadcast_max_win();

        let keys = self.motes[id.index()].schedule.keys_at_slot(slot);
        for key in keys {
            let mote = &mut self.motes[id.index()];
            let Some(cell) = mote.schedule.get_mut(key) else {
                continue;
            };
            match cell.direction {
                CellDirection::Shared => {
                    if shared_quiet {
                        continue;
                    }
                    let assigned = cell.broadcast_id.is_some()
                        && cell.broadcast_id == mote.assigned_broadcast_id;
                    if assigned && mote.broadcast_wait == 0 {
                        cell.num_tx += 1;
                        cell.waiting_for = Some(CellDirection::Shared);
                        let snapshot = mote.schedule.snapshot(asn);
                        mote.broadcast_wait = max_win.saturating_sub(1);
                        mote.charge(CHARGE_TX_DATA_UC);
                        self.stats.counters.tx_broadcast += 1;
                        self.propagation.start_tx(
                            id,
                            Destination::Broadcast,
                            key.channel,
                            key,
                            Packet {
                                kind: PacketKind::Gossip {
                                    sender: id,
                                    asn,
                                    snapshot,
                                },
                                retries_left: 0,
                                enqueued_asn: asn,
                            },
                        );
                        trace!(mote = %id, slot, channel = key.channel, "gossip broadcast");
                    } else {
                        if assigned {
                            mote.broadcast_wait -= 1;
                        }
                        cell.waiting_for = Some(CellDirection::Shared);
                        self.propagation.start_rx(id, key.channel, key);
                    }
                }
                CellDirection::Rx => {
                    cell.waiting_for = Some(CellDirection::Rx);
                    self.propagation.start_rx(id, key.channel, key);
                }
                CellDirection::Tx => {
                    let Some(dst) = cell.peer.mote() else {
                        continue;
                    };
                    if let Some(packet) = mote.tx_queue.pop_front() {
                        cell.num_tx += 1;
                        cell.waiting_for = Some(CellDirection::Tx);
                        mote.charge(CHARGE_TX_DATA_RX_ACK_UC);
                        self.stats.counters.num_tx += 1;
                        self.propagation.start_tx(
                            id,
                            Destination::Unicast(dst),
                            key.channel,
                            key,
                            packet,
                        );
                    }
                }
            }
        }

        self.reschedule_activation(id);
        Ok(())
    }

    /// Deliver a decoded unicast data frame to its destination; the
    /// return value becomes the transmitter's ack/nack.
    pub(crate) fn deliver_data(
        &mut self,
        ti: usize,
        transmissions: &[Transmission],
        listener: Listener,
    ) -> TxOutcome {
        let sender = transmissions[ti].src;
        let payload = match &transmissions[ti].packet.kind {
            PacketKind::Data(p) => *p,
            _ => return TxOutcome::Failed { collision: false },
        };
        let asn = self.asn();
        let cycle = self.cycle();
        let in_probe_window =
            (PROBE_WINDOW_START_CYCLE..=PROBE_WINDOW_END_CYCLE).contains(&cycle);
        let max_retries = self.settings.max_retries;
        let capacity = self.settings.tx_queue_size;
        let dst = listener.mote;

        let mote = &mut self.motes[dst.index()];
        if let Some(cell) = mote.schedule.get_mut(listener.cell_key) {
            cell.num_rx += 1;
            cell.waiting_for = None;
        }
        mote.charge(CHARGE_RX_DATA_TX_ACK_UC);
        self.stats.counters.num_rx += 1;

        if dst.is_root() {
            let latency = asn - payload.emitted_asn;
            let hops = payload.hops + 1;
            self.stats.latencies.push(latency);
            self.stats.hops.push(hops);
            self.stats.counters.app_reaches_root += 1;
            if in_probe_window {
                mote.stats.probe_num_packet_received += 1;
            }
            metrics::counter!(metric_defs::APP_REACHES_ROOT.name).increment(1);
            metrics::histogram!(metric_defs::APP_LATENCY_SLOTS.name).record(latency as f64);
            metrics::histogram!(metric_defs::APP_HOPS.name).record(hops as f64);
            trace!(source = %payload.source, latency, hops, "data reached root");
            return TxOutcome::Acked;
        }

        // Relay: count the inbound traffic for OTF and forward a copy
        // with the hop count bumped.
        mote.count_inbound(sender);
        match mote.enqueue(Packet::relay(payload, asn, max_retries), capacity) {
            Ok(()) => {
                self.stats.counters.app_relayed += 1;
                TxOutcome::Acked
            }
            Err(EnqueueError::QueueFull) => {
                self.stats.counters.dropped_queue_full += 1;
                metrics::counter!(metric_defs::MAC_DROPPED_ENQUEUE.name).increment(1);
                TxOutcome::Nacked
            }
            Err(EnqueueError::NoTxCells) => {
                self.stats.counters.dropped_no_tx_cells += 1;
                metrics::counter!(metric_defs::MAC_DROPPED_ENQUEUE.name).increment(1);
                TxOutcome::Acked
            }
            Err(EnqueueError::NoRoute) => {
                // Should not happen once the DAG has formed; drop rather
                // than abort the run.
                warn!(mote = %dst, "relay has no route; dropping packet");
                self.stats.counters.dropped_no_route += 1;
                metrics::counter!(metric_defs::MAC_DROPPED_ENQUEUE.name).increment(1);
                TxOutcome::Acked
            }
        }
    }

    /// Deliver a decoded gossip broadcast: store the sender's snapshot.
    pub(crate) fn deliver_gossip(
        &mut self,
        ti: usize,
        transmissions: &[Transmission],
        listener: Listener,
    ) {
        let (sender, snapshot) = match &transmissions[ti].packet.kind {
            PacketKind::Gossip {
                sender, snapshot, ..
            } => (*sender, snapshot.clone()),
            _ => return,
        };
        let mote = &mut self.motes[listener.mote.index()];
        if let Some(cell) = mote.schedule.get_mut(listener.cell_key) {
            cell.num_rx += 1;
            cell.waiting_for = None;
        }
        mote.charge(CHARGE_RX_DATA_UC);
        // Last received wins; no staleness reconciliation.
        mote.schedule_neighborhood.insert(sender, snapshot);
        self.stats.counters.rx_broadcast += 1;
    }

    /// Apply each transmitter's outcome exactly once: ack accounting,
    /// retry bookkeeping, and re-queueing of unacknowledged packets.
    pub(crate) fn finish_transmissions(
        &mut self,
        transmissions: Vec<Transmission>,
        outcomes: &[TxOutcome],
    ) {
        let asn = self.asn();
        let mut requeue: Vec<(MoteId, Packet)> = Vec::new();

        for (ti, t) in transmissions.into_iter().enumerate() {
            if matches!(t.packet.kind, PacketKind::Gossip { .. }) {
                // Broadcasts carry no feedback; the cell counter was
                // already bumped at activation.
                continue;
            }
            let src = t.src;
            let dst = match t.dest {
                Destination::Unicast(dst) => dst,
                Destination::Broadcast => continue,
            };
            let preferred = self.motes[src.index()].preferred_parent;
            let mote = &mut self.motes[src.index()];
            match outcomes[ti] {
                TxOutcome::Acked | TxOutcome::Nacked => {
                    // A nack (receiver queue full) still counts as an ack
                    // in the link statistics; only the payload is lost.
                    if let Some(cell) = mote.schedule.get_mut(t.cell_key) {
                        cell.num_tx_ack += 1;
                        cell.record_attempt(true);
                        cell.waiting_for = None;
                    }
                    self.stats.counters.num_tx_ack += 1;
                    mote.stats.queue_delay_slots += asn - t.packet.enqueued_asn;
                    mote.stats.queue_delay_samples += 1;
                    if preferred == Some(dst) {
                        mote.time_corrected_slot = asn;
                    }
                }
                TxOutcome::Failed { collision } => {
                    if let Some(cell) = mote.schedule.get_mut(t.cell_key) {
                        cell.record_attempt(false);
                        cell.waiting_for = None;
                    }
                    if collision {
                        self.stats.counters.drop_by_collision += 1;
                        metrics::counter!(metric_defs::PHY_DROP_COLLISION.name).increment(1);
                    } else {
                        self.stats.counters.drop_by_propagation += 1;
                        metrics::counter!(metric_defs::PHY_DROP_PROPAGATION.name).increment(1);
                    }
                    let mut packet = t.packet;
                    packet.retries_left = packet.retries_left.saturating_sub(1);
                    if packet.retries_left == 0 {
                        self.stats.counters.dropped_mac_retries += 1;
                        metrics::counter!(metric_defs::MAC_DROPPED_RETRIES.name).increment(1);
                        debug!(mote = %src, to = %dst, "packet dropped: retries exhausted");
                    } else {
                        requeue.push((src, packet));
                    }
                }
                TxOutcome::BroadcastDone => {}
            }
        }

        // Reinsert at the queue head in original order.
        for (src, packet) in requeue.into_iter().rev() {
            self.motes[src.index()].tx_queue.push_front(packet);
        }
    }

    /// Drop a freshly generated packet that could not be enqueued.
    pub(crate) fn count_enqueue_drop(&mut self, mote: MoteId, err: EnqueueError) {
        match err {
            EnqueueError::NoRoute => {
                warn!(mote = %mote, "no route at enqueue; packet dropped");
                self.stats.counters.dropped_no_route += 1;
            }
            EnqueueError::NoTxCells => self.stats.counters.dropped_no_tx_cells += 1,
            EnqueueError::QueueFull => self.stats.counters.dropped_queue_full += 1,
        }
        metrics::counter!(metric_defs::MAC_DROPPED_ENQUEUE.name).increment(1);
    }
}
