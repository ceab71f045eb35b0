//! 6top: cell reservation, deletion, and health-driven relocation.
//!
//! Reservations install symmetric pairs (TX on the requester, RX on the
//! peer) in a single callback, so both schedules change atomically with
//! respect to other events. Housekeeping relocates cells whose measured
//! PDR falls behind the rest of their bundle or behind the link's
//! theoretical PDR, and receiver-side housekeeping replaces cells whose
//! owner detected collisions. New cells are always added before old ones
//! are deleted; a reservation shortfall aborts the deletion.

use crate::engine::EventKind;
use crate::schedule::{Cell, CellDirection, CellKey, CellPeer};
use crate::sim::{SimError, Simulation};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};
use tschsim_common::consts::CELL_PDR_MIN_TX;
use tschsim_common::MoteId;
use tschsim_metrics::{metric_defs, metrics};

impl Simulation {
    /// Reserve up to `n` cells from `requester` to `peer`; returns how
    /// many were actually installed. Public so embedders can pre-install
    /// bundles before a run.
    pub fn sixtop_reserve(
        &mut self,
        requester: MoteId,
        peer: MoteId,
        n: usize,
    ) -> Result<usize, SimError> {
        if n == 0 || requester == peer {
            return Ok(0);
        }
        let keys = self.allocate_cells(requester, peer, n);
        for &key in &keys {
            let (req, rx) = self.pair_mut(requester, peer);
            req.schedule
                .add(key, Cell::new(CellDirection::Tx, CellPeer::Mote(peer)))?;
            rx.schedule
                .add(key, Cell::new(CellDirection::Rx, CellPeer::Mote(requester)))?;
            *req.cells_to.entry(peer).or_insert(0) += 1;
            *rx.cells_from.entry(requester).or_insert(0) += 1;
        }
        if !keys.is_empty() {
            debug!(
                from = %requester,
                to = %peer,
                granted = keys.len(),
                asked = n,
                "cells reserved"
            );
            self.reschedule_activation(requester);
            self.reschedule_activation(peer);
        }
        Ok(keys.len())
    }

    /// Remove the cell at `key` on `owner` together with its mirror on
    /// the bound peer.
    pub fn remove_cell_pair(&mut self, owner: MoteId, key: CellKey) -> Result<(), SimError> {
        let (direction, peer) = {
            let cell = self.motes[owner.index()]
                .schedule
                .get(key)
                .ok_or(crate::schedule::ScheduleError::MissingCell { key })?;
            (cell.direction, cell.peer)
        };
        let Some(peer) = peer.mote() else {
            // SHARED cells are never deleted; remove() below would refuse
            // anyway, but the pairing logic needs a unicast peer.
            return Err(crate::schedule::ScheduleError::SharedCellRemoval { key }.into());
        };

        let (own, other) = self.pair_mut(owner, peer);
        own.schedule.remove(key)?;
        match other.schedule.remove(key) {
            Ok(_) => {}
            Err(e) => warn!(owner = %owner, peer = %peer, ?key, error = %e, "unpaired cell removal"),
        }
        match direction {
            CellDirection::Tx => {
                decrement(&mut own.cells_to, peer);
                decrement(&mut other.cells_from, owner);
            }
            CellDirection::Rx => {
                decrement(&mut own.cells_from, peer);
                decrement(&mut other.cells_to, owner);
            }
            CellDirection::Shared => unreachable!("shared cells are filtered above"),
        }
        self.reschedule_activation(owner);
        self.reschedule_activation(peer);
        Ok(())
    }

    /// Remove `k` TX cells from `owner` to `peer`, worst candidates
    /// first; returns how many were removed.
    pub(crate) fn sixtop_remove_worst(
        &mut self,
        owner: MoteId,
        peer: MoteId,
        k: usize,
    ) -> Result<usize, SimError> {
        let keys = self.select_cells_for_removal(owner, peer, k);
        for &key in &keys {
            self.remove_cell_pair(owner, key)?;
        }
        Ok(keys.len())
    }

    /// Pick up to `k` TX cells to `peer` for removal. Each cell gets a
    /// weighted PDR `(acks + static_pdr·10) / (attempts + 10)`; after a
    /// shuffle, cells measuring worse than the theoretical PDR come
    /// first ordered by descending ack count (prefer removing cells that
    /// were given a fair chance), the rest by ascending ack count.
    fn select_cells_for_removal(&mut self, owner: MoteId, peer: MoteId, k: usize) -> Vec<CellKey> {
        let theoretical = self.topology.pdr(owner, peer);
        let baseline = CELL_PDR_MIN_TX as f64;
        let mut entries: Vec<(CellKey, f64, u32)> = self.motes[owner.index()]
            .schedule
            .tx_cell_keys_to(peer)
            .into_iter()
            .filter_map(|key| {
                self.motes[owner.index()].schedule.get(key).map(|cell| {
                    let weighted = (cell.num_tx_ack as f64 + theoretical * baseline)
                        / (cell.num_tx as f64 + baseline);
                    (key, weighted, cell.num_tx_ack)
                })
            })
            .collect();
        entries.shuffle(&mut self.rng);
        if !self.settings.sixtop_no_remove_worst_cell {
            let (mut worse, mut rest): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|&(_, w, _)| w < theoretical);
            worse.sort_by(|a, b| b.2.cmp(&a.2));
            rest.sort_by(|a, b| a.2.cmp(&b.2));
            worse.extend(rest);
            entries = worse;
        }
        entries.into_iter().take(k).map(|(key, _, _)| key).collect()
    }

    /// One 6top housekeeping pass for `id`; reschedules itself.
    pub(crate) fn sixtop_housekeeping(&mut self, id: MoteId) -> Result<(), SimError> {
        let jitter = 0.9 + self.rng.gen_range(0.0..0.2);
        let next = self.asn_after(self.settings.sixtop_housekeeping_period * jitter);
        self.queue.schedule_at(next, EventKind::SixtopHousekeeping(id));

        if self.settings.sixtop_no_housekeeping {
            return Ok(());
        }
        self.sixtop_tx_housekeeping(id)?;
        self.sixtop_rx_housekeeping(id)?;
        Ok(())
    }

    /// Transmitter-side relocation: worst cell of a bundle, then the
    /// bundle as a whole against the theoretical link PDR.
    fn sixtop_tx_housekeeping(&mut self, id: MoteId) -> Result<(), SimError> {
        let threshold = self.settings.sixtop_pdr_threshold;
        let neighbors: Vec<MoteId> = self.motes[id.index()]
            .cells_to
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&nb, _)| nb)
            .collect();

        for nb in neighbors {
            let keys = self.motes[id.index()].schedule.tx_cell_keys_to(nb);
            let mut measured: Vec<(CellKey, f64)> = Vec::new();
            let mut bundle_attempts = 0u64;
            let mut bundle_history_len = 0usize;
            let mut bundle_history_acks = 0usize;
            for &key in &keys {
                let Some(cell) = self.motes[id.index()].schedule.get(key) else {
                    continue;
                };
                bundle_attempts += cell.num_tx as u64;
                bundle_history_len += cell.history.len();
                bundle_history_acks += cell.history.iter().filter(|&&a| a).count();
                if cell.num_tx >= CELL_PDR_MIN_TX {
                    if let Some(pdr) = cell.measured_pdr() {
                        measured.push((key, pdr));
                    }
                }
            }

            let mut relocated = false;
            let worst = if measured.len() >= 2 {
                measured
                    .iter()
                    .copied()
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            } else {
                None
            };
            if let Some((worst_key, worst_pdr)) = worst {
                let rest_sum: f64 = measured
                    .iter()
                    .filter(|&&(k, _)| k != worst_key)
                    .map(|&(_, p)| p)
                    .sum();
                let rest_avg = rest_sum / (measured.len() - 1) as f64;
                let triggered = if worst_pdr <= 0.0 {
                    rest_avg > 0.0
                } else {
                    rest_avg / worst_pdr >= threshold
                };
                if triggered && self.sixtop_reserve(id, nb, 1)? > 0 {
                    self.remove_cell_pair(id, worst_key)?;
                    self.stats.counters.top_tx_relocated_cells += 1;
                    metrics::counter!(metric_defs::SIXTOP_TX_RELOCATED.name).increment(1);
                    debug!(mote = %id, to = %nb, ?worst_key, "worst cell relocated");
                    relocated = true;
                }
            }

            if !relocated && bundle_attempts >= CELL_PDR_MIN_TX as u64 && bundle_history_len > 0 {
                let bundle_pdr = bundle_history_acks as f64 / bundle_history_len as f64;
                let theoretical = self.topology.pdr(id, nb);
                let triggered = if bundle_pdr <= 0.0 {
                    theoretical > 0.0
                } else {
                    theoretical / bundle_pdr >= threshold
                };
                if triggered {
                    self.stats.counters.top_tx_relocated_bundles += 1;
                    debug!(mote = %id, to = %nb, cells = keys.len(), "bundle relocation");
                    for key in keys {
                        if self.sixtop_reserve(id, nb, 1)? > 0 {
                            self.remove_cell_pair(id, key)?;
                            self.stats.counters.top_tx_relocated_cells += 1;
                            metrics::counter!(metric_defs::SIXTOP_TX_RELOCATED.name).increment(1);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Receiver-side relocation: cells that detected a collision ask the
    /// sender to reserve a replacement; only then is the old cell
    /// deleted.
    fn sixtop_rx_housekeeping(&mut self, id: MoteId) -> Result<(), SimError> {
        let colliding: Vec<(CellKey, MoteId)> = self.motes[id.index()]
            .schedule
            .iter()
            .filter(|(_, c)| c.direction == CellDirection::Rx && c.rx_detected_collision)
            .filter_map(|(&key, c)| c.peer.mote().map(|sender| (key, sender)))
            .collect();

        for (key, sender) in colliding {
            if let Some(cell) = self.motes[id.index()].schedule.get_mut(key) {
                cell.rx_detected_collision = false;
            }
            if self.sixtop_reserve(sender, id, 1)? > 0 {
                self.remove_cell_pair(id, key)?;
                self.stats.counters.top_rx_relocated_cells += 1;
                metrics::counter!(metric_defs::SIXTOP_RX_RELOCATED.name).increment(1);
                debug!(mote = %id, from = %sender, ?key, "colliding RX cell relocated");
            }
        }
        Ok(())
    }
}

fn decrement(map: &mut std::collections::BTreeMap<MoteId, usize>, key: MoteId) {
    if let Some(count) = map.get_mut(&key) {
        *count = count.saturating_sub(1);
    }
}
