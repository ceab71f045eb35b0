//! Rank-based DAG maintenance.
//!
//! DIOs are modelled without airtime: once per DIO interval (aligned to
//! slotframe boundaries) every joined mote advertises its rank to all
//! neighbors that can hear it, and each receiver re-evaluates its parent
//! set. Parent churn is damped by a switch threshold, loops are avoided
//! by walking the candidate's parent chain, and per-parent traffic
//! weights follow inverse ETX.

use crate::engine::EventKind;
use crate::schedule::CellDirection;
use crate::sim::Simulation;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};
use tschsim_common::consts::{
    MAX_PARENT_CHAIN_HOPS, NUM_SUFFICIENT_TX, RPL_MAX_RANK_INCREASE, RPL_MAX_TOTAL_RANK,
    RPL_MIN_HOP_RANK_INCREASE, RPL_PARENT_SWITCH_THRESHOLD,
};
use tschsim_common::MoteId;
use tschsim_metrics::{metric_defs, metrics};

#[derive(Debug, Clone, Copy)]
struct ParentCandidate {
    id: MoteId,
    /// Rank this mote would take through the candidate.
    potential_rank: f64,
    /// The candidate's own advertised rank.
    neighbor_rank: f64,
    rank_increase: f64,
}

impl Simulation {
    /// Emit a DIO: advertise rank to every neighbor in range, then let
    /// each receiver re-run parent selection.
    pub(crate) fn rpl_send_dio(&mut self, id: MoteId) {
        let asn = self.asn();
        let next = asn + self.dio_interval_slots();
        self.queue.schedule_at(next, EventKind::Dio(id));

        // A mote with infinite rank does not beacon.
        let Some(rank) = self.motes[id.index()].rank else {
            return;
        };
        let dag_rank = (rank / RPL_MIN_HOP_RANK_INCREASE) as u16;

        let hearers = self.topology.neighbors_of(id);
        for &nb in &hearers {
            let mote = &mut self.motes[nb.index()];
            mote.neighbor_rank.insert(id, rank);
            mote.neighbor_dag_rank.insert(id, dag_rank);
            *mote.neighbor_dio_count.entry(id).or_insert(0) += 1;
            // Hearing the preferred parent resynchronises the clock.
            if mote.preferred_parent == Some(id) {
                mote.time_corrected_slot = asn;
            }
        }
        for &nb in &hearers {
            self.rpl_parent_housekeeping(nb);
        }
    }

    /// ETX of the link `from → to`: observed attempts over all TX cells,
    /// padded with a baseline of `NUM_SUFFICIENT_TX` trials at the
    /// link's static PDR.
    pub(crate) fn link_etx(&self, from: MoteId, to: MoteId) -> f64 {
        let static_pdr = self.topology.pdr(from, to);
        let mote = &self.motes[from.index()];
        let mut tx = 0u64;
        let mut ack = 0u64;
        for (_, cell) in mote.schedule.iter() {
            if cell.direction == CellDirection::Tx && cell.peer.mote() == Some(to) {
                tx += cell.num_tx as u64;
                ack += cell.num_tx_ack as u64;
            }
        }
        let baseline = NUM_SUFFICIENT_TX as f64;
        let estimated_pdr = (ack as f64 + baseline * static_pdr) / (tx as f64 + baseline);
        if estimated_pdr <= 0.0 {
            f64::INFINITY
        } else {
            1.0 / estimated_pdr
        }
    }

    /// Rank increase this mote would incur through `to`.
    pub(crate) fn rank_increase(&self, from: MoteId, to: MoteId) -> f64 {
        2.0 * RPL_MIN_HOP_RANK_INCREASE * self.link_etx(from, to)
    }

    /// Whether choosing `candidate` as parent would close a loop:
    /// its parent chain already passes through `mote`.
    pub(crate) fn creates_loop(&self, mote: MoteId, candidate: MoteId) -> bool {
        let mut current = candidate;
        for _ in 0..MAX_PARENT_CHAIN_HOPS {
            if current == mote {
                return true;
            }
            if current.is_root() {
                return false;
            }
            match self.motes[current.index()].preferred_parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        // Chains this deep do not occur in a consistent DAG.
        true
    }

    /// Re-evaluate rank, preferred parent, parent set, and traffic
    /// portions from the latest neighbor advertisements.
    pub(crate) fn rpl_parent_housekeeping(&mut self, id: MoteId) {
        if id.is_root() {
            return;
        }

        let advertised: Vec<(MoteId, f64)> = self.motes[id.index()]
            .neighbor_rank
            .iter()
            .map(|(&nb, &rank)| (nb, rank))
            .collect();

        let mut candidates = Vec::new();
        for (nb, neighbor_rank) in advertised {
            let rank_increase = self.rank_increase(id, nb);
            if rank_increase > RPL_MAX_RANK_INCREASE {
                continue;
            }
            let potential_rank = neighbor_rank + rank_increase;
            if potential_rank > RPL_MAX_TOTAL_RANK {
                continue;
            }
            if self.creates_loop(id, nb) {
                trace!(mote = %id, candidate = %nb, "parent candidate skipped: loop");
                continue;
            }
            candidates.push(ParentCandidate {
                id: nb,
                potential_rank,
                neighbor_rank,
                rank_increase,
            });
        }
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by(|a, b| {
            a.potential_rank
                .partial_cmp(&b.potential_rank)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        // Hysteresis: keep the incumbent unless the best candidate beats
        // it by the switch threshold.
        let old_pref = self.motes[id.index()].preferred_parent;
        let incumbent = old_pref.and_then(|p| candidates.iter().find(|c| c.id == p).copied());
        let preferred = match incumbent {
            Some(inc) => {
                let best = candidates[0];
                if best.id != inc.id
                    && best.potential_rank + RPL_PARENT_SWITCH_THRESHOLD <= inc.potential_rank
                {
                    best
                } else {
                    inc
                }
            }
            None => candidates[0],
        };
        let new_rank = preferred.potential_rank;

        // Parent set: preferred first, then the next-best candidates
        // whose advertised rank stays below ours.
        let mut parent_set = vec![preferred.id];
        let mut portions_basis = vec![(preferred.id, preferred.neighbor_rank + preferred.rank_increase)];
        for c in &candidates {
            if parent_set.len() >= self.settings.parent_set_size {
                break;
            }
            if c.id == preferred.id || c.neighbor_rank >= new_rank {
                continue;
            }
            parent_set.push(c.id);
            portions_basis.push((c.id, c.neighbor_rank + c.rank_increase));
        }
        let weight_sum: f64 = portions_basis.iter().map(|(_, r)| 1.0 / r).sum();
        let portions: BTreeMap<MoteId, f64> = portions_basis
            .iter()
            .map(|&(p, r)| (p, (1.0 / r) / weight_sum))
            .collect();

        let mote = &mut self.motes[id.index()];
        let rank_changed = mote.rank != Some(new_rank);
        let pref_changed = mote.preferred_parent != Some(preferred.id);
        let old_parents = std::mem::replace(&mut mote.parent_set, parent_set);
        mote.rank = Some(new_rank);
        mote.dag_rank = Some((new_rank / RPL_MIN_HOP_RANK_INCREASE) as u16);
        mote.preferred_parent = Some(preferred.id);
        mote.traffic_portion = portions;
        if rank_changed {
            self.stats.counters.rpl_churn_rank += 1;
        }
        if pref_changed {
            self.motes[id.index()].stats.rpl_churn_pref_parent += 1;
            self.stats.counters.rpl_churn_pref_parent += 1;
            metrics::counter!(metric_defs::RPL_CHURN.name).increment(1);
            debug!(mote = %id, old = ?old_pref, new = %preferred.id, "preferred parent changed");
        }

        // Departed parents keep their TX cells until at least one
        // replacement cell to the new preferred parent exists.
        let departed: Vec<MoteId> = old_parents
            .into_iter()
            .filter(|p| !self.motes[id.index()].parent_set.contains(p))
            .collect();
        if !departed.is_empty() {
            let has_replacement = self.motes[id.index()]
                .cells_to
                .get(&preferred.id)
                .copied()
                .unwrap_or(0)
                > 0;
            if has_replacement {
                for old in departed {
                    let keys = self.motes[id.index()].schedule.tx_cell_keys_to(old);
                    for key in keys {
                        if let Err(e) = self.remove_cell_pair(id, key) {
                            warn!(mote = %id, ?key, error = %e, "stale parent cell removal failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Cell, CellKey, CellPeer};
    use tschsim_model::{Settings, Topology};

    fn sim_with_links(n: u16, links: &[(u16, u16, f64)]) -> Simulation {
        let settings = Settings {
            num_motes: n,
            ..Settings::default()
        };
        let positions = (0..n).map(|i| (i as f64 * 0.2, 0.0)).collect();
        let topology = Topology::from_links(positions, links).unwrap();
        Simulation::new(settings, topology, 5).unwrap()
    }

    #[test]
    fn etx_from_static_pdr_without_observations() {
        let sim = sim_with_links(2, &[(0, 1, -79.0), (1, 0, -79.0)]);
        // Perfect link: ETX 1.
        let etx = sim.link_etx(MoteId(1), MoteId(0));
        assert!((etx - 1.0).abs() < 1e-9);
    }

    #[test]
    fn etx_blends_observations() {
        let mut sim = sim_with_links(2, &[(0, 1, -79.0), (1, 0, -79.0)]);
        let key = CellKey::new(5, 0);
        let mut cell = Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(0)));
        cell.num_tx = 10;
        cell.num_tx_ack = 0;
        sim.motes[1].schedule.add(key, cell).unwrap();
        // (0 + 10*1.0) / (10 + 10) = 0.5 -> ETX 2.
        let etx = sim.link_etx(MoteId(1), MoteId(0));
        assert!((etx - 2.0).abs() < 1e-9);
    }

    #[test]
    fn initial_parent_selection_counts_as_churn() {
        let mut sim = sim_with_links(2, &[(0, 1, -80.0), (1, 0, -80.0)]);
        sim.motes[1].neighbor_rank.insert(MoteId(0), 0.0);
        sim.rpl_parent_housekeeping(MoteId(1));

        let leaf = &sim.motes[1];
        assert_eq!(leaf.preferred_parent, Some(MoteId(0)));
        assert!(leaf.rank.unwrap() > RPL_MIN_HOP_RANK_INCREASE);
        assert_eq!(leaf.stats.rpl_churn_pref_parent, 1);
        assert_eq!(sim.stats.counters.rpl_churn_pref_parent, 1);
        let portion = leaf.traffic_portion[&MoteId(0)];
        assert!((portion - 1.0).abs() < 1e-9);
    }

    #[test]
    fn hysteresis_keeps_slightly_worse_incumbent() {
        let mut sim = sim_with_links(
            3,
            &[
                (0, 2, -80.0),
                (2, 0, -80.0),
                (1, 2, -80.0),
                (2, 1, -80.0),
                (0, 1, -80.0),
                (1, 0, -80.0),
            ],
        );
        // Mote 2 first hears only mote 1 (rank 3100) and adopts it.
        sim.motes[2].neighbor_rank.insert(MoteId(1), 3100.0);
        sim.motes[1].preferred_parent = Some(MoteId(0));
        sim.motes[1].rank = Some(3100.0);
        sim.rpl_parent_housekeeping(MoteId(2));
        assert_eq!(sim.motes[2].preferred_parent, Some(MoteId(1)));

        // The root then advertises rank 3000: better, but within the
        // switch threshold of the incumbent's potential rank.
        sim.motes[2].neighbor_rank.insert(MoteId(0), 3000.0);
        sim.rpl_parent_housekeeping(MoteId(2));
        assert_eq!(sim.motes[2].preferred_parent, Some(MoteId(1)));

        // Far better rank forces the switch.
        sim.motes[2].neighbor_rank.insert(MoteId(0), 0.0);
        sim.rpl_parent_housekeeping(MoteId(2));
        assert_eq!(sim.motes[2].preferred_parent, Some(MoteId(0)));
        assert_eq!(sim.motes[2].stats.rpl_churn_pref_parent, 2);
    }

    #[test]
    fn loop_candidates_are_skipped() {
        let mut sim = sim_with_links(
            3,
            &[
                (0, 1, -80.0),
                (1, 0, -80.0),
                (1, 2, -80.0),
                (2, 1, -80.0),
            ],
        );
        // 2's parent is 1; 1 must not adopt 2.
        sim.motes[2].preferred_parent = Some(MoteId(1));
        assert!(sim.creates_loop(MoteId(1), MoteId(2)));
        assert!(!sim.creates_loop(MoteId(1), MoteId(0)));

        sim.motes[1].neighbor_rank.insert(MoteId(2), 100.0);
        sim.rpl_parent_housekeeping(MoteId(1));
        // The only candidate loops, so nothing is adopted.
        assert_eq!(sim.motes[1].preferred_parent, None);
    }

    #[test]
    fn weak_links_are_discarded() {
        // -96 dBm: static PDR ~0.15, ETX ~6.7, far above the cap.
        let mut sim = sim_with_links(2, &[(0, 1, -96.0), (1, 0, -96.0)]);
        sim.motes[1].neighbor_rank.insert(MoteId(0), 0.0);
        sim.rpl_parent_housekeeping(MoteId(1));
        assert_eq!(sim.motes[1].preferred_parent, None);
        assert_eq!(sim.motes[1].rank, None);
    }

    #[test]
    fn dio_resyncs_children() {
        let mut sim = sim_with_links(2, &[(0, 1, -80.0), (1, 0, -80.0)]);
        sim.motes[1].preferred_parent = Some(MoteId(0));
        sim.motes[1].parent_set = vec![MoteId(0)];
        sim.rpl_send_dio(MoteId(0));
        assert_eq!(sim.motes[1].neighbor_rank.get(&MoteId(0)), Some(&0.0));
        assert_eq!(sim.motes[1].neighbor_dio_count[&MoteId(0)], 1);
    }
}
