//! Cell-selection policies used by 6top reservations.
//!
//! All four policies start from the slots free in both the requester's
//! and the peer's schedule, shrink that set according to their knowledge
//! of the rest of the network, shuffle what remains, and take a random
//! sample. The centralized policies read every mote's schedule; deBras
//! only what its gossip snapshots revealed.

use crate::schedule::{CellDirection, CellKey};
use crate::sim::Simulation;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use tschsim_common::consts::RX_GUARD_DB;
use tschsim_common::MoteId;
use tschsim_model::SchedulerKind;

impl Simulation {
    /// Pick up to `n` free `(timeslot, channel)` pairs for a new bundle
    /// from `requester` to `peer`, according to the configured policy.
    pub(crate) fn allocate_cells(
        &mut self,
        requester: MoteId,
        peer: MoteId,
        n: usize,
    ) -> Vec<CellKey> {
        if n == 0 {
            return Vec::new();
        }
        let free = self.free_in_both(requester, peer);
        match self.settings.scheduler {
            SchedulerKind::Random => self.sample(free, n),
            SchedulerKind::Centralized => {
                let used = self.network_used_keys();
                let candidates: Vec<CellKey> =
                    free.into_iter().filter(|k| !used.contains(k)).collect();
                self.sample(candidates, n)
            }
            SchedulerKind::CentralizedOptimized => {
                let blocked = self.interference_blocked_keys(requester, peer);
                self.sample_with_fallback(free, &blocked, n)
            }
            SchedulerKind::DeBras => {
                let blocked = self.gossip_blocked_keys(requester, peer);
                self.sample_with_fallback(free, &blocked, n)
            }
        }
    }

    /// Keys free in both schedules, timeslot-major.
    fn free_in_both(&self, a: MoteId, b: MoteId) -> Vec<CellKey> {
        let mut free = Vec::new();
        for slot in 0..self.settings.slotframe_length {
            for channel in 0..self.settings.num_chans {
                let key = CellKey::new(slot, channel);
                if self.motes[a.index()].schedule.is_free(key)
                    && self.motes[b.index()].schedule.is_free(key)
                {
                    free.push(key);
                }
            }
        }
        free
    }

    /// Every key in use anywhere in the network, plus the reserved
    /// bootstrap slot (0, 0).
    fn network_used_keys(&self) -> BTreeSet<CellKey> {
        let mut used = BTreeSet::new();
        used.insert(CellKey::new(0, 0));
        for mote in &self.motes {
            for (key, _) in mote.schedule.iter() {
                used.insert(*key);
            }
        }
        used
    }

    /// Keys where a third mote's cell could mutually interfere with the
    /// new `requester → peer` pair, judged with an 8 dB guard around the
    /// sensitivity floor. A transmitting third party blocks the key in
    /// both directions; a listening one only when the requester's signal
    /// can reach it.
    fn interference_blocked_keys(&self, requester: MoteId, peer: MoteId) -> BTreeSet<CellKey> {
        let mut blocked = BTreeSet::new();
        for mote in &self.motes {
            if mote.id == requester || mote.id == peer {
                continue;
            }
            for (key, cell) in mote.schedule.iter() {
                if self.cell_conflicts(mote.id, cell.direction, requester, peer) {
                    blocked.insert(*key);
                }
            }
        }
        blocked
    }

    /// Like [`Self::interference_blocked_keys`], but judged only from
    /// the requester's gossip snapshots of its neighbors' schedules.
    fn gossip_blocked_keys(&self, requester: MoteId, peer: MoteId) -> BTreeSet<CellKey> {
        let mut blocked = BTreeSet::new();
        for (&owner, snapshot) in &self.motes[requester.index()].schedule_neighborhood {
            if owner == requester || owner == peer {
                continue;
            }
            for cell in &snapshot.cells {
                if self.cell_conflicts(owner, cell.direction, requester, peer) {
                    blocked.insert(cell.key);
                }
            }
        }
        blocked
    }

    fn cell_conflicts(
        &self,
        third: MoteId,
        direction: CellDirection,
        requester: MoteId,
        peer: MoteId,
    ) -> bool {
        let audible = |from: MoteId, to: MoteId| {
            matches!(
                self.topology.rssi(from, to),
                Some(rssi) if rssi + RX_GUARD_DB > self.settings.min_rssi
            )
        };
        match direction {
            // The third party transmits there: it can jam our receiver,
            // and our transmission can jam whoever listens to it.
            CellDirection::Tx | CellDirection::Shared => {
                audible(third, peer) || audible(third, requester)
            }
            // The third party listens there: only our transmitter can
            // disturb it.
            CellDirection::Rx => audible(requester, third),
        }
    }

    fn sample(&mut self, mut candidates: Vec<CellKey>, n: usize) -> Vec<CellKey> {
        candidates.shuffle(&mut self.rng);
        candidates.truncate(n);
        candidates
    }

    /// Prefer unblocked keys; on shortfall fall back to random picks
    /// from the blocked remainder.
    fn sample_with_fallback(
        &mut self,
        free: Vec<CellKey>,
        blocked: &BTreeSet<CellKey>,
        n: usize,
    ) -> Vec<CellKey> {
        let (preferred, remainder): (Vec<CellKey>, Vec<CellKey>) =
            free.into_iter().partition(|k| !blocked.contains(k));
        let mut picked = self.sample(preferred, n);
        if picked.len() < n {
            let extra = self.sample(remainder, n - picked.len());
            picked.extend(extra);
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Cell, CellPeer};
    use tschsim_model::{Settings, Topology};

    fn sim(scheduler: SchedulerKind, n: u16, links: &[(u16, u16, f64)]) -> Simulation {
        let settings = Settings {
            num_motes: n,
            scheduler,
            num_chans: 4,
            slotframe_length: 11,
            ..Settings::default()
        };
        let positions = (0..n).map(|i| (i as f64 * 0.2, 0.0)).collect();
        let topology = Topology::from_links(positions, links).unwrap();
        Simulation::new(settings, topology, 5).unwrap()
    }

    fn full_mesh_links(n: u16, rssi: f64) -> Vec<(u16, u16, f64)> {
        let mut links = Vec::new();
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    links.push((i, j, rssi));
                }
            }
        }
        links
    }

    #[test]
    fn random_policy_avoids_occupied_ends() {
        let mut s = sim(SchedulerKind::Random, 2, &full_mesh_links(2, -80.0));
        let key = CellKey::new(3, 1);
        s.motes[0]
            .schedule
            .add(key, Cell::new(CellDirection::Rx, CellPeer::Mote(MoteId(1))))
            .unwrap();
        for _ in 0..10 {
            let picked = s.allocate_cells(MoteId(1), MoteId(0), 4);
            assert!(!picked.contains(&key));
            assert_eq!(picked.len(), 4);
        }
    }

    #[test]
    fn centralized_policy_avoids_everyone() {
        let mut s = sim(SchedulerKind::Centralized, 3, &full_mesh_links(3, -80.0));
        let taken = CellKey::new(5, 2);
        s.motes[2]
            .schedule
            .add(taken, Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(0))))
            .unwrap();
        // 11 slots x 4 channels minus (0,0) minus the third mote's cell.
        let picked = s.allocate_cells(MoteId(1), MoteId(0), 11 * 4);
        assert_eq!(picked.len(), 11 * 4 - 2);
        assert!(!picked.contains(&taken));
        assert!(!picked.contains(&CellKey::new(0, 0)));
    }

    #[test]
    fn optimized_policy_blocks_only_reachable_interferers() {
        // Mote 2 is close enough to interfere; mote 3 is out of range of
        // both ends.
        let mut links = vec![
            (0, 1, -80.0),
            (1, 0, -80.0),
            (2, 0, -85.0),
            (0, 2, -85.0),
            (2, 1, -85.0),
            (1, 2, -85.0),
        ];
        links.extend([(3, 2, -85.0), (2, 3, -85.0)]);
        let mut s = sim(SchedulerKind::CentralizedOptimized, 4, &links);
        let near = CellKey::new(5, 2);
        let far = CellKey::new(7, 3);
        s.motes[2]
            .schedule
            .add(near, Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(3))))
            .unwrap();
        s.motes[3]
            .schedule
            .add(far, Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(2))))
            .unwrap();

        let blocked = s.interference_blocked_keys(MoteId(1), MoteId(0));
        assert!(blocked.contains(&near));
        assert!(!blocked.contains(&far));
    }

    #[test]
    fn optimized_policy_falls_back_on_shortfall() {
        let mut s = sim(
            SchedulerKind::CentralizedOptimized,
            3,
            &full_mesh_links(3, -80.0),
        );
        // The third mote transmits on every key: everything is blocked.
        for slot in 0..11u16 {
            for channel in 0..4u8 {
                s.motes[2]
                    .schedule
                    .add(
                        CellKey::new(slot, channel),
                        Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(0))),
                    )
                    .unwrap();
            }
        }
        let picked = s.allocate_cells(MoteId(1), MoteId(0), 3);
        assert_eq!(picked.len(), 3, "fallback must cover the shortfall");
    }

    #[test]
    fn debras_uses_gossip_knowledge_only() {
        let mut s = sim(SchedulerKind::DeBras, 3, &full_mesh_links(3, -80.0));
        let taken = CellKey::new(5, 2);
        s.motes[2]
            .schedule
            .add(taken, Cell::new(CellDirection::Tx, CellPeer::Mote(MoteId(0))))
            .unwrap();

        // Without gossip, mote 1 cannot know about the conflict.
        assert!(s.gossip_blocked_keys(MoteId(1), MoteId(0)).is_empty());

        // After hearing mote 2's schedule, the key is avoided.
        let snapshot = s.motes[2].schedule.snapshot(0);
        s.motes[1].schedule_neighborhood.insert(MoteId(2), snapshot);
        let blocked = s.gossip_blocked_keys(MoteId(1), MoteId(0));
        assert!(blocked.contains(&taken));
    }
}
