//! End-to-end scenario tests.
//!
//! Each scenario builds a small network, runs it to completion, and
//! checks externally observable behavior plus the structural invariants
//! every run must maintain (schedule pairing, counter consistency, rank
//! monotonicity, acyclic parent graph).

use std::collections::HashMap;
use tschsim_common::consts::RPL_MIN_HOP_RANK_INCREASE;
use tschsim_common::MoteId;
use tschsim_model::{SchedulerKind, Settings, Topology};
use tschsim_sim::{CellDirection, CellKey, CellPeer, Simulation};

/// Common scenario settings: 10 ms slots, 101-slot frames, 4 channels.
fn base_settings() -> Settings {
    Settings {
        num_chans: 4,
        slot_duration: 0.01,
        slotframe_length: 101,
        min_rssi: -97.0,
        seed: 5,
        ..Settings::default()
    }
}

/// Structural invariants that must hold in any finished run.
fn check_invariants(sim: &Simulation) {
    for mote in &sim.motes {
        for (key, cell) in mote.schedule.iter() {
            // History ring and ack counters stay bounded.
            assert!(cell.history.len() <= 32);
            assert!(cell.num_tx_ack <= cell.num_tx, "{}: acks exceed attempts", mote.id);

            // Every unicast cell has its mirror on the peer.
            match (cell.direction, cell.peer) {
                (CellDirection::Tx, CellPeer::Mote(peer)) => {
                    let mirror = sim.motes[peer.index()].schedule.get(*key);
                    match mirror {
                        Some(m) => {
                            assert_eq!(m.direction, CellDirection::Rx);
                            assert_eq!(m.peer, CellPeer::Mote(mote.id));
                        }
                        None => panic!("{}: TX cell {:?} has no RX mirror on {}", mote.id, key, peer),
                    }
                }
                (CellDirection::Rx, CellPeer::Mote(peer)) => {
                    assert!(sim.motes[peer.index()].schedule.get(*key).is_some());
                }
                (CellDirection::Shared, CellPeer::Broadcast) => {}
                (direction, peer) => panic!("{}: bad cell shape {:?}/{:?}", mote.id, direction, peer),
            }
        }

        // Cell-count maps agree with the schedule.
        for (&peer, &count) in &mote.cells_to {
            assert_eq!(mote.schedule.tx_cell_keys_to(peer).len(), count, "{}", mote.id);
        }

        // Rank grows along the DAG and parent chains reach the root.
        if let (Some(rank), Some(parent)) = (mote.rank, mote.preferred_parent) {
            let parent_rank = sim.motes[parent.index()].rank.expect("parent joined");
            assert!(
                rank > parent_rank + RPL_MIN_HOP_RANK_INCREASE,
                "{}: rank {} vs parent {}",
                mote.id,
                rank,
                parent_rank
            );
            let mut current = mote.id;
            let mut hops = 0;
            while !current.is_root() {
                current = sim.motes[current.index()]
                    .preferred_parent
                    .expect("chain reaches root");
                hops += 1;
                assert!(hops <= 30, "parent chain from {} too deep", mote.id);
            }
        }
    }
}

fn full_mesh(n: u16, rssi: f64) -> Topology {
    let positions = (0..n).map(|i| (0.1 * i as f64, 0.0)).collect();
    let mut links = Vec::new();
    for i in 0..n {
        for j in 0..n {
            if i != j {
                links.push((i, j, rssi));
            }
        }
    }
    Topology::from_links(positions, &links).unwrap()
}

/// Two motes, one good link: the leaf's traffic reaches the root, and
/// the only parent choice ever made is the initial one.
#[test]
fn s1_two_mote_delivery() {
    let settings = Settings {
        num_motes: 2,
        pk_period: 1.0,
        scheduler: SchedulerKind::Random,
        num_cycles_per_run: 100,
        ..base_settings()
    };
    let topology = Topology::from_links(
        vec![(0.0, 0.0), (0.3, 0.0)],
        &[(0, 1, -80.0), (1, 0, -80.0)],
    )
    .unwrap();

    let mut sim = Simulation::new(settings, topology, 5).unwrap();
    let report = sim.run().unwrap();

    let leaf = &report.motes[1];
    let root = &report.motes[0];
    assert!(
        leaf.app_generated >= 90,
        "leaf generated only {} packets",
        leaf.app_generated
    );
    assert!(
        (20..=40).contains(&root.probe_num_packet_received),
        "root received {} probe packets",
        root.probe_num_packet_received
    );
    assert_eq!(leaf.rpl_churn_pref_parent, 1, "only the initial selection");
    assert_eq!(leaf.preferred_parent, Some(MoteId(0)));

    // Delivered latency is measured in slots from emission to delivery.
    assert!(report.mean_latency_slots.unwrap() > 0.0);
    assert!(report.totals.app_reaches_root > 0);
    check_invariants(&sim);
}

/// Linear chain under the centralized no-overlap allocator: bundles grow
/// with subtree size and no `(ts, ch)` is used by more than one pair.
#[test]
fn s2_chain_centralized_no_overlap() {
    let settings = Settings {
        num_motes: 5,
        scheduler: SchedulerKind::Centralized,
        pk_period: 1.0,
        // End exactly at the warm-down boundary so bundles are still
        // sized to live traffic when inspected.
        num_cycles_per_run: 96,
        ..base_settings()
    };
    let positions = (0..5).map(|i| (0.2 * i as f64, 0.0)).collect();
    let mut links = Vec::new();
    for i in 0..4u16 {
        links.push((i, i + 1, -80.0));
        links.push((i + 1, i, -80.0));
    }
    let topology = Topology::from_links(positions, &links).unwrap();

    let mut sim = Simulation::new(settings, topology, 5).unwrap();
    let report = sim.run().unwrap();

    // The chain forms: each mote's parent is its predecessor.
    for id in 1..5usize {
        assert_eq!(
            sim.motes[id].preferred_parent,
            Some(MoteId(id as u16 - 1)),
            "mote {id} picked the wrong parent"
        );
    }

    // Bundles at least cover the subtree draining through each mote.
    for id in 1..5usize {
        let subtree = 5 - id as u64;
        assert!(
            report.motes[id].tx_cells >= subtree,
            "mote {id} has {} TX cells for a subtree of {subtree}",
            report.motes[id].tx_cells
        );
    }

    // Global no-overlap: every key is owned by exactly one TX/RX pair,
    // and the bootstrap slot stays clear.
    let mut users: HashMap<CellKey, Vec<MoteId>> = HashMap::new();
    for mote in &sim.motes {
        for (key, _) in mote.schedule.iter() {
            users.entry(*key).or_default().push(mote.id);
        }
    }
    assert!(!users.contains_key(&CellKey::new(0, 0)));
    for (key, motes) in &users {
        assert_eq!(motes.len(), 2, "key {key:?} shared by {motes:?}");
    }

    assert!(report.mean_hops.unwrap() > 1.0, "multi-hop traffic expected");
    check_invariants(&sim);
}

/// deBras gossip: after enough slotframes every mote has heard every
/// in-range neighbor's schedule at least once.
#[test]
fn s3_debras_gossip_coverage() {
    let settings = Settings {
        num_motes: 20,
        scheduler: SchedulerKind::DeBras,
        num_broadcast_cells: 2,
        num_cycles_per_run: 100,
        ..base_settings()
    };
    // 8 broadcast cells for 20 motes: up to three motes share a cell,
    // so full coverage needs at most 20 * 3 = 60 slotframes; the run is
    // 100.
    let mut sim = Simulation::new(settings, full_mesh(20, -80.0), 5).unwrap();
    sim.run().unwrap();

    for mote in &sim.motes {
        for other in 0..20u16 {
            if other == mote.id.0 {
                continue;
            }
            let snapshot = mote.schedule_neighborhood.get(&MoteId(other));
            match snapshot {
                Some(snap) => assert!(
                    !snap.cells.is_empty(),
                    "{} has an empty snapshot of mote{}",
                    mote.id,
                    other
                ),
                None => panic!("{} never heard gossip from mote{}", mote.id, other),
            }
        }
    }
    check_invariants(&sim);
}

/// Forced congestion: a two-tier tree at five packets per second per
/// source overflows queues and collides overlapping allocations.
///
/// (A single-tier star cannot collide here: pairwise reservations keep
/// the root's keys disjoint, and beacons carry no airtime. The relays
/// reintroduce the cross-pair overlap that congests real networks.)
#[test]
fn s4_congestion_drops_and_collisions() {
    let settings = Settings {
        num_motes: 10,
        pk_period: 0.2,
        scheduler: SchedulerKind::Random,
        num_cycles_per_run: 100,
        ..base_settings()
    };

    // 0 = root; 1..=3 relays; 4..=9 leaves, two per relay.
    let positions = (0..10).map(|i| (0.1 * i as f64, 0.0)).collect();
    let mut links = Vec::new();
    for relay in 1..=3u16 {
        links.push((0, relay, -80.0));
        links.push((relay, 0, -80.0));
        for other in 1..=3u16 {
            if relay != other {
                links.push((relay, other, -85.0));
            }
        }
    }
    for leaf in 4..=9u16 {
        let parent = 1 + (leaf - 4) % 3;
        for relay in 1..=3u16 {
            let rssi = if relay == parent { -80.0 } else { -90.0 };
            links.push((leaf, relay, rssi));
            links.push((relay, leaf, rssi));
        }
    }
    let topology = Topology::from_links(positions, &links).unwrap();

    let mut sim = Simulation::new(settings.clone(), topology, 5).unwrap();
    let report = sim.run().unwrap();
    let totals = &report.totals;

    assert!(
        totals.dropped_queue_full + totals.dropped_mac_retries > 0,
        "congestion must overflow queues or exhaust retries"
    );
    assert!(
        totals.drop_by_collision > 0,
        "overlapping random allocations must collide"
    );
    assert!(totals.app_reaches_root < totals.app_generated);

    // The root cannot take in more than one packet per channel per slot.
    let duration_s = report.final_asn as f64 * settings.slot_duration;
    let throughput = totals.app_reaches_root as f64 / duration_s;
    assert!(throughput <= settings.num_chans as f64 / settings.slot_duration);
    check_invariants(&sim);
}

/// A cell whose history is all failures is relocated exactly once by
/// 6top housekeeping.
#[test]
fn s5_bad_cell_is_relocated_once() {
    let settings = Settings {
        num_motes: 2,
        // Nearly silent application so only the injected cell matters.
        pk_period: 1.0e6,
        sixtop_no_housekeeping: false,
        num_cycles_per_run: 10,
        ..base_settings()
    };
    let topology = Topology::from_links(
        vec![(0.0, 0.0), (0.3, 0.0)],
        &[(0, 1, -80.0), (1, 0, -80.0)],
    )
    .unwrap();
    let mut sim = Simulation::new(settings, topology, 5).unwrap();

    // Join the leaf and give it one cell with a fully failed history.
    sim.motes[1].preferred_parent = Some(MoteId(0));
    sim.motes[1].parent_set = vec![MoteId(0)];
    sim.motes[1].traffic_portion.insert(MoteId(0), 1.0);
    sim.sixtop_reserve(MoteId(1), MoteId(0), 1).unwrap();
    let bad_key = sim.motes[1].schedule.tx_cell_keys_to(MoteId(0))[0];
    {
        let cell = sim.motes[1].schedule.get_mut(bad_key).unwrap();
        cell.num_tx = 32;
        for _ in 0..32 {
            cell.record_attempt(false);
        }
    }

    let report = sim.run().unwrap();

    assert_eq!(
        report.totals.top_tx_relocated_cells, 1,
        "exactly one relocation expected"
    );
    assert!(sim.motes[1].schedule.get(bad_key).is_none(), "bad cell removed");
    assert_eq!(sim.motes[1].cells_to[&MoteId(0)], 1, "replacement installed");
    check_invariants(&sim);
}

/// Clock drift: with the root at 0 ppm and the leaf at +30 ppm, the
/// leaf's offset to the root grows at 30 µs per second since its last
/// resynchronisation.
#[test]
fn s6_clock_drift_rate() {
    let settings = Settings {
        num_motes: 2,
        // No data traffic; resync happens only on received beacons.
        pk_period: 1.0e6,
        dio_period: 3.0,
        num_cycles_per_run: 10,
        ..base_settings()
    };
    let topology = Topology::from_links(
        vec![(0.0, 0.0), (0.3, 0.0)],
        &[(0, 1, -80.0), (1, 0, -80.0)],
    )
    .unwrap();
    let mut sim = Simulation::new(settings.clone(), topology, 5).unwrap();
    sim.motes[0].drift_ppm = 0.0;
    sim.motes[1].drift_ppm = 30.0;

    sim.run().unwrap();

    let resync_asn = sim.motes[1].time_corrected_slot;
    let final_asn = settings.total_slots();
    assert!(resync_asn > 0, "the leaf heard at least one beacon");
    assert!(resync_asn < final_asn);

    let elapsed_s = (final_asn - resync_asn) as f64 * settings.slot_duration;
    let expected = 30.0e-6 * elapsed_s;
    let offset = sim.clock_offset_to_root(MoteId(1));
    assert!(
        (offset - expected).abs() < 1e-12,
        "offset {offset} for {elapsed_s}s since resync, expected {expected}"
    );
    assert!(expected > 0.0);
}
