//! The run context and dispatch loop.
//!
//! [`Simulation`] owns everything a run needs. Event callbacks are
//! methods on it, selected by a match over [`EventKind`], so cross-mote
//! mutations (propagation resolution, cell reservation) happen inside a
//! single callback with full access to the arena and never race.

use crate::engine::{EventKind, EventQueue};
use crate::mote::Mote;
use crate::propagation::PropagationRegistry;
use crate::schedule::{CellDirection, ScheduleError};
use crate::stats::{MoteSummary, RunReport, RunStats};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::debug;
use tschsim_common::consts::{CLOCK_DRIFT_PPM_BOUND, MAX_PARENT_CHAIN_HOPS};
use tschsim_common::{units, Asn, MoteId};
use tschsim_model::{ModelError, Settings, Topology};

/// Errors surfaced by a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    /// Settings or topology rejected.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A schedule mutation violated an invariant.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The simulation was already run.
    #[error("simulation already ran; build a fresh one per run")]
    AlreadyRan,
}

/// A complete simulation context: one per run.
pub struct Simulation {
    /// Immutable run parameters.
    pub settings: Settings,
    /// Static neighbor graph.
    pub topology: Topology,
    /// The mote arena; index = id.
    pub motes: Vec<Mote>,
    /// Statistics, updated as the run progresses.
    pub stats: RunStats,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) queue: EventQueue,
    pub(crate) propagation: PropagationRegistry,
    asn: Asn,
    seed: u64,
    running: bool,
    booted: bool,
}

impl Simulation {
    /// Build a run context. Draws each mote's clock drift from the
    /// seeded stream; schedules nothing until [`Simulation::run`].
    pub fn new(settings: Settings, topology: Topology, seed: u64) -> Result<Self, SimError> {
        settings.validate()?;
        if topology.num_motes() != settings.num_motes as usize {
            return Err(SimError::Model(ModelError::InvalidTopology(format!(
                "topology has {} motes, settings expect {}",
                topology.num_motes(),
                settings.num_motes
            ))));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let motes = (0..settings.num_motes)
            .map(|id| {
                let id = MoteId(id);
                let drift = rng.gen_range(-CLOCK_DRIFT_PPM_BOUND..=CLOCK_DRIFT_PPM_BOUND);
                Mote::new(id, topology.position(id), drift)
            })
            .collect();
        Ok(Simulation {
            settings,
            topology,
            motes,
            stats: RunStats::default(),
            rng,
            queue: EventQueue::new(),
            propagation: PropagationRegistry::default(),
            asn: 0,
            seed,
            running: false,
            booted: false,
        })
    }

    /// Current slot.
    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Zero-based index of the current slotframe cycle.
    pub fn cycle(&self) -> u64 {
        self.asn / self.settings.slotframe_length as u64
    }

    /// Run to completion and produce the report.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        if self.booted {
            return Err(SimError::AlreadyRan);
        }
        self.boot()?;
        self.running = true;
        while let Some(event) = self.queue.pop() {
            self.asn = event.asn;
            match event.kind {
                EventKind::CellActivation(id) => self.activate_cells(id)?,
                EventKind::Propagate => self.propagate()?,
                EventKind::AppPacket(id) => self.app_generate(id),
                EventKind::Dio(id) => self.rpl_send_dio(id),
                EventKind::OtfHousekeeping(id) => self.otf_housekeeping(id)?,
                EventKind::SixtopHousekeeping(id) => self.sixtop_housekeeping(id)?,
                EventKind::CycleStats => self.collect_cycle_stats(),
                EventKind::EndOfRun => self.running = false,
            }
            if !self.running {
                break;
            }
        }
        Ok(self.build_report())
    }

    fn boot(&mut self) -> Result<(), SimError> {
        self.booted = true;
        debug!(
            motes = self.settings.num_motes,
            scheduler = ?self.settings.scheduler,
            seed = self.seed,
            "booting simulation"
        );

        if self.settings.scheduler.uses_gossip() {
            self.install_broadcast_cells()?;
        }
        for id in 0..self.settings.num_motes {
            self.reschedule_activation(MoteId(id));
        }
        self.queue.schedule_at(1, EventKind::Propagate);

        // Application sources: everyone but the root, jittered start.
        let frame = self.settings.slotframe_length as f64;
        for id in 1..self.settings.num_motes {
            let offset_slots = self.rng.gen_range(frame / 6.0..frame / 3.0);
            let delay = self.settings.slot_duration * (1.0 + offset_slots);
            let asn = self.asn_after(delay);
            self.queue.schedule_at(asn, EventKind::AppPacket(MoteId(id)));
        }

        // Routing beacons, aligned to slotframe boundaries.
        let dio_asn = self.dio_interval_slots();
        for id in 0..self.settings.num_motes {
            self.queue.schedule_at(dio_asn, EventKind::Dio(MoteId(id)));
        }

        // Housekeeping, spread out so motes do not run in lockstep.
        for id in 0..self.settings.num_motes {
            let jitter = 0.5 + self.rng.gen_range(0.0..1.0);
            let asn = self.asn_after(self.settings.otf_housekeeping_period * jitter);
            self.queue
                .schedule_at(asn, EventKind::OtfHousekeeping(MoteId(id)));
        }
        for id in 0..self.settings.num_motes {
            let jitter = 0.5 + self.rng.gen_range(0.0..1.0);
            let asn = self.asn_after(self.settings.sixtop_housekeeping_period * jitter);
            self.queue
                .schedule_at(asn, EventKind::SixtopHousekeeping(MoteId(id)));
        }

        let frame_slots = self.settings.slotframe_length as u64;
        self.queue.schedule_at(frame_slots, EventKind::CycleStats);
        self.queue
            .schedule_at(self.settings.total_slots(), EventKind::EndOfRun);
        Ok(())
    }

    /// Slots between consecutive DIO emissions, as an ASN multiple of
    /// the slotframe length.
    pub(crate) fn dio_interval_slots(&self) -> u64 {
        let cycles = (self.settings.dio_period / self.settings.cycle_duration()).ceil() as u64;
        cycles.max(1) * self.settings.slotframe_length as u64
    }

    /// The ASN `delay_s` seconds from now, at least one slot ahead.
    pub(crate) fn asn_after(&self, delay_s: f64) -> Asn {
        let slots = (delay_s / self.settings.slot_duration).round() as u64;
        self.asn + slots.max(1)
    }

    /// (Re)schedule a mote's next cell activation from the current ASN;
    /// cancels instead when its schedule is empty.
    pub(crate) fn reschedule_activation(&mut self, id: MoteId) {
        let mote = &self.motes[id.index()];
        match mote
            .schedule
            .slots_until_next_active(self.asn, self.settings.slotframe_length)
        {
            Some(delta) => self
                .queue
                .schedule_at(self.asn + delta, EventKind::CellActivation(id)),
            None => self.queue.cancel(EventKind::CellActivation(id)),
        }
    }

    /// Disjoint mutable borrows of two motes.
    ///
    /// # Panics
    /// When `a == b`; reservation and removal always involve two ends.
    pub(crate) fn pair_mut(&mut self, a: MoteId, b: MoteId) -> (&mut Mote, &mut Mote) {
        assert_ne!(a, b, "pair_mut needs two distinct motes");
        let (ai, bi) = (a.index(), b.index());
        if ai < bi {
            let (left, right) = self.motes.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.motes.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }

    /// Clock offset of `id` relative to the DAG root, in seconds:
    /// the sum over the parent chain of relative drift times the time
    /// since that hop last resynchronised.
    pub fn clock_offset_to_root(&self, id: MoteId) -> f64 {
        let mut offset = 0.0;
        let mut current = id;
        for _ in 0..MAX_PARENT_CHAIN_HOPS {
            if current.is_root() {
                break;
            }
            let mote = &self.motes[current.index()];
            let Some(parent) = mote.preferred_parent else {
                break;
            };
            let parent_drift = self.motes[parent.index()].drift_ppm;
            let elapsed =
                self.asn.saturating_sub(mote.time_corrected_slot) as f64 * self.settings.slot_duration;
            offset += units::ppm(mote.drift_ppm - parent_drift) * elapsed;
            current = parent;
        }
        offset
    }

    fn collect_cycle_stats(&mut self) {
        let frame = self.settings.slotframe_length as u64;
        let cycle = self.asn / frame - 1;
        let used_cells: u64 = self
            .motes
            .iter()
            .map(|m| m.schedule.count_direction(CellDirection::Tx) as u64)
            .sum();
        let queue_fill: u64 = self.motes.iter().map(|m| m.tx_queue.len() as u64).sum();
        let charge: f64 = self.motes.iter().map(|m| m.charge_uc).sum();
        self.stats.close_cycle(cycle, used_cells, queue_fill, charge);
        let next = self.asn + frame;
        if next <= self.settings.total_slots() {
            self.queue.schedule_at(next, EventKind::CycleStats);
        }
    }

    fn build_report(&self) -> RunReport {
        let motes = self
            .motes
            .iter()
            .map(|m| MoteSummary {
                id: m.id,
                probe_packets_generated: m.stats.probe_packets_generated,
                probe_num_packet_received: m.stats.probe_num_packet_received,
                app_generated: m.stats.app_generated,
                rpl_churn_pref_parent: m.stats.rpl_churn_pref_parent,
                rank: m.rank,
                preferred_parent: m.preferred_parent,
                tx_cells: m.schedule.count_direction(CellDirection::Tx) as u64,
                rx_cells: m.schedule.count_direction(CellDirection::Rx) as u64,
                shared_cells: m.schedule.count_direction(CellDirection::Shared) as u64,
                queue_fill: m.tx_queue.len() as u64,
                charge_uc: m.charge_uc,
            })
            .collect();
        RunReport {
            seed: self.seed,
            final_asn: self.asn,
            totals: self.stats.counters.clone(),
            mean_latency_slots: self.stats.mean_latency(),
            mean_hops: self.stats.mean_hops(),
            cycles: self.stats.cycles.clone(),
            motes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tschsim_model::Topology;

    fn two_mote_sim() -> Simulation {
        let settings = Settings {
            num_motes: 2,
            ..Settings::default()
        };
        let topology = Topology::from_links(
            vec![(0.0, 0.0), (0.3, 0.0)],
            &[(0, 1, -80.0), (1, 0, -80.0)],
        )
        .unwrap();
        Simulation::new(settings, topology, 5).unwrap()
    }

    #[test]
    fn drift_is_bounded() {
        let sim = two_mote_sim();
        for m in &sim.motes {
            assert!(m.drift_ppm.abs() <= CLOCK_DRIFT_PPM_BOUND);
        }
    }

    #[test]
    fn asn_after_rounds_and_clamps() {
        let sim = two_mote_sim();
        // 0.095 s at 10 ms slots rounds to 10 slots.
        assert_eq!(sim.asn_after(0.095), 10);
        // Sub-slot delays still land one slot ahead.
        assert_eq!(sim.asn_after(0.0001), 1);
    }

    #[test]
    fn clock_offset_walks_parent_chain() {
        let mut sim = two_mote_sim();
        sim.motes[0].drift_ppm = 0.0;
        sim.motes[1].drift_ppm = 30.0;
        sim.motes[1].preferred_parent = Some(MoteId::ROOT);
        sim.motes[1].time_corrected_slot = 0;
        sim.asn = 10_000; // 100 s of slots at 10 ms

        let offset = sim.clock_offset_to_root(MoteId(1));
        // 30 ppm over 100 s = 3 ms.
        assert!((offset - 3.0e-3).abs() < 1e-9, "offset = {offset}");
        assert_eq!(sim.clock_offset_to_root(MoteId::ROOT), 0.0);
    }

    #[test]
    fn pair_mut_is_disjoint() {
        let mut sim = two_mote_sim();
        let (a, b) = sim.pair_mut(MoteId(1), MoteId(0));
        a.charge(1.0);
        b.charge(2.0);
        assert_eq!(sim.motes[1].charge_uc, 1.0);
        assert_eq!(sim.motes[0].charge_uc, 2.0);
    }

    #[test]
    fn run_twice_is_refused() {
        let mut sim = two_mote_sim();
        sim.run().unwrap();
        assert!(matches!(sim.run(), Err(SimError::AlreadyRan)));
    }

    #[test]
    fn mismatched_topology_rejected() {
        let settings = Settings {
            num_motes: 3,
            ..Settings::default()
        };
        let topology =
            Topology::from_links(vec![(0.0, 0.0), (0.3, 0.0)], &[(0, 1, -80.0)]).unwrap();
        assert!(Simulation::new(settings, topology, 1).is_err());
    }
}
