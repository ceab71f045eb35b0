//! The application traffic source.
//!
//! Every non-root mote emits upstream data packets: the first at a
//! random offset early in the run, then one per `pk_period` with
//! uniform jitter. Generation ceases at the warm-down boundary so the
//! tail of the run only drains queues. Packets generated (and, at the
//! root, received) during the instrumented window feed the probe
//! counters.

use crate::engine::EventKind;
use crate::packet::Packet;
use crate::sim::Simulation;
use rand::Rng;
use tracing::trace;
use tschsim_common::consts::{PROBE_WINDOW_END_CYCLE, PROBE_WINDOW_START_CYCLE};
use tschsim_common::MoteId;
use tschsim_metrics::{metric_defs, metrics};

impl Simulation {
    /// Emit one data packet at `id` and schedule the next emission.
    pub(crate) fn app_generate(&mut self, id: MoteId) {
        let asn = self.asn();
        let warm_down = PROBE_WINDOW_END_CYCLE * self.settings.slotframe_length as u64;
        if asn >= warm_down {
            // Warm-down: stop producing, let the network drain.
            return;
        }

        let cycle = self.cycle();
        let in_probe_window =
            (PROBE_WINDOW_START_CYCLE..=PROBE_WINDOW_END_CYCLE).contains(&cycle);
        let max_retries = self.settings.max_retries;
        let capacity = self.settings.tx_queue_size;

        self.stats.counters.app_generated += 1;
        metrics::counter!(metric_defs::APP_GENERATED.name).increment(1);
        {
            let mote = &mut self.motes[id.index()];
            mote.stats.app_generated += 1;
            if in_probe_window {
                mote.stats.probe_packets_generated += 1;
            }
            // Locally generated packets count as inbound traffic from
            // the mote itself, which is what sizes its own bundles.
            mote.count_inbound(id);
        }

        let packet = Packet::data(id, asn, max_retries);
        match self.motes[id.index()].enqueue(packet, capacity) {
            Ok(()) => trace!(mote = %id, asn, "data packet enqueued"),
            Err(err) => self.count_enqueue_drop(id, err),
        }

        let jitter = self
            .rng
            .gen_range(-self.settings.pk_period_var..=self.settings.pk_period_var);
        let delay = self.settings.pk_period * (1.0 + jitter);
        let next = self.asn_after(delay);
        self.queue.schedule_at(next, EventKind::AppPacket(id));
    }
}
