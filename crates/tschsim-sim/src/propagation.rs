//! Per-slot radio resolution.
//!
//! During activation (priority 0) motes register transmissions and
//! listeners here; the propagate event (priority 1, same ASN) then
//! resolves every channel: who locks onto whom, SINR against the
//! concurrent transmitters, a Bernoulli draw against the derived PDR,
//! and collision detection through pseudo-decoding of captured
//! interferers. Every transmitter is notified exactly once, and the
//! registry is cleared for the next slot.

use crate::engine::EventKind;
use crate::packet::{Destination, Packet};
use crate::schedule::CellKey;
use crate::sim::{SimError, Simulation};
use rand::Rng;
use tschsim_common::consts::{CHARGE_IDLE_UC, RX_GUARD_DB};
use tschsim_common::units::{dbm_to_mw, mw_to_dbm};
use tschsim_common::{ChannelOffset, MoteId};
use tschsim_model::{rssi_to_pdr, Topology};

/// A transmission registered for the current slot.
#[derive(Debug)]
pub(crate) struct Transmission {
    pub src: MoteId,
    pub dest: Destination,
    pub channel: ChannelOffset,
    /// The TX (or SHARED) cell on the source used for this attempt.
    pub cell_key: CellKey,
    pub packet: Packet,
    /// Clock offset of the source relative to the root, captured at
    /// resolution time; earlier arrivals win receiver lock.
    pub arrival: f64,
}

/// A listener registered for the current slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Listener {
    pub mote: MoteId,
    pub channel: ChannelOffset,
    /// The RX (or SHARED) cell the mote is listening on.
    pub cell_key: CellKey,
}

/// The per-slot registry, written at priority 0 and drained at
/// priority 1 of the same ASN.
#[derive(Debug, Default)]
pub(crate) struct PropagationRegistry {
    pub transmissions: Vec<Transmission>,
    pub listeners: Vec<Listener>,
}

impl PropagationRegistry {
    pub fn start_tx(
        &mut self,
        src: MoteId,
        dest: Destination,
        channel: ChannelOffset,
        cell_key: CellKey,
        packet: Packet,
    ) {
        self.transmissions.push(Transmission {
            src,
            dest,
            channel,
            cell_key,
            packet,
            arrival: 0.0,
        });
    }

    pub fn start_rx(&mut self, mote: MoteId, channel: ChannelOffset, cell_key: CellKey) {
        self.listeners.push(Listener {
            mote,
            channel,
            cell_key,
        });
    }
}

/// What happened to one registered transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOutcome {
    /// Destination decoded and accepted the frame.
    Acked,
    /// Destination decoded the frame but had no queue space.
    Nacked,
    /// Nothing decoded it.
    Failed {
        /// Interference was in play at the destination.
        collision: bool,
    },
    /// Broadcasts complete without feedback.
    BroadcastDone,
}

/// SINR in dB of `src`'s signal at `dst` with the given co-channel
/// interferers treated as noise.
fn sinr_db(
    topology: &Topology,
    noise_power_dbm: f64,
    src: MoteId,
    dst: MoteId,
    interferers: &[usize],
    transmissions: &[Transmission],
) -> f64 {
    let noise = dbm_to_mw(noise_power_dbm);
    let signal = match topology.rssi(src, dst) {
        Some(rssi) => dbm_to_mw(rssi) - noise,
        None => return -10.0,
    };
    if signal < 0.0 {
        return -10.0;
    }
    let mut interference = 0.0;
    for &i in interferers {
        if let Some(rssi) = topology.rssi(transmissions[i].src, dst) {
            interference += (dbm_to_mw(rssi) - noise).max(0.0);
        }
    }
    mw_to_dbm(signal / (interference + noise))
}

/// PDR corresponding to a SINR value, through the equivalent-RSSI
/// waterfall: the decoder sees signal-plus-noise against noise.
fn pdr_from_sinr(sinr_db: f64, noise_power_dbm: f64) -> f64 {
    let equivalent_rssi =
        mw_to_dbm(dbm_to_mw(sinr_db + noise_power_dbm) + dbm_to_mw(noise_power_dbm));
    rssi_to_pdr(equivalent_rssi)
}

/// Index of the earliest-arriving transmission (other than `skip`) on
/// `channel` whose signal at `listener` exceeds `threshold`. This is the
/// interferer a receiver would lock onto instead of its own traffic.
fn capturing_interferer(
    topology: &Topology,
    transmissions: &[Transmission],
    skip: Option<usize>,
    channel: ChannelOffset,
    listener: MoteId,
    before_arrival: Option<f64>,
    threshold: f64,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, t) in transmissions.iter().enumerate() {
        if Some(i) == skip || t.channel != channel || t.src == listener {
            continue;
        }
        if let Some(limit) = before_arrival {
            if t.arrival >= limit {
                continue;
            }
        }
        match topology.rssi(t.src, listener) {
            Some(rssi) if rssi > threshold => {}
            _ => continue,
        }
        match best {
            Some(b) if transmissions[b].arrival <= t.arrival => {}
            _ => best = Some(i),
        }
    }
    best
}

impl Simulation {
    /// Resolve the current slot's transmissions and notify all parties.
    pub(crate) fn propagate(&mut self) -> Result<(), SimError> {
        let mut transmissions = std::mem::take(&mut self.propagation.transmissions);
        let listeners = std::mem::take(&mut self.propagation.listeners);

        // Arrival-time snapshot: the root is the time reference.
        for t in &mut transmissions {
            t.arrival = if t.src.is_root() {
                0.0
            } else {
                self.clock_offset_to_root(t.src)
            };
        }

        let min_rssi = self.settings.min_rssi;
        let noise_power = self.settings.noise_power;
        let mut listener_active = vec![true; listeners.len()];
        let mut outcomes = vec![TxOutcome::Failed { collision: false }; transmissions.len()];

        for ti in 0..transmissions.len() {
            let channel = transmissions[ti].channel;
            match transmissions[ti].dest {
                Destination::Broadcast => {
                    for li in 0..listeners.len() {
                        if !listener_active[li] {
                            continue;
                        }
                        let l = listeners[li];
                        if l.channel != channel || l.mote == transmissions[ti].src {
                            continue;
                        }
                        let audible = matches!(
                            self.topology.rssi(transmissions[ti].src, l.mote),
                            Some(rssi) if rssi > min_rssi
                        );
                        if !audible {
                            continue;
                        }
                        let captured = capturing_interferer(
                            &self.topology,
                            &transmissions,
                            Some(ti),
                            channel,
                            l.mote,
                            Some(transmissions[ti].arrival),
                            min_rssi,
                        );
                        if captured.is_some() {
                            // An earlier signal owns this receiver; it is
                            // handled when that transmission is processed.
                            continue;
                        }
                        let interferers: Vec<usize> = co_channel(&transmissions, channel, ti);
                        let sinr = sinr_db(
                            &self.topology,
                            noise_power,
                            transmissions[ti].src,
                            l.mote,
                            &interferers,
                            &transmissions,
                        );
                        let pdr = pdr_from_sinr(sinr, noise_power);
                        let decoded = self.rng.gen_bool(pdr.clamp(0.0, 1.0));
                        listener_active[li] = false;
                        if decoded {
                            self.deliver_gossip(ti, &transmissions, l);
                        } else {
                            self.rx_idle(l);
                        }
                    }
                    outcomes[ti] = TxOutcome::BroadcastDone;
                }
                Destination::Unicast(dst) => {
                    let li = listeners.iter().position(|l| {
                        l.mote == dst && l.channel == channel
                    });
                    let Some(li) = li.filter(|&li| listener_active[li]) else {
                        // Destination is not listening this slot.
                        outcomes[ti] = TxOutcome::Failed { collision: false };
                        continue;
                    };
                    let l = listeners[li];
                    let guard = min_rssi + RX_GUARD_DB;
                    let captured = capturing_interferer(
                        &self.topology,
                        &transmissions,
                        Some(ti),
                        channel,
                        dst,
                        Some(transmissions[ti].arrival),
                        guard,
                    );
                    let audible = matches!(
                        self.topology.rssi(transmissions[ti].src, dst),
                        Some(rssi) if rssi > min_rssi
                    );
                    let interferers = co_channel(&transmissions, channel, ti);
                    let interference_present = interferers.iter().any(|&i| {
                        matches!(
                            self.topology.rssi(transmissions[i].src, dst),
                            Some(rssi) if rssi > min_rssi
                        )
                    });
                    if let Some(ci) = captured {
                        // The receiver locked onto an interferer. Pseudo-
                        // decode it with our signal added to the noise: if
                        // it would have decoded, the receiver knows this
                        // cell is colliding.
                        listener_active[li] = false;
                        let pseudo_interferers = co_channel(&transmissions, channel, ci);
                        let sinr = sinr_db(
                            &self.topology,
                            noise_power,
                            transmissions[ci].src,
                            dst,
                            &pseudo_interferers,
                            &transmissions,
                        );
                        let pdr = pdr_from_sinr(sinr, noise_power);
                        if self.rng.gen_bool(pdr.clamp(0.0, 1.0)) {
                            self.mark_rx_collision(l);
                        }
                        self.rx_idle(l);
                        outcomes[ti] = TxOutcome::Failed { collision: true };
                    } else if audible {
                        let sinr = sinr_db(
                            &self.topology,
                            noise_power,
                            transmissions[ti].src,
                            dst,
                            &interferers,
                            &transmissions,
                        );
                        let pdr = pdr_from_sinr(sinr, noise_power);
                        let decoded = self.rng.gen_bool(pdr.clamp(0.0, 1.0));
                        listener_active[li] = false;
                        if decoded {
                            outcomes[ti] = self.deliver_data(ti, &transmissions, l);
                        } else {
                            self.rx_idle(l);
                            outcomes[ti] = TxOutcome::Failed {
                                collision: interference_present,
                            };
                        }
                    } else {
                        // Below the sensitivity floor; the destination
                        // keeps listening and may still detect a captured
                        // interferer in the final sweep.
                        outcomes[ti] = TxOutcome::Failed {
                            collision: interference_present,
                        };
                    }
                }
            }
        }

        // Untargeted listeners: a strong enough stray signal that would
        // have decoded marks the cell as colliding, so the receiver side
        // can ask for relocation.
        for li in 0..listeners.len() {
            if !listener_active[li] {
                continue;
            }
            let l = listeners[li];
            let captured = capturing_interferer(
                &self.topology,
                &transmissions,
                None,
                l.channel,
                l.mote,
                None,
                min_rssi + RX_GUARD_DB,
            );
            if let Some(ci) = captured {
                let pseudo_interferers = co_channel(&transmissions, l.channel, ci);
                let sinr = sinr_db(
                    &self.topology,
                    noise_power,
                    transmissions[ci].src,
                    l.mote,
                    &pseudo_interferers,
                    &transmissions,
                );
                let pdr = pdr_from_sinr(sinr, noise_power);
                if self.rng.gen_bool(pdr.clamp(0.0, 1.0)) {
                    self.mark_rx_collision(l);
                }
            }
            self.rx_idle(l);
        }

        self.finish_transmissions(transmissions, &outcomes);

        self.queue.schedule_at(self.asn() + 1, EventKind::Propagate);
        Ok(())
    }

    fn rx_idle(&mut self, listener: Listener) {
        let mote = &mut self.motes[listener.mote.index()];
        if let Some(cell) = mote.schedule.get_mut(listener.cell_key) {
            cell.waiting_for = None;
        }
        mote.charge(CHARGE_IDLE_UC);
    }

    fn mark_rx_collision(&mut self, listener: Listener) {
        let mote = &mut self.motes[listener.mote.index()];
        if let Some(cell) = mote.schedule.get_mut(listener.cell_key) {
            cell.rx_detected_collision = true;
        }
    }
}

/// Indexes of all transmissions on `channel` except `except`.
fn co_channel(transmissions: &[Transmission], channel: ChannelOffset, except: usize) -> Vec<usize> {
    transmissions
        .iter()
        .enumerate()
        .filter(|(i, t)| *i != except && t.channel == channel)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tschsim_model::Topology;

    fn tx(src: u16, channel: ChannelOffset, arrival: f64) -> Transmission {
        Transmission {
            src: MoteId(src),
            dest: Destination::Broadcast,
            channel,
            cell_key: CellKey::new(0, channel),
            packet: Packet::data(MoteId(src), 0, 5),
            arrival,
        }
    }

    fn line_topology() -> Topology {
        Topology::from_links(
            vec![(0.0, 0.0), (0.3, 0.0), (0.6, 0.0)],
            &[
                (0, 1, -80.0),
                (1, 0, -80.0),
                (1, 2, -85.0),
                (2, 1, -85.0),
                (0, 2, -95.0),
                (2, 0, -95.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn sinr_without_interference_matches_link_budget() {
        let topo = line_topology();
        let txs = [tx(0, 0, 0.0)];
        let sinr = sinr_db(&topo, -105.0, MoteId(0), MoteId(1), &[], &txs);
        // Signal 25 dB above the noise floor loses almost nothing.
        assert!((sinr - 25.0).abs() < 0.1, "sinr = {sinr}");
        let pdr = pdr_from_sinr(sinr, -105.0);
        assert!(pdr > 0.99, "pdr = {pdr}");
    }

    #[test]
    fn sinr_degrades_with_interference() {
        let topo = line_topology();
        let txs = [tx(0, 0, 0.0), tx(2, 0, 0.0)];
        let clean = sinr_db(&topo, -105.0, MoteId(0), MoteId(1), &[], &txs);
        let jammed = sinr_db(&topo, -105.0, MoteId(0), MoteId(1), &[1], &txs);
        assert!(jammed < clean);
        assert!(pdr_from_sinr(jammed, -105.0) < pdr_from_sinr(clean, -105.0));
    }

    #[test]
    fn unreachable_signal_floors_at_minus_ten() {
        let topo = line_topology();
        let txs = [tx(0, 0, 0.0)];
        // No link 1 -> ... to a mote it cannot reach: use reversed pair
        // (0, 2) exists at -95; remove by querying a pair with no entry.
        let sinr = sinr_db(&topo, -105.0, MoteId(1), MoteId(1), &[], &txs);
        assert_eq!(sinr, -10.0);
    }

    #[test]
    fn capture_prefers_earliest_strong_arrival() {
        let topo = line_topology();
        let txs = [tx(0, 0, 0.002), tx(2, 0, 0.001), tx(1, 0, 0.005)];
        // At listener 1, both 0 (-80) and 2 (-85) are audible; 2 arrives
        // earlier.
        let best = capturing_interferer(&topo, &txs, None, 0, MoteId(1), None, -97.0);
        assert_eq!(best, Some(1));
        // With an arrival limit before tx 2's, nothing qualifies.
        let none = capturing_interferer(&topo, &txs, None, 0, MoteId(1), Some(0.0005), -97.0);
        assert_eq!(none, None);
        // A high threshold filters the weak -95 link from mote 2 at 0.
        let strong =
            capturing_interferer(&topo, &txs, Some(0), 0, MoteId(0), None, -97.0 + 8.0);
        assert_eq!(strong, Some(2));
    }

    #[test]
    fn equivalent_rssi_tracks_sinr() {
        // A 25 dB SINR at a -105 dBm floor behaves like a strong link;
        // a 0 dB SINR sits deep in the waterfall.
        assert!(pdr_from_sinr(25.0, -105.0) > 0.99);
        assert!(pdr_from_sinr(0.0, -105.0) < 0.05);
    }
}
