//! Static topology oracle: per-link RSSI and the RSSI→PDR curve.
//!
//! Topology generation and curve fitting happen outside the simulator;
//! this module only stores the resulting neighbor graph and answers link
//! queries. The RSSI→PDR waterfall below is the measured system's curve:
//! nothing decodes below −97 dBm, everything decodes above −79 dBm, and
//! the transition is interpolated linearly between the measured points.

use crate::ModelError;
use serde::{Deserialize, Serialize};
use tschsim_common::MoteId;

/// Measured (RSSI dBm, PDR) waterfall, ascending by RSSI.
const RSSI_PDR_TABLE: &[(f64, f64)] = &[
    (-97.0, 0.0000),
    (-96.0, 0.1494),
    (-95.0, 0.2340),
    (-94.0, 0.4071),
    (-93.0, 0.6359),
    (-92.0, 0.6866),
    (-91.0, 0.7476),
    (-90.0, 0.8603),
    (-89.0, 0.8702),
    (-88.0, 0.9324),
    (-87.0, 0.9427),
    (-86.0, 0.9562),
    (-85.0, 0.9611),
    (-84.0, 0.9739),
    (-83.0, 0.9745),
    (-82.0, 0.9844),
    (-81.0, 0.9854),
    (-80.0, 0.9903),
    (-79.0, 1.0000),
];

/// Map an RSSI value to a packet delivery ratio through the waterfall.
pub fn rssi_to_pdr(rssi: f64) -> f64 {
    let (min_rssi, _) = RSSI_PDR_TABLE[0];
    let (max_rssi, _) = RSSI_PDR_TABLE[RSSI_PDR_TABLE.len() - 1];
    if rssi <= min_rssi {
        return 0.0;
    }
    if rssi >= max_rssi {
        return 1.0;
    }
    let below = rssi.floor();
    let idx = (below - min_rssi) as usize;
    let (lo_rssi, lo_pdr) = RSSI_PDR_TABLE[idx];
    let (_, hi_pdr) = RSSI_PDR_TABLE[idx + 1];
    lo_pdr + (hi_pdr - lo_pdr) * (rssi - lo_rssi)
}

/// Position of one mote in the deployment area (km).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotePosition {
    /// Mote id; ids must cover 0..numMotes.
    pub id: u16,
    /// X coordinate, km.
    pub x: f64,
    /// Y coordinate, km.
    pub y: f64,
}

/// One directed radio link with its received signal strength.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    /// Transmitter id.
    pub from: u16,
    /// Receiver id.
    pub to: u16,
    /// RSSI at the receiver, dBm.
    pub rssi: f64,
}

/// Serialized form of a topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    /// Mote positions.
    pub motes: Vec<MotePosition>,
    /// Directed links; pairs absent here are out of radio range.
    pub links: Vec<LinkSpec>,
}

/// The static neighbor graph queried by propagation, routing, and the
/// allocators.
#[derive(Debug, Clone)]
pub struct Topology {
    positions: Vec<(f64, f64)>,
    // Dense directed RSSI matrix; None = unreachable.
    rssi: Vec<Option<f64>>,
    num_motes: usize,
}

impl Topology {
    /// Build the oracle from its serialized form.
    pub fn from_config(config: &TopologyConfig, num_motes: u16) -> Result<Self, ModelError> {
        let n = num_motes as usize;
        if config.motes.len() != n {
            return Err(ModelError::InvalidTopology(format!(
                "expected {} motes, got {}",
                n,
                config.motes.len()
            )));
        }
        let mut positions = vec![None; n];
        for m in &config.motes {
            let idx = m.id as usize;
            if idx >= n {
                return Err(ModelError::InvalidTopology(format!(
                    "mote id {} out of range 0..{}",
                    m.id, n
                )));
            }
            if positions[idx].replace((m.x, m.y)).is_some() {
                return Err(ModelError::InvalidTopology(format!(
                    "duplicate mote id {}",
                    m.id
                )));
            }
        }
        let positions: Vec<(f64, f64)> = positions
            .into_iter()
            .map(|p| p.ok_or_else(|| ModelError::InvalidTopology("missing mote id".into())))
            .collect::<Result<_, _>>()?;

        let mut rssi = vec![None; n * n];
        for link in &config.links {
            let (from, to) = (link.from as usize, link.to as usize);
            if from >= n || to >= n {
                return Err(ModelError::InvalidTopology(format!(
                    "link {} -> {} references unknown mote",
                    link.from, link.to
                )));
            }
            if from == to {
                return Err(ModelError::InvalidTopology(format!(
                    "self-link on mote {}",
                    link.from
                )));
            }
            rssi[from * n + to] = Some(link.rssi);
        }
        Ok(Topology {
            positions,
            rssi,
            num_motes: n,
        })
    }

    /// Build directly from parts; used by tests and embedders.
    pub fn from_links(
        positions: Vec<(f64, f64)>,
        links: &[(u16, u16, f64)],
    ) -> Result<Self, ModelError> {
        let config = TopologyConfig {
            motes: positions
                .iter()
                .enumerate()
                .map(|(i, &(x, y))| MotePosition { id: i as u16, x, y })
                .collect(),
            links: links
                .iter()
                .map(|&(from, to, rssi)| LinkSpec { from, to, rssi })
                .collect(),
        };
        Topology::from_config(&config, positions.len() as u16)
    }

    /// Number of motes in the graph.
    pub fn num_motes(&self) -> usize {
        self.num_motes
    }

    /// Position of a mote, km.
    pub fn position(&self, mote: MoteId) -> (f64, f64) {
        self.positions[mote.index()]
    }

    /// RSSI of the directed link, if in range.
    pub fn rssi(&self, from: MoteId, to: MoteId) -> Option<f64> {
        self.rssi[from.index() * self.num_motes + to.index()]
    }

    /// Static PDR of the directed link; 0 when out of range.
    pub fn pdr(&self, from: MoteId, to: MoteId) -> f64 {
        self.rssi(from, to).map(rssi_to_pdr).unwrap_or(0.0)
    }

    /// Whether `to` can hear `from` at all.
    pub fn reachable(&self, from: MoteId, to: MoteId) -> bool {
        self.pdr(from, to) > 0.0
    }

    /// Ids of all motes that can hear `from`, ascending.
    pub fn neighbors_of(&self, from: MoteId) -> Vec<MoteId> {
        (0..self.num_motes as u16)
            .map(MoteId)
            .filter(|&to| to != from && self.reachable(from, to))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waterfall_endpoints() {
        assert_eq!(rssi_to_pdr(-110.0), 0.0);
        assert_eq!(rssi_to_pdr(-97.0), 0.0);
        assert_eq!(rssi_to_pdr(-79.0), 1.0);
        assert_eq!(rssi_to_pdr(-50.0), 1.0);
    }

    #[test]
    fn waterfall_interpolates() {
        // Halfway between -96 (0.1494) and -95 (0.2340).
        let pdr = rssi_to_pdr(-95.5);
        assert!((pdr - (0.1494 + 0.2340) / 2.0).abs() < 1e-9);
        // Monotone over the transition band.
        let mut prev = 0.0;
        let mut rssi = -97.0;
        while rssi <= -79.0 {
            let p = rssi_to_pdr(rssi);
            assert!(p >= prev);
            prev = p;
            rssi += 0.25;
        }
    }

    #[test]
    fn link_queries() {
        let topo = Topology::from_links(
            vec![(0.0, 0.0), (0.5, 0.0), (1.0, 0.0)],
            &[(0, 1, -80.0), (1, 0, -80.0), (1, 2, -90.0), (2, 1, -90.0)],
        )
        .unwrap();
        assert!(topo.reachable(0.into(), 1.into()));
        assert!(!topo.reachable(0.into(), 2.into()));
        assert!((topo.pdr(1.into(), 2.into()) - 0.8603).abs() < 1e-9);
        assert_eq!(topo.neighbors_of(1.into()), vec![MoteId(0), MoteId(2)]);
        assert_eq!(topo.rssi(2.into(), 0.into()), None);
    }

    #[test]
    fn duplicate_mote_rejected() {
        let config = TopologyConfig {
            motes: vec![
                MotePosition { id: 0, x: 0.0, y: 0.0 },
                MotePosition { id: 0, x: 1.0, y: 0.0 },
            ],
            links: vec![],
        };
        assert!(Topology::from_config(&config, 2).is_err());
    }

    #[test]
    fn self_link_rejected() {
        let topo = Topology::from_links(vec![(0.0, 0.0), (1.0, 0.0)], &[(0, 0, -50.0)]);
        assert!(topo.is_err());
    }
}
