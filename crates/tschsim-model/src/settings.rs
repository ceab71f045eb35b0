//! Immutable run parameters.

use crate::ModelError;
use serde::{Deserialize, Serialize};

/// Cell-allocation policy used when 6top reserves new cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Pick uniformly among slots free on both ends.
    #[serde(rename = "none")]
    Random,
    /// Centralized: additionally exclude every (ts, ch) used anywhere in
    /// the network.
    #[serde(rename = "cen")]
    Centralized,
    /// Centralized, interference-aware: exclude only pairs where mutual
    /// interference is possible.
    #[serde(rename = "opt2")]
    CentralizedOptimized,
    /// Decentralized: like opt2, but judged only from gossiped neighbor
    /// schedules.
    #[serde(rename = "deBras")]
    DeBras,
}

impl SchedulerKind {
    /// Whether this policy relies on broadcast schedule gossip.
    pub fn uses_gossip(self) -> bool {
        matches!(self, SchedulerKind::DeBras)
    }
}

/// Immutable parameters of a simulation run.
///
/// Field names in configuration files use the knob names of the measured
/// system (camelCase); defaults reproduce its stock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Settings {
    /// Population including the root (id 0).
    pub num_motes: u16,
    /// Side of the square deployment area, km.
    pub square_side: f64,
    /// Mean application inter-arrival time, seconds.
    pub pk_period: f64,
    /// Relative jitter on the inter-arrival time (fraction).
    pub pk_period_var: f64,
    /// Routing beacon period, seconds.
    pub dio_period: f64,
    /// Bundle over-provision tolerance, cells.
    pub otf_threshold: usize,
    /// OTF housekeeping period, seconds.
    pub otf_housekeeping_period: f64,
    /// Demand-driven bundle sizing; when false, every parent gets
    /// `otf_static_demand` cells.
    pub otf_enabled: bool,
    /// Fixed per-parent demand used when OTF is disabled.
    pub otf_static_demand: usize,
    /// 6top housekeeping period, seconds.
    pub sixtop_housekeeping_period: f64,
    /// Relocation triggers when a cell (or bundle) is worse than its
    /// reference PDR by at least this factor.
    pub sixtop_pdr_threshold: f64,
    /// Disable 6top housekeeping entirely.
    pub sixtop_no_housekeeping: bool,
    /// Skip PDR-aware ordering when picking cells to remove.
    pub sixtop_no_remove_worst_cell: bool,
    /// Slot duration, seconds.
    pub slot_duration: f64,
    /// Slots per slotframe.
    pub slotframe_length: u16,
    /// Number of frequency channels.
    pub num_chans: u8,
    /// Sensitivity floor, dBm; signals below it are never received.
    pub min_rssi: f64,
    /// Thermal noise floor, dBm.
    pub noise_power: f64,
    /// The interference-free fast path is not implemented; must be false.
    pub no_interference: bool,
    /// Cell-allocation policy.
    pub scheduler: SchedulerKind,
    /// deBras broadcast cells per channel.
    pub num_broadcast_cells: u16,
    /// Independent runs per experiment.
    pub num_runs: u32,
    /// Slotframe cycles per run.
    pub num_cycles_per_run: u64,
    /// Transmit queue bound.
    pub tx_queue_size: usize,
    /// MAC retries before a packet is dropped.
    pub max_retries: u8,
    /// Parent set bound.
    pub parent_set_size: usize,
    /// PRNG seed for run 0; run k uses `seed + k`.
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            num_motes: 20,
            square_side: 2.0,
            pk_period: 1.0,
            pk_period_var: 0.05,
            dio_period: 1.0,
            otf_threshold: 1,
            otf_housekeeping_period: 1.0,
            otf_enabled: true,
            otf_static_demand: 1,
            sixtop_housekeeping_period: 1.0,
            sixtop_pdr_threshold: 1.5,
            sixtop_no_housekeeping: false,
            sixtop_no_remove_worst_cell: false,
            slot_duration: 0.01,
            slotframe_length: 101,
            num_chans: 16,
            min_rssi: -97.0,
            noise_power: -105.0,
            no_interference: false,
            scheduler: SchedulerKind::Random,
            num_broadcast_cells: 2,
            num_runs: 1,
            num_cycles_per_run: 100,
            tx_queue_size: tschsim_common::consts::DEFAULT_TX_QUEUE_SIZE,
            max_retries: tschsim_common::consts::MAX_MAC_RETRIES,
            parent_set_size: 1,
            seed: 5,
        }
    }
}

impl Settings {
    /// Seconds per slotframe cycle.
    pub fn cycle_duration(&self) -> f64 {
        self.slotframe_length as f64 * self.slot_duration
    }

    /// Total slots simulated in one run.
    pub fn total_slots(&self) -> u64 {
        self.slotframe_length as u64 * self.num_cycles_per_run
    }

    /// Check value ranges and unsupported combinations.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.num_motes < 2 {
            return Err(ModelError::InvalidSetting(format!(
                "numMotes must be at least 2, got {}",
                self.num_motes
            )));
        }
        if self.slotframe_length < 2 {
            return Err(ModelError::InvalidSetting(format!(
                "slotframeLength must be at least 2, got {}",
                self.slotframe_length
            )));
        }
        if self.num_chans == 0 {
            return Err(ModelError::InvalidSetting("numChans must be positive".into()));
        }
        if self.slot_duration <= 0.0 {
            return Err(ModelError::InvalidSetting(format!(
                "slotDuration must be positive, got {}",
                self.slot_duration
            )));
        }
        if self.no_interference {
            // The interference-free resolution path does not exist in the
            // measured system either; refuse rather than silently model it.
            return Err(ModelError::InvalidSetting(
                "noInterference=true is not supported".into(),
            ));
        }
        if self.sixtop_pdr_threshold < 1.0 {
            return Err(ModelError::InvalidSetting(format!(
                "sixtopPdrThreshold must be >= 1, got {}",
                self.sixtop_pdr_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.pk_period_var) {
            return Err(ModelError::InvalidSetting(format!(
                "pkPeriodVar must be in [0, 1), got {}",
                self.pk_period_var
            )));
        }
        if self.scheduler.uses_gossip() {
            let slots = self.num_broadcast_cells as u32 * self.num_chans as u32;
            if slots == 0 {
                return Err(ModelError::InvalidSetting(
                    "deBras requires numBroadcastCells >= 1".into(),
                ));
            }
            if self.num_broadcast_cells > self.slotframe_length {
                return Err(ModelError::InvalidSetting(format!(
                    "numBroadcastCells ({}) exceeds slotframeLength ({})",
                    self.num_broadcast_cells, self.slotframe_length
                )));
            }
        }
        if self.parent_set_size == 0 {
            return Err(ModelError::InvalidSetting("parentSetSize must be >= 1".into()));
        }
        if self.tx_queue_size == 0 {
            return Err(ModelError::InvalidSetting("txQueueSize must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn no_interference_rejected() {
        let settings = Settings {
            no_interference: true,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ModelError::InvalidSetting(_))
        ));
    }

    #[test]
    fn scheduler_names_round_trip() {
        for (kind, name) in [
            (SchedulerKind::Random, "none"),
            (SchedulerKind::Centralized, "cen"),
            (SchedulerKind::CentralizedOptimized, "opt2"),
            (SchedulerKind::DeBras, "deBras"),
        ] {
            let yaml = serde_yaml::to_string(&kind).unwrap();
            assert_eq!(yaml.trim(), name);
            let back: SchedulerKind = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn cycle_duration() {
        let settings = Settings::default();
        assert!((settings.cycle_duration() - 1.01).abs() < 1e-9);
        assert_eq!(settings.total_slots(), 101 * 100);
    }

    #[test]
    fn debras_needs_broadcast_cells() {
        let settings = Settings {
            scheduler: SchedulerKind::DeBras,
            num_broadcast_cells: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
