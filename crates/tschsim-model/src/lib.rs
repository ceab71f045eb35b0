//! Run settings and the static topology oracle.
//!
//! A simulation run is fully described by a [`Settings`] value (immutable
//! knobs) and a [`Topology`] value (per-link RSSI plus the deterministic
//! RSSI→PDR curve). Both can be built programmatically or loaded together
//! from one YAML document via [`load_config`] / [`RunConfig`].

mod error;
mod settings;
mod topology;

pub use error::ModelError;
pub use settings::{SchedulerKind, Settings};
pub use topology::{LinkSpec, MotePosition, Topology, TopologyConfig, rssi_to_pdr};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A complete run configuration: settings plus topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Simulation settings.
    #[serde(default)]
    pub settings: Settings,
    /// Static neighbor graph.
    pub topology: TopologyConfig,
}

impl RunConfig {
    /// Validate the settings and build the topology oracle.
    pub fn build(self) -> Result<(Settings, Topology), ModelError> {
        self.settings.validate()?;
        let topology = Topology::from_config(&self.topology, self.settings.num_motes)?;
        Ok((self.settings, topology))
    }
}

/// Load a [`RunConfig`] from a YAML file.
pub fn load_config(path: &Path) -> Result<RunConfig, ModelError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ModelError::Io(path.display().to_string(), e))?;
    load_config_from_str(&text)
}

/// Load a [`RunConfig`] from YAML text.
pub fn load_config_from_str(text: &str) -> Result<RunConfig, ModelError> {
    Ok(serde_yaml::from_str(text)?)
}
