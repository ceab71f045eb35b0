//! Metric declarations for the tschsim simulator.
//!
//! All metrics emitted through the [`metrics`] facade are declared here as
//! structured [`Metric`] constants to avoid name typos and keep the
//! descriptions in one place. The facade is observability plumbing only;
//! the authoritative simulation results are the serde record types in
//! `tschsim-sim`.
//!
//! ```rust,ignore
//! use tschsim_metrics::{describe_metrics, metric_defs};
//!
//! describe_metrics();
//! metrics::counter!(metric_defs::APP_REACHES_ROOT.name).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_histogram, Unit};

/// The kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing counter.
    Counter,
    /// Distribution of observed values.
    Histogram,
}

/// A metric declaration with its metadata.
///
/// Const constructors allow declaring the full metric set at compile time:
///
/// ```rust
/// use tschsim_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const DROPS: Metric = Metric::counter("tschsim.mac.dropped")
///     .with_description("Packets dropped at the MAC layer")
///     .with_unit(Unit::Count);
/// assert_eq!(DROPS.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name, e.g. `tschsim.app.generated`.
    pub name: &'static str,
    /// Counter or histogram.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// Unit of measurement, if any.
    pub unit: Option<Unit>,
}

impl Metric {
    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Metric {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
        }
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Metric {
            name,
            kind: MetricKind::Histogram,
            description: "",
            unit: None,
        }
    }

    /// Attach a description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Attach a unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Register this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metric definitions for the simulator.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Application packets generated at source motes.
    pub const APP_GENERATED: Metric = Metric::counter("tschsim.app.generated")
        .with_description("Application packets generated at source motes")
        .with_unit(Unit::Count);

    /// Data packets delivered to the DAG root.
    pub const APP_REACHES_ROOT: Metric = Metric::counter("tschsim.app.reaches_root")
        .with_description("Data packets delivered to the DAG root")
        .with_unit(Unit::Count);

    /// End-to-end latency of delivered packets, in slots.
    pub const APP_LATENCY_SLOTS: Metric = Metric::histogram("tschsim.app.latency_slots")
        .with_description("End-to-end latency of delivered packets in slots")
        .with_unit(Unit::Count);

    /// Hop count of delivered packets.
    pub const APP_HOPS: Metric = Metric::histogram("tschsim.app.hops")
        .with_description("Hop count of packets delivered to the root")
        .with_unit(Unit::Count);

    /// Packets dropped because MAC retries were exhausted.
    pub const MAC_DROPPED_RETRIES: Metric = Metric::counter("tschsim.mac.dropped_retries")
        .with_description("Packets dropped after exhausting MAC retries")
        .with_unit(Unit::Count);

    /// Packets rejected at enqueue time (no route, no cells, queue full).
    pub const MAC_DROPPED_ENQUEUE: Metric = Metric::counter("tschsim.mac.dropped_enqueue")
        .with_description("Packets rejected at enqueue time")
        .with_unit(Unit::Count);

    /// Unicast transmissions lost to interference.
    pub const PHY_DROP_COLLISION: Metric = Metric::counter("tschsim.phy.drop_collision")
        .with_description("Unicast transmissions lost to interference")
        .with_unit(Unit::Count);

    /// Unicast transmissions lost to propagation alone.
    pub const PHY_DROP_PROPAGATION: Metric = Metric::counter("tschsim.phy.drop_propagation")
        .with_description("Unicast transmissions lost to propagation alone")
        .with_unit(Unit::Count);

    /// Cells relocated by 6top TX housekeeping.
    pub const SIXTOP_TX_RELOCATED: Metric = Metric::counter("tschsim.sixtop.tx_relocated")
        .with_description("Cells relocated by transmitter-side housekeeping")
        .with_unit(Unit::Count);

    /// Cells relocated by 6top RX housekeeping.
    pub const SIXTOP_RX_RELOCATED: Metric = Metric::counter("tschsim.sixtop.rx_relocated")
        .with_description("Cells relocated by receiver-side collision detection")
        .with_unit(Unit::Count);

    /// Preferred-parent changes.
    pub const RPL_CHURN: Metric = Metric::counter("tschsim.rpl.churn")
        .with_description("Preferred-parent changes across the network")
        .with_unit(Unit::Count);

    /// All defined metrics.
    pub const ALL: &[&Metric] = &[
        &APP_GENERATED,
        &APP_REACHES_ROOT,
        &APP_LATENCY_SLOTS,
        &APP_HOPS,
        &MAC_DROPPED_RETRIES,
        &MAC_DROPPED_ENQUEUE,
        &PHY_DROP_COLLISION,
        &PHY_DROP_PROPAGATION,
        &SIXTOP_TX_RELOCATED,
        &SIXTOP_RX_RELOCATED,
        &RPL_CHURN,
    ];
}

/// Register descriptions for every metric; call once at startup.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
