//! Discrete-event simulator for a 6TiSCH-style time-slotted
//! channel-hopping mesh.
//!
//! One [`Simulation`] value owns the complete run context: settings,
//! topology oracle, seeded RNG, the mote arena, the propagation registry,
//! the event queue, and the statistics. Everything executes on a single
//! thread; the event queue is the only source of ordering, and all
//! randomness draws from the one seeded stream, so a run is a pure
//! function of `(settings, topology, seed)`.
//!
//! ```rust,no_run
//! use tschsim_model::{Settings, Topology};
//! use tschsim_sim::Simulation;
//!
//! let settings = Settings::default();
//! let topology = Topology::from_links(
//!     vec![(0.0, 0.0), (0.3, 0.0)],
//!     &[(0, 1, -80.0), (1, 0, -80.0)],
//! ).unwrap();
//! # let settings = Settings { num_motes: 2, ..settings };
//! let mut sim = Simulation::new(settings, topology, 5).unwrap();
//! let report = sim.run().unwrap();
//! println!("{} packets reached the root", report.totals.app_reaches_root);
//! ```

mod alloc;
mod app;
mod engine;
mod gossip;
mod mac;
mod mote;
mod otf;
mod packet;
mod propagation;
mod rpl;
mod schedule;
mod sim;
mod sixtop;
mod stats;

pub use engine::{Event, EventKind, EventQueue};
pub use mote::{EnqueueError, Mote, MoteStats};
pub use packet::{DataPayload, Destination, Packet, PacketKind};
pub use schedule::{
    Cell, CellDirection, CellKey, CellPeer, Schedule, ScheduleError, ScheduleSnapshot,
    SnapshotCell,
};
pub use sim::{SimError, Simulation};
pub use stats::{Counters, CycleRecord, MoteSummary, RunReport, RunStats};
