//! Protocol constants.
//!
//! Values that are fixed by the modelled protocols rather than by run
//! configuration. Rank arithmetic follows RPL (RFC 6550) with the
//! profile used by the measured system; the charge table is the per-slot
//! energy cost of each radio activity class in microcoulombs.

// ---------------------------------------------------------------------------
// RPL rank parameters
// ---------------------------------------------------------------------------

/// Minimum rank increase of a single hop.
pub const RPL_MIN_HOP_RANK_INCREASE: f64 = 1536.0;

/// A candidate parent is discarded when its rank increase exceeds this.
pub const RPL_MAX_RANK_INCREASE: f64 = 2.0 * 1.3 * RPL_MIN_HOP_RANK_INCREASE;

/// Upper bound on total rank; candidates pushing past it are discarded.
pub const RPL_MAX_TOTAL_RANK: f64 = 2.0 * RPL_MIN_HOP_RANK_INCREASE * 8.0;

/// Hysteresis: the preferred parent only changes when the challenger's
/// rank beats the incumbent's by at least this much.
pub const RPL_PARENT_SWITCH_THRESHOLD: f64 = 384.0;

/// Baseline transmission trials assumed at the link's static PDR when
/// estimating ETX, so that fresh links neither look perfect nor broken.
pub const NUM_SUFFICIENT_TX: u32 = 10;

/// Loop-check walk limit: any consistent DAG reaches the root within
/// this many hops.
pub const MAX_PARENT_CHAIN_HOPS: usize = 30;

// ---------------------------------------------------------------------------
// MAC parameters
// ---------------------------------------------------------------------------

/// MAC retries before a packet is dropped.
pub const MAX_MAC_RETRIES: u8 = 5;

/// Default transmit queue bound.
pub const DEFAULT_TX_QUEUE_SIZE: usize = 10;

/// Depth of the per-cell ack/no-ack history ring.
pub const CELL_HISTORY_LEN: usize = 32;

/// TX attempts a cell must have seen before its measured PDR is trusted
/// by housekeeping.
pub const CELL_PDR_MIN_TX: u32 = 10;

/// Receiver capture guard margin in dB applied on unicast reception.
pub const RX_GUARD_DB: f64 = 8.0;

/// Shared cells stay silent for the first two slotframes after boot.
pub const SHARED_CELL_QUIET_SLOTFRAMES: u64 = 2;

// ---------------------------------------------------------------------------
// Application instrumentation window
// ---------------------------------------------------------------------------

/// First cycle (inclusive) of the instrumented window.
pub const PROBE_WINDOW_START_CYCLE: u64 = 64;

/// Last cycle (inclusive) of the instrumented window; data generation
/// ceases once this many cycles have elapsed.
pub const PROBE_WINDOW_END_CYCLE: u64 = 96;

// ---------------------------------------------------------------------------
// Charge table (microcoulombs per slot)
// ---------------------------------------------------------------------------

/// Idle listen: radio on, nothing decoded.
pub const CHARGE_IDLE_UC: f64 = 6.4;

/// Transmit data and receive the acknowledgement.
pub const CHARGE_TX_DATA_RX_ACK_UC: f64 = 54.5;

/// Transmit data, no acknowledgement expected or received.
pub const CHARGE_TX_DATA_UC: f64 = 49.5;

/// Receive data and transmit the acknowledgement.
pub const CHARGE_RX_DATA_TX_ACK_UC: f64 = 32.6;

/// Receive data without acknowledging (broadcast).
pub const CHARGE_RX_DATA_UC: f64 = 22.6;

/// Clock drift bound, parts per million. Each mote draws its drift
/// uniformly from ±this.
pub const CLOCK_DRIFT_PPM_BOUND: f64 = 30.0;
