//! Power-unit conversions used by the propagation model.

/// Convert a power level in dBm to milliwatts.
#[inline]
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert a power level in milliwatts to dBm.
///
/// `mw` must be strictly positive; the propagation code clamps signal
/// power to a small positive floor before converting.
#[inline]
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Parts-per-million expressed as a dimensionless factor.
#[inline]
pub fn ppm(value: f64) -> f64 {
    value * 1e-6
}
