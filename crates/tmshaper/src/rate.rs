//! Rate conversion between operator units and TM shaping units.
//!
//! With `unit == "BPS"` the SDE encodes `max_rate` in 1 kbps steps: the
//! default port max_rate of ~10,003,999 corresponds to ~10 Gbps. Requested
//! rates are floored to the step, never rounded up.

use std::fmt;

use crate::error::{TmError, TmResult};

/// Bits per second represented by one hardware shaping unit.
pub const BPS_PER_UNIT: i64 = 1_000;

/// Converts a rate in bits per second into hardware shaping units.
///
/// Negative rates convert to 0.
pub fn to_hardware_units(rate_bps: i64) -> u64 {
    if rate_bps <= 0 {
        return 0;
    }
    // rate_bps > 0, so the quotient fits in u64.
    (rate_bps / BPS_PER_UNIT) as u64
}

/// Converts hardware shaping units back into bits per second.
pub fn from_hardware_units(units: u64) -> u64 {
    units.saturating_mul(BPS_PER_UNIT as u64)
}

/// A shaping rate as requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateRequest {
    /// Gigabits per second.
    Gbps(f64),
    /// Megabits per second.
    Mbps(f64),
    /// Bits per second.
    Bps(i64),
}

impl RateRequest {
    /// Picks the rate from the mutually exclusive CLI options.
    ///
    /// Explicit bps wins over gbps, which wins over mbps.
    pub fn from_options(
        max_gbps: Option<f64>,
        max_mbps: Option<f64>,
        max_bps: Option<i64>,
    ) -> Option<Self> {
        max_bps
            .map(RateRequest::Bps)
            .or_else(|| max_gbps.map(RateRequest::Gbps))
            .or_else(|| max_mbps.map(RateRequest::Mbps))
    }

    /// Returns the requested rate in bits per second, truncated.
    pub fn bits_per_second(&self) -> i64 {
        match *self {
            RateRequest::Gbps(g) => (g * 1_000_000_000.0) as i64,
            RateRequest::Mbps(m) => (m * 1_000_000.0) as i64,
            RateRequest::Bps(b) => b,
        }
    }

    /// Rejects negative or non-finite rates.
    pub fn validate(&self) -> TmResult<()> {
        let (arg, ok) = match *self {
            RateRequest::Gbps(g) => ("--max-gbps", g.is_finite() && g >= 0.0),
            RateRequest::Mbps(m) => ("--max-mbps", m.is_finite() && m >= 0.0),
            RateRequest::Bps(b) => ("--max-bps", b >= 0),
        };
        if ok {
            Ok(())
        } else {
            Err(TmError::invalid_argument(arg, format!("invalid rate {}", self)))
        }
    }
}

impl fmt::Display for RateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateRequest::Gbps(g) => write!(f, "{} Gbps", g),
            RateRequest::Mbps(m) => write!(f, "{} Mbps", m),
            RateRequest::Bps(b) => write!(f, "{} bps", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hardware_units_floors() {
        assert_eq!(to_hardware_units(0), 0);
        assert_eq!(to_hardware_units(999), 0);
        assert_eq!(to_hardware_units(1_000), 1);
        assert_eq!(to_hardware_units(1_999), 1);
        assert_eq!(to_hardware_units(10_000_000_000), 10_000_000);
    }

    #[test]
    fn test_to_hardware_units_negative() {
        assert_eq!(to_hardware_units(-1), 0);
        assert_eq!(to_hardware_units(i64::MIN), 0);
    }

    #[test]
    fn test_to_hardware_units_monotonic() {
        let samples = [0, 1, 500, 999, 1_000, 1_001, 25_999, 26_000, 1 << 40, i64::MAX];
        for pair in samples.windows(2) {
            assert!(to_hardware_units(pair[0]) <= to_hardware_units(pair[1]));
        }
        for r in samples {
            assert_eq!(to_hardware_units(r), (r / 1_000) as u64);
        }
    }

    #[test]
    fn test_rate_request_precedence() {
        assert_eq!(
            RateRequest::from_options(Some(1.0), Some(5.0), Some(42)),
            Some(RateRequest::Bps(42))
        );
        assert_eq!(
            RateRequest::from_options(Some(1.0), Some(5.0), None),
            Some(RateRequest::Gbps(1.0))
        );
        assert_eq!(
            RateRequest::from_options(None, Some(5.0), None),
            Some(RateRequest::Mbps(5.0))
        );
        assert_eq!(RateRequest::from_options(None, None, None), None);
    }

    #[test]
    fn test_rate_request_bits() {
        assert_eq!(RateRequest::Gbps(10.0).bits_per_second(), 10_000_000_000);
        assert_eq!(RateRequest::Mbps(2.5).bits_per_second(), 2_500_000);
    }

    #[test]
    fn test_rate_request_validate() {
        assert!(RateRequest::Gbps(1.5).validate().is_ok());
        assert!(RateRequest::Mbps(-1.0).validate().is_err());
        assert!(RateRequest::Gbps(f64::NAN).validate().is_err());
        assert!(RateRequest::Bps(-5).validate().is_err());
    }
}
