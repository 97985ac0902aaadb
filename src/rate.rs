//! Per-flow rate accounting.
//!
//! A flow only contributes to rate aggregates when its lifetime is strictly
//! positive; zero is the uninitialized sentinel for the minima, so a real
//! minimum can never be reported as zero.

use serde::Serialize;

/// Min/avg/max bits-per-second and packets-per-second over contributing
/// flows.
///
/// During accumulation `avg_*` holds the running sum of per-flow rates;
/// [`RateStats::calc`] divides it by the contributing record count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateStats {
    pub avg_bps: f64,
    pub min_bps: f64,
    pub max_bps: f64,
    pub avg_pps: f64,
    pub min_pps: f64,
    pub max_pps: f64,
}

impl RateStats {
    /// Per-flow rates for `octets` and `packets` over `duration_ms`.
    ///
    /// Returns `None` when the duration is not strictly positive.
    pub fn sample(octets: u64, packets: u64, duration_ms: u32) -> Option<(f64, f64)> {
        if duration_ms == 0 {
            return None;
        }
        let secs = f64::from(duration_ms) / 1_000.0;
        let bps = octets as f64 * 8.0 / secs;
        let pps = packets as f64 / secs;
        Some((bps, pps))
    }

    /// Fold one flow's rates into the aggregate.
    pub fn add_sample(&mut self, bps: f64, pps: f64) {
        if self.max_pps < pps {
            self.max_pps = pps;
        }
        if self.min_pps == 0.0 || self.min_pps > pps {
            self.min_pps = pps;
        }
        self.avg_pps += pps;

        if self.max_bps < bps {
            self.max_bps = bps;
        }
        if self.min_bps == 0.0 || self.min_bps > bps {
            self.min_bps = bps;
        }
        self.avg_bps += bps;
    }

    /// Turn the running sums into averages over `recs` contributing flows.
    pub fn calc(&mut self, recs: u64) {
        if recs > 0 {
            self.avg_bps /= recs as f64;
            self.avg_pps /= recs as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_contributes_nothing() {
        assert_eq!(RateStats::sample(400, 4, 0), None);
    }

    #[test]
    fn sample_rates() {
        let (bps, pps) = RateStats::sample(1_000, 10, 2_000).unwrap();
        assert_eq!(bps, 4_000.0);
        assert_eq!(pps, 5.0);
    }

    #[test]
    fn min_sentinel_never_sticks_at_zero() {
        let mut r = RateStats::default();
        r.add_sample(8_000.0, 10.0);
        r.add_sample(2_000.0, 40.0);
        r.add_sample(4_000.0, 20.0);

        assert_eq!(r.min_bps, 2_000.0);
        assert_eq!(r.max_bps, 8_000.0);
        assert_eq!(r.min_pps, 10.0);
        assert_eq!(r.max_pps, 40.0);

        r.calc(3);
        assert!((r.avg_bps - 14_000.0 / 3.0).abs() < 1e-9);
        assert!((r.avg_pps - 70.0 / 3.0).abs() < 1e-9);
    }
}
