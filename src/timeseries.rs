//! Time-stamped sample records and co-registration of concurrent captures.
//!
//! Sampling-mode measurements come back as two parallel arrays (instrument
//! timestamps and readings). [`TimedSeries`] pairs them, and
//! [`co_register`] aligns two series captured on independent clocks by
//! linear interpolation onto each other's time base, so a prober-side and
//! an analyzer-side capture of the same interval can be tabulated together.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::{ProbeError, Result};

/// A sequence of readings with per-sample timestamps in seconds.
///
/// Timestamps are assumed ascending, which holds for anything an
/// instrument's sample clock produces. Interpolation does not re-sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSeries {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl TimedSeries {
    /// Pair timestamp and value arrays.
    ///
    /// Mismatched lengths mean the instrument returned partial buffers, so
    /// this refuses to guess at an alignment.
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if times.len() != values.len() {
            return Err(ProbeError::InstrumentFault(format!(
                "timed series misaligned: {} timestamps vs {} samples",
                times.len(),
                values.len()
            )));
        }
        Ok(Self { times, values })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Shift every timestamp by `offset` seconds.
    ///
    /// Captures that each start their clock at zero need this to land on a
    /// shared experiment time base before co-registration.
    pub fn with_offset(mut self, offset: f64) -> Self {
        for t in &mut self.times {
            *t += offset;
        }
        self
    }

    /// Linearly interpolate this series at each of `target` times.
    ///
    /// Times outside the captured span clamp to the first or last value;
    /// an empty series yields NaN everywhere.
    pub fn interp_onto(&self, target: &[f64]) -> Vec<f64> {
        target.iter().map(|&t| self.sample_at(t)).collect()
    }

    fn sample_at(&self, t: f64) -> f64 {
        let Some((&t_first, t_rest)) = self.times.split_first() else {
            return f64::NAN;
        };
        if t <= t_first {
            return self.values[0];
        }
        let last = self.times.len() - 1;
        if t >= self.times[last] {
            return self.values[last];
        }
        // First index whose timestamp is >= t; bounded by the clamps above.
        let hi = t_rest.partition_point(|&x| x < t) + 1;
        let (t_lo, t_hi) = (self.times[hi - 1], self.times[hi]);
        if t_hi == t_lo {
            return self.values[hi];
        }
        let frac = (t - t_lo) / (t_hi - t_lo);
        self.values[hi - 1] + frac * (self.values[hi] - self.values[hi - 1])
    }
}

/// Tabulate two concurrently captured series onto each other's time base.
///
/// Returns one row table per input: `(t, a, b_at_t)` over `a`'s timestamps
/// and `(t, b, a_at_t)` over `b`'s, so each capture keeps its native sample
/// points and gains an interpolated column from the other.
pub fn co_register(a: &TimedSeries, b: &TimedSeries) -> (Vec<[f64; 3]>, Vec<[f64; 3]>) {
    let b_on_a = b.interp_onto(a.times());
    let a_on_b = a.interp_onto(b.times());
    let on_a = a
        .times
        .iter()
        .zip(&a.values)
        .zip(b_on_a)
        .map(|((&t, &v), w)| [t, v, w])
        .collect();
    let on_b = b
        .times
        .iter()
        .zip(&b.values)
        .zip(a_on_b)
        .map(|((&t, &v), w)| [t, v, w])
        .collect();
    (on_a, on_b)
}

/// Drive two captures concurrently and return both series.
///
/// The fragments run on the same task; either error aborts the pair.
pub async fn acquire_pair<A, B>(a: A, b: B) -> Result<(TimedSeries, TimedSeries)>
where
    A: Future<Output = Result<TimedSeries>>,
    B: Future<Output = Result<TimedSeries>>,
{
    let (first, second) = futures::try_join!(a, b)?;
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(times: &[f64], values: &[f64]) -> TimedSeries {
        TimedSeries::new(times.to_vec(), values.to_vec()).expect("aligned arrays")
    }

    #[test]
    fn test_mismatched_arrays_are_rejected() {
        let result = TimedSeries::new(vec![0.0, 1.0], vec![5.0]);
        assert!(matches!(result, Err(ProbeError::InstrumentFault(_))));
    }

    #[test]
    fn test_interpolation_is_linear_between_samples() {
        let s = series(&[0.0, 1.0, 2.0], &[0.0, 10.0, 20.0]);
        assert_eq!(s.interp_onto(&[0.5, 1.5]), [5.0, 15.0]);
        assert_eq!(s.interp_onto(&[1.0]), [10.0]);
    }

    #[test]
    fn test_interpolation_clamps_outside_the_span() {
        let s = series(&[0.0, 1.0, 2.0], &[0.0, 10.0, 20.0]);
        assert_eq!(s.interp_onto(&[-5.0, 3.0]), [0.0, 20.0]);
    }

    #[test]
    fn test_empty_series_interpolates_to_nan() {
        let s = series(&[], &[]);
        assert!(s.interp_onto(&[1.0])[0].is_nan());
    }

    #[test]
    fn test_offset_shifts_every_timestamp() {
        let s = series(&[0.0, 1.0], &[1.0, 2.0]).with_offset(10.0);
        assert_eq!(s.times(), [10.0, 11.0]);
        assert_eq!(s.values(), [1.0, 2.0]);
    }

    #[test]
    fn test_co_registration_keeps_native_sample_points() {
        let a = series(&[0.0, 1.0, 2.0], &[0.0, 10.0, 20.0]);
        let b = series(&[0.5, 1.5], &[100.0, 200.0]);
        let (on_a, on_b) = co_register(&a, &b);
        assert_eq!(on_a, [[0.0, 0.0, 100.0], [1.0, 10.0, 150.0], [2.0, 20.0, 200.0]]);
        assert_eq!(on_b, [[0.5, 100.0, 5.0], [1.5, 200.0, 15.0]]);
    }

    #[test]
    fn test_acquire_pair_joins_both_captures() {
        let (a, b) = tokio_test::block_on(acquire_pair(
            async { Ok(series(&[0.0], &[1.0])) },
            async { Ok(series(&[0.0, 0.1], &[2.0, 3.0])) },
        ))
        .expect("both succeed");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_acquire_pair_propagates_either_failure() {
        let result = tokio_test::block_on(acquire_pair(
            async { Ok(series(&[0.0], &[1.0])) },
            async { Err(ProbeError::Communication("link dropped".into())) },
        ));
        assert!(matches!(result, Err(ProbeError::Communication(_))));
    }
}
