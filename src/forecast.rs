// GreenFlow: joint flow routing and link sleeping for hybrid SDN networks
// Copyright (C) 2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Per-link demand forecasting: a one-step EWMA with volatility-adaptive smoothing, plus the
//! mapping from the predicted peak to the planner's load/energy weight pair.
//!
//! Everything here is pure; the caller owns the histories and runs the forecast on its own
//! thread.

use std::collections::BTreeMap;

use crate::types::{EdgeKey, Weights};

/// Configuration of the forecaster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastConfig {
    /// Base EWMA smoothing factor in `[0, 1]`, used when adaptation is off.
    pub alpha: f64,
    /// Derive α per series from its recent volatility.
    pub adaptive_alpha: bool,
    /// Look-back window of the volatility estimate.
    pub adapt_window: usize,
    /// Lower bound of the adaptive α.
    pub alpha_min: f64,
    /// Upper bound of the adaptive α.
    pub alpha_max: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        ForecastConfig {
            alpha: 0.6,
            adaptive_alpha: true,
            adapt_window: 6,
            alpha_min: 0.3,
            alpha_max: 0.9,
        }
    }
}

/// Batch prediction over all edges, with its summary statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Next-step prediction per edge, in Mbps.
    pub next: BTreeMap<EdgeKey, f64>,
    /// Maximum prediction over all edges.
    pub peak: f64,
    /// Arithmetic mean over all edges.
    pub mean: f64,
}

/// The forecaster. Stateless apart from its configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Forecast {
    /// Configuration used by [`Forecast::predict_next`].
    cfg: ForecastConfig,
}

impl Forecast {
    /// Create a forecaster with the given configuration.
    pub fn new(cfg: ForecastConfig) -> Self {
        Forecast { cfg }
    }

    /// The active configuration.
    pub fn config(&self) -> ForecastConfig {
        self.cfg
    }

    /// Predict the next value of every edge and summarize peak and mean. Empty histories predict
    /// 0.
    pub fn predict_next(&self, histories: &BTreeMap<EdgeKey, Vec<f64>>) -> Prediction {
        let mut next = BTreeMap::new();
        let mut peak = 0.0f64;
        let mut sum = 0.0;
        for (&edge, h) in histories {
            let alpha = if self.cfg.adaptive_alpha {
                adapt_alpha(h, self.cfg.alpha_min, self.cfg.alpha_max, self.cfg.adapt_window)
            } else {
                self.cfg.alpha
            };
            let pred = ewma_next(h, alpha);
            peak = peak.max(pred);
            sum += pred;
            next.insert(edge, pred);
        }
        let mean = if next.is_empty() {
            0.0
        } else {
            sum / next.len() as f64
        };
        Prediction { next, peak, mean }
    }
}

/// One-step EWMA prediction: fold the chronological history into the smoothed state and return
/// it. An empty history yields 0; a singleton yields its only element.
pub fn ewma_next(hist: &[f64], alpha: f64) -> f64 {
    let mut iter = hist.iter();
    let first = match iter.next() {
        Some(x) => *x,
        None => return 0.0,
    };
    iter.fold(first, |s, x| alpha * x + (1.0 - alpha) * s)
}

/// Choose α from the coefficient of variation over the last `win` samples: volatile series get a
/// reactive (high) α, steady series a smooth (low) one.
///
/// Degenerate inputs fall back conservatively: invalid bounds to the 0.6 default, too-short
/// histories to the midpoint, a non-positive mean to `alpha_min`.
pub fn adapt_alpha(hist: &[f64], alpha_min: f64, alpha_max: f64, win: usize) -> f64 {
    if !alpha_min.is_finite() || !alpha_max.is_finite() || alpha_min > alpha_max {
        return 0.6;
    }
    if hist.len() < win.max(2) {
        return ((alpha_min + alpha_max) * 0.5).clamp(0.0, 1.0);
    }
    let tail = &hist[hist.len() - win.min(hist.len())..];
    let n = tail.len() as f64;
    let mean = tail.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return alpha_min;
    }
    let var = tail.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0).max(1.0);
    let cov = var.sqrt() / mean.max(1e-9);

    // soft-clip the CoV onto [alpha_min, alpha_max]; 0.3 marks moderate volatility
    let x = cov / 0.3;
    let w = x / (1.0 + x);
    (alpha_min + (alpha_max - alpha_min) * w).clamp(alpha_min, alpha_max)
}

/// Derive the planner weights from the predicted peak and a capacity threshold in Mbps. A
/// non-positive threshold degenerates to pure energy optimization.
pub fn weights_from_peak(predicted_peak_mbps: f64, threshold_mbps: f64) -> Weights {
    if threshold_mbps <= 0.0 {
        return Weights { ewr: 1.0, lwr: 0.0 };
    }
    weights_from_ratio(predicted_peak_mbps / threshold_mbps, 1.25)
}

/// Map a peak/threshold ratio onto the weight pair through the S-shaped curve
/// `LWr = r^γ / (1 + r^γ)` (γ floored at 0.5), with `EWr = 1 − LWr`.
pub fn weights_from_ratio(peak_over_thresh: f64, gamma: f64) -> Weights {
    let r = peak_over_thresh.max(0.0);
    let rg = r.powf(gamma.max(0.5));
    let lwr = rg / (1.0 + rg);
    Weights {
        ewr: 1.0 - lwr,
        lwr,
    }
}

/// Arithmetic mean, 0 for an empty slice.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Maximum, 0 for an empty slice.
pub fn peak(xs: &[f64]) -> f64 {
    xs.iter().copied().fold(0.0, f64::max)
}

#[cfg(test)]
mod test {
    use super::*;

    /// Approximate float comparison.
    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() <= eps
    }

    #[test]
    fn ewma_boundaries() {
        assert_eq!(ewma_next(&[], 0.5), 0.0);
        assert_eq!(ewma_next(&[42.0], 0.5), 42.0);
    }

    #[test]
    fn ewma_step_trajectory() {
        // smoothed state walks 10, 10, 10, 30
        assert_eq!(ewma_next(&[10.0, 10.0, 10.0, 50.0], 0.5), 30.0);
    }

    #[test]
    fn ewma_stays_within_history_bounds() {
        let h = [3.0, 9.0, 1.0, 7.0, 2.0];
        for alpha in [0.0, 0.3, 0.5, 0.9, 1.0] {
            let p = ewma_next(&h, alpha);
            assert!((1.0..=9.0).contains(&p), "alpha={alpha} p={p}");
        }
    }

    #[test]
    fn adaptive_alpha_respects_bounds() {
        let steady = vec![100.0; 10];
        let volatile: Vec<f64> = (0..10).map(|i| if i % 2 == 0 { 10.0 } else { 400.0 }).collect();
        for h in [&steady, &volatile] {
            let a = adapt_alpha(h, 0.3, 0.9, 6);
            assert!((0.3..=0.9).contains(&a), "alpha {a} out of bounds");
        }
        // volatility pushes alpha up
        assert!(adapt_alpha(&volatile, 0.3, 0.9, 6) > adapt_alpha(&steady, 0.3, 0.9, 6));
    }

    #[test]
    fn adaptive_alpha_degenerate_cases() {
        // invalid bounds: default
        assert_eq!(adapt_alpha(&[1.0; 10], 0.9, 0.3, 6), 0.6);
        // short history: midpoint
        assert_eq!(adapt_alpha(&[1.0, 2.0], 0.3, 0.9, 6), 0.6);
        // non-positive mean: alpha_min
        assert_eq!(adapt_alpha(&[0.0; 10], 0.3, 0.9, 6), 0.3);
    }

    #[test]
    fn weights_shape_at_eighty_percent_load() {
        let w = weights_from_peak(80.0, 100.0);
        assert!(close(w.lwr, 0.430, 1e-3), "lwr = {}", w.lwr);
        assert!(close(w.ewr, 0.570, 1e-3), "ewr = {}", w.ewr);
    }

    #[test]
    fn weights_always_sum_to_one() {
        for peak in [0.0, 10.0, 80.0, 100.0, 1000.0] {
            let w = weights_from_peak(peak, 100.0);
            assert!(close(w.ewr + w.lwr, 1.0, 1e-12));
            assert!(w.lwr >= 0.0 && w.lwr < 1.0);
        }
    }

    #[test]
    fn non_positive_threshold_prioritizes_energy() {
        assert_eq!(weights_from_peak(500.0, 0.0), Weights { ewr: 1.0, lwr: 0.0 });
        assert_eq!(weights_from_peak(500.0, -1.0), Weights { ewr: 1.0, lwr: 0.0 });
    }

    #[test]
    fn batch_prediction_summarizes_peak_and_mean() {
        let e1 = EdgeKey::new(1, 2);
        let e2 = EdgeKey::new(2, 3);
        let e3 = EdgeKey::new(3, 4);
        let histories = BTreeMap::from([
            (e1, vec![100.0; 8]),
            (e2, vec![50.0; 8]),
            (e3, vec![]),
        ]);
        let pred = Forecast::default().predict_next(&histories);
        assert_eq!(pred.next[&e1], 100.0);
        assert_eq!(pred.next[&e2], 50.0);
        assert_eq!(pred.next[&e3], 0.0);
        assert_eq!(pred.peak, 100.0);
        assert_eq!(pred.mean, 50.0);
    }

    #[test]
    fn empty_batch_is_all_zero() {
        let pred = Forecast::default().predict_next(&BTreeMap::new());
        assert!(pred.next.is_empty());
        assert_eq!(pred.peak, 0.0);
        assert_eq!(pred.mean, 0.0);
    }
}
