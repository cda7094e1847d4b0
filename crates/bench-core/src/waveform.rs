//! Waveform step materialization and post-processing (spec.md §4.6).
//!
//! This module is deliberately free of any wall-clock or scheduling concern:
//! `SequenceEngine` (in `bench-server`) owns the tick timer and calls into
//! `materialize_cycle` once per cycle and `postprocess` once per step. Kept
//! pure so the waveform formulas can be property-tested without pausing a
//! `tokio` runtime.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandardShape {
    Sine,
    Triangle,
    Ramp,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformParams {
    #[serde(rename = "type")]
    pub shape: StandardShape,
    pub min: f64,
    pub max: f64,
    pub points_per_cycle: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomWalk {
    pub start_value: f64,
    pub max_step_size: f64,
    pub min: f64,
    pub max: f64,
    pub points_per_cycle: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitraryStep {
    pub value: f64,
    pub dwell_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrarySteps {
    pub steps: Vec<ArbitraryStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Waveform {
    Standard(WaveformParams),
    RandomWalk(RandomWalk),
    Arbitrary(ArbitrarySteps),
}

/// A single scheduled step: the raw (pre-postprocessing) value and its
/// dwell duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub value: f64,
    pub dwell_ms: u64,
}

/// Generate exactly one cycle's worth of raw steps (spec.md §4.6).
///
/// `prev` is the last raw value produced by a previous cycle, used only to
/// seed `RandomWalk` continuation across cycle boundaries; standard shapes
/// and arbitrary steps ignore it. `rng_step` supplies the random walk's
/// per-sample delta in `[-1.0, 1.0]`, already unit-scaled by the caller
/// (kept as an injected closure so tests are deterministic without pulling
/// in a seeded-rng dependency here).
pub fn materialize_cycle(waveform: &Waveform, prev: Option<f64>, mut rng_unit: impl FnMut() -> f64) -> Vec<Step> {
    match waveform {
        Waveform::Standard(p) => standard_cycle(p),
        Waveform::RandomWalk(w) => random_walk_cycle(w, prev, &mut rng_unit),
        Waveform::Arbitrary(a) => a
            .steps
            .iter()
            .map(|s| Step {
                value: s.value,
                dwell_ms: s.dwell_ms,
            })
            .collect(),
    }
}

fn standard_cycle(p: &WaveformParams) -> Vec<Step> {
    let n = p.points_per_cycle.max(1);
    let span = p.max - p.min;
    (0..n)
        .map(|i| {
            let value = match p.shape {
                StandardShape::Sine => p.min + span * ((2.0 * PI * i as f64 / n as f64).sin() + 1.0) / 2.0,
                StandardShape::Triangle => triangle_value(i, n, p.min, p.max),
                StandardShape::Ramp => p.min + span * (i as f64 / n as f64),
                StandardShape::Square => {
                    if i < n / 2 {
                        p.min
                    } else {
                        p.max
                    }
                }
            };
            Step {
                value,
                dwell_ms: p.interval_ms,
            }
        })
        .collect()
}

/// Isoceles triangle over `[0, n)`: rises from `min` to `max` across the
/// first half, falls back across the second half.
fn triangle_value(i: u32, n: u32, min: f64, max: f64) -> f64 {
    let half = n as f64 / 2.0;
    let span = max - min;
    let phase = i as f64;
    if phase < half {
        min + span * (phase / half)
    } else {
        max - span * ((phase - half) / half)
    }
}

fn random_walk_cycle(w: &RandomWalk, prev: Option<f64>, rng_unit: &mut impl FnMut() -> f64) -> Vec<Step> {
    let n = w.points_per_cycle.max(1);
    let mut value = prev.unwrap_or(w.start_value);
    (0..n)
        .map(|_| {
            let delta = rng_unit() * w.max_step_size;
            value = (value + delta).clamp(w.min, w.max);
            Step {
                value,
                dwell_ms: w.interval_ms,
            }
        })
        .collect()
}

/// Configurable post-processing chain: scale, offset, clamp, slew limit.
/// Applied in this order per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessConfig {
    pub scale: f64,
    pub offset: f64,
    pub min_clamp: Option<f64>,
    pub max_clamp: Option<f64>,
    pub max_slew_rate: Option<f64>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        PostProcessConfig {
            scale: 1.0,
            offset: 0.0,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
        }
    }
}

/// Apply scale, then offset, then clamp, then slew-rate limiting against
/// `previous_command` over `dwell_ms` elapsed time.
pub fn postprocess(raw: f64, dwell_ms: u64, previous_command: Option<f64>, cfg: &PostProcessConfig) -> f64 {
    let mut value = raw * cfg.scale + cfg.offset;

    if let (Some(min), Some(max)) = (cfg.min_clamp, cfg.max_clamp) {
        value = value.clamp(min, max);
    } else if let Some(min) = cfg.min_clamp {
        value = value.max(min);
    } else if let Some(max) = cfg.max_clamp {
        value = value.min(max);
    }

    if let (Some(max_rate), Some(prev)) = (cfg.max_slew_rate, previous_command) {
        let dt_s = dwell_ms as f64 / 1000.0;
        if dt_s > 0.0 {
            let max_delta = max_rate * dt_s;
            let delta = value - prev;
            if delta.abs() > max_delta {
                value = prev + max_delta.copysign(delta);
            }
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_rng(v: f64) -> impl FnMut() -> f64 {
        move || v
    }

    #[test]
    fn sine_starts_at_midpoint_rising() {
        let p = WaveformParams {
            shape: StandardShape::Sine,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 4,
            interval_ms: 100,
        };
        let steps = standard_cycle(&p);
        assert_eq!(steps.len(), 4);
        assert!((steps[0].value - 5.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_goes_from_min_toward_max() {
        let p = WaveformParams {
            shape: StandardShape::Ramp,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 5,
            interval_ms: 100,
        };
        let steps = standard_cycle(&p);
        assert_eq!(steps[0].value, 0.0);
        assert_eq!(steps[4].value, 8.0);
    }

    #[test]
    fn square_splits_cycle_in_half() {
        let p = WaveformParams {
            shape: StandardShape::Square,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 4,
            interval_ms: 100,
        };
        let steps = standard_cycle(&p);
        assert_eq!(steps.iter().map(|s| s.value).collect::<Vec<_>>(), vec![0.0, 0.0, 10.0, 10.0]);
    }

    #[test]
    fn random_walk_clamps_to_bounds() {
        let w = RandomWalk {
            start_value: 9.5,
            max_step_size: 5.0,
            min: 0.0,
            max: 10.0,
            points_per_cycle: 3,
            interval_ms: 100,
        };
        let steps = random_walk_cycle(&w, None, &mut fixed_rng(1.0));
        assert!(steps.iter().all(|s| s.value <= 10.0 && s.value >= 0.0));
        assert_eq!(steps[0].value, 10.0);
    }

    #[test]
    fn random_walk_continues_from_prev_across_cycles() {
        let w = RandomWalk {
            start_value: 0.0,
            max_step_size: 1.0,
            min: -100.0,
            max: 100.0,
            points_per_cycle: 2,
            interval_ms: 100,
        };
        let steps = random_walk_cycle(&w, Some(50.0), &mut fixed_rng(1.0));
        assert_eq!(steps[0].value, 51.0);
    }

    #[test]
    fn postprocess_applies_scale_then_offset() {
        let cfg = PostProcessConfig {
            scale: 2.0,
            offset: 1.0,
            ..Default::default()
        };
        assert_eq!(postprocess(3.0, 100, None, &cfg), 7.0);
    }

    #[test]
    fn postprocess_clamps_after_scale_offset() {
        let cfg = PostProcessConfig {
            min_clamp: Some(0.0),
            max_clamp: Some(5.0),
            ..Default::default()
        };
        assert_eq!(postprocess(10.0, 100, None, &cfg), 5.0);
        assert_eq!(postprocess(-10.0, 100, None, &cfg), 0.0);
    }

    #[test]
    fn postprocess_limits_slew_rate() {
        let cfg = PostProcessConfig {
            max_slew_rate: Some(10.0),
            ..Default::default()
        };
        let result = postprocess(100.0, 500, Some(0.0), &cfg);
        assert_eq!(result, 5.0);
    }

    #[test]
    fn postprocess_slew_limit_allows_within_budget() {
        let cfg = PostProcessConfig {
            max_slew_rate: Some(100.0),
            ..Default::default()
        };
        let result = postprocess(10.0, 500, Some(5.0), &cfg);
        assert_eq!(result, 10.0);
    }
}
