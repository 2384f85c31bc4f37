//! # GRTT Estimation
//!
//! The sender periodically probes the group with `CMD(CC_PROBE)`;
//! receivers echo the timestamp (minus their processing delay) in
//! `CMD(CC_REPORT)`. The group round-trip time is the worst recent RTT
//! across responders, smoothed asymmetrically — fast up (0.25), slow
//! down (0.125) — so the estimate errs high rather than low.

use std::time::Duration;

use quanta::Instant;
use rand::rngs::SmallRng;
use rand::RngExt;
use tracing::trace;

use crate::stats::Ewma;
use crate::wire::{quantize_grtt, CcProbeCmd, CcReportCmd};

/// Probe emission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbingMode {
    /// No probes; the estimate is whatever was configured.
    None,
    /// Probes are sent but responses are not solicited; the estimate
    /// stays at the configured value.
    Passive,
    /// Full probe/response loop.
    #[default]
    Active,
}

/// EWMA weight toward samples above the current estimate.
const WEIGHT_UP: f64 = 0.25;
/// EWMA weight toward samples below the current estimate.
const WEIGHT_DOWN: f64 = 0.125;

pub struct GrttEstimator {
    /// Smoothed estimate; updated with the asymmetric weights at each
    /// probe-window boundary.
    smoothed: Ewma,
    grtt_min: f64,
    grtt_max: f64,
    mode: ProbingMode,
    /// Randomized probe spacing bounds, seconds.
    interval_min: f64,
    interval_max: f64,
    next_probe: Instant,
    cc_sequence: u16,
    /// Worst RTT observed in the current probe window.
    window_peak: Option<f64>,
    /// Clock epoch for probe timestamps.
    epoch: Instant,
    /// Last advertised quantized value, for change detection.
    last_quantized: u8,
}

impl GrttEstimator {
    pub fn new(
        initial: f64,
        grtt_min: f64,
        grtt_max: f64,
        mode: ProbingMode,
        interval_min: f64,
        interval_max: f64,
        now: Instant,
    ) -> Self {
        let estimate = initial.clamp(grtt_min, grtt_max);
        let mut smoothed = Ewma::new(WEIGHT_DOWN);
        smoothed.update(estimate);
        GrttEstimator {
            smoothed,
            grtt_min,
            grtt_max,
            mode,
            interval_min,
            interval_max,
            next_probe: now,
            cc_sequence: 0,
            window_peak: None,
            epoch: now,
            last_quantized: quantize_grtt(estimate),
        }
    }

    pub fn estimate(&self) -> f64 {
        self.smoothed.value()
    }

    /// Overwrite the smoothed value (manual estimate, clamp enforcement).
    fn seed(&mut self, grtt: f64) {
        self.smoothed.reset();
        self.smoothed.update(grtt);
    }

    pub fn quantized(&self) -> u8 {
        quantize_grtt(self.smoothed.value())
    }

    /// Microseconds of `now` on the probe clock.
    pub fn clock_us(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_micros() as u64
    }

    pub fn set_estimate(&mut self, grtt: f64) {
        self.seed(grtt.clamp(self.grtt_min, self.grtt_max));
    }

    pub fn set_max(&mut self, grtt_max: f64) {
        self.grtt_max = grtt_max;
        if self.smoothed.value() > grtt_max {
            self.seed(grtt_max);
        }
    }

    pub fn set_probing_mode(&mut self, mode: ProbingMode) {
        self.mode = mode;
    }

    pub fn set_interval(&mut self, min: f64, max: f64) {
        self.interval_min = min;
        self.interval_max = max.max(min);
    }

    /// When the next probe is due, if probing at all.
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.mode {
            ProbingMode::None => None,
            _ => Some(self.next_probe),
        }
    }

    /// Emit a probe if one is due. Folds the previous window's peak into
    /// the estimate at each window boundary.
    pub fn poll_probe(&mut self, now: Instant, rng: &mut SmallRng) -> Option<CcProbeCmd> {
        if self.mode == ProbingMode::None || now < self.next_probe {
            return None;
        }
        if self.mode == ProbingMode::Active {
            self.fold_window();
        }
        let spread = (self.interval_max - self.interval_min).max(0.0);
        let wait = self.interval_min + rng.random::<f64>() * spread;
        self.next_probe = now + Duration::from_secs_f64(wait.max(0.050));
        self.cc_sequence = self.cc_sequence.wrapping_add(1);
        Some(CcProbeCmd {
            cc_sequence: self.cc_sequence,
            send_time_us: self.clock_us(now),
        })
    }

    /// Ingest a receiver's probe echo. Returns the RTT sample in seconds
    /// (for the congestion controller), or `None` if it was unusable.
    pub fn handle_report(&mut self, report: &CcReportCmd, now: Instant) -> Option<f64> {
        if self.mode != ProbingMode::Active {
            return None;
        }
        let now_us = self.clock_us(now);
        let echoed = report.send_time_us;
        if echoed > now_us {
            return None; // not our clock (stale or restarted)
        }
        let rtt_us = (now_us - echoed).saturating_sub(report.delay_us as u64);
        let rtt = (rtt_us as f64 / 1.0e6).max(1.0e-6);
        if rtt > self.grtt_max * 2.0 {
            return None; // ancient echo
        }
        self.window_peak = Some(self.window_peak.map_or(rtt, |p| p.max(rtt)));
        trace!(rtt, "grtt sample");
        Some(rtt)
    }

    /// Apply the window peak to the smoothed estimate.
    fn fold_window(&mut self) {
        let Some(peak) = self.window_peak.take() else {
            return;
        };
        let weight = if peak > self.smoothed.value() {
            WEIGHT_UP
        } else {
            WEIGHT_DOWN
        };
        let next = self.smoothed.update_weighted(peak, weight);
        let clamped = next.clamp(self.grtt_min, self.grtt_max);
        if clamped != next {
            self.seed(clamped);
        }
    }

    /// True when the advertised (quantized) GRTT changed since the last
    /// call — the trigger for a GRTT_UPDATED event.
    pub fn take_quantized_change(&mut self) -> bool {
        let q = self.quantized();
        if q != self.last_quantized {
            self.last_quantized = q;
            true
        } else {
            false
        }
    }
}

/// Backoff scaling used by the NACK and repair timers, clamped the same
/// way everywhere: `backoff · max(grtt, grtt_min)`, capped at
/// `backoff · grtt_max`.
pub fn scaled_backoff(grtt: f64, grtt_min: f64, grtt_max: f64, backoff: f64) -> f64 {
    (backoff * grtt.max(grtt_min)).min(backoff * grtt_max)
}
