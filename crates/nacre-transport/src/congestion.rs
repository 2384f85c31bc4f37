//! # TFRC Congestion Control
//!
//! Receiver side: a gap-based loss-event estimator — runs of loss
//! separated by at least one RTT of received traffic count as one event;
//! the loss event rate is the inverse of the weighted mean of the eight
//! most recent inter-event intervals.
//!
//! Sender side: the TCP-friendly rate equation applied to the *current
//! limiting receiver* (CLR) — the responder whose reported (loss, RTT)
//! pair implies the lowest rate:
//!
//! ```text
//! R = S / ( RTT · ( sqrt(2p/3) + 12·sqrt(3p/8) · p · (1 + 32·p²) ) )
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use quanta::Instant;
use tracing::debug;

// ─── Modes ───────────────────────────────────────────────────────────────────

/// Congestion control operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CcMode {
    /// Controller disabled; the application's rate stands.
    #[default]
    Fixed,
    /// Standard TFRC on packet loss.
    Cc,
    /// Loss events from ECN marks only.
    Cce,
    /// Loss-tolerant: isolated single-packet gaps are discounted.
    Ccl,
}

// ─── TFRC Equation ──────────────────────────────────────────────────────────

/// The TCP-friendly rate in bytes/second for segment size `s` (bytes),
/// round-trip `rtt` (seconds) and loss event rate `p`.
pub fn tfrc_rate(segment_size: f64, rtt: f64, p: f64) -> f64 {
    if p <= 0.0 {
        return f64::INFINITY;
    }
    let rtt = rtt.max(1.0e-6);
    let p = p.min(1.0);
    let denom = rtt * ((2.0 * p / 3.0).sqrt() + 12.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p));
    segment_size / denom
}

// ─── Loss Event Estimator (receiver side) ───────────────────────────────────

/// TFRC interval weights, most recent first.
const INTERVAL_WEIGHTS: [f64; 8] = [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

/// Tracks the per-sender datagram sequence space and derives the loss
/// event rate reported in CC_REPORT messages.
pub struct LossEstimator {
    mode: CcMode,
    /// Next expected datagram sequence.
    next_seq: Option<u16>,
    /// Completed loss intervals (packet counts), most recent first.
    intervals: VecDeque<u64>,
    /// Packets in the interval currently accruing.
    current: u64,
    /// When the last loss event started (events closer than one RTT merge).
    last_event: Option<Instant>,
    /// Ever lost anything (p stays 0 until the first event).
    any_loss: bool,
}

impl LossEstimator {
    pub fn new(mode: CcMode) -> Self {
        LossEstimator {
            mode,
            next_seq: None,
            intervals: VecDeque::with_capacity(INTERVAL_WEIGHTS.len() + 1),
            current: 0,
            last_event: None,
            any_loss: false,
        }
    }

    pub fn set_mode(&mut self, mode: CcMode) {
        self.mode = mode;
    }

    /// Feed an arriving datagram's sequence number. `rtt` scales the
    /// event separation.
    pub fn on_sequence(&mut self, seq: u16, now: Instant, rtt: f64) {
        let Some(expected) = self.next_seq else {
            self.next_seq = Some(seq.wrapping_add(1));
            self.current = 1;
            return;
        };
        let delta = seq.wrapping_sub(expected) as i16;
        if delta < 0 {
            // Late or duplicate datagram; the gap it closes was already
            // charged as loss.
            return;
        }
        let gap = delta as u64;
        self.next_seq = Some(seq.wrapping_add(1));
        self.current += 1;

        if gap == 0 {
            return;
        }
        // ECN-only mode never reads loss from the sequence space, and
        // loss-tolerant mode forgives isolated single-packet gaps.
        if self.mode == CcMode::Cce || (self.mode == CcMode::Ccl && gap == 1) {
            self.current += gap;
            return;
        }
        self.register_event(now, rtt);
    }

    /// An ECN congestion-experienced mark arrived.
    pub fn on_ecn(&mut self, now: Instant, rtt: f64) {
        self.register_event(now, rtt);
    }

    fn register_event(&mut self, now: Instant, rtt: f64) {
        let separation = Duration::from_secs_f64(rtt.max(1.0e-6));
        if let Some(last) = self.last_event {
            if now.duration_since(last) < separation {
                return; // same loss event
            }
        }
        self.last_event = Some(now);
        self.any_loss = true;
        self.intervals.push_front(self.current.max(1));
        self.intervals.truncate(INTERVAL_WEIGHTS.len());
        self.current = 0;
        debug!(intervals = self.intervals.len(), "loss event");
    }

    /// Loss event rate `p` in [0, 1].
    ///
    /// Weighted mean over the recent complete intervals; the open interval
    /// substitutes for the oldest when that lowers `p` (standard TFRC
    /// history discounting).
    pub fn loss_event_rate(&self) -> f64 {
        if !self.any_loss || self.intervals.is_empty() {
            return 0.0;
        }
        let mean = Self::weighted_mean(self.intervals.iter().copied());
        let mean_with_current = Self::weighted_mean(
            std::iter::once(self.current).chain(self.intervals.iter().copied()),
        );
        1.0 / mean.max(mean_with_current)
    }

    fn weighted_mean(intervals: impl Iterator<Item = u64>) -> f64 {
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, interval) in intervals.take(INTERVAL_WEIGHTS.len()).enumerate() {
            num += INTERVAL_WEIGHTS[i] * interval as f64;
            den += INTERVAL_WEIGHTS[i];
        }
        if den == 0.0 {
            return f64::INFINITY;
        }
        (num / den).max(1.0)
    }
}

// ─── Rate Controller (sender side) ──────────────────────────────────────────

/// The receiver currently dictating the sender's rate.
#[derive(Debug, Clone, Copy)]
pub struct Clr {
    pub node_id: u32,
    pub loss_rate: f64,
    pub rtt: f64,
    pub last_report: Instant,
}

/// Sender-side rate state.
pub struct RateController {
    mode: CcMode,
    /// Current transmit rate, bytes/second.
    rate: f64,
    rate_min: f64,
    rate_max: f64,
    segment_size: f64,
    clr: Option<Clr>,
    /// CLRs silent longer than this are dropped.
    clr_timeout: Duration,
}

/// Rate-control events surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcEvent {
    Activated,
    Deactivated,
    RateChanged,
}

impl RateController {
    pub fn new(mode: CcMode, initial_rate: f64, segment_size: usize) -> Self {
        RateController {
            mode,
            rate: initial_rate,
            rate_min: 0.0,
            rate_max: f64::INFINITY,
            segment_size: segment_size as f64,
            clr: None,
            clr_timeout: Duration::from_secs(30),
        }
    }

    pub fn mode(&self) -> CcMode {
        self.mode
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn clr(&self) -> Option<&Clr> {
        self.clr.as_ref()
    }

    pub fn set_rate_bounds(&mut self, min: f64, max: f64) {
        self.rate_min = min;
        self.rate_max = max.max(min);
        self.rate = self.rate.clamp(self.rate_min, self.rate_max);
    }

    /// Manual rate override. Authoritative in Fixed mode; otherwise the
    /// next CLR report takes over again.
    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.clamp(self.rate_min, self.rate_max.min(f64::MAX));
    }

    pub fn set_clr_timeout(&mut self, timeout: Duration) {
        self.clr_timeout = timeout;
    }

    /// Implied TFRC rate of a report; the CLR is the reporter implying
    /// the lowest.
    fn implied_rate(&self, loss_rate: f64, rtt: f64) -> f64 {
        tfrc_rate(self.segment_size, rtt, loss_rate)
    }

    /// Ingest a receiver's CC report. Returns events to surface.
    pub fn on_report(
        &mut self,
        node_id: u32,
        loss_rate: f64,
        rtt: f64,
        now: Instant,
    ) -> Vec<CcEvent> {
        if self.mode == CcMode::Fixed {
            return Vec::new();
        }
        let mut events = Vec::new();
        let implied = self.implied_rate(loss_rate, rtt);

        let replaces = match &self.clr {
            None => {
                events.push(CcEvent::Activated);
                true
            }
            Some(clr) if clr.node_id == node_id => true,
            Some(clr) => implied <= self.implied_rate(clr.loss_rate, clr.rtt),
        };
        if !replaces {
            return events;
        }
        self.clr = Some(Clr {
            node_id,
            loss_rate,
            rtt,
            last_report: now,
        });

        let old = self.rate;
        let new_rate = if loss_rate <= 0.0 {
            // No loss observed: open the rate up, at most doubling.
            (self.rate * 2.0).min(self.rate_max)
        } else {
            implied.clamp(self.rate_min, self.rate_max)
        };
        self.rate = new_rate.clamp(self.rate_min, self.rate_max);
        if (self.rate - old).abs() > old * 0.01 {
            debug!(rate = self.rate, node_id, "cc rate update");
            events.push(CcEvent::RateChanged);
        }
        events
    }

    /// Drop a CLR that stopped reporting. Returns events to surface.
    pub fn check_clr_timeout(&mut self, now: Instant) -> Vec<CcEvent> {
        let Some(clr) = &self.clr else {
            return Vec::new();
        };
        if now.duration_since(clr.last_report) < self.clr_timeout {
            return Vec::new();
        }
        debug!(node_id = clr.node_id, "clr timed out");
        self.clr = None;
        vec![CcEvent::Deactivated]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTT: f64 = 0.1;

    // ─── TFRC Equation ──────────────────────────────────────────────────

    #[test]
    fn tfrc_rate_decreases_with_loss() {
        let r1 = tfrc_rate(1400.0, RTT, 0.001);
        let r2 = tfrc_rate(1400.0, RTT, 0.01);
        let r3 = tfrc_rate(1400.0, RTT, 0.1);
        assert!(r1 > r2);
        assert!(r2 > r3);
    }

    #[test]
    fn tfrc_rate_decreases_with_rtt() {
        let fast = tfrc_rate(1400.0, 0.01, 0.01);
        let slow = tfrc_rate(1400.0, 1.0, 0.01);
        assert!(fast > slow);
    }

    #[test]
    fn tfrc_rate_zero_loss_unbounded() {
        assert!(tfrc_rate(1400.0, RTT, 0.0).is_infinite());
    }

    #[test]
    fn tfrc_known_point() {
        // p = 0.01, RTT = 100 ms, S = 1400:
        // denom = 0.1·(sqrt(0.00667) + 12·sqrt(0.00375)·0.01·(1+0.0032))
        //       ≈ 0.1·(0.08165 + 0.00737) ≈ 0.008902 → R ≈ 157 kB/s.
        let r = tfrc_rate(1400.0, 0.1, 0.01);
        assert!((r - 157_000.0).abs() < 5_000.0, "r = {r}");
    }

    // ─── Loss Estimator ─────────────────────────────────────────────────

    fn feed(est: &mut LossEstimator, seqs: impl IntoIterator<Item = u16>, t: Instant) {
        for s in seqs {
            est.on_sequence(s, t, RTT);
        }
    }

    #[test]
    fn no_loss_means_zero_rate() {
        let mut est = LossEstimator::new(CcMode::Cc);
        feed(&mut est, 0..100, Instant::now());
        assert_eq!(est.loss_event_rate(), 0.0);
    }

    #[test]
    fn single_gap_registers_event() {
        let mut est = LossEstimator::new(CcMode::Cc);
        let t = Instant::now();
        feed(&mut est, 0..50, t);
        est.on_sequence(51, t, RTT); // 50 lost
        assert!(est.loss_event_rate() > 0.0);
    }

    #[test]
    fn losses_within_one_rtt_are_one_event() {
        let mut est = LossEstimator::new(CcMode::Cc);
        let t = Instant::now();
        feed(&mut est, 0..10, t);
        est.on_sequence(11, t, RTT); // gap
        est.on_sequence(13, t, RTT); // another gap, same instant → same event
        assert_eq!(est.intervals.len(), 1, "merged into one loss event");
    }

    #[test]
    fn losses_past_one_rtt_are_separate_events() {
        let mut est = LossEstimator::new(CcMode::Cc);
        let t = Instant::now();
        feed(&mut est, 0..10, t);
        est.on_sequence(11, t, RTT);
        let later = t + Duration::from_secs_f64(RTT * 2.0);
        feed(&mut est, 12..20, later);
        est.on_sequence(21, later, RTT);
        assert_eq!(est.intervals.len(), 2);
    }

    #[test]
    fn ccl_discounts_isolated_gaps() {
        let mut strict = LossEstimator::new(CcMode::Cc);
        let mut tolerant = LossEstimator::new(CcMode::Ccl);
        let t = Instant::now();
        for est in [&mut strict, &mut tolerant] {
            feed(est, 0..10, t);
            est.on_sequence(11, t, RTT); // isolated single loss
        }
        assert!(strict.loss_event_rate() > 0.0);
        assert_eq!(tolerant.loss_event_rate(), 0.0);
    }

    #[test]
    fn ccl_still_counts_burst_gaps() {
        let mut est = LossEstimator::new(CcMode::Ccl);
        let t = Instant::now();
        feed(&mut est, 0..10, t);
        est.on_sequence(13, t, RTT); // 3-packet gap
        assert!(est.loss_event_rate() > 0.0);
    }

    #[test]
    fn cce_reads_ecn_not_gaps() {
        let mut est = LossEstimator::new(CcMode::Cce);
        let t = Instant::now();
        feed(&mut est, 0..10, t);
        est.on_sequence(15, t, RTT); // gap ignored
        assert_eq!(est.loss_event_rate(), 0.0);
        est.on_ecn(t + Duration::from_secs(1), RTT);
        assert!(est.loss_event_rate() > 0.0);
    }

    #[test]
    fn reordered_late_arrival_not_new_loss() {
        let mut est = LossEstimator::new(CcMode::Cc);
        let t = Instant::now();
        feed(&mut est, 0..5, t);
        est.on_sequence(7, t, RTT); // gap at 5, 6
        let before = est.intervals.len();
        est.on_sequence(5, t + Duration::from_secs(1), RTT); // late
        assert_eq!(est.intervals.len(), before);
    }

    #[test]
    fn sequence_wrap_handled() {
        let mut est = LossEstimator::new(CcMode::Cc);
        let t = Instant::now();
        feed(&mut est, [65533, 65534, 65535, 0, 1], t);
        assert_eq!(est.loss_event_rate(), 0.0, "clean wrap is not loss");
        est.on_sequence(4, t, RTT); // gap across nothing special
        assert!(est.loss_event_rate() > 0.0);
    }

    #[test]
    fn long_clean_run_decays_rate() {
        let mut est = LossEstimator::new(CcMode::Cc);
        let mut t = Instant::now();
        // Two spaced loss events.
        feed(&mut est, 0..10, t);
        est.on_sequence(11, t, RTT);
        t += Duration::from_secs(1);
        feed(&mut est, 12..22, t);
        est.on_sequence(23, t, RTT);
        let p_after_loss = est.loss_event_rate();
        // A long clean run grows the open interval, which substitutes in.
        feed(&mut est, 24..1000, t + Duration::from_secs(2));
        assert!(est.loss_event_rate() < p_after_loss);
    }

    // ─── Rate Controller ────────────────────────────────────────────────

    #[test]
    fn fixed_mode_ignores_reports() {
        let mut rc = RateController::new(CcMode::Fixed, 50_000.0, 1400);
        let events = rc.on_report(1, 0.1, RTT, Instant::now());
        assert!(events.is_empty());
        assert!((rc.rate() - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn first_report_activates() {
        let mut rc = RateController::new(CcMode::Cc, 50_000.0, 1400);
        let events = rc.on_report(1, 0.01, RTT, Instant::now());
        assert!(events.contains(&CcEvent::Activated));
        assert_eq!(rc.clr().unwrap().node_id, 1);
    }

    #[test]
    fn worst_reporter_becomes_clr() {
        let mut rc = RateController::new(CcMode::Cc, 50_000.0, 1400);
        let t = Instant::now();
        rc.on_report(1, 0.001, RTT, t);
        rc.on_report(2, 0.05, RTT, t); // worse → takes over
        assert_eq!(rc.clr().unwrap().node_id, 2);
        rc.on_report(3, 0.001, RTT, t); // better → ignored
        assert_eq!(rc.clr().unwrap().node_id, 2);
    }

    #[test]
    fn rate_follows_tfrc() {
        let mut rc = RateController::new(CcMode::Cc, 1.0e9, 1400);
        rc.on_report(1, 0.01, 0.1, Instant::now());
        let expected = tfrc_rate(1400.0, 0.1, 0.01);
        assert!((rc.rate() - expected).abs() / expected < 0.01);
    }

    #[test]
    fn rate_clamped_to_bounds() {
        let mut rc = RateController::new(CcMode::Cc, 50_000.0, 1400);
        rc.set_rate_bounds(10_000.0, 100_000.0);
        rc.on_report(1, 0.5, 1.0, Instant::now()); // dreadful → tiny rate
        assert!((rc.rate() - 10_000.0).abs() < 1e-6);
        rc.on_report(1, 0.0, 0.001, Instant::now()); // pristine → huge
        assert!(rc.rate() <= 100_000.0);
    }

    #[test]
    fn zero_loss_doubles_rate() {
        let mut rc = RateController::new(CcMode::Cc, 50_000.0, 1400);
        rc.set_rate_bounds(0.0, 1.0e9);
        rc.on_report(1, 0.0, RTT, Instant::now());
        assert!((rc.rate() - 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn clr_timeout_deactivates() {
        let mut rc = RateController::new(CcMode::Cc, 50_000.0, 1400);
        rc.set_clr_timeout(Duration::from_secs(5));
        let t = Instant::now();
        rc.on_report(1, 0.01, RTT, t);
        assert!(rc.check_clr_timeout(t + Duration::from_secs(1)).is_empty());
        let events = rc.check_clr_timeout(t + Duration::from_secs(6));
        assert_eq!(events, vec![CcEvent::Deactivated]);
        assert!(rc.clr().is_none());
    }

    #[test]
    fn same_clr_update_keeps_it() {
        let mut rc = RateController::new(CcMode::Cc, 50_000.0, 1400);
        let t = Instant::now();
        rc.on_report(2, 0.05, RTT, t);
        // The CLR improving still updates in place.
        rc.on_report(2, 0.001, RTT, t + Duration::from_secs(1));
        assert_eq!(rc.clr().unwrap().node_id, 2);
        assert!((rc.clr().unwrap().loss_rate - 0.001).abs() < 1e-9);
    }
}
