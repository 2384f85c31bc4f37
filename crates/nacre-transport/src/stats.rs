//! # Session Statistics
//!
//! Counters kept by the sender and receiver paths, snapshot-friendly for
//! JSON export, plus the EWMA helper behind the GRTT estimator's
//! smoothing.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Source segments transmitted (first transmissions only).
    pub segments_sent: u64,
    /// Payload bytes transmitted (first transmissions only).
    pub bytes_sent: u64,
    /// Proactive parity segments transmitted.
    pub auto_parity_sent: u64,
    /// Repair segments (parity or source) sent in response to NACKs.
    pub repairs_sent: u64,
    /// NACK messages processed.
    pub nacks_received: u64,
    /// NACKs ignored as duplicates within one GRTT window.
    pub nacks_redundant: u64,
    /// Flush commands transmitted.
    pub flushes_sent: u64,
    /// Watermark (ACK_REQ) commands transmitted.
    pub ack_requests_sent: u64,
    /// Watermark ACKs received.
    pub acks_received: u64,
    /// GRTT probes transmitted.
    pub probes_sent: u64,
    /// Objects evicted from the transmit cache.
    pub objects_purged: u64,
    /// Squelch commands transmitted for out-of-cache NACKs.
    pub squelches_sent: u64,
}

impl SenderStats {
    /// Repair overhead relative to first transmissions.
    pub fn repair_ratio(&self) -> f64 {
        if self.segments_sent == 0 {
            0.0
        } else {
            self.repairs_sent as f64 / self.segments_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side counters (summed over remote senders).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Data segments received (including duplicates and parity).
    pub segments_received: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Duplicate segments discarded.
    pub duplicates: u64,
    /// Source segments reconstructed by the FEC decoder.
    pub fec_recoveries: u64,
    /// NACK messages transmitted.
    pub nacks_sent: u64,
    /// NACKs withheld because an overheard NACK covered our losses.
    pub nacks_suppressed: u64,
    /// Objects completed and delivered.
    pub objects_completed: u64,
    /// Objects aborted (sender purged them before completion).
    pub objects_aborted: u64,
    /// Segments dropped because they fell outside the sync window.
    pub out_of_window: u64,
    /// Segments dropped because the segment pool was exhausted.
    pub pool_exhausted: u64,
    /// Watermark ACKs transmitted.
    pub acks_sent: u64,
}

impl ReceiverStats {
    /// Fraction of delivered source data that needed FEC reconstruction.
    pub fn recovery_ratio(&self) -> f64 {
        if self.segments_received == 0 {
            0.0
        } else {
            self.fec_recoveries as f64 / self.segments_received as f64
        }
    }
}

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Session-level datagram counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Datagrams handed to the session.
    pub datagrams_in: u64,
    /// Datagrams produced by the session.
    pub datagrams_out: u64,
    /// Malformed or version-mismatched datagrams dropped.
    pub malformed_dropped: u64,
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    /// `alpha` in [0, 1]; higher is more responsive.
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    /// Update using an explicit weight, overriding the configured alpha.
    /// Used where the smoothing is asymmetric (GRTT: fast up, slow down).
    pub fn update_weighted(&mut self, sample: f64, alpha: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = alpha * sample + (1.0 - alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_repair_ratio() {
        let stats = SenderStats {
            segments_sent: 100,
            repairs_sent: 7,
            ..Default::default()
        };
        assert!((stats.repair_ratio() - 0.07).abs() < 1e-9);
    }

    #[test]
    fn sender_repair_ratio_zero_div() {
        assert_eq!(SenderStats::default().repair_ratio(), 0.0);
    }

    #[test]
    fn receiver_recovery_ratio() {
        let stats = ReceiverStats {
            segments_received: 200,
            fec_recoveries: 10,
            ..Default::default()
        };
        assert!((stats.recovery_ratio() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn stats_serialize() {
        let stats = SenderStats {
            segments_sent: 5,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"segments_sent\":5"));
    }

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut ewma = Ewma::new(0.125);
        ewma.update(100.0);
        assert_eq!(ewma.value(), 100.0);
    }

    #[test]
    fn ewma_smooths_toward_new_value() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        let v = ewma.update(200.0);
        assert!((v - 150.0).abs() < 1e-9);
    }

    #[test]
    fn ewma_asymmetric_weights() {
        let mut ewma = Ewma::new(0.125);
        ewma.update(1.0);
        // A large sample pushed with the fast weight moves further than the
        // configured alpha would.
        let fast = ewma.update_weighted(2.0, 0.25);
        assert!((fast - 1.25).abs() < 1e-9);
    }

    #[test]
    fn ewma_reset() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        ewma.reset();
        assert!(!ewma.is_initialized());
        ewma.update(50.0);
        assert_eq!(ewma.value(), 50.0);
    }
}
