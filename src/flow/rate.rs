//! TCP throughput estimation.
//!
//! The estimator buckets the flow's timeline into fixed one-second windows
//! anchored at the flow's first receive and folds each finished bucket into
//! an exponentially-weighted moving average of bytes per second. Sequence
//! arithmetic wraps modulo 2^32 like raw TCP; a connection fast enough to
//! wrap within one timeout window will under-count (known limitation).

use super::FlowError;

/// Capture timestamps are microseconds, so one bucket is a million ticks.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

/// Windowed EWMA bytes-per-second estimator for one TCP flow. Created with
/// the flow and never shared; the owning flow feeds it every accepted
/// segment's `(seq, payload_size, timestamp)`.
#[derive(Debug, Clone)]
pub struct TcpRateEstimator {
    /// First receive timestamp of the owning flow; while `bucket_start`
    /// still equals it the very first bucket is open and no estimate has
    /// been folded yet.
    first_rx: u64,
    alpha: f64,
    /// Sequence number one past the last accepted byte range.
    last_seen_seq: Option<u32>,
    bytes_this_second: f64,
    bytes_per_second: f64,
    bucket_start: u64,
    out_of_order: bool,
}

impl TcpRateEstimator {
    pub fn new(first_rx: u64, alpha: f64) -> TcpRateEstimator {
        TcpRateEstimator {
            first_rx,
            alpha,
            last_seen_seq: None,
            bytes_this_second: 0.0,
            bytes_per_second: 0.0,
            bucket_start: first_rx,
            out_of_order: false,
        }
    }

    /// Feeds one segment. `last_rx` is the owning flow's previous receive
    /// timestamp, so it must be read before the flow advances it.
    pub fn update(&mut self, seq: u32, payload_size: u16, timestamp: u64, last_rx: u64) {
        let payload = u64::from(payload_size);

        let Some(last_seen) = self.last_seen_seq else {
            self.bytes_this_second += payload as f64;
            self.last_seen_seq = Some(seq.wrapping_add(u32::from(payload_size)));
            return;
        };

        if seq < last_seen {
            // Segment overlaps or precedes bytes already accounted for.
            // Ignoring it biases the estimate low rather than attempting
            // reassembly.
            self.out_of_order = true;
            return;
        }

        let bytes_delta = (u64::from(seq) - u64::from(last_seen) + payload) as f64;
        let bucket_end = self.bucket_start + TICKS_PER_SECOND;

        if timestamp <= bucket_end {
            self.bytes_this_second += bytes_delta;
        } else {
            // The segment spans one or more bucket boundaries. Spread its
            // bytes at the instantaneous rate across the crossing. Same-flow
            // delivery is not timestamp-ordered across threads, so last_rx
            // may sit ahead of this timestamp; the subtractions saturate and
            // the elapsed time is clamped to one tick.
            let time_delta = timestamp.saturating_sub(last_rx).max(1);
            let rate = bytes_delta / time_delta as f64;
            let seconds_skipped = (timestamp - bucket_end) / TICKS_PER_SECOND;
            let remaining_in_bucket = bucket_end.saturating_sub(last_rx);

            self.bytes_this_second += rate * remaining_in_bucket as f64;

            if self.bucket_start == self.first_rx {
                // First bucket: nothing to decay against yet.
                self.bytes_per_second = self.bytes_this_second;
            } else {
                self.bytes_per_second = (1.0 - self.alpha) * self.bytes_per_second
                    + self.alpha * self.bytes_this_second;
            }

            // Skipped whole seconds are decayed as if they ran at the
            // instantaneous rate for a full second each.
            for _ in 0..seconds_skipped {
                self.bytes_per_second = (1.0 - self.alpha) * self.bytes_per_second
                    + self.alpha * rate * TICKS_PER_SECOND as f64;
            }

            let new_bucket_start = bucket_end + seconds_skipped * TICKS_PER_SECOND;
            self.bytes_this_second = rate * (timestamp - new_bucket_start) as f64;
            self.bucket_start = new_bucket_start;
        }

        self.last_seen_seq = Some(seq.wrapping_add(u32::from(payload_size)));
    }

    /// Read-only projection of the current estimate at `now`, decayed once
    /// per whole second elapsed past the open bucket. `last_rx` is the
    /// owning flow's last receive timestamp; querying before it is a
    /// contract violation.
    pub fn estimate_bps(&self, now: u64, last_rx: u64) -> Result<f64, FlowError> {
        if now < last_rx {
            return Err(FlowError::RetroactiveQuery {
                queried: now,
                last_rx,
            });
        }

        // Until the first bucket is finalized the running total stands in
        // for the estimate.
        let mut bps = if self.bucket_start == self.first_rx {
            self.bytes_this_second
        } else {
            self.bytes_per_second
        };

        let bucket_end = self.bucket_start + TICKS_PER_SECOND;
        if now <= bucket_end {
            return Ok(bps);
        }

        let seconds_elapsed = (now - bucket_end) / TICKS_PER_SECOND;
        for _ in 0..seconds_elapsed {
            bps *= 1.0 - self.alpha;
        }

        Ok(bps)
    }

    /// Whether any out-of-order segment has been seen.
    pub fn saw_reordering(&self) -> bool {
        self.out_of_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 5_000_000;

    #[test]
    fn test_first_segment_opens_bucket() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(1000, 500, T0, u64::MAX);

        assert_eq!(est.last_seen_seq, Some(1500));
        assert_eq!(est.bytes_this_second, 500.0);
        assert_eq!(est.bucket_start, T0);
        assert!(!est.saw_reordering());
    }

    #[test]
    fn test_out_of_order_segment_ignored() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(1000, 100, T0, u64::MAX);
        let bytes_before = est.bytes_this_second;

        est.update(500, 100, T0 + 10, T0);

        assert!(est.saw_reordering());
        assert_eq!(est.last_seen_seq, Some(1100));
        assert_eq!(est.bytes_this_second, bytes_before);
    }

    #[test]
    fn test_within_bucket_accumulates() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(0, 500, T0, u64::MAX);
        est.update(500, 500, T0 + 100_000, T0);
        est.update(1000, 500, T0 + 200_000, T0 + 100_000);

        assert_eq!(est.bytes_this_second, 1500.0);
        assert_eq!(est.bucket_start, T0);
    }

    #[test]
    fn test_first_bucket_estimate_is_running_total() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(0, 500, T0, u64::MAX);
        est.update(500, 500, T0 + 100_000, T0);

        let bps = est.estimate_bps(T0 + 200_000, T0 + 100_000).unwrap();
        assert_eq!(bps, 1000.0);
    }

    #[test]
    fn test_retroactive_query_fails() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(0, 500, T0, u64::MAX);

        let err = est.estimate_bps(T0 - 1, T0).unwrap_err();
        assert_eq!(
            err,
            FlowError::RetroactiveQuery {
                queried: T0 - 1,
                last_rx: T0,
            }
        );
    }

    #[test]
    fn test_steady_stream_converges() {
        // 500-byte segments every 100ms: 5000 bytes per second.
        let mut est = TcpRateEstimator::new(T0, 0.5);
        let mut seq = 0u32;
        let mut ts = T0;
        let mut last_rx = u64::MAX;

        for _ in 0..100 {
            est.update(seq, 500, ts, last_rx);
            seq += 500;
            last_rx = ts;
            ts += 100_000;
        }

        let bps = est.estimate_bps(last_rx, last_rx).unwrap();
        assert!((bps - 5000.0).abs() < 600.0, "bps = {bps}");
    }

    #[test]
    fn test_gap_decays_estimate() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        let mut seq = 0u32;
        let mut ts = T0;
        let mut last_rx = u64::MAX;

        for _ in 0..30 {
            est.update(seq, 500, ts, last_rx);
            seq += 500;
            last_rx = ts;
            ts += 100_000;
        }

        let now = est.estimate_bps(last_rx, last_rx).unwrap();
        let later = est.estimate_bps(last_rx + 5 * TICKS_PER_SECOND, last_rx).unwrap();

        assert!(later < now);
        // Projection must not mutate stored state.
        assert_eq!(est.estimate_bps(last_rx, last_rx).unwrap(), now);
    }

    #[test]
    fn test_late_delivery_within_bucket_accumulates() {
        // Cross-thread hand-off can deliver a segment whose timestamp sits
        // behind the flow's last receive. The estimator must fold it into
        // the open bucket rather than underflow on the elapsed time.
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(0, 500, T0 + 2_000_000, u64::MAX);
        est.update(500, 500, T0 + 10, T0 + 2_000_000);

        assert_eq!(est.bytes_this_second, 1000.0);
        assert_eq!(est.last_seen_seq, Some(1000));
        assert_eq!(est.bucket_start, T0);
    }

    #[test]
    fn test_late_delivery_across_bucket_boundary() {
        // Same non-monotone delivery, but the stale segment still lands past
        // the open bucket's end: the crossing math clamps instead of
        // dividing by a wrapped elapsed time.
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(0, 500, T0, u64::MAX);
        est.update(500, 500, T0 + 2_000_000, T0 + 3_000_000);

        assert_eq!(est.last_seen_seq, Some(1000));
        assert_eq!(est.bucket_start, T0 + 2_000_000);
        let bps = est.estimate_bps(T0 + 3_000_000, T0 + 3_000_000).unwrap();
        assert!(bps.is_finite() && bps >= 0.0, "bps = {bps}");
    }

    #[test]
    fn test_sequence_wraps_modulo_u32() {
        let mut est = TcpRateEstimator::new(T0, 0.5);
        est.update(u32::MAX - 99, 200, T0, u64::MAX);

        // 0xFFFF_FF9C + 200 wraps past zero.
        assert_eq!(est.last_seen_seq, Some(100));
    }
}
