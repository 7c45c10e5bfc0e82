use std::time::Duration;

use hdrhistogram::Histogram;

/// Flusher-side metrics, sampled once per flush iteration.
#[derive(Clone)]
pub struct LogWriterMetrics {
    /// Bytes handed to the sink.
    pub write_throughput_bytes: u64,
    /// Time spent writing and syncing.
    pub work_duration: Duration,
    /// Time spent waiting for work.
    pub idle_duration: Duration,
    /// Number of full blocks pending at each flush.
    pub pending_buffer_len: Histogram<u64>,
    /// Number of sync waiters released by each flush.
    pub sync_queue_len: Histogram<u64>,
}

impl LogWriterMetrics {
    pub fn new() -> Self {
        Self {
            write_throughput_bytes: 0,
            work_duration: Duration::ZERO,
            idle_duration: Duration::ZERO,
            pending_buffer_len: new_histogram(),
            sync_queue_len: new_histogram(),
        }
    }
}

impl Default for LogWriterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn new_histogram() -> Histogram<u64> {
    // Samples are queue lengths; SYNC_CONCURRENCY bounds them well below
    // the high limit.
    Histogram::new_with_bounds(1, 1 << 20, 3).expect("static histogram bounds")
}

/// Records a sample, saturating rather than failing on out-of-range values.
pub fn record_sample(histogram: &mut Histogram<u64>, value: u64) {
    let _ = histogram.record(value.min(1 << 20));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_produce_a_mean() {
        let mut m = LogWriterMetrics::new();
        record_sample(&mut m.pending_buffer_len, 0);
        record_sample(&mut m.pending_buffer_len, 14);
        record_sample(&mut m.pending_buffer_len, 0);
        let mean = m.pending_buffer_len.mean();
        assert!(mean > 4.0 && mean < 5.0);
    }

    #[test]
    fn oversized_samples_saturate() {
        let mut m = LogWriterMetrics::new();
        record_sample(&mut m.sync_queue_len, u64::MAX);
        assert_eq!(m.sync_queue_len.len(), 1);
    }
}
