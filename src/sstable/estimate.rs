//! Size estimation for data written through the parallel pipeline.
//!
//! Higher layers poll the estimated table size to decide when to cut over to
//! a new table, so the reported size must never decrease even while blocks
//! are in flight between compression and the file.

use std::sync::Mutex;

/// Tracks written and inflight bytes with a running compression ratio.
#[derive(Debug, Default)]
pub struct SizeEstimate {
    /// Size reported when nothing has been written or is inflight.
    empty_size: u64,
    /// Estimated size of inflight data not yet written.
    inflight_size: u64,
    /// Total size of data already written.
    total_size: u64,
    num_written_entries: u64,
    num_inflight_entries: u64,
    /// Maximum size ever returned, making the estimate monotone.
    max_estimated_size: u64,
    /// Compressed/uncompressed byte totals for the observed ratio. Equal
    /// when no compression happens.
    compressed_size: u64,
    uncompressed_size: u64,
}

impl SizeEstimate {
    pub fn new(empty_size: u64) -> Self {
        Self {
            empty_size,
            ..Default::default()
        }
    }

    /// The monotone size estimate: written bytes plus inflight bytes scaled
    /// by the compression ratio observed so far.
    pub fn size(&mut self) -> u64 {
        let ratio = if self.uncompressed_size > 0 {
            self.compressed_size as f64 / self.uncompressed_size as f64
        } else {
            1.0
        };
        let estimated_inflight = (self.inflight_size as f64 * ratio) as u64;
        let mut total = self.total_size + estimated_inflight;
        if total > self.max_estimated_size {
            self.max_estimated_size = total;
        } else {
            total = self.max_estimated_size;
        }

        if total == 0 {
            return self.empty_size;
        }
        total
    }

    pub fn num_total_entries(&self) -> u64 {
        self.num_written_entries + self.num_inflight_entries
    }

    pub fn inflight_size(&self) -> u64 {
        self.inflight_size
    }

    /// Registers an entry whose final size is not yet known.
    pub fn add_inflight(&mut self, size: usize) {
        self.num_inflight_entries += 1;
        self.inflight_size += size as u64;
    }

    /// Records a written entry given the new total size.
    pub fn written_with_total(&mut self, new_total_size: u64, inflight_size: usize) {
        let delta = (new_total_size - self.total_size) as usize;
        self.written_with_delta(delta, inflight_size);
    }

    /// Records a written entry of `final_entry_size` bytes. If the entry was
    /// previously inflight, its inflight contribution is retired and the
    /// compression ratio updated.
    pub fn written_with_delta(&mut self, final_entry_size: usize, inflight_size: usize) {
        if inflight_size > 0 {
            self.num_inflight_entries -= 1;
            self.inflight_size -= inflight_size as u64;
            self.uncompressed_size += inflight_size as u64;
            self.compressed_size += final_entry_size as u64;
        }
        self.num_written_entries += 1;
        self.total_size += final_entry_size as u64;
    }

    pub fn clear(&mut self) {
        *self = SizeEstimate::new(self.empty_size);
    }
}

/// The data-block size estimate shared between the producer and the write
/// queue. The mutex is engaged only when parallelism is on; serial mode
/// pays no synchronization and must have nothing inflight.
#[derive(Debug)]
pub struct DataBlockEstimates {
    use_mutex: bool,
    estimate: Mutex<SizeEstimate>,
}

impl DataBlockEstimates {
    pub fn new(use_mutex: bool) -> Self {
        Self {
            use_mutex,
            estimate: Mutex::new(SizeEstimate::new(0)),
        }
    }

    /// Records a compressed data block. `inflight_size` is the uncompressed
    /// estimate previously registered through `add_inflight_data_block`, or
    /// 0 if none was.
    pub fn data_block_compressed(&self, compressed_size: usize, inflight_size: usize) {
        let mut estimate = self.lock();
        estimate.written_with_delta(
            compressed_size + crate::sstable::BLOCK_TRAILER_LEN,
            inflight_size,
        );
    }

    /// Registers an uncompressed block handed to the write queue.
    pub fn add_inflight_data_block(&self, size: usize) {
        self.lock().add_inflight(size);
    }

    /// Estimated size of data-block bytes written to disk.
    pub fn size(&self) -> u64 {
        let mut estimate = self.lock();
        if !self.use_mutex {
            // Serial mode writes blocks in-thread, so nothing is ever
            // inflight here.
            debug_assert_eq!(estimate.inflight_size(), 0);
        }
        estimate.size()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SizeEstimate> {
        // The mutex is uncontended in serial mode; locking it anyway keeps a
        // single code path without measurable cost.
        self.estimate.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_size_reported_until_first_write() {
        let mut s = SizeEstimate::new(8);
        assert_eq!(s.size(), 8);
        s.written_with_delta(100, 0);
        assert_eq!(s.size(), 100);
    }

    #[test]
    fn size_is_monotone_across_inflight_retirement() {
        let mut s = SizeEstimate::new(0);
        // First block compresses 10:1.
        s.add_inflight(1000);
        let before = s.size();
        s.written_with_delta(100, 1000);
        // A pessimistic inflight estimate was already reported; the smaller
        // written total must not lower the estimate.
        assert!(s.size() >= before);

        // Ratio now applies to new inflight data.
        s.add_inflight(1000);
        let with_ratio = s.size();
        assert!(with_ratio >= s.total_size);
    }

    #[test]
    fn ratio_scales_inflight() {
        let mut s = SizeEstimate::new(0);
        s.add_inflight(1000);
        s.written_with_delta(500, 1000); // observed ratio 0.5
        s.add_inflight(1000);
        // 500 written + 1000 inflight * 0.5
        assert_eq!(s.size(), 1000);
    }

    #[test]
    fn written_with_total_computes_delta() {
        let mut s = SizeEstimate::new(0);
        s.written_with_total(40, 0);
        s.written_with_total(100, 0);
        assert_eq!(s.size(), 100);
        assert_eq!(s.num_total_entries(), 2);
    }

    #[test]
    fn serial_data_block_estimates_have_no_inflight() {
        let d = DataBlockEstimates::new(false);
        d.data_block_compressed(100, 0);
        assert_eq!(d.size(), 100 + crate::sstable::BLOCK_TRAILER_LEN as u64);
    }
}
