use crate::encoding::varint_len;
use crate::sstable::CACHE_VALUE_METADATA_SIZE;

/// Parameters informing the block flush heuristics.
#[derive(Clone, Copy, Debug)]
pub struct FlushDecisionOptions {
    /// Target block size.
    pub block_size: usize,
    /// Size below which a block is never flushed.
    pub block_size_threshold: usize,
    /// Takes precedence over `block_size_threshold` when allocator size
    /// classes are known.
    pub size_class_aware_threshold: usize,
}

impl FlushDecisionOptions {
    /// Derives thresholds from percentages of the block size, rounding up.
    pub fn new(block_size: usize, threshold_pct: usize, size_class_threshold_pct: usize) -> Self {
        Self {
            block_size,
            block_size_threshold: (block_size * threshold_pct + 99) / 100,
            size_class_aware_threshold: (block_size * size_class_threshold_pct + 99) / 100,
        }
    }
}

/// Decides whether the current block should be flushed before appending an
/// entry of `key_len`/`value_len` bytes.
pub fn should_flush(
    key_len: usize,
    value_len: usize,
    restart_interval: usize,
    estimated_block_size: usize,
    num_entries: usize,
    options: FlushDecisionOptions,
    size_class_hints: &[usize],
) -> bool {
    if num_entries == 0 {
        return false;
    }

    // Without knowledge of the memory allocator's size classes, fall back to
    // heuristics that are unaware of internal fragmentation in block cache
    // allocations.
    if size_class_hints.is_empty() {
        return should_flush_without_hints(
            key_len,
            value_len,
            restart_interval,
            estimated_block_size,
            num_entries,
            options,
        );
    }

    // When this block is loaded into the block cache, the allocation also
    // covers the cache's entry metadata. A 1020B block may fit a 1024B class
    // on its own yet land in a 2048B class once the metadata is added.
    let block_size_with_metadata = estimated_block_size + CACHE_VALUE_METADATA_SIZE;

    // Fast path: combine the entry size with an upper-bound estimate of its
    // encoding overhead rather than computing exact varint widths.
    let new_estimated_size = block_size_with_metadata + key_len + value_len + 18;
    if block_size_with_metadata <= options.size_class_aware_threshold
        || new_estimated_size <= options.block_size
    {
        return false;
    }

    let Some(size_class) = block_size_class(block_size_with_metadata, size_class_hints) else {
        // The block did not map to any size class; fall back.
        return should_flush_without_hints(
            key_len,
            value_len,
            restart_interval,
            estimated_block_size,
            num_entries,
            options,
        );
    };

    // Tighter estimate of the metadata stored with the next entry.
    let mut new_size = block_size_with_metadata + key_len + value_len;
    if num_entries % restart_interval == 0 {
        new_size += 4;
    }
    new_size += 4; // varint for shared prefix length
    new_size += varint_len(key_len as u64);
    new_size += varint_len(value_len as u64);

    if block_size_with_metadata < options.block_size {
        if let Some(new_size_class) = block_size_class(new_size, size_class_hints) {
            if new_size_class - new_size >= size_class - block_size_with_metadata {
                // The block hasn't reached the target size, but waiting for
                // the next entry would exceed the target and increase
                // internal fragmentation.
                return true;
            }
        }
        return false;
    }

    // Flush if inserting the next entry bumps the block into the allocator's
    // next size class.
    new_size > size_class
}

fn should_flush_without_hints(
    key_len: usize,
    value_len: usize,
    restart_interval: usize,
    estimated_block_size: usize,
    num_entries: usize,
    options: FlushDecisionOptions,
) -> bool {
    if estimated_block_size >= options.block_size {
        return true;
    }

    // The block is smaller than the target size.
    if estimated_block_size <= options.block_size_threshold {
        // And smaller than the threshold at which flushing is considered.
        return false;
    }

    let mut new_size = estimated_block_size + key_len + value_len;
    if num_entries % restart_interval == 0 {
        new_size += 4;
    }
    new_size += 4; // varint for shared prefix length
    new_size += varint_len(key_len as u64);
    new_size += varint_len(value_len as u64);
    // Flush if the block plus the new entry overshoots the target size.
    new_size > options.block_size
}

/// The smallest allocator size class that can hold `block_size`, if any.
fn block_size_class(block_size: usize, size_class_hints: &[usize]) -> Option<usize> {
    let idx = size_class_hints.partition_point(|&class| class < block_size);
    size_class_hints.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> FlushDecisionOptions {
        FlushDecisionOptions::new(4096, 90, 60)
    }

    #[test]
    fn empty_block_never_flushes() {
        assert!(!should_flush(100, 100, 16, 0, 0, options(), &[]));
        assert!(!should_flush(100, 100, 16, 0, 0, options(), &[1024, 2048]));
    }

    #[test]
    fn at_target_always_flushes() {
        assert!(should_flush(10, 10, 16, 4096, 5, options(), &[]));
        assert!(should_flush(10, 10, 16, 8000, 5, options(), &[]));
    }

    #[test]
    fn below_threshold_never_flushes() {
        // Threshold is 90% of 4096 = 3687; a huge entry on a small block
        // still does not flush.
        assert!(!should_flush(100_000, 100_000, 16, 3000, 5, options(), &[]));
    }

    #[test]
    fn between_threshold_and_target_depends_on_entry_size() {
        // 3700 is above the threshold; a large entry would overshoot.
        assert!(should_flush(300, 300, 16, 3700, 5, options(), &[]));
        // A tiny entry fits under the target.
        assert!(!should_flush(10, 10, 16, 3700, 5, options(), &[]));
    }

    #[test]
    fn threshold_rounds_up() {
        let o = FlushDecisionOptions::new(1000, 7, 0);
        assert_eq!(o.block_size_threshold, 70);
        let o = FlushDecisionOptions::new(999, 7, 0);
        assert_eq!(o.block_size_threshold, 70);
    }

    #[test]
    fn size_class_finds_smallest_fit() {
        let hints = [1024, 2048, 4096];
        assert_eq!(block_size_class(512, &hints), Some(1024));
        assert_eq!(block_size_class(1024, &hints), Some(1024));
        assert_eq!(block_size_class(1025, &hints), Some(2048));
        assert_eq!(block_size_class(8192, &hints), None);
    }

    #[test]
    fn size_class_gate_suppresses_small_flushes() {
        let o = options();
        // Below the size-class-aware threshold (60% of 4096 = 2458 with
        // metadata), nothing flushes.
        assert!(!should_flush(4000, 4000, 16, 2000, 5, o, &[4096, 8192]));
    }

    #[test]
    fn size_class_prefers_less_fragmentation() {
        let o = FlushDecisionOptions::new(4096, 90, 60);
        let hints = [1024, 2048, 4096, 8192];
        // Block at 3800 (+32 metadata) sits in the 4096 class with ~260
        // bytes of slack. An 800-byte entry would push it into 8192,
        // wasting far more; flushing now wastes less.
        assert!(should_flush(400, 400, 16, 3800, 5, o, &hints));
        // A small entry stays within the current class: no flush.
        assert!(!should_flush(8, 8, 16, 3800, 5, o, &hints));
    }
}
