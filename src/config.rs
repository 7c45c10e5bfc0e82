use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheInvalidator;
use crate::checksum::ChecksumType;
use crate::compress::Compression;
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::key::{BytewiseComparer, Comparer};
use crate::sstable::collector::BlockPropertyCollector;
use crate::sstable::TableFormat;

/// Builds a fresh collector for each table.
pub type CollectorFactory = Box<dyn Fn() -> Box<dyn BlockPropertyCollector> + Send>;

/// Derives a short attribute from `(user_key, prefix_len, value)` for values
/// redirected to value blocks.
pub type ShortAttributeExtractor = Box<dyn Fn(&[u8], usize, &[u8]) -> Result<u8> + Send>;

/// An inclusive-lower, exclusive-upper bound on user-key prefixes whose
/// values must stay in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserKeyPrefixBound {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
}

impl UserKeyPrefixBound {
    pub fn is_empty(&self) -> bool {
        self.lower.is_empty() && self.upper.is_empty()
    }
}

/// Configuration for the table writer.
pub struct WriterOptions {
    /// Target uncompressed size of a data block (default: 4KB)
    pub block_size: usize,

    /// Percentage of the block size a block must reach before the flush
    /// heuristics consider cutting it (default: 90)
    pub block_size_threshold: usize,

    /// Percentage gate used instead when allocator size classes are known
    /// (default: 60)
    pub size_class_aware_threshold: usize,

    /// Target size of an index block before it is cut into a partition
    /// (default: 4KB)
    pub index_block_size: usize,

    /// Entries between restart points in data blocks (default: 16)
    pub restart_interval: usize,

    /// Block compression codec (default: Snappy)
    pub compression: Compression,

    /// Block checksum algorithm (default: CRC32-C)
    pub checksum: ChecksumType,

    /// Table format version; gates range keys, value blocks, and the
    /// obsolete bit (default: v4)
    pub table_format: TableFormat,

    /// Key comparison, split, separator, and successor (default: bytewise)
    pub comparer: Arc<dyn Comparer>,

    /// Merge operator name recorded in the properties block
    pub merger_name: String,

    /// Optional filter policy; when set, a filter block is written
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Block property collector factories
    pub block_property_collectors: Vec<CollectorFactory>,

    /// Run compression and file writes on a separate thread (default: off)
    pub parallelism: bool,

    /// The allocator's size classes, ascending, for fragmentation-aware
    /// flushing
    pub allocator_size_classes: Vec<usize>,

    /// Whether this table is written to the LSM's lowest level; point
    /// deletes there are immediately obsolete
    pub writing_to_lowest_level: bool,

    /// Enforce the strict-obsolete contract: all adds must go through
    /// `add_with_force_obsolete`, and Merge is forbidden
    pub is_strict_obsolete: bool,

    /// Disable value separation even when the format supports it
    pub disable_value_blocks: bool,

    /// Values at or below this length are never redirected to value blocks
    /// (default: 0, redirect everything eligible)
    pub tiny_value_threshold: usize,

    /// Extracts the short attribute stored in the value prefix byte
    pub short_attribute_extractor: Option<ShortAttributeExtractor>,

    /// Prefix range whose values must not be redirected
    pub required_in_place_value_bound: UserKeyPrefixBound,

    /// Reader-side block cache to invalidate as offsets are written
    pub cache: Option<Arc<dyn CacheInvalidator + Sync>>,

    /// File number of the table, used as the cache invalidation key
    pub file_num: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_size_threshold: 90,
            size_class_aware_threshold: 60,
            index_block_size: 4096,
            restart_interval: 16,
            compression: Compression::default(),
            checksum: ChecksumType::default(),
            table_format: TableFormat::default(),
            comparer: Arc::new(BytewiseComparer),
            merger_name: String::new(),
            filter_policy: None,
            block_property_collectors: Vec::new(),
            parallelism: false,
            allocator_size_classes: Vec::new(),
            writing_to_lowest_level: false,
            is_strict_obsolete: false,
            disable_value_blocks: false,
            tiny_value_threshold: 0,
            short_attribute_extractor: None,
            required_in_place_value_bound: UserKeyPrefixBound::default(),
            cache: None,
            file_num: 0,
        }
    }
}

impl WriterOptions {
    /// Set the target data-block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the target index-block size
    pub fn index_block_size(mut self, size: usize) -> Self {
        self.index_block_size = size;
        self
    }

    /// Set the data-block restart interval
    pub fn restart_interval(mut self, interval: usize) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Set the compression codec
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the checksum algorithm
    pub fn checksum(mut self, checksum: ChecksumType) -> Self {
        self.checksum = checksum;
        self
    }

    /// Set the table format version
    pub fn table_format(mut self, format: TableFormat) -> Self {
        self.table_format = format;
        self
    }

    /// Set the comparer
    pub fn comparer(mut self, comparer: Arc<dyn Comparer>) -> Self {
        self.comparer = comparer;
        self
    }

    /// Set the filter policy
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Add a block property collector factory
    pub fn block_property_collector(mut self, factory: CollectorFactory) -> Self {
        self.block_property_collectors.push(factory);
        self
    }

    /// Enable the parallel compression/write pipeline
    pub fn parallelism(mut self, enabled: bool) -> Self {
        self.parallelism = enabled;
        self
    }

    /// Provide the allocator's size classes, ascending
    pub fn allocator_size_classes(mut self, classes: Vec<usize>) -> Self {
        self.allocator_size_classes = classes;
        self
    }

    /// Mark the table as written to the lowest level
    pub fn writing_to_lowest_level(mut self, lowest: bool) -> Self {
        self.writing_to_lowest_level = lowest;
        self
    }

    /// Enforce strict-obsolete semantics
    pub fn strict_obsolete(mut self, strict: bool) -> Self {
        self.is_strict_obsolete = strict;
        self
    }
}

/// Configuration for the WAL record writer.
#[derive(Default)]
pub struct LogWriterConfig {
    /// Minimum duration between fsyncs; syncs requested sooner wait for the
    /// interval timer while writes keep flowing (default: none)
    pub min_sync_interval: Option<Box<dyn Fn() -> Duration + Send>>,

    /// Called with the duration of every fsync (default: none)
    pub on_fsync: Option<Box<dyn Fn(Duration) + Send>>,
}

impl LogWriterConfig {
    /// Set the minimum interval between fsyncs
    pub fn min_sync_interval(mut self, f: impl Fn() -> Duration + Send + 'static) -> Self {
        self.min_sync_interval = Some(Box::new(f));
        self
    }

    /// Set the fsync latency callback
    pub fn on_fsync(mut self, f: impl Fn(Duration) + Send + 'static) -> Self {
        self.on_fsync = Some(Box::new(f));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = WriterOptions::default();
        assert_eq!(options.block_size, 4096);
        assert_eq!(options.block_size_threshold, 90);
        assert_eq!(options.restart_interval, 16);
        assert_eq!(options.table_format, TableFormat::V4);
        assert!(!options.parallelism);
        assert_eq!(options.tiny_value_threshold, 0);
    }

    #[test]
    fn options_builder() {
        let options = WriterOptions::default()
            .block_size(16 * 1024)
            .restart_interval(8)
            .parallelism(true)
            .table_format(TableFormat::V2)
            .allocator_size_classes(vec![1024, 2048]);

        assert_eq!(options.block_size, 16 * 1024);
        assert_eq!(options.restart_interval, 8);
        assert!(options.parallelism);
        assert_eq!(options.table_format, TableFormat::V2);
        assert_eq!(options.allocator_size_classes, vec![1024, 2048]);
    }

    #[test]
    fn log_writer_config_builder() {
        let config = LogWriterConfig::default()
            .min_sync_interval(|| Duration::from_millis(100))
            .on_fsync(|_d| {});
        assert!(config.min_sync_interval.is_some());
        assert!(config.on_fsync.is_some());
    }
}
