//! The table writer state machine.
//!
//! Entries flow: ordering check → value-separation decision → data-block add
//! → flush decision → write queue → ordered file write → index entry. Close
//! drains the queue and lays down the meta blocks and footer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::compress::Compression;
use crate::config::{ShortAttributeExtractor, UserKeyPrefixBound, WriterOptions};
use crate::error::{Error, Result};
use crate::key::{
    internal_compare, make_trailer, Comparer, InternalKey, KeyKind, SEQ_NUM_MAX,
};
use crate::keyspan::{Fragmenter, Span, SpanKey};
use crate::rangekey;
use crate::sstable::block::{BlockWriter, RawBlockWriter};
use crate::sstable::buffer::{BlockBuf, BufferPool, DataBlockBuf};
use crate::sstable::collector::{
    BlockPropertyCollector, BlockPropsEncoder, ObsoleteKeyBlockCollector,
    MAX_PROPERTY_COLLECTORS,
};
use crate::sstable::estimate::DataBlockEstimates;
use crate::sstable::flush::FlushDecisionOptions;
use crate::sstable::footer::{
    BlockHandle, BlockHandleWithProperties, Footer, ENCODED_BHP_ESTIMATED_SIZE,
};
use crate::sstable::index::{new_index_buf, recycle_index_buf, IndexBlockBuf, IndexPartition};
use crate::sstable::properties::{
    Properties, BINARY_SEARCH_INDEX, PROPERTIES_BLOCK_RESTART_INTERVAL, TWO_LEVEL_INDEX,
};
use crate::sstable::value_block::{
    make_prefix_for_in_place_value, make_prefix_for_value_handle, ValueBlockWriter,
};
use crate::sstable::write_queue::{SharedCore, WriteQueue, WriteTask};
use crate::sstable::{
    TableFormat, BLOCK_TRAILER_LEN, META_PROPERTIES_NAME, META_RANGE_DEL_NAME,
    META_RANGE_DEL_V2_NAME, META_RANGE_KEY_NAME, META_VALUE_INDEX_NAME,
};
use crate::writable::Writable;
use crate::{errfragment, errkeyorder};
use crate::filter::TableFilterWriter;

/// Info about a finished table. The largest keys are only set on close.
#[derive(Debug, Default, Clone)]
pub struct WriterMetadata {
    pub size: u64,
    pub smallest_point: Option<InternalKey>,
    pub largest_point: Option<InternalKey>,
    pub smallest_range_del: Option<InternalKey>,
    pub largest_range_del: Option<InternalKey>,
    pub smallest_range_key: Option<InternalKey>,
    pub largest_range_key: Option<InternalKey>,
    pub smallest_seq_num: u64,
    pub largest_seq_num: u64,
    pub properties: Properties,
}

impl WriterMetadata {
    pub fn has_point_keys(&self) -> bool {
        self.smallest_point.is_some()
    }

    pub fn has_range_del_keys(&self) -> bool {
        self.smallest_range_del.is_some()
    }

    pub fn has_range_keys(&self) -> bool {
        self.smallest_range_key.is_some()
    }

    fn update_seq_num(&mut self, seq_num: u64) {
        if self.smallest_seq_num > seq_num {
            self.smallest_seq_num = seq_num;
        }
        if self.largest_seq_num < seq_num {
            self.largest_seq_num = seq_num;
        }
    }
}

/// Cached facts about the last point key, so the next add does not extract
/// them again.
#[derive(Debug, Default, Clone)]
struct PointKeyInfo {
    trailer: u64,
    /// Computed only when value blocks are enabled.
    prefix_len: usize,
    is_obsolete: bool,
}

/// A streaming sorted-string-table writer.
///
/// Keys must be added in order per keyspace: point keys strictly increasing
/// (user key ascending, trailer descending), range tombstones fragmented and
/// ordered by start, range keys ordered by start. `close` finalizes the
/// table; the writer is inert afterwards.
pub struct Writer {
    core: Arc<Mutex<SharedCore>>,
    queue: WriteQueue,
    parallelism: bool,
    meta: WriterMetadata,
    props: Properties,
    err: Option<Error>,
    closed: bool,

    cmp: Arc<dyn Comparer>,
    compression: Compression,
    table_format: TableFormat,
    restart_interval: usize,
    checksum_type: crate::checksum::ChecksumType,
    is_strict_obsolete: bool,
    writing_to_lowest_level: bool,
    data_block_options: FlushDecisionOptions,
    index_block_options: FlushDecisionOptions,
    allocator_size_classes: Vec<usize>,
    cache: Option<Arc<dyn crate::cache::CacheInvalidator + Sync>>,
    file_num: u64,

    data_block_buf: DataBlockBuf,
    block_buf: BlockBuf,
    data_buf_pool: Arc<BufferPool<DataBlockBuf>>,
    index_buf_pool: Arc<BufferPool<IndexBlockBuf>>,
    index_block: Arc<IndexBlockBuf>,
    top_level_index_block: BlockWriter,
    range_del_block: BlockWriter,
    range_key_block: BlockWriter,
    filter: Option<TableFilterWriter>,
    collectors: Vec<Box<dyn BlockPropertyCollector>>,
    obsolete_collector: ObsoleteKeyBlockCollector,
    props_encoder: BlockPropsEncoder,
    size_estimates: Arc<DataBlockEstimates>,
    fragmenter: Fragmenter,
    last_point_key_info: PointKeyInfo,
    has_set_with_delete: bool,

    value_block_writer: Option<ValueBlockWriter>,
    short_attribute_extractor: Option<ShortAttributeExtractor>,
    required_in_place_value_bound: UserKeyPrefixBound,
    tiny_value_threshold: usize,

    /// Largest estimate ever reported; keeps `estimated_size` monotone even
    /// as in-progress blocks are cut and replaced by empty ones.
    max_estimated_size: std::sync::atomic::AtomicU64,
}

impl Writer {
    pub fn new(writable: Box<dyn Writable>, mut options: WriterOptions) -> Writer {
        let parallelism = options.parallelism;
        let core = Arc::new(Mutex::new(SharedCore {
            writable: Some(writable),
            file_size: 0,
            index_partitions: Vec::new(),
            two_level_index: false,
            err: None,
        }));
        let data_buf_pool = Arc::new(BufferPool::new());
        let index_buf_pool = Arc::new(BufferPool::new());
        let queue_size = if parallelism {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            0
        };
        let queue = WriteQueue::new(
            queue_size,
            core.clone(),
            data_buf_pool.clone(),
            index_buf_pool.clone(),
            options.cache.clone(),
            options.file_num,
        );
        let size_estimates = Arc::new(DataBlockEstimates::new(parallelism));

        let mut collectors: Vec<Box<dyn BlockPropertyCollector>> = Vec::new();
        let mut err = None;
        if options.block_property_collectors.len() >= MAX_PROPERTY_COLLECTORS {
            err = Some(Error::InvalidData(
                "too many block property collectors".to_string(),
            ));
        } else {
            for factory in &options.block_property_collectors {
                collectors.push(factory());
            }
        }

        let mut collector_names: Vec<&'static str> =
            collectors.iter().map(|c| c.name()).collect();
        if options.table_format >= TableFormat::V4 {
            collector_names.push(ObsoleteKeyBlockCollector::NAME);
        }
        let property_collector_names = format!("[{}]", collector_names.join(","));

        let value_block_writer = if options.table_format >= TableFormat::V3
            && !options.disable_value_blocks
        {
            let estimates = size_estimates.clone();
            Some(ValueBlockWriter::new(
                options.block_size,
                options.compression,
                options.checksum,
                Box::new(move |compressed_size| {
                    estimates.data_block_compressed(compressed_size, 0)
                }),
            ))
        } else {
            None
        };

        let props = Properties {
            comparer_name: options.comparer.name().to_string(),
            compression_name: options.compression.to_string(),
            merger_name: options.merger_name.clone(),
            property_collector_names,
            ..Default::default()
        };

        Writer {
            queue,
            parallelism,
            meta: WriterMetadata {
                smallest_seq_num: u64::MAX,
                ..Default::default()
            },
            props,
            err,
            closed: false,
            cmp: options.comparer.clone(),
            compression: options.compression,
            table_format: options.table_format,
            restart_interval: options.restart_interval,
            checksum_type: options.checksum,
            is_strict_obsolete: options.is_strict_obsolete,
            writing_to_lowest_level: options.writing_to_lowest_level,
            data_block_options: FlushDecisionOptions::new(
                options.block_size,
                options.block_size_threshold,
                options.size_class_aware_threshold,
            ),
            index_block_options: FlushDecisionOptions::new(
                options.index_block_size,
                options.block_size_threshold,
                options.size_class_aware_threshold,
            ),
            allocator_size_classes: std::mem::take(&mut options.allocator_size_classes),
            cache: options.cache.clone(),
            file_num: options.file_num,
            data_block_buf: DataBlockBuf::new(options.restart_interval, options.checksum),
            block_buf: BlockBuf::new(options.checksum),
            data_buf_pool,
            index_buf_pool: index_buf_pool.clone(),
            index_block: new_index_buf(&index_buf_pool, parallelism),
            top_level_index_block: BlockWriter::new(1),
            range_del_block: BlockWriter::new(1),
            range_key_block: BlockWriter::new(1),
            filter: options
                .filter_policy
                .as_ref()
                .map(|policy| TableFilterWriter::new(policy.clone())),
            collectors,
            obsolete_collector: ObsoleteKeyBlockCollector::default(),
            props_encoder: BlockPropsEncoder::default(),
            size_estimates,
            fragmenter: Fragmenter::new(options.comparer.clone()),
            last_point_key_info: PointKeyInfo::default(),
            has_set_with_delete: false,
            value_block_writer,
            short_attribute_extractor: options.short_attribute_extractor.take(),
            required_in_place_value_bound: options.required_in_place_value_bound.clone(),
            tiny_value_threshold: options.tiny_value_threshold,
            max_estimated_size: std::sync::atomic::AtomicU64::new(0),
            core,
        }
    }

    /// Sets the value for the given key with sequence number 0, for tables
    /// built externally and ingested.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_latched()?;
        if self.is_strict_obsolete {
            return Err(Error::StrictObsolete(
                "use add_with_force_obsolete".to_string(),
            ));
        }
        self.add_point(&InternalKey::new(key.to_vec(), 0, KeyKind::Set), value, false)
    }

    /// Deletes the value for the given key with sequence number 0.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_latched()?;
        if self.is_strict_obsolete {
            return Err(Error::StrictObsolete(
                "use add_with_force_obsolete".to_string(),
            ));
        }
        self.add_point(&InternalKey::new(key.to_vec(), 0, KeyKind::Delete), &[], false)
    }

    /// Adds a merge operand for the given key with sequence number 0.
    pub fn merge(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_latched()?;
        if self.is_strict_obsolete {
            return Err(Error::StrictObsolete(
                "use add_with_force_obsolete".to_string(),
            ));
        }
        self.add_point(&InternalKey::new(key.to_vec(), 0, KeyKind::Merge), value, false)
    }

    /// Deletes all keys in `[start, end)` with sequence number 0.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.check_latched()?;
        self.add_tombstone(
            &InternalKey::new(start.to_vec(), 0, KeyKind::RangeDelete),
            end,
        )
    }

    /// Adds a key/value pair. Point keys must be strictly increasing; range
    /// deletion tombstones must be fragmented and ordered by start key, but
    /// may interleave out of order with point keys.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if self.is_strict_obsolete {
            return Err(Error::StrictObsolete(
                "use add_with_force_obsolete".to_string(),
            ));
        }
        self.add_with_force_obsolete(key, value, false)
    }

    /// The required entry point for strict-obsolete tables. `force_obsolete`
    /// marks keys the caller knows are shadowed by a range delete.
    pub fn add_with_force_obsolete(
        &mut self,
        key: &InternalKey,
        value: &[u8],
        force_obsolete: bool,
    ) -> Result<()> {
        self.check_latched()?;
        match key.kind() {
            KeyKind::RangeDelete => self.add_tombstone(key, value),
            KeyKind::RangeKeySet | KeyKind::RangeKeyUnset | KeyKind::RangeKeyDelete => {
                let err = Error::KindMisroute(
                    "range keys must be added through the range_key_* functions".to_string(),
                );
                self.err = Some(err.clone());
                Err(err)
            }
            _ => self.add_point(key, value, force_obsolete),
        }
    }

    /// Sets `[start, end)` with the given suffix to the given value, at
    /// sequence number 0. Spans need not be fragmented but must arrive in
    /// start-key order.
    pub fn range_key_set(
        &mut self,
        start: &[u8],
        end: &[u8],
        suffix: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.check_latched()?;
        self.add_range_key_span(Span {
            start: start.to_vec(),
            end: end.to_vec(),
            keys: vec![SpanKey {
                trailer: make_trailer(0, KeyKind::RangeKeySet),
                suffix: suffix.to_vec(),
                value: value.to_vec(),
            }],
        })
    }

    /// Un-sets `[start, end)` for the given suffix at sequence number 0.
    pub fn range_key_unset(&mut self, start: &[u8], end: &[u8], suffix: &[u8]) -> Result<()> {
        self.check_latched()?;
        self.add_range_key_span(Span {
            start: start.to_vec(),
            end: end.to_vec(),
            keys: vec![SpanKey {
                trailer: make_trailer(0, KeyKind::RangeKeyUnset),
                suffix: suffix.to_vec(),
                value: Vec::new(),
            }],
        })
    }

    /// Deletes all range keys in `[start, end)` at sequence number 0.
    pub fn range_key_delete(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.check_latched()?;
        self.add_range_key_span(Span {
            start: start.to_vec(),
            end: end.to_vec(),
            keys: vec![SpanKey {
                trailer: make_trailer(0, KeyKind::RangeKeyDelete),
                suffix: Vec::new(),
                value: Vec::new(),
            }],
        })
    }

    /// Adds an already-fragmented, already-encoded range key. Start keys
    /// must be strictly increasing and overlapping spans aligned; the caller
    /// owns the fragmentation invariant.
    pub fn add_range_key(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        self.check_latched()?;
        self.add_range_key_inner(key, value)
    }

    /// The estimated file size if the table were finished now. Monotone
    /// non-decreasing.
    pub fn estimated_size(&self) -> u64 {
        let estimate = self.size_estimates.size()
            + self.data_block_buf.block.estimated_size() as u64
            + self.index_block.estimated_size();
        let prev = self
            .max_estimated_size
            .fetch_max(estimate, std::sync::atomic::Ordering::AcqRel);
        estimate.max(prev)
    }

    /// Metadata for the finished table. Only valid after `close`.
    pub fn metadata(&self) -> Result<&WriterMetadata> {
        if !self.closed {
            return Err(Error::InvalidData("writer is not closed".to_string()));
        }
        Ok(&self.meta)
    }

    /// The last point user key written. Points into the writer's buffers;
    /// invalid after the next point add. Must not be called after close.
    pub fn unsafe_last_point_user_key(&self) -> Option<&[u8]> {
        if self.data_block_buf.block.n_entries() >= 1 {
            Some(self.data_block_buf.block.cur_user_key())
        } else {
            None
        }
    }

    fn check_latched(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn latch(&mut self, err: Error) -> Error {
        self.err = Some(err.clone());
        err
    }

    fn lock_core(&self) -> MutexGuard<'_, SharedCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_collectors(&self) -> bool {
        !self.collectors.is_empty() || self.table_format >= TableFormat::V4
    }

    // ---- point keys ----

    fn make_add_point_decision_v2(&mut self, key: &InternalKey) -> Result<()> {
        let prev_trailer = self.last_point_key_info.trailer;
        self.last_point_key_info.trailer = key.trailer;
        if self.data_block_buf.block.n_entries() == 0 {
            return Ok(());
        }
        let prev_user = self.data_block_buf.block.cur_user_key();
        let cmp_user = self.cmp.compare(prev_user, &key.user_key);
        if cmp_user == std::cmp::Ordering::Greater
            || (cmp_user == std::cmp::Ordering::Equal && prev_trailer <= key.trailer)
        {
            let prev = InternalKey {
                user_key: prev_user.to_vec(),
                trailer: prev_trailer,
            };
            return Err(errkeyorder!(
                "keys must be added in strictly increasing order: {}, {}",
                prev.pretty(),
                key.pretty()
            ));
        }
        Ok(())
    }

    /// Decides value separation and obsolescence for formats with value
    /// blocks. Returns (set_has_same_prefix, write_to_value_block,
    /// is_obsolete).
    fn make_add_point_decision_v3(
        &mut self,
        key: &InternalKey,
        value_len: usize,
    ) -> Result<(bool, bool, bool)> {
        let prev_info = self.last_point_key_info.clone();
        self.last_point_key_info = PointKeyInfo {
            trailer: key.trailer,
            prefix_len: self.cmp.split(&key.user_key),
            is_obsolete: false,
        };
        if !self.meta.has_point_keys() {
            return Ok((false, false, false));
        }
        let key_kind = key.kind();
        let prev_user = self.data_block_buf.block.cur_user_key().to_vec();
        let prev_kind = crate::key::trailer_kind(prev_info.trailer);

        let mut consider_value_block =
            prev_kind == KeyKind::Set && key_kind == KeyKind::Set;
        if consider_value_block && !self.required_in_place_value_bound.is_empty() {
            let key_prefix = &key.user_key[..self.last_point_key_info.prefix_len];
            if self
                .cmp
                .compare(&self.required_in_place_value_bound.upper, key_prefix)
                != std::cmp::Ordering::Greater
            {
                // Everything from here on sorts past the bound; stop
                // checking it.
                self.required_in_place_value_bound = UserKeyPrefixBound::default();
            } else if self
                .cmp
                .compare(key_prefix, &self.required_in_place_value_bound.lower)
                != std::cmp::Ordering::Less
            {
                consider_value_block = false;
            }
        }

        let mut cmp_prefix = std::cmp::Ordering::Equal;
        let cmp_user;
        if consider_value_block {
            cmp_prefix = self.cmp.compare(
                &prev_user[..prev_info.prefix_len],
                &key.user_key[..self.last_point_key_info.prefix_len],
            );
            cmp_user = if cmp_prefix == std::cmp::Ordering::Equal {
                self.cmp.compare(
                    &prev_user[prev_info.prefix_len..],
                    &key.user_key[self.last_point_key_info.prefix_len..],
                )
            } else {
                cmp_prefix
            };
        } else {
            cmp_user = self.cmp.compare(&prev_user, &key.user_key);
        }

        match key_kind {
            KeyKind::Set
            | KeyKind::SetWithDelete
            | KeyKind::Merge
            | KeyKind::Delete
            | KeyKind::SingleDelete
            | KeyKind::DeleteSized => {}
            _ => {
                return Err(Error::KindMisroute(format!(
                    "unexpected point key kind {key_kind}"
                )))
            }
        }

        // For the same user key the current key is obsolete if (C1) the
        // previous key was obsolete, or (C2) the previous key was not a
        // Merge. Merge operands must survive so their values merge into the
        // newer entry, and deletes below a Merge must survive to shadow
        // older entries in lower levels. Regardless of the user key, (C3) a
        // point delete written to the lowest level is immediately obsolete.
        let is_obsolete_c1_and_c2 = cmp_user == std::cmp::Ordering::Equal
            && (prev_info.is_obsolete || prev_kind != KeyKind::Merge);
        let is_obsolete_c3 = self.writing_to_lowest_level && key_kind.is_point_delete();
        let is_obsolete = is_obsolete_c1_and_c2 || is_obsolete_c3;

        if cmp_user == std::cmp::Ordering::Greater
            || (cmp_user == std::cmp::Ordering::Equal && prev_info.trailer <= key.trailer)
        {
            let prev = InternalKey {
                user_key: prev_user,
                trailer: prev_info.trailer,
            };
            return Err(errkeyorder!(
                "keys must be added in strictly increasing order: {}, {}",
                prev.pretty(),
                key.pretty()
            ));
        }

        if !consider_value_block {
            return Ok((false, false, is_obsolete));
        }
        // Identical user keys (open snapshots) still share the prefix.
        let set_has_same_prefix = cmp_prefix == std::cmp::Ordering::Equal;
        let write_to_value_block = set_has_same_prefix
            && value_len > self.tiny_value_threshold
            && self.value_block_writer.is_some();
        Ok((set_has_same_prefix, write_to_value_block, is_obsolete))
    }

    fn add_point(&mut self, key: &InternalKey, value: &[u8], force_obsolete: bool) -> Result<()> {
        if self.is_strict_obsolete && key.kind() == KeyKind::Merge {
            return Err(self.latch(Error::StrictObsolete(
                "Merge is not supported in a strict-obsolete table".to_string(),
            )));
        }

        let v3 = self.table_format >= TableFormat::V3;
        let max_shared_key_len = if v3 {
            self.last_point_key_info.prefix_len
        } else {
            key.user_key.len()
        };
        let (set_has_same_prefix, write_to_value_block, mut is_obsolete) = if v3 {
            match self.make_add_point_decision_v3(key, value.len()) {
                Ok(decision) => decision,
                Err(err) => return Err(self.latch(err)),
            }
        } else {
            if let Err(err) = self.make_add_point_decision_v2(key) {
                return Err(self.latch(err));
            }
            (false, false, false)
        };
        let add_value_prefix = v3 && key.kind() == KeyKind::Set;

        is_obsolete = self.table_format >= TableFormat::V4 && (is_obsolete || force_obsolete);
        self.last_point_key_info.is_obsolete = is_obsolete;

        let mut handle_buf = Vec::new();
        let (stored_value, value_prefix): (&[u8], Option<u8>) = if write_to_value_block {
            let prefix_len = self.last_point_key_info.prefix_len;
            let extracted = self
                .short_attribute_extractor
                .as_ref()
                .map_or(Ok(0), |extract| extract(&key.user_key, prefix_len, value));
            let attribute = match extracted {
                Ok(attribute) => attribute,
                Err(err) => return Err(self.latch(err)),
            };
            let vbw = self
                .value_block_writer
                .as_mut()
                .expect("value separation decided without a value-block writer");
            let vh = vbw.add_value(value);
            vh.encode(&mut handle_buf);
            (
                &handle_buf,
                Some(make_prefix_for_value_handle(set_has_same_prefix, attribute)),
            )
        } else if add_value_prefix {
            (value, Some(make_prefix_for_in_place_value(set_has_same_prefix)))
        } else {
            (value, None)
        };
        let stored_value_len = stored_value.len() + usize::from(value_prefix.is_some());

        if let Err(err) = self.maybe_flush(key, stored_value_len) {
            return Err(self.latch(err));
        }

        for collector in &mut self.collectors {
            // Redirected and prefixed SET values may never be read by a
            // compaction; collectors must not depend on them.
            let collector_value: &[u8] = if add_value_prefix { &[] } else { value };
            if let Err(err) = collector.add(key, collector_value) {
                return Err(self.latch(err));
            }
        }
        if self.table_format >= TableFormat::V4 {
            self.obsolete_collector.add_point(is_obsolete);
        }

        if let Some(filter) = &mut self.filter {
            let prefix = &key.user_key[..self.cmp.split(&key.user_key)];
            filter.add_key(prefix);
        }

        self.data_block_buf.block.add_with_optional_value_prefix(
            key,
            is_obsolete,
            stored_value,
            max_shared_key_len,
            value_prefix,
        );

        self.meta.update_seq_num(key.seq_num());
        if self.meta.smallest_point.is_none() {
            self.meta.smallest_point = Some(key.clone());
        }

        self.props.num_entries += 1;
        match key.kind() {
            KeyKind::Delete | KeyKind::SingleDelete => {
                self.props.num_deletions += 1;
                self.props.raw_point_tombstone_key_size += key.user_key.len() as u64;
            }
            KeyKind::DeleteSized => {
                let mut size = 0;
                if !value.is_empty() {
                    match crate::encoding::get_varint64(value) {
                        Ok((v, _)) => size = v,
                        Err(_) => {
                            return Err(self.latch(Error::InvalidData(format!(
                                "DELSIZED key's value does not parse as a varint: {}",
                                key.pretty()
                            ))));
                        }
                    }
                }
                self.props.num_deletions += 1;
                self.props.num_sized_deletions += 1;
                self.props.raw_point_tombstone_key_size += key.user_key.len() as u64;
                self.props.raw_point_tombstone_value_size += size;
            }
            KeyKind::Merge => {
                self.props.num_merge_operands += 1;
            }
            KeyKind::SetWithDelete => {
                self.has_set_with_delete = true;
            }
            _ => {}
        }
        self.props.raw_key_size += key.size() as u64;
        self.props.raw_value_size += value.len() as u64;
        Ok(())
    }

    // ---- range deletes ----

    fn add_tombstone(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if self.range_del_block.n_entries() > 0 {
            // Tombstones must arrive fragmented: overlapping tombstones have
            // identical bounds.
            let prev_key = self.range_del_block.cur_key();
            match self.cmp.compare(&prev_key.user_key, &key.user_key) {
                std::cmp::Ordering::Greater => {
                    return Err(self.latch(errkeyorder!(
                        "tombstones must be added in order: {}, {}",
                        prev_key.pretty(),
                        key.pretty()
                    )));
                }
                std::cmp::Ordering::Equal => {
                    let prev_value = self.range_del_block.cur_value();
                    if self.cmp.compare(prev_value, value) != std::cmp::Ordering::Equal {
                        let err = errfragment!(
                            "overlapping tombstones must be fragmented: {} vs {}",
                            prev_key.pretty(),
                            key.pretty()
                        );
                        return Err(self.latch(err));
                    }
                    if prev_key.seq_num() <= key.seq_num() {
                        return Err(self.latch(errkeyorder!(
                            "tombstones must be added in strictly increasing order: {}, {}",
                            prev_key.pretty(),
                            key.pretty()
                        )));
                    }
                }
                std::cmp::Ordering::Less => {
                    let prev_end = self.range_del_block.cur_value();
                    if self.cmp.compare(prev_end, &key.user_key) == std::cmp::Ordering::Greater {
                        let err = errfragment!(
                            "overlapping tombstones must be fragmented: {} vs {}",
                            prev_key.pretty(),
                            key.pretty()
                        );
                        return Err(self.latch(err));
                    }
                }
            }
        }

        if key.trailer == make_trailer(SEQ_NUM_MAX, KeyKind::RangeDelete) {
            return Err(self.latch(errkeyorder!(
                "cannot add the range-delete sentinel: {}",
                key.pretty()
            )));
        }

        self.meta.update_seq_num(key.seq_num());

        // Tombstones are fragmented, so the first start key is the smallest.
        // The largest is derived from the last end key at close.
        if self.props.num_range_deletions == 0 {
            self.meta.smallest_range_del = Some(key.clone());
        }

        self.props.num_entries += 1;
        self.props.num_deletions += 1;
        self.props.num_range_deletions += 1;
        self.props.raw_key_size += key.size() as u64;
        self.props.raw_value_size += value.len() as u64;
        self.range_del_block.add(key, value);
        Ok(())
    }

    // ---- range keys ----

    fn add_range_key_span(&mut self, span: Span) -> Result<()> {
        if self.cmp.compare(&span.start, &span.end) != std::cmp::Ordering::Less {
            return Err(errkeyorder!("start key must be strictly less than end key"));
        }
        if let Some(pending_start) = self.fragmenter.start() {
            if self.cmp.compare(pending_start, &span.start) == std::cmp::Ordering::Greater {
                return Err(self.latch(errkeyorder!(
                    "spans must be added in order of start key"
                )));
            }
        }
        let mut emitted = Vec::new();
        let result = self.fragmenter.add(span, &mut |s| {
            emitted.push(s);
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.latch(err));
        }
        for span in emitted {
            self.encode_range_key_span(span)?;
        }
        Ok(())
    }

    fn encode_range_key_span(&mut self, mut span: Span) -> Result<()> {
        // Sort the keys by suffix within the coalesced span.
        let cmp = self.cmp.clone();
        span.keys
            .sort_by(|a, b| cmp.compare(&a.suffix, &b.suffix));

        let mut entries = Vec::new();
        rangekey::encode_span(&span, &mut |key, value| {
            entries.push((key, value));
            Ok(())
        })?;
        for (key, value) in entries {
            self.add_range_key_inner(&key, &value)?;
        }
        Ok(())
    }

    fn add_range_key_inner(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if self.range_key_block.n_entries() > 0 {
            let prev_start = self.range_key_block.cur_key();
            // The previous entry was validated when added, so a decode
            // failure here is unreachable short of memory corruption.
            let decoded_prev =
                rangekey::decode_end_key(prev_start.kind(), self.range_key_block.cur_value())
                    .map(|end| end.to_vec());
            let prev_end = match decoded_prev {
                Ok(end) => end,
                Err(err) => return Err(self.latch(err)),
            };
            let decoded_cur = rangekey::decode_end_key(key.kind(), value).map(|end| end.to_vec());
            let cur_end = match decoded_cur {
                Ok(end) => end,
                Err(err) => return Err(self.latch(err)),
            };

            if internal_compare(&*self.cmp, &prev_start, key) != std::cmp::Ordering::Less {
                return Err(self.latch(errkeyorder!(
                    "range key starts must be added in increasing order: {}, {}",
                    prev_start.pretty(),
                    key.pretty()
                )));
            }

            if self.cmp.compare(&prev_start.user_key, &key.user_key) == std::cmp::Ordering::Equal {
                // Aligned spans must share bounds.
                if self.cmp.compare(&prev_end, &cur_end) != std::cmp::Ordering::Equal {
                    let err = errfragment!(
                        "overlapping range keys must be fragmented: {}, {}",
                        prev_start.pretty(),
                        key.pretty()
                    );
                    return Err(self.latch(err));
                }
            } else if self.cmp.compare(&prev_end, &key.user_key) == std::cmp::Ordering::Greater {
                // Distinct starts must not overlap; a shared boundary is
                // fine because end keys are exclusive.
                let err = errfragment!(
                    "overlapping range keys must be fragmented: {}, {}",
                    prev_start.pretty(),
                    key.pretty()
                );
                return Err(self.latch(err));
            }
        } else {
            // Validate the first entry's end key too.
            if let Err(err) = rangekey::decode_end_key(key.kind(), value) {
                return Err(self.latch(err));
            }
        }

        self.meta.update_seq_num(key.seq_num());

        if self.props.num_range_keys() == 0 {
            self.meta.smallest_range_key = Some(key.clone());
        }

        self.props.raw_range_key_key_size += key.size() as u64;
        self.props.raw_range_key_value_size += value.len() as u64;
        match key.kind() {
            KeyKind::RangeKeyDelete => self.props.num_range_key_dels += 1,
            KeyKind::RangeKeySet => self.props.num_range_key_sets += 1,
            KeyKind::RangeKeyUnset => self.props.num_range_key_unsets += 1,
            kind => {
                return Err(self.latch(Error::KindMisroute(format!(
                    "invalid range key kind {kind}"
                ))));
            }
        }

        for collector in &mut self.collectors {
            if let Err(err) = collector.add(key, value) {
                return Err(self.latch(err));
            }
        }

        self.range_key_block.add(key, value);
        Ok(())
    }

    // ---- flushing ----

    fn maybe_flush(&mut self, key: &InternalKey, value_len: usize) -> Result<()> {
        if !self.data_block_buf.should_flush(
            key,
            value_len,
            self.data_block_options,
            &self.allocator_size_classes,
        ) {
            return Ok(());
        }
        self.flush(key)
    }

    /// Cuts the current data block and hands it to the write queue, together
    /// with everything the consumer needs for the index entry.
    fn flush(&mut self, next_key: &InternalKey) -> Result<()> {
        self.finish_data_block_props()?;
        self.data_block_buf.compress_and_checksum(self.compression);
        let compressed_len = self
            .data_block_buf
            .physical
            .as_ref()
            .map_or(0, |p| p.data().len());
        self.size_estimates.data_block_compressed(compressed_len, 0);

        let prev_key = self.data_block_buf.block.cur_key();
        let sep = prev_key.separator(&*self.cmp, &next_key.user_key);

        // The index-flush decision is made here on the producer, because
        // collector calls must stay on this side; the queue consumer only
        // finishes the partition.
        let should_flush_index = self.table_format.supports_two_level_index()
            && self.index_block.should_flush(
                &sep,
                ENCODED_BHP_ESTIMATED_SIZE,
                self.index_block_options,
                &self.allocator_size_classes,
            );
        let mut flushable_index_block = None;
        let mut finished_index_props = Vec::new();
        if should_flush_index {
            flushable_index_block = Some(std::mem::replace(
                &mut self.index_block,
                new_index_buf(&self.index_buf_pool, self.parallelism),
            ));
            finished_index_props = self.finish_index_block_props()?;
        }

        self.add_prev_data_block_to_index_block_props();

        let index_inflight_size = sep.size() + ENCODED_BHP_ESTIMATED_SIZE;
        self.index_block.add_inflight(index_inflight_size);

        let next_buf = self
            .data_buf_pool
            .get()
            .unwrap_or_else(|| DataBlockBuf::new(self.restart_interval, self.checksum_type));
        let buf = std::mem::replace(&mut self.data_block_buf, next_buf);
        let task = WriteTask {
            buf,
            index_sep: sep,
            index_inflight_size,
            curr_index_block: self.index_block.clone(),
            flushable_index_block,
            finished_index_props,
        };

        if self.parallelism {
            self.queue.add(task);
            Ok(())
        } else {
            self.queue.add_sync(task)
        }
    }

    fn finish_data_block_props(&mut self) -> Result<()> {
        if !self.has_collectors() {
            return Ok(());
        }
        let encoder = &mut self.data_block_buf.props_encoder;
        encoder.reset_props();
        for (i, collector) in self.collectors.iter_mut().enumerate() {
            let mut scratch = encoder.scratch_for_prop();
            collector.finish_data_block(&mut scratch)?;
            encoder.add_prop(i as u8, scratch);
        }
        if self.table_format >= TableFormat::V4 {
            let mut scratch = encoder.scratch_for_prop();
            self.obsolete_collector.finish_data_block(&mut scratch)?;
            encoder.add_prop(self.collectors.len() as u8, scratch);
        }
        self.data_block_buf.props = encoder.props();
        Ok(())
    }

    fn finish_index_block_props(&mut self) -> Result<Vec<u8>> {
        if !self.has_collectors() {
            return Ok(Vec::new());
        }
        self.props_encoder.reset_props();
        for (i, collector) in self.collectors.iter_mut().enumerate() {
            let mut scratch = self.props_encoder.scratch_for_prop();
            collector.finish_index_block(&mut scratch)?;
            self.props_encoder.add_prop(i as u8, scratch);
        }
        if self.table_format >= TableFormat::V4 {
            let mut scratch = self.props_encoder.scratch_for_prop();
            self.obsolete_collector.finish_index_block(&mut scratch)?;
            self.props_encoder
                .add_prop(self.collectors.len() as u8, scratch);
        }
        Ok(self.props_encoder.props())
    }

    fn add_prev_data_block_to_index_block_props(&mut self) {
        for collector in &mut self.collectors {
            collector.add_prev_data_block_to_index_block();
        }
        if self.table_format >= TableFormat::V4 {
            self.obsolete_collector.add_prev_data_block_to_index_block();
        }
    }

    /// Writes a block synchronously from the producer side; the close path.
    fn write_block(&mut self, block: Vec<u8>, compression: Compression) -> Result<BlockHandle> {
        let physical = self.block_buf.compress_and_checksum(block, compression);
        let mut core = self.lock_core();
        let offset = core.file_size;
        if let Some(cache) = &self.cache {
            cache.invalidate(self.file_num, offset);
        }
        core.write_raw(physical.data())?;
        core.write_raw(physical.trailer())?;
        Ok(BlockHandle {
            offset,
            length: physical.data().len() as u64,
        })
    }

    /// Adds an index entry synchronously; only used once the queue has
    /// drained at close.
    fn add_index_entry_sep_sync(
        &mut self,
        sep: InternalKey,
        bhp: BlockHandleWithProperties,
    ) -> Result<()> {
        let should_flush_index = self.table_format.supports_two_level_index()
            && self.index_block.should_flush(
                &sep,
                ENCODED_BHP_ESTIMATED_SIZE,
                self.index_block_options,
                &self.allocator_size_classes,
            );
        let mut flushable = None;
        let mut props = Vec::new();
        if should_flush_index {
            flushable = Some(std::mem::replace(
                &mut self.index_block,
                new_index_buf(&self.index_buf_pool, self.parallelism),
            ));
            props = self.finish_index_block_props()?;
        }

        // A valid block handle has a non-zero length.
        if bhp.handle.length > 0 {
            if let Some(flushable) = flushable.take() {
                let mut core = self.lock_core();
                core.two_level_index = true;
                core.index_partitions.push(IndexPartition {
                    n_entries: flushable.n_entries(),
                    sep: flushable.cur_key(),
                    properties: props,
                    block: flushable.finish(),
                });
                drop(core);
                recycle_index_buf(flushable, &self.index_buf_pool);
            }
            self.index_block.add(&sep, &bhp.encoded(), 0);
        }
        self.add_prev_data_block_to_index_block_props();
        Ok(())
    }

    fn write_two_level_index(&mut self) -> Result<BlockHandle> {
        let props = self.finish_index_block_props()?;
        // Close the final, unfinished partition.
        {
            let partition = IndexPartition {
                n_entries: self.index_block.n_entries(),
                sep: self.index_block.cur_key(),
                properties: props,
                block: self.index_block.finish(),
            };
            self.lock_core().index_partitions.push(partition);
        }

        let partitions = std::mem::take(&mut self.lock_core().index_partitions);
        for partition in partitions.iter() {
            self.props.num_data_blocks += partition.n_entries as u64;
            self.props.index_size += partition.block.len() as u64;
            let handle = self.write_block(partition.block.clone(), self.compression)?;
            let bhp = BlockHandleWithProperties {
                handle,
                props: partition.properties.clone(),
            };
            self.top_level_index_block.add(&partition.sep, &bhp.encoded());
        }

        self.props.index_partitions = partitions.len() as u64;
        self.props.top_level_index_size = self.top_level_index_block.estimated_size() as u64;
        self.props.index_size += self.props.top_level_index_size + BLOCK_TRAILER_LEN as u64;
        self.props.index_type = TWO_LEVEL_INDEX;

        let top = self.top_level_index_block.finish();
        self.write_block(top, self.compression)
    }

    fn finish_fragmenter(&mut self) -> Result<()> {
        let mut emitted = Vec::new();
        let result = self.fragmenter.finish(&mut |s| {
            emitted.push(s);
            Ok(())
        });
        if let Err(err) = result {
            return Err(self.latch(err));
        }
        for span in emitted {
            self.encode_range_key_span(span)?;
        }
        Ok(())
    }

    fn assert_format_compatibility(&self) -> Result<()> {
        if !self.collectors.is_empty() {
            self.table_format
                .gate(TableFormat::V1, "block properties")?;
        }
        if self.props.num_range_keys() > 0 {
            self.table_format.gate(TableFormat::V2, "range keys")?;
        }
        if self.props.num_value_blocks > 0
            || self.props.num_values_in_value_blocks > 0
            || self.props.value_blocks_size > 0
        {
            self.table_format.gate(TableFormat::V3, "value blocks")?;
        }
        if self.has_set_with_delete {
            self.table_format
                .gate(TableFormat::V3, "SetWithDelete keys")?;
        }
        if self.props.num_sized_deletions > 0 {
            self.table_format
                .gate(TableFormat::V4, "sized deletion tombstones")?;
        }
        Ok(())
    }

    /// Finishes the table: drains the queue, writes the trailing data block,
    /// filter, index, range blocks, value blocks, properties, metaindex, and
    /// footer, then finishes the sink. On error the sink is aborted instead.
    pub fn close(&mut self) -> Result<()> {
        let result = self.close_inner();
        self.value_block_writer = None;
        if let Err(err) = &result {
            let mut core = self.lock_core();
            if let Some(mut writable) = core.writable.take() {
                writable.abort();
            }
            drop(core);
            if self.err.is_none() {
                self.err = Some(err.clone());
            }
        }
        result
    }

    fn close_inner(&mut self) -> Result<()> {
        // Drain before checking the latch: an error can surface from any
        // queued task.
        let queue_result = self.queue.finish();
        self.check_latched()?;
        queue_result?;

        // The current data block always holds the latest point key, because
        // a flush is immediately followed by an add into the fresh block.
        if self.data_block_buf.block.n_entries() >= 1 {
            self.meta.largest_point = Some(self.data_block_buf.block.cur_key());
        }

        // Finish the last data block, or force an empty one so the table
        // always has a data section.
        if self.data_block_buf.block.n_entries() > 0 || self.index_block.n_entries() == 0 {
            self.finish_data_block_props()?;
            let prev_key = self.data_block_buf.block.cur_key();
            let block = self.data_block_buf.block.finish();
            let handle = self.write_block(block, self.compression)?;
            let bhp = BlockHandleWithProperties {
                handle,
                props: std::mem::take(&mut self.data_block_buf.props),
            };
            let sep = prev_key.successor(&*self.cmp);
            self.add_index_entry_sep_sync(sep, bhp)?;
        }
        let file_size = self.lock_core().file_size;
        self.props.data_size = file_size;

        let mut metaindex_entries: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        // Filter block.
        if let Some(mut filter) = self.filter.take() {
            let block = filter.finish();
            let handle = self.write_block(block, Compression::None)?;
            self.props.filter_policy_name = filter.policy_name().to_string();
            self.props.filter_size = handle.length;
            metaindex_entries.insert(filter.meta_name().into_bytes(), handle.encoded());
        }

        // Index: two-level once any partition was cut, single block
        // otherwise.
        let index_handle = if self.lock_core().two_level_index {
            self.write_two_level_index()?
        } else {
            self.props.index_type = BINARY_SEARCH_INDEX;
            self.props.index_size =
                self.index_block.estimated_size() + BLOCK_TRAILER_LEN as u64;
            self.props.num_data_blocks = self.index_block.n_entries() as u64;
            let block = self.index_block.finish();
            self.write_block(block, self.compression)?
        };

        // Range-del block. Fragmented input means the last tombstone's end
        // key is the largest; table bounds are inclusive, so it becomes an
        // exclusive sentinel.
        if self.props.num_range_deletions > 0 {
            let end = self.range_del_block.cur_value().to_vec();
            self.meta.largest_range_del =
                Some(InternalKey::exclusive_sentinel(end, KeyKind::RangeDelete));
            let block = self.range_del_block.finish();
            let handle = self.write_block(block, Compression::None)?;
            metaindex_entries.insert(META_RANGE_DEL_NAME.into(), handle.encoded());
            metaindex_entries.insert(META_RANGE_DEL_V2_NAME.into(), handle.encoded());
        }

        // Range-key block, flushing the fragmenter first.
        self.finish_fragmenter()?;
        if self.props.num_range_keys() > 0 {
            let last = self.range_key_block.cur_key();
            let end = rangekey::decode_end_key(last.kind(), self.range_key_block.cur_value())?
                .to_vec();
            self.meta.largest_range_key =
                Some(InternalKey::exclusive_sentinel(end, last.kind()));
            // Like the range-del block, never compressed.
            let block = self.range_key_block.finish();
            let handle = self.write_block(block, Compression::None)?;
            metaindex_entries.insert(META_RANGE_KEY_NAME.into(), handle.encoded());
        }

        // Value blocks and their index.
        if let Some(mut vbw) = self.value_block_writer.take() {
            let file_offset = self.lock_core().file_size;
            let finished = vbw.finish(file_offset);
            self.props.num_value_blocks = finished.stats.num_value_blocks;
            self.props.num_values_in_value_blocks = finished.stats.num_values_in_value_blocks;
            self.props.value_blocks_size = finished.stats.value_blocks_and_index_size;
            if let Some(index_handle) = finished.index_handle {
                if let Some(cache) = &self.cache {
                    for offset in &finished.block_offsets {
                        cache.invalidate(self.file_num, *offset);
                    }
                }
                self.lock_core().write_raw(&finished.bytes)?;
                metaindex_entries.insert(META_VALUE_INDEX_NAME.into(), index_handle.encoded());
            }
        }

        // Table-scope collector properties.
        if self.props.user_properties.is_empty() {
            for (i, collector) in self.collectors.iter_mut().enumerate() {
                // The short ID leads so readers can map names to in-block
                // property IDs.
                let mut buf = vec![i as u8];
                collector.finish_table(&mut buf)?;
                self.props
                    .user_properties
                    .insert(collector.name().to_string(), buf);
            }
            if self.table_format >= TableFormat::V4 {
                let mut buf = vec![self.collectors.len() as u8];
                self.obsolete_collector.finish_table(&mut buf)?;
                self.props
                    .user_properties
                    .insert(ObsoleteKeyBlockCollector::NAME.to_string(), buf);
            }
        }

        // Properties block.
        {
            let mut raw = RawBlockWriter::new(PROPERTIES_BLOCK_RESTART_INTERVAL);
            self.props.save(&mut raw);
            let handle = self.write_block(raw.finish(), Compression::None)?;
            metaindex_entries.insert(META_PROPERTIES_NAME.into(), handle.encoded());
        }

        // Metaindex; entries iterate in sorted key order, never compressed.
        let mut metaindex = RawBlockWriter::new(1);
        for (key, value) in &metaindex_entries {
            metaindex.add(key, value);
        }
        let metaindex_handle = self.write_block(metaindex.finish(), Compression::None)?;

        // Footer.
        let footer = Footer {
            format: self.table_format,
            checksum: self.checksum_type,
            metaindex_handle,
            index_handle,
        }
        .encode();
        {
            let mut core = self.lock_core();
            core.write_raw(&footer)?;
            let file_size = core.file_size;
            drop(core);
            self.meta.size = file_size;
        }
        self.meta.properties = self.props.clone();

        self.assert_format_compatibility()?;

        {
            let mut core = self.lock_core();
            let mut writable = core.writable.take().ok_or(Error::WriterClosed)?;
            writable.finish()?;
        }

        tracing::debug!(
            size = self.meta.size,
            entries = self.props.num_entries,
            data_blocks = self.props.num_data_blocks,
            index_partitions = self.props.index_partitions,
            range_deletions = self.props.num_range_deletions,
            range_keys = self.props.num_range_keys(),
            "finished sstable"
        );

        // Recycle the producer-side buffers.
        self.data_block_buf.clear();
        let recycled =
            std::mem::replace(&mut self.data_block_buf, DataBlockBuf::new(1, self.checksum_type));
        self.data_buf_pool.put(recycled);
        let index_block = std::mem::replace(
            &mut self.index_block,
            new_index_buf(&self.index_buf_pool, false),
        );
        recycle_index_buf(index_block, &self.index_buf_pool);

        self.closed = true;
        self.err = Some(Error::WriterClosed);
        Ok(())
    }
}
