use std::collections::BTreeMap;

use crate::encoding::put_varint64;
use crate::sstable::block::RawBlockWriter;

/// Index-type values persisted in the properties block.
pub const BINARY_SEARCH_INDEX: u64 = 0;
pub const TWO_LEVEL_INDEX: u64 = 2;

/// The properties block is read sequentially and kept in one object, so
/// restart points would only waste space.
pub const PROPERTIES_BLOCK_RESTART_INTERVAL: usize = u32::MAX as usize;

/// Table-scope statistics accumulated while writing and serialised into the
/// properties block at close.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_sized_deletions: u64,
    pub num_merge_operands: u64,
    pub num_range_deletions: u64,
    pub num_range_key_dels: u64,
    pub num_range_key_sets: u64,
    pub num_range_key_unsets: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    pub raw_point_tombstone_key_size: u64,
    pub raw_point_tombstone_value_size: u64,
    pub raw_range_key_key_size: u64,
    pub raw_range_key_value_size: u64,
    pub data_size: u64,
    pub index_size: u64,
    pub index_partitions: u64,
    pub top_level_index_size: u64,
    pub index_type: u64,
    pub num_data_blocks: u64,
    pub num_value_blocks: u64,
    pub num_values_in_value_blocks: u64,
    pub value_blocks_size: u64,
    pub filter_size: u64,
    pub filter_policy_name: String,
    pub comparer_name: String,
    pub compression_name: String,
    pub merger_name: String,
    pub property_collector_names: String,
    pub user_properties: BTreeMap<String, Vec<u8>>,
}

impl Properties {
    pub fn num_range_keys(&self) -> u64 {
        self.num_range_key_dels + self.num_range_key_sets + self.num_range_key_unsets
    }

    /// Serialises all properties, sorted by name, into `block`. Numeric
    /// values are varints; string values raw bytes.
    pub fn save(&self, block: &mut RawBlockWriter) {
        let mut entries: BTreeMap<&str, Vec<u8>> = BTreeMap::new();

        let mut put_num = |entries: &mut BTreeMap<&str, Vec<u8>>, name: &'static str, v: u64| {
            let mut buf = Vec::new();
            put_varint64(&mut buf, v);
            entries.insert(name, buf);
        };

        put_num(&mut entries, "rocksdb.num.entries", self.num_entries);
        put_num(&mut entries, "rocksdb.deleted.keys", self.num_deletions);
        put_num(&mut entries, "rocksdb.merge.operands", self.num_merge_operands);
        put_num(
            &mut entries,
            "rocksdb.num.range-deletions",
            self.num_range_deletions,
        );
        put_num(&mut entries, "rocksdb.raw.key.size", self.raw_key_size);
        put_num(&mut entries, "rocksdb.raw.value.size", self.raw_value_size);
        put_num(&mut entries, "rocksdb.data.size", self.data_size);
        put_num(&mut entries, "rocksdb.index.size", self.index_size);
        put_num(&mut entries, "rocksdb.index.type", self.index_type);
        put_num(&mut entries, "rocksdb.num.data.blocks", self.num_data_blocks);
        put_num(&mut entries, "rocksdb.filter.size", self.filter_size);
        if self.index_partitions != 0 {
            put_num(&mut entries, "rocksdb.index.partitions", self.index_partitions);
            put_num(
                &mut entries,
                "rocksdb.top-level.index.size",
                self.top_level_index_size,
            );
        }
        if self.num_sized_deletions > 0 {
            put_num(
                &mut entries,
                "kiln.num.sized-deletions",
                self.num_sized_deletions,
            );
        }
        if self.num_deletions > 0 {
            put_num(
                &mut entries,
                "kiln.raw.point-tombstone.key.size",
                self.raw_point_tombstone_key_size,
            );
        }
        if self.raw_point_tombstone_value_size > 0 {
            put_num(
                &mut entries,
                "kiln.raw.point-tombstone.value.size",
                self.raw_point_tombstone_value_size,
            );
        }
        if self.num_range_key_sets > 0 {
            put_num(&mut entries, "kiln.num.range-key-sets", self.num_range_key_sets);
        }
        if self.num_range_key_unsets > 0 {
            put_num(
                &mut entries,
                "kiln.num.range-key-unsets",
                self.num_range_key_unsets,
            );
        }
        if self.num_range_key_dels > 0 {
            put_num(&mut entries, "kiln.num.range-key-dels", self.num_range_key_dels);
        }
        if self.num_range_keys() > 0 {
            put_num(
                &mut entries,
                "kiln.raw.range-key.key.size",
                self.raw_range_key_key_size,
            );
            put_num(
                &mut entries,
                "kiln.raw.range-key.value.size",
                self.raw_range_key_value_size,
            );
        }
        if self.num_value_blocks > 0 {
            put_num(&mut entries, "kiln.num.value-blocks", self.num_value_blocks);
            put_num(
                &mut entries,
                "kiln.num.values-in-value-blocks",
                self.num_values_in_value_blocks,
            );
            put_num(&mut entries, "kiln.value-blocks.size", self.value_blocks_size);
        }

        entries.insert("rocksdb.comparator", self.comparer_name.clone().into_bytes());
        entries.insert(
            "rocksdb.compression",
            self.compression_name.clone().into_bytes(),
        );
        if !self.merger_name.is_empty() {
            entries.insert("rocksdb.merge.operator", self.merger_name.clone().into_bytes());
        }
        if !self.filter_policy_name.is_empty() {
            entries.insert(
                "rocksdb.filter.policy",
                self.filter_policy_name.clone().into_bytes(),
            );
        }
        entries.insert(
            "rocksdb.property.collectors",
            self.property_collector_names.clone().into_bytes(),
        );

        let mut all: Vec<(&[u8], Vec<u8>)> = entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes(), v))
            .collect();
        for (name, value) in &self.user_properties {
            all.push((name.as_bytes(), value.clone()));
        }
        all.sort_by(|a, b| a.0.cmp(b.0));

        for (name, value) in all {
            block.add(name, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_emits_sorted_entries() {
        let props = Properties {
            num_entries: 10,
            comparer_name: "kiln.BytewiseComparer".to_string(),
            compression_name: "Snappy".to_string(),
            property_collector_names: "[]".to_string(),
            ..Default::default()
        };
        let mut block = RawBlockWriter::new(PROPERTIES_BLOCK_RESTART_INTERVAL);
        props.save(&mut block);
        assert!(block.n_entries() > 5);
        let bytes = block.finish();
        // RawBlockWriter relies on sorted input for prefix compression; a
        // properties block always fits one restart.
        assert!(!bytes.is_empty());
    }

    #[test]
    fn user_properties_are_included() {
        let mut props = Properties {
            comparer_name: "c".to_string(),
            compression_name: "n".to_string(),
            property_collector_names: "[a]".to_string(),
            ..Default::default()
        };
        props
            .user_properties
            .insert("a.custom".to_string(), b"v".to_vec());
        let mut block = RawBlockWriter::new(PROPERTIES_BLOCK_RESTART_INTERVAL);
        let before = block.n_entries();
        props.save(&mut block);
        assert!(block.n_entries() > before);
    }

    #[test]
    fn range_key_counts_sum() {
        let props = Properties {
            num_range_key_sets: 2,
            num_range_key_unsets: 1,
            num_range_key_dels: 1,
            ..Default::default()
        };
        assert_eq!(props.num_range_keys(), 4);
    }
}
