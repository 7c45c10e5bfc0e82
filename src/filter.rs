//! Filter block construction.
//!
//! The filter policy itself (bloom bit math) is injected; this module only
//! feeds it prefixes and packages its output as a table-scoped filter block.

use std::sync::Arc;

/// An injected filter implementation, e.g. a bloom filter.
pub trait FilterPolicy: Send + Sync {
    /// Name persisted in the metaindex key and the properties block.
    fn name(&self) -> &'static str;

    /// Appends to `dst` a filter covering `keys`.
    fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>);

    /// Queries a filter produced by `create_filter`. False positives are
    /// allowed; false negatives are not.
    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool;
}

/// Accumulates key prefixes for a single table-scoped filter block.
pub struct TableFilterWriter {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
}

impl TableFilterWriter {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
        }
    }

    /// Adds a key prefix. The writer passes the output of the comparer's
    /// split, so a prefix extractor sees prefixes and a whole-key policy
    /// sees full user keys.
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Produces the filter block contents.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut block = Vec::new();
        self.policy.create_filter(&self.keys, &mut block);
        self.keys.clear();
        block
    }

    /// Metaindex key for the filter block.
    pub fn meta_name(&self) -> String {
        format!("fullfilter.{}", self.policy.name())
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::ExactFilterPolicy;
    use super::*;

    #[test]
    fn filter_writer_roundtrip() {
        let policy = Arc::new(ExactFilterPolicy);
        let mut fw = TableFilterWriter::new(policy.clone());
        fw.add_key(b"apple");
        fw.add_key(b"banana");
        let block = fw.finish();

        assert!(policy.may_contain(&block, b"apple"));
        assert!(policy.may_contain(&block, b"banana"));
        assert!(!policy.may_contain(&block, b"cherry"));
        assert_eq!(fw.meta_name(), "fullfilter.kiln.test.ExactFilter");
    }
}
