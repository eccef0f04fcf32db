//! Count index: (predicate, posting-list size) → the subjects with that
//! many objects.
//!
//! The merger publishes every completed key group's length; the indexer runs
//! as its own thread, accumulates the mapping, and at shutdown turns it into
//! count-key KVs that are written through the same sink before the table
//! writer closes.

use std::sync::mpsc::Receiver;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::key::{count_key, parse_key};
use crate::posting::{encode_uids, PostingList, BLOCK_SIZE};
use crate::stream::{Kv, KvList, StreamRegistry, COMPLETE_POSTING};

/// One completed key group: the group's key and how many entries it held.
#[derive(Debug, Clone)]
pub struct CountEvent {
    pub key: Vec<u8>,
    pub count: usize,
}

pub type CountMap = FxHashMap<(String, u32), Vec<u64>>;

/// Drain group-size events until the channel closes.
pub fn run_count_indexer(rx: Receiver<CountEvent>) -> Result<CountMap> {
    let mut counts = CountMap::default();
    for event in rx.iter() {
        let parsed = parse_key(&event.key)?;
        // Split continuations never form groups; only data keys count.
        if !parsed.is_data() || parsed.has_start_uid() {
            continue;
        }
        counts
            .entry((parsed.predicate, event.count as u32))
            .or_default()
            .push(parsed.uid);
    }
    Ok(counts)
}

/// Turn the accumulated mapping into sorted count-index KVs.
pub fn count_entries(counts: CountMap, registry: &StreamRegistry, write_ts: u64) -> Result<KvList> {
    let mut kvs = Vec::with_capacity(counts.len());
    for ((predicate, count), mut subjects) in counts {
        subjects.sort_unstable();
        subjects.dedup();
        let list = PostingList {
            pack: encode_uids(&subjects, BLOCK_SIZE),
            postings: Vec::new(),
        };
        kvs.push(Kv {
            key: count_key(&predicate, count),
            value: list.encode(),
            user_meta: COMPLETE_POSTING,
            version: write_ts,
            stream_id: registry.stream_id_for(&predicate),
        });
    }
    kvs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(kvs)
}
