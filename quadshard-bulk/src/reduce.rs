//! Reduce phase: merge each shard's spill runs into posting-list KVs.
//!
//! One reducer per reduce shard. The reducer thread drives the k-way merge
//! and ships fixed-size batches to an encoder thread over a bounded channel;
//! the encoder groups successive entries with equal key into a posting list,
//! encodes it (splitting oversized lists across continuation keys), and
//! writes ordered KV batches into the shard's table sink. A count-indexer
//! thread observes every completed group's length and appends its KVs before
//! the sink closes.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use tracing::info;

use crate::count_index::{count_entries, run_count_indexer, CountEvent};
use crate::error::{BulkError, Result};
use crate::key::{parse_key, split_key};
use crate::loader::LoaderState;
use crate::merge::KWayMerge;
use crate::posting::{decode_uids, encode_uids, PostingList, UidBlock, BLOCK_SIZE, MAX_LIST_SIZE};
use crate::schema::ValueType;
use crate::shuffle::{filenames_in_tree, read_shard_dirs, REDUCE_SHARD_DIR};
use crate::spill::SpillReader;
use crate::stream::{tag_stream_ids, Kv, KvList, SegmentWriter, TableSink, COMPLETE_POSTING};
use crate::throttle::Throttle;
use crate::wire::{MapEntry, Posting};

/// Entries per merge batch.
pub const BATCH_SIZE: usize = 10_000;
/// Batch capacity: 10% slack over the ship threshold.
const BATCH_ALLOC: usize = BATCH_SIZE * 11 / 10;
/// Accumulated KV bytes that trigger a write to the sink.
pub const PENDING_LIST_BYTES: usize = 4 << 20;

const ENTRY_CHANNEL_CAP: usize = 100;
const COUNT_CHANNEL_CAP: usize = 1 << 10;

/// Run every reduce shard to completion.
pub fn run_reduce(state: &Arc<LoaderState>) -> Result<()> {
    let reduce_root = state.opt.tmp_dir.join(REDUCE_SHARD_DIR);
    let dirs = read_shard_dirs(&reduce_root)?;
    if dirs.len() != state.opt.reduce_shards {
        return Err(BulkError::Config(format!(
            "expected {} reduce shard directories under {}, found {}",
            state.opt.reduce_shards,
            reduce_root.display(),
            dirs.len()
        )));
    }

    let throttle = Throttle::new(state.opt.reduce_shards.min(state.opt.num_go_routines));
    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            throttle.acquire();
            let throttle = &throttle;
            let out_dir = state.opt.out_dir.join(dir.file_name().unwrap());
            handles.push(scope.spawn(move || {
                let result = reduce_shard(state, dir, &out_dir);
                throttle.release();
                result
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| BulkError::Io(std::io::Error::other("reducer thread panicked")))??;
        }
        Ok(())
    })
}

fn reduce_shard(state: &Arc<LoaderState>, shard_dir: &Path, out_dir: &Path) -> Result<()> {
    let files = filenames_in_tree(shard_dir)?;
    let mut readers = Vec::with_capacity(files.len());
    for file in &files {
        readers.push(SpillReader::open(file)?);
    }
    info!(
        shard = %shard_dir.display(),
        spill_files = readers.len(),
        "reducing shard"
    );

    let sink = SegmentWriter::new(out_dir)?;
    let (batch_tx, batch_rx) = sync_channel::<Vec<MapEntry>>(ENTRY_CHANNEL_CAP);
    let (count_tx, count_rx) = sync_channel::<CountEvent>(COUNT_CHANNEL_CAP);

    std::thread::scope(|scope| -> Result<()> {
        let encoder = scope.spawn(move || encode_and_write(batch_rx, sink, state));
        let counter = scope.spawn(move || run_count_indexer(count_rx));

        let merge_result = merge_spills(readers, &batch_tx, &count_tx);
        drop(batch_tx);
        drop(count_tx);

        let encoder_result = encoder
            .join()
            .map_err(|_| BulkError::Io(std::io::Error::other("encoder thread panicked")))?;
        let counter_result = counter
            .join()
            .map_err(|_| BulkError::Io(std::io::Error::other("count indexer panicked")))?;

        let mut sink = encoder_result?;
        let counts = counter_result?;
        merge_result?;

        let count_kvs = count_entries(counts, &state.registry, state.write_ts)?;
        if !count_kvs.is_empty() {
            sink.write(count_kvs)?;
        }
        sink.flush()
    })
}

/// Drive the k-way merge, batching entries for the encoder and publishing
/// group sizes to the count indexer on every key change.
fn merge_spills(
    readers: Vec<SpillReader>,
    batch_tx: &SyncSender<Vec<MapEntry>>,
    count_tx: &SyncSender<CountEvent>,
) -> Result<()> {
    let gone = |who: &str| BulkError::Io(std::io::Error::other(format!("{who} terminated early")));

    let mut merger = KWayMerge::new(readers)?;
    let mut batch: Vec<MapEntry> = Vec::with_capacity(BATCH_ALLOC);
    let mut prev_key: Vec<u8> = Vec::new();
    let mut group_len = 0usize;

    while let Some(entry) = merger.next_entry()? {
        let key_changed = entry.key != prev_key;
        // Keys arrive sorted, so a key change closes the previous group;
        // its size must reach the count indexer before the new key starts
        // accumulating.
        if key_changed && group_len > 0 {
            count_tx
                .send(CountEvent {
                    key: std::mem::take(&mut prev_key),
                    count: group_len,
                })
                .map_err(|_| gone("count indexer"))?;
            group_len = 0;
        }

        // Ship on batch full without waiting for a key change: a hot key can
        // keep the key from changing for a long time, and the batch would
        // grow without bound.
        if batch.len() >= BATCH_SIZE {
            batch_tx
                .send(std::mem::replace(
                    &mut batch,
                    Vec::with_capacity(BATCH_ALLOC),
                ))
                .map_err(|_| gone("encoder"))?;
        }

        if key_changed {
            prev_key.clear();
            prev_key.extend_from_slice(&entry.key);
        }
        group_len += 1;
        batch.push(entry);
    }

    if !batch.is_empty() {
        batch_tx.send(batch).map_err(|_| gone("encoder"))?;
    }
    if group_len > 0 {
        count_tx
            .send(CountEvent {
                key: prev_key,
                count: group_len,
            })
            .map_err(|_| gone("count indexer"))?;
    }
    Ok(())
}

/// Posting-list builder state carried across batches: a batch boundary
/// rarely coincides with a key boundary.
#[derive(Default)]
struct KvBuilder {
    current_key: Vec<u8>,
    /// Strictly increasing: adjacent duplicates are skipped on append.
    uids: Vec<u64>,
    postings: Vec<Posting>,
}

fn encode_and_write(
    rx: Receiver<Vec<MapEntry>>,
    mut sink: SegmentWriter,
    state: &LoaderState,
) -> Result<SegmentWriter> {
    let mut kvb = KvBuilder::default();
    let mut pending: KvList = Vec::new();
    let mut pending_size = 0usize;

    for batch in rx.iter() {
        pending_size += to_list(&batch, &mut pending, &mut kvb, state)?;
        if pending_size > PENDING_LIST_BYTES {
            tag_stream_ids(&mut pending, &state.registry)?;
            sink.write(std::mem::take(&mut pending))?;
            pending_size = 0;
        }
    }

    // End of stream: close out the final group.
    append_to_list(&mut kvb, &mut pending, state)?;
    if !pending.is_empty() {
        tag_stream_ids(&mut pending, &state.registry)?;
        sink.write(pending)?;
    }
    Ok(sink)
}

/// Fold a batch of sorted entries into the builder, emitting one KV (or a
/// split family) per completed key. Returns the encoded bytes appended to
/// `out`.
fn to_list(
    entries: &[MapEntry],
    out: &mut KvList,
    kvb: &mut KvBuilder,
    state: &LoaderState,
) -> Result<usize> {
    let mut size = 0usize;
    for entry in entries {
        state.prog.reduce_edge_count.fetch_add(1, Ordering::Relaxed);

        if entry.key != kvb.current_key {
            if !kvb.current_key.is_empty() {
                size += append_to_list(kvb, out, state)?;
            }
            kvb.current_key.clear();
            kvb.current_key.extend_from_slice(&entry.key);
        }

        let uid = entry.sort_uid();
        if kvb.uids.last() == Some(&uid) {
            // Adjacent duplicate of the same (key, uid): collapse.
            continue;
        }
        kvb.uids.push(uid);
        if let Some(posting) = &entry.posting {
            kvb.postings.push(posting.clone());
        }
    }
    Ok(size)
}

/// Seal the current group: encode its posting list, split it when oversized,
/// and reset the builder.
fn append_to_list(kvb: &mut KvBuilder, out: &mut KvList, state: &LoaderState) -> Result<usize> {
    if kvb.uids.is_empty() {
        kvb.postings.clear();
        return Ok(0);
    }
    state.prog.reduce_key_count.fetch_add(1, Ordering::Relaxed);

    let parsed = parse_key(&kvb.current_key)?;
    if parsed.is_data() && kvb.uids.len() > 1 {
        // A uid predicate declared non-list cannot hold multiple objects
        // without losing data; upgrade it and tell the user to fix their
        // declarations once the cluster is up.
        if let Some(schema) = state.schema.get(&parsed.predicate) {
            if schema.value_type == ValueType::Uid && !schema.list {
                info!(
                    "Schema for pred {} is not a list but more than one uid found; \
                     forcing the schema to be a list to avoid data loss",
                    parsed.predicate
                );
                state.schema.set_as_list(&parsed.predicate);
            }
        }
    }

    let list = PostingList {
        pack: encode_uids(&kvb.uids, BLOCK_SIZE),
        postings: std::mem::take(&mut kvb.postings),
    };
    let encoded = list.encode();

    let mut size = 0usize;
    if encoded.len() > MAX_LIST_SIZE && list.pack.blocks.len() > 1 {
        for kv in split_list(&kvb.current_key, &list, state.write_ts) {
            size += kv.size();
            out.push(kv);
        }
    } else {
        let kv = Kv {
            key: kvb.current_key.clone(),
            value: encoded,
            user_meta: COMPLETE_POSTING,
            version: state.write_ts,
            stream_id: 0,
        };
        size += kv.size();
        out.push(kv);
    }

    kvb.uids.clear();
    Ok(size)
}

/// Split an oversized posting list into fragments of whole blocks, each
/// encoding below [`MAX_LIST_SIZE`]. The first fragment keeps the original
/// key; continuations extend it with the fragment's start uid.
fn split_list(key: &[u8], list: &PostingList, write_ts: u64) -> KvList {
    let mut groups: Vec<Vec<UidBlock>> = Vec::new();
    let mut current: Vec<UidBlock> = Vec::new();
    let mut current_size = 0usize;
    for block in &list.pack.blocks {
        let block_size = block.wire_len();
        // Envelope: the block-count and posting-count varints of the
        // fragment's own encoding.
        let envelope = crate::wire::uvarint_len(current.len() as u64 + 1) + 1;
        if !current.is_empty() && envelope + current_size + block_size > MAX_LIST_SIZE {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += block_size;
        current.push(block.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }

    // Rich postings travel with the fragment covering their uid. Both the
    // posting sequence and the fragments are uid-ordered, so one forward
    // pointer suffices.
    let mut kvs = Vec::with_capacity(groups.len());
    let mut posting_idx = 0usize;
    for (i, blocks) in groups.iter().enumerate() {
        let start_uid = blocks[0].base;
        let next_start = groups.get(i + 1).map(|g| g[0].base);
        let mut postings = Vec::new();
        while posting_idx < list.postings.len() {
            let posting = &list.postings[posting_idx];
            if next_start.is_some_and(|next| posting.uid >= next) {
                break;
            }
            postings.push(posting.clone());
            posting_idx += 1;
        }

        let fragment = PostingList {
            pack: crate::posting::UidPack {
                blocks: blocks.clone(),
            },
            postings,
        };
        let frag_key = if i == 0 {
            key.to_vec()
        } else {
            split_key(key, start_uid)
        };
        kvs.push(Kv {
            key: frag_key,
            value: fragment.encode(),
            user_meta: COMPLETE_POSTING,
            version: write_ts,
            stream_id: 0,
        });
    }
    kvs
}

/// Reassemble the uid list from a split family, for verification.
pub fn concat_split_uids(kvs: &[Kv]) -> Result<Vec<u64>> {
    let mut uids = Vec::new();
    for kv in kvs {
        let list = PostingList::decode(&kv.value)?;
        uids.extend(decode_uids(&list.pack)?);
    }
    Ok(uids)
}
