//! Output KVs, per-predicate stream ids, and the table sink.
//!
//! Every KV leaving the reduce phase is tagged with a stream id derived from
//! its predicate so the downstream table writer can seal one segment per
//! predicate. Registration is lazy and monotonic: a shared-lock read first,
//! then a double-checked insert under the exclusive lock. Split-list
//! continuation keys carry the registered id with the top bit set.
//!
//! The real sealed-table writer is an external component; [`TableSink`] is
//! its seam and [`SegmentWriter`] a file-backed stand-in that enforces the
//! per-stream ordering contract.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{BulkError, Result};
use crate::key::parse_key;
use crate::wire::{put_uvarint, read_uvarint};

/// `user_meta` marker: the value is a complete posting list.
pub const COMPLETE_POSTING: u8 = 0x01;

/// Set on the stream id of split-list continuation keys.
pub const SPLIT_STREAM_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
    pub version: u64,
    pub stream_id: u32,
}

impl Kv {
    /// Rough in-memory size, used for the 4 MiB batch threshold.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + 16
    }
}

pub type KvList = Vec<Kv>;

/// Lazy, monotonically growing predicate → stream id registration.
pub struct StreamRegistry {
    ids: RwLock<FxHashMap<String, u32>>,
    next: AtomicU32,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            ids: RwLock::new(FxHashMap::default()),
            next: AtomicU32::new(0),
        }
    }

    /// The stream id for `predicate`, allocating the next id on first sight.
    /// Ids start at 1; zero means "not yet tagged".
    pub fn stream_id_for(&self, predicate: &str) -> u32 {
        if let Some(&id) = self.ids.read().get(predicate) {
            return id;
        }
        let mut ids = self.ids.write();
        if let Some(&id) = ids.get(predicate) {
            return id;
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        ids.insert(predicate.to_string(), id);
        id
    }
}

/// Stamp every KV in `list` with its predicate's stream id, setting the
/// continuation bit on split keys.
pub fn tag_stream_ids(list: &mut [Kv], registry: &StreamRegistry) -> Result<()> {
    for kv in list {
        let parsed = parse_key(&kv.key)?;
        let mut id = registry.stream_id_for(&parsed.predicate);
        if parsed.has_start_uid() {
            id |= SPLIT_STREAM_BIT;
        }
        kv.stream_id = id;
    }
    Ok(())
}

/// Receives ordered KV batches; one instance per reduce shard.
pub trait TableSink: Send {
    fn write(&mut self, batch: KvList) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// File-backed sink: one length-prefixed segment file per stream id under
/// the shard's output directory. Rejects out-of-order keys within a stream,
/// which is exactly the contract the sealed-table writer depends on.
pub struct SegmentWriter {
    dir: PathBuf,
    segments: FxHashMap<u32, Segment>,
}

struct Segment {
    writer: BufWriter<File>,
    last_key: Vec<u8>,
    kv_count: u64,
}

impl SegmentWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            segments: FxHashMap::default(),
        })
    }

    fn segment(&mut self, stream_id: u32) -> Result<&mut Segment> {
        if !self.segments.contains_key(&stream_id) {
            let path = self.dir.join(format!("{stream_id:08x}.seg"));
            let file = File::create(&path)?;
            self.segments.insert(
                stream_id,
                Segment {
                    writer: BufWriter::new(file),
                    last_key: Vec::new(),
                    kv_count: 0,
                },
            );
        }
        Ok(self.segments.get_mut(&stream_id).unwrap())
    }

    /// Total KVs written across all streams.
    pub fn kv_count(&self) -> u64 {
        self.segments.values().map(|s| s.kv_count).sum()
    }
}

impl TableSink for SegmentWriter {
    fn write(&mut self, batch: KvList) -> Result<()> {
        let mut record = Vec::with_capacity(256);
        for kv in batch {
            if kv.stream_id == 0 {
                return Err(BulkError::Encoding("KV without a stream id".into()));
            }
            let seg = self.segment(kv.stream_id)?;
            if !seg.last_key.is_empty() && kv.key < seg.last_key {
                return Err(BulkError::Encoding(format!(
                    "out-of-order key in stream {:#x}",
                    kv.stream_id
                )));
            }

            record.clear();
            put_uvarint(&mut record, kv.key.len() as u64);
            record.extend_from_slice(&kv.key);
            put_uvarint(&mut record, kv.value.len() as u64);
            record.extend_from_slice(&kv.value);
            record.push(kv.user_meta);
            put_uvarint(&mut record, kv.version);
            seg.writer.write_all(&record)?;

            seg.last_key = kv.key;
            seg.kv_count += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for seg in self.segments.values_mut() {
            seg.writer.flush()?;
            seg.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// Read one segment file back, stream id recovered from the file name.
/// Verification/debug utility; the pipeline itself never reads segments.
pub fn read_segment_file(path: &Path) -> Result<Vec<Kv>> {
    let stream_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| BulkError::Corrupt(format!("bad segment name: {}", path.display())))?;

    let mut reader = BufReader::new(File::open(path)?);
    let corrupt = |what: &str| BulkError::Corrupt(format!("segment record: {what}"));
    let mut kvs = Vec::new();
    loop {
        let key_len = match read_uvarint(&mut reader)? {
            Some(len) => len as usize,
            None => break,
        };
        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;
        let value_len = read_uvarint(&mut reader)?.ok_or_else(|| corrupt("value length"))? as usize;
        let mut value = vec![0u8; value_len];
        reader.read_exact(&mut value)?;
        let mut user_meta = [0u8; 1];
        reader.read_exact(&mut user_meta)?;
        let version = read_uvarint(&mut reader)?.ok_or_else(|| corrupt("version"))?;
        kvs.push(Kv {
            key,
            value,
            user_meta: user_meta[0],
            version,
            stream_id,
        });
    }
    Ok(kvs)
}

/// All KVs in a shard's output directory, ordered per segment.
pub fn read_segments(dir: &Path) -> Result<Vec<Kv>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "seg"))
        .collect();
    paths.sort();
    let mut kvs = Vec::new();
    for path in paths {
        kvs.extend(read_segment_file(&path)?);
    }
    Ok(kvs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{data_key, split_key};

    #[test]
    fn test_stream_ids_unique_per_predicate() {
        let reg = StreamRegistry::new();
        let a = reg.stream_id_for("<a>");
        let b = reg.stream_id_for("<b>");
        assert_ne!(a, b);
        assert_eq!(reg.stream_id_for("<a>"), a);
        assert_eq!(reg.stream_id_for("<b>"), b);
        assert_ne!(a, 0);
        assert_eq!(a & SPLIT_STREAM_BIT, 0);
    }

    #[test]
    fn test_tag_sets_continuation_bit_only_on_split_keys() {
        let reg = StreamRegistry::new();
        let base = data_key("<p>", 1);
        let mut list = vec![
            Kv {
                key: base.clone(),
                value: vec![],
                user_meta: COMPLETE_POSTING,
                version: 1,
                stream_id: 0,
            },
            Kv {
                key: split_key(&base, 500),
                value: vec![],
                user_meta: COMPLETE_POSTING,
                version: 1,
                stream_id: 0,
            },
        ];
        tag_stream_ids(&mut list, &reg).unwrap();
        let id = reg.stream_id_for("<p>");
        assert_eq!(list[0].stream_id, id);
        assert_eq!(list[1].stream_id, id | SPLIT_STREAM_BIT);
    }

    #[test]
    fn test_segment_writer_round_trip() {
        let dir = std::env::temp_dir().join("quadshard_test_stream_rt");
        let _ = std::fs::remove_dir_all(&dir);

        let mut writer = SegmentWriter::new(&dir).unwrap();
        let kvs = vec![
            Kv {
                key: data_key("<p>", 1),
                value: b"one".to_vec(),
                user_meta: COMPLETE_POSTING,
                version: 7,
                stream_id: 1,
            },
            Kv {
                key: data_key("<p>", 2),
                value: b"two".to_vec(),
                user_meta: COMPLETE_POSTING,
                version: 7,
                stream_id: 1,
            },
        ];
        writer.write(kvs.clone()).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.kv_count(), 2);

        let got = read_segments(&dir).unwrap();
        assert_eq!(got, kvs);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_segment_writer_rejects_out_of_order() {
        let dir = std::env::temp_dir().join("quadshard_test_stream_order");
        let _ = std::fs::remove_dir_all(&dir);

        let mut writer = SegmentWriter::new(&dir).unwrap();
        let kv = |uid: u64| Kv {
            key: data_key("<p>", uid),
            value: vec![],
            user_meta: COMPLETE_POSTING,
            version: 1,
            stream_id: 3,
        };
        writer.write(vec![kv(5)]).unwrap();
        assert!(writer.write(vec![kv(2)]).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
