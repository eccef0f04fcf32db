//! Sorted, gzip-compressed spill runs.
//!
//! A spill file is one sorted run of length-prefixed map entries inside a
//! gzip stream. The writer establishes the (key, uid) order; the k-way
//! merge depends on it and on nothing else. Readers are forward-only and
//! buffered, holding one decoded entry of lookahead.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;

use crate::error::{BulkError, Result};
use crate::wire::{cmp_entries, read_uvarint, MapEntry};

const WRITE_BUF_SIZE: usize = 256 * 1024;
const READ_BUF_SIZE: usize = 16 * 1024;

/// Sort `entries` by (key, uid) and write them as one spill run.
///
/// The parent directory is created on demand; the file is synced before the
/// function returns so a completed spill is durable.
pub fn write_spill(path: &Path, mut entries: Vec<MapEntry>) -> Result<()> {
    entries.par_sort_unstable_by(cmp_entries);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut gz = GzEncoder::new(
        BufWriter::with_capacity(WRITE_BUF_SIZE, file),
        Compression::default(),
    );

    let mut record = Vec::with_capacity(256);
    for entry in &entries {
        record.clear();
        entry.encode_into(&mut record);
        gz.write_all(&record)?;
    }

    let mut writer = gz.finish()?;
    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

/// Forward-only reader over one spill run.
pub struct SpillReader {
    path: PathBuf,
    reader: BufReader<MultiGzDecoder<BufReader<File>>>,
    head: Option<MapEntry>,
    body: Vec<u8>,
}

impl SpillReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(
            READ_BUF_SIZE,
            MultiGzDecoder::new(BufReader::with_capacity(READ_BUF_SIZE, file)),
        );
        let mut me = Self {
            path: path.to_path_buf(),
            reader,
            head: None,
            body: Vec::with_capacity(256),
        };
        me.head = me.read_record()?;
        Ok(me)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&mut self) -> Result<Option<MapEntry>> {
        let len = match read_uvarint(&mut self.reader)? {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        self.body.resize(len, 0);
        self.reader.read_exact(&mut self.body).map_err(|e| {
            BulkError::Corrupt(format!(
                "truncated record in {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(MapEntry::decode_body(&self.body)?))
    }

    /// Take the next entry, or `None` when the run is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<MapEntry>> {
        match self.head.take() {
            None => Ok(None),
            Some(entry) => {
                self.head = self.read_record()?;
                Ok(Some(entry))
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::data_key;
    use crate::wire::{Posting, VAL_STRING};

    fn entry(pred: &str, subject: u64, uid: u64) -> MapEntry {
        MapEntry {
            key: data_key(pred, subject),
            uid,
            posting: None,
        }
    }

    fn read_all(path: &Path) -> Vec<MapEntry> {
        let mut reader = SpillReader::open(path).unwrap();
        let mut entries = Vec::new();
        while let Some(e) = reader.next_entry().unwrap() {
            entries.push(e);
        }
        assert!(reader.is_exhausted());
        entries
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = std::env::temp_dir().join("quadshard_test_spill_rt");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("000001.rdf.gz");

        let entries = vec![
            entry("<p>", 1, 10),
            entry("<p>", 2, 20),
            MapEntry {
                key: data_key("<q>", 1),
                uid: 0,
                posting: Some(Posting {
                    uid: 99,
                    value: b"v".to_vec(),
                    value_type: VAL_STRING,
                }),
            },
        ];
        write_spill(&path, entries.clone()).unwrap();
        assert_eq!(read_all(&path), entries);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_writer_sorts_by_key_then_uid() {
        let dir = std::env::temp_dir().join("quadshard_test_spill_sort");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("000001.rdf.gz");

        write_spill(
            &path,
            vec![
                entry("<q>", 1, 1),
                entry("<p>", 2, 9),
                entry("<p>", 2, 3),
                entry("<p>", 1, 5),
            ],
        )
        .unwrap();

        let got = read_all(&path);
        let mut prev: Option<&MapEntry> = None;
        for e in &got {
            if let Some(p) = prev {
                assert!(
                    (p.key.clone(), p.sort_uid()) <= (e.key.clone(), e.sort_uid()),
                    "spill run must be non-decreasing by (key, uid)"
                );
            }
            prev = Some(e);
        }
        assert_eq!(got[0], entry("<p>", 1, 5));
        assert_eq!(got[1], entry("<p>", 2, 3));
        assert_eq!(got[2], entry("<p>", 2, 9));
        assert_eq!(got[3], entry("<q>", 1, 1));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_spill() {
        let dir = std::env::temp_dir().join("quadshard_test_spill_empty");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("000001.rdf.gz");

        write_spill(&path, Vec::new()).unwrap();
        assert!(read_all(&path).is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_truncated_spill_is_fatal() {
        let dir = std::env::temp_dir().join("quadshard_test_spill_trunc");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("000001.rdf.gz");

        write_spill(&path, vec![entry("<p>", 1, 1), entry("<p>", 2, 2)]).unwrap();

        // Re-compress a truncated copy of the decompressed stream: the gzip
        // framing stays valid but the last record is cut short.
        let mut raw = Vec::new();
        MultiGzDecoder::new(BufReader::new(File::open(&path).unwrap()))
            .read_to_end(&mut raw)
            .unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&raw[..raw.len() - 2]).unwrap();
        let corrupt_path = dir.join("000002.rdf.gz");
        std::fs::write(&corrupt_path, enc.finish().unwrap()).unwrap();

        let mut reader = SpillReader::open(&corrupt_path).unwrap();
        let mut result = Ok(());
        loop {
            match reader.next_entry() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert!(result.is_err(), "truncated record must be a hard error");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
