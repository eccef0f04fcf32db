//! K-way merge of sorted spill runs.
//!
//! A manual min-heap merges N forward-only streams into a single
//! (key, uid)-sorted sequence. Equal entries are ordered by stream index so
//! the merge is deterministic regardless of thread scheduling during the
//! map phase.

use std::cmp::Ordering;

use crate::error::Result;
use crate::spill::SpillReader;
use crate::wire::{cmp_entries, MapEntry};

/// A buffered, forward-only stream of sorted map entries.
pub trait MergeSource {
    fn next_entry(&mut self) -> Result<Option<MapEntry>>;
}

impl MergeSource for SpillReader {
    fn next_entry(&mut self) -> Result<Option<MapEntry>> {
        SpillReader::next_entry(self)
    }
}

struct HeapNode {
    entry: MapEntry,
    stream_idx: usize,
}

/// Merge iterator over N sorted streams.
pub struct KWayMerge<T: MergeSource> {
    heap: Vec<HeapNode>,
    streams: Vec<T>,
}

impl<T: MergeSource> KWayMerge<T> {
    /// Seed the heap with the head of every non-empty stream.
    pub fn new(mut streams: Vec<T>) -> Result<Self> {
        let mut heap = Vec::with_capacity(streams.len());
        for (idx, stream) in streams.iter_mut().enumerate() {
            if let Some(entry) = stream.next_entry()? {
                heap.push(HeapNode {
                    entry,
                    stream_idx: idx,
                });
            }
        }

        let mut me = Self { heap, streams };
        if me.heap.len() > 1 {
            let last_internal = me.heap.len() / 2 - 1;
            for i in (0..=last_internal).rev() {
                me.sift_down(i);
            }
        }
        Ok(me)
    }

    #[inline]
    fn heap_less(&self, i: usize, j: usize) -> bool {
        match cmp_entries(&self.heap[i].entry, &self.heap[j].entry) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.heap[i].stream_idx < self.heap[j].stream_idx,
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap_less(right, left) {
                smallest = right;
            }
            if !self.heap_less(smallest, pos) {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap_less(pos, parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    /// Pop the next entry in merge order.
    pub fn next_entry(&mut self) -> Result<Option<MapEntry>> {
        if self.heap.is_empty() {
            return Ok(None);
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let node = self.heap.pop().unwrap();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }

        // Refill from the stream the popped entry came from.
        if let Some(next) = self.streams[node.stream_idx].next_entry()? {
            self.heap.push(HeapNode {
                entry: next,
                stream_idx: node.stream_idx,
            });
            let pos = self.heap.len() - 1;
            self.sift_up(pos);
        }

        Ok(Some(node.entry))
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::data_key;
    use crate::spill::write_spill;
    use std::path::{Path, PathBuf};

    struct VecSource(std::vec::IntoIter<MapEntry>);

    impl MergeSource for VecSource {
        fn next_entry(&mut self) -> Result<Option<MapEntry>> {
            Ok(self.0.next())
        }
    }

    fn entry(pred: &str, subject: u64, uid: u64) -> MapEntry {
        MapEntry {
            key: data_key(pred, subject),
            uid,
            posting: None,
        }
    }

    fn drain<T: MergeSource>(mut merge: KWayMerge<T>) -> Vec<MapEntry> {
        let mut out = Vec::new();
        while let Some(e) = merge.next_entry().unwrap() {
            out.push(e);
        }
        assert!(merge.is_exhausted());
        out
    }

    #[test]
    fn test_merge_three_streams() {
        let streams = vec![
            VecSource(vec![entry("<p>", 1, 0), entry("<p>", 3, 0), entry("<p>", 5, 0)].into_iter()),
            VecSource(vec![entry("<p>", 2, 0), entry("<p>", 4, 0)].into_iter()),
            VecSource(vec![entry("<p>", 6, 0)].into_iter()),
        ];
        let out = drain(KWayMerge::new(streams).unwrap());
        let subjects: Vec<u64> = out
            .iter()
            .map(|e| crate::key::parse_key(&e.key).unwrap().uid)
            .collect();
        assert_eq!(subjects, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_merge_is_sorted_permutation() {
        // Arbitrary overlapping runs: the output must be the sorted multiset
        // union of the inputs.
        let a = vec![
            entry("<p>", 1, 1),
            entry("<p>", 1, 3),
            entry("<q>", 1, 1),
        ];
        let b = vec![entry("<p>", 1, 2), entry("<p>", 2, 1)];
        let c = vec![entry("<p>", 1, 2), entry("<q>", 2, 9)];

        let mut expected: Vec<MapEntry> = a
            .iter()
            .chain(b.iter())
            .chain(c.iter())
            .cloned()
            .collect();
        expected.sort_by(cmp_entries);

        let streams = vec![
            VecSource(a.into_iter()),
            VecSource(b.into_iter()),
            VecSource(c.into_iter()),
        ];
        let out = drain(KWayMerge::new(streams).unwrap());
        assert_eq!(out, expected);
    }

    #[test]
    fn test_merge_empty_streams() {
        let streams = vec![
            VecSource(vec![].into_iter()),
            VecSource(vec![entry("<p>", 1, 1)].into_iter()),
            VecSource(vec![].into_iter()),
        ];
        let out = drain(KWayMerge::new(streams).unwrap());
        assert_eq!(out.len(), 1);

        let none: Vec<VecSource> = vec![];
        let mut merge = KWayMerge::new(none).unwrap();
        assert!(merge.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_merge_spill_files(){
        let dir = std::env::temp_dir().join("quadshard_test_merge_spills");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let write = |name: &str, entries: Vec<MapEntry>| -> PathBuf {
            let path = dir.join(name);
            write_spill(&path, entries).unwrap();
            path
        };
        let p0 = write(
            "000001.rdf.gz",
            vec![entry("<p>", 5, 0), entry("<p>", 1, 0)],
        );
        let p1 = write(
            "000002.rdf.gz",
            vec![entry("<p>", 4, 0), entry("<p>", 2, 0), entry("<p>", 3, 0)],
        );

        let open = |p: &Path| SpillReader::open(p).unwrap();
        let out = drain(KWayMerge::new(vec![open(&p0), open(&p1)]).unwrap());
        let subjects: Vec<u64> = out
            .iter()
            .map(|e| crate::key::parse_key(&e.key).unwrap().uid)
            .collect();
        assert_eq!(subjects, vec![1, 2, 3, 4, 5]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
