//! Posting lists: delta-compressed uid packs plus optional rich postings.
//!
//! Uids are grouped into fixed-size blocks ([`BLOCK_SIZE`] uids each). A
//! block stores its first uid verbatim and the remaining uids as varint
//! deltas from their predecessor, so dense lists compress to roughly one
//! byte per uid. The encoded form is what gets stored per key; lists whose
//! encoding exceeds [`MAX_LIST_SIZE`] are split across multiple keys by the
//! reduce phase.

use crate::error::{BulkError, Result};
use crate::wire::{put_uvarint, uvarint, uvarint_len, Posting};

/// Uids per delta block.
pub const BLOCK_SIZE: usize = 256;

/// Encoded posting lists above this size (with more than one block) are
/// split across adjacent keys.
pub const MAX_LIST_SIZE: usize = (1 << 20) / 2;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UidBlock {
    /// First uid of the block, stored verbatim.
    pub base: u64,
    /// Varint deltas for the remaining uids.
    pub deltas: Vec<u8>,
    /// Total uids in the block, base included.
    pub num_uids: u32,
}

impl UidBlock {
    /// On-disk length of this block inside a pack.
    pub fn wire_len(&self) -> usize {
        uvarint_len(self.base)
            + uvarint_len(u64::from(self.num_uids))
            + uvarint_len(self.deltas.len() as u64)
            + self.deltas.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UidPack {
    pub blocks: Vec<UidBlock>,
}

impl UidPack {
    pub fn num_uids(&self) -> usize {
        self.blocks.iter().map(|b| b.num_uids as usize).sum()
    }
}

/// Pack a strictly-increasing uid list into delta blocks of `block_size`.
pub fn encode_uids(uids: &[u64], block_size: usize) -> UidPack {
    let mut blocks = Vec::with_capacity(uids.len().div_ceil(block_size.max(1)));
    for chunk in uids.chunks(block_size.max(1)) {
        let base = chunk[0];
        let mut deltas = Vec::with_capacity(chunk.len());
        let mut prev = base;
        for &uid in &chunk[1..] {
            put_uvarint(&mut deltas, uid - prev);
            prev = uid;
        }
        blocks.push(UidBlock {
            base,
            deltas,
            num_uids: chunk.len() as u32,
        });
    }
    UidPack { blocks }
}

/// Expand a pack back into the uid list.
pub fn decode_uids(pack: &UidPack) -> Result<Vec<u64>> {
    let mut uids = Vec::with_capacity(pack.num_uids());
    for block in &pack.blocks {
        let mut uid = block.base;
        uids.push(uid);
        let mut rest = &block.deltas[..];
        for _ in 1..block.num_uids {
            let (delta, n) = uvarint(rest)
                .ok_or_else(|| BulkError::Corrupt("uid block delta truncated".into()))?;
            uid += delta;
            uids.push(uid);
            rest = &rest[n..];
        }
        if !rest.is_empty() {
            return Err(BulkError::Corrupt("uid block has trailing deltas".into()));
        }
    }
    Ok(uids)
}

/// The aggregate stored per key: the packed uids plus any rich postings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostingList {
    pub pack: UidPack,
    pub postings: Vec<Posting>,
}

impl PostingList {
    /// Encode to the stored value form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        put_uvarint(&mut buf, self.pack.blocks.len() as u64);
        for block in &self.pack.blocks {
            put_uvarint(&mut buf, block.base);
            put_uvarint(&mut buf, u64::from(block.num_uids));
            put_uvarint(&mut buf, block.deltas.len() as u64);
            buf.extend_from_slice(&block.deltas);
        }
        put_uvarint(&mut buf, self.postings.len() as u64);
        for p in &self.postings {
            put_uvarint(&mut buf, p.uid);
            buf.push(p.value_type);
            put_uvarint(&mut buf, p.value.len() as u64);
            buf.extend_from_slice(&p.value);
        }
        buf
    }

    /// Exact encoded size without materialising the encoding.
    pub fn encoded_len(&self) -> usize {
        let mut n = uvarint_len(self.pack.blocks.len() as u64);
        for block in &self.pack.blocks {
            n += block.wire_len();
        }
        n += uvarint_len(self.postings.len() as u64);
        for p in &self.postings {
            n += uvarint_len(p.uid) + 1 + uvarint_len(p.value.len() as u64) + p.value.len();
        }
        n
    }

    pub fn decode(bytes: &[u8]) -> Result<PostingList> {
        let corrupt = |what: &str| BulkError::Corrupt(format!("posting list: {what}"));

        let mut pos = 0usize;
        let (block_count, n) = uvarint(bytes).ok_or_else(|| corrupt("block count"))?;
        pos += n;
        let mut blocks = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            let (base, n) = uvarint(&bytes[pos..]).ok_or_else(|| corrupt("block base"))?;
            pos += n;
            let (num_uids, n) = uvarint(&bytes[pos..]).ok_or_else(|| corrupt("block size"))?;
            pos += n;
            let (delta_len, n) = uvarint(&bytes[pos..]).ok_or_else(|| corrupt("delta length"))?;
            pos += n;
            let delta_len = delta_len as usize;
            if bytes.len() < pos + delta_len {
                return Err(corrupt("truncated deltas"));
            }
            blocks.push(UidBlock {
                base,
                num_uids: num_uids as u32,
                deltas: bytes[pos..pos + delta_len].to_vec(),
            });
            pos += delta_len;
        }
        let (posting_count, n) = uvarint(&bytes[pos..]).ok_or_else(|| corrupt("posting count"))?;
        pos += n;
        let mut postings = Vec::with_capacity(posting_count as usize);
        for _ in 0..posting_count {
            let (uid, n) = uvarint(&bytes[pos..]).ok_or_else(|| corrupt("posting uid"))?;
            pos += n;
            let value_type = *bytes.get(pos).ok_or_else(|| corrupt("value type"))?;
            pos += 1;
            let (value_len, n) = uvarint(&bytes[pos..]).ok_or_else(|| corrupt("value length"))?;
            pos += n;
            let value_len = value_len as usize;
            if bytes.len() < pos + value_len {
                return Err(corrupt("truncated value"));
            }
            postings.push(Posting {
                uid,
                value: bytes[pos..pos + value_len].to_vec(),
                value_type,
            });
            pos += value_len;
        }
        if pos != bytes.len() {
            return Err(corrupt("trailing bytes"));
        }
        Ok(PostingList {
            pack: UidPack { blocks },
            postings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::VAL_STRING;

    #[test]
    fn test_pack_round_trip_dense() {
        let uids: Vec<u64> = (1..=1000).collect();
        let pack = encode_uids(&uids, BLOCK_SIZE);
        assert_eq!(pack.blocks.len(), 4);
        assert_eq!(pack.num_uids(), 1000);
        assert_eq!(decode_uids(&pack).unwrap(), uids);
    }

    #[test]
    fn test_pack_round_trip_sparse() {
        let uids: Vec<u64> = (0..5000u64).map(|i| 1 + i * 0x37_0000_1234).collect();
        let pack = encode_uids(&uids, BLOCK_SIZE);
        assert_eq!(decode_uids(&pack).unwrap(), uids);
    }

    #[test]
    fn test_pack_single_uid() {
        let pack = encode_uids(&[7], BLOCK_SIZE);
        assert_eq!(pack.blocks.len(), 1);
        assert_eq!(decode_uids(&pack).unwrap(), vec![7]);
    }

    #[test]
    fn test_pack_block_boundary() {
        let uids: Vec<u64> = (1..=BLOCK_SIZE as u64).collect();
        let pack = encode_uids(&uids, BLOCK_SIZE);
        assert_eq!(pack.blocks.len(), 1);
        let uids: Vec<u64> = (1..=BLOCK_SIZE as u64 + 1).collect();
        let pack = encode_uids(&uids, BLOCK_SIZE);
        assert_eq!(pack.blocks.len(), 2);
        assert_eq!(pack.blocks[1].num_uids, 1);
        assert_eq!(decode_uids(&pack).unwrap(), uids);
    }

    #[test]
    fn test_posting_list_round_trip() {
        let uids = vec![3, 9, 27, 81];
        let pl = PostingList {
            pack: encode_uids(&uids, BLOCK_SIZE),
            postings: vec![Posting {
                uid: 9,
                value: b"three squared".to_vec(),
                value_type: VAL_STRING,
            }],
        };
        let bytes = pl.encode();
        assert_eq!(bytes.len(), pl.encoded_len());
        let decoded = PostingList::decode(&bytes).unwrap();
        assert_eq!(decoded, pl);
        assert_eq!(decode_uids(&decoded.pack).unwrap(), uids);
    }

    #[test]
    fn test_empty_posting_list() {
        let pl = PostingList::default();
        let bytes = pl.encode();
        assert_eq!(PostingList::decode(&bytes).unwrap(), pl);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let pl = PostingList {
            pack: encode_uids(&(1..=600).collect::<Vec<_>>(), BLOCK_SIZE),
            postings: vec![],
        };
        let bytes = pl.encode();
        assert!(PostingList::decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
