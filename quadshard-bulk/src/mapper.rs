//! Mapper workers: text lines in, sorted spill runs out.
//!
//! Each worker drains the shared chunk channel, parses every line, rewrites
//! uids when reassignment is on, and appends the resulting map entry to the
//! per-shard buffer chosen by the predicate's shard. When a buffer crosses
//! the spill threshold it is handed to a background writer thread; at most
//! one write per (worker, shard) is in flight, and shutdown joins every
//! pending write before the map phase is allowed to complete.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use tracing::info;

use crate::error::{BulkError, Result};
use crate::key::data_key;
use crate::loader::LoaderState;
use crate::nquad::{parse_line, parse_uid_token, uid_token, LineError, NQuad, BLANK_NODE_PREFIX};
use crate::shuffle::MAP_SHARD_DIR;
use crate::spill::write_spill;
use crate::wire::{value_fingerprint, MapEntry, Posting, VAL_STRING};

/// Slots pre-allocated when a shard buffer is replaced after a spill.
const FRESH_BUFFER_SLOTS: usize = 512;

pub struct Mapper {
    state: Arc<LoaderState>,
    shards: Vec<ShardBuffer>,
}

#[derive(Default)]
struct ShardBuffer {
    entries: Vec<MapEntry>,
    encoded_size: u64,
    /// In-flight background spill write, if any.
    pending: Option<JoinHandle<Result<()>>>,
}

fn join_spill(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .map_err(|_| BulkError::Io(std::io::Error::other("spill writer thread panicked")))?
}

impl Mapper {
    pub fn new(state: Arc<LoaderState>) -> Self {
        let shards = (0..state.opt.map_shards)
            .map(|_| ShardBuffer::default())
            .collect();
        Self { state, shards }
    }

    /// Consume chunks until the channel closes, then flush everything.
    pub fn run(&mut self, chunk_rx: Receiver<Vec<u8>>) -> Result<()> {
        for chunk in chunk_rx.iter() {
            for raw_line in chunk.split(|&b| b == b'\n') {
                let line = match std::str::from_utf8(raw_line) {
                    Ok(line) => line,
                    Err(_) => {
                        self.soft_error("<invalid utf-8>")?;
                        continue;
                    }
                };
                match self.process_line(line) {
                    Ok(true) => {
                        self.state.prog.nquad_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(e) if e.is_soft() => self.soft_error(line)?,
                    Err(e) => return Err(e),
                }
            }

            for shard_idx in 0..self.shards.len() {
                if self.shards[shard_idx].encoded_size >= self.state.opt.map_buf_size {
                    self.flush_shard(shard_idx, false)?;
                }
            }
        }

        // Channel closed: flush the remainder synchronously and fence every
        // pending background write.
        for shard_idx in 0..self.shards.len() {
            self.flush_shard(shard_idx, true)?;
        }
        for shard in &mut self.shards {
            if let Some(handle) = shard.pending.take() {
                join_spill(handle)?;
            }
        }
        Ok(())
    }

    fn soft_error(&self, line: &str) -> Result<()> {
        self.state.prog.err_count.fetch_add(1, Ordering::Relaxed);
        if !self.state.opt.ignore_errors {
            return Err(BulkError::Parse(line.to_string()));
        }
        if self.state.opt.verbose {
            info!("Illegal RDF: {line}");
        }
        Ok(())
    }

    /// Map one line. `Ok(true)` when an entry was emitted, `Ok(false)` for
    /// an ignorable empty line.
    fn process_line(&mut self, line: &str) -> Result<bool> {
        let mut nq = match parse_line(line) {
            Ok(nq) => nq,
            Err(LineError::Empty) => return Ok(false),
            Err(LineError::Malformed(l)) => return Err(BulkError::Parse(l)),
        };

        if self.state.opt.new_uids {
            self.reassign_uids(&mut nq)?;
        }

        let subject_uid = parse_uid_token(&nq.subject).ok_or_else(|| {
            BulkError::Parse(format!("subject is not a uid token: {}", nq.subject))
        })?;

        let key = data_key(&nq.predicate, subject_uid);
        let entry = if let Some(inner) = nq.object.strip_prefix('"') {
            let value = match inner.rfind('"') {
                Some(end) => &inner[..end],
                None => inner,
            };
            let value = value.as_bytes().to_vec();
            let fingerprint = value_fingerprint(&value);
            MapEntry {
                key,
                uid: 0,
                posting: Some(Posting {
                    uid: fingerprint,
                    value,
                    value_type: VAL_STRING,
                }),
            }
        } else if let Some(object_uid) = parse_uid_token(&nq.object) {
            MapEntry {
                key,
                uid: object_uid,
                posting: None,
            }
        } else {
            return Err(BulkError::Parse(format!(
                "object is neither a quoted value nor a uid token: {}",
                nq.object
            )));
        };

        let shard_idx = self.state.shards.shard_for(&nq.predicate);
        let shard = &mut self.shards[shard_idx];
        shard.encoded_size += entry.encoded_len() as u64;
        shard.entries.push(entry);
        Ok(true)
    }

    /// Intern the subject (always) and blank-node objects, rewriting the
    /// tokens to their `<0x{hex}>` form.
    fn reassign_uids(&self, nq: &mut NQuad) -> Result<()> {
        let uid = self.state.xids.assign_uid(&nq.subject)?;
        nq.subject = uid_token(uid);
        if nq.object.starts_with(BLANK_NODE_PREFIX) {
            let uid = self.state.xids.assign_uid(&nq.object)?;
            nq.object = uid_token(uid);
        }
        Ok(())
    }

    /// Spill one shard's buffer. Asynchronous flushes join the previous
    /// in-flight write first so only one write per shard runs at a time;
    /// synchronous flushes (shutdown) write inline.
    fn flush_shard(&mut self, shard_idx: usize, sync: bool) -> Result<()> {
        if self.shards[shard_idx].entries.is_empty() {
            return Ok(());
        }
        if let Some(handle) = self.shards[shard_idx].pending.take() {
            join_spill(handle)?;
        }

        let shard = &mut self.shards[shard_idx];
        let entries = std::mem::replace(
            &mut shard.entries,
            Vec::with_capacity(FRESH_BUFFER_SLOTS),
        );
        shard.encoded_size = 0;

        let file_id = self.state.map_file_id.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self
            .state
            .opt
            .tmp_dir
            .join(MAP_SHARD_DIR)
            .join(format!("{shard_idx:03}"))
            .join(format!("{file_id:06}.rdf.gz"));

        if sync {
            write_spill(&path, entries)
        } else {
            let handle = std::thread::Builder::new()
                .name(format!("spill-{shard_idx:03}"))
                .spawn(move || write_spill(&path, entries))?;
            self.shards[shard_idx].pending = Some(handle);
            Ok(())
        }
    }
}
