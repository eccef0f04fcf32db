//! String-label interning backed by an external uid-allocation service.
//!
//! The allocation contract is a request/response pair: ask for `n` ids,
//! receive a `(start, count)` lease. [`ZeroClient`] speaks a plain TCP line
//! protocol honoring that contract (`timestamps n` / `uids n` →
//! `start count`), retrying transient failures forever with a one-second
//! sleep. [`XidMap`] shards the label cache so mappers can intern
//! concurrently; each shard draws down its own lease and refills in batches.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::hash::Hasher;
use tracing::info;

/// How long the initial dial may take.
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-request socket timeout; a miss triggers a retry, not a failure.
const RPC_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Ids leased per shard refill.
pub const UID_LEASE_BATCH: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedIds {
    pub start: u64,
    pub count: u64,
}

/// The id-allocation contract. `timestamps` leases version timestamps,
/// `assign_uids` leases uid ranges; both return the first id and the count
/// granted.
pub trait UidAllocator: Send + Sync {
    fn assign_uids(&self, count: u64) -> io::Result<AssignedIds>;
    fn timestamps(&self, count: u64) -> io::Result<AssignedIds>;
}

/// In-process allocator: a bare monotonic counter. Used by tests and
/// benchmarks where no allocation service is running.
pub struct SequentialAllocator {
    next: AtomicU64,
}

impl SequentialAllocator {
    pub fn new(first_id: u64) -> Self {
        Self {
            next: AtomicU64::new(first_id),
        }
    }
}

impl UidAllocator for SequentialAllocator {
    fn assign_uids(&self, count: u64) -> io::Result<AssignedIds> {
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        Ok(AssignedIds { start, count })
    }

    fn timestamps(&self, count: u64) -> io::Result<AssignedIds> {
        self.assign_uids(count)
    }
}

/// TCP client for the uid-allocation service.
///
/// Wire protocol: one request line `<verb> <count>\n` with verb `uids` or
/// `timestamps`; one response line `<start> <count>\n`. The connection is
/// serialised behind a mutex; a failed exchange reconnects and retries
/// indefinitely, logging each attempt.
pub struct ZeroClient {
    addr: String,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl ZeroClient {
    /// Dial the service, blocking up to 60 seconds.
    pub fn connect(addr: &str) -> io::Result<Self> {
        info!("Connecting to zero at {addr}");
        let stream = Self::dial(addr, DIAL_TIMEOUT)?;
        Ok(Self {
            addr: addr.to_string(),
            conn: Mutex::new(Some(BufReader::new(stream))),
        })
    }

    fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {addr}"),
        );
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(RPC_TIMEOUT))?;
                    stream.set_write_timeout(Some(RPC_TIMEOUT))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn exchange_once(
        conn: &mut Option<BufReader<TcpStream>>,
        addr: &str,
        verb: &str,
        count: u64,
    ) -> io::Result<AssignedIds> {
        let reader = match conn {
            Some(r) => r,
            None => {
                *conn = Some(BufReader::new(Self::dial(addr, RPC_TIMEOUT)?));
                conn.as_mut().unwrap()
            }
        };

        reader
            .get_mut()
            .write_all(format!("{verb} {count}\n").as_bytes())?;
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "allocation service closed the connection",
            ));
        }
        let mut parts = line.split_whitespace();
        let parse = |tok: Option<&str>| -> io::Result<u64> {
            tok.and_then(|t| t.parse().ok()).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed allocation response: {line:?}"),
                )
            })
        };
        let start = parse(parts.next())?;
        let granted = parse(parts.next())?;
        Ok(AssignedIds {
            start,
            count: granted,
        })
    }

    /// Run one RPC, retrying transient failures forever.
    fn request(&self, verb: &str, count: u64) -> AssignedIds {
        let mut conn = self.conn.lock();
        loop {
            match Self::exchange_once(&mut conn, &self.addr, verb, count) {
                Ok(ids) => return ids,
                Err(e) => {
                    info!("Error communicating with zero, retrying: {e}");
                    *conn = None;
                    std::thread::sleep(RETRY_SLEEP);
                }
            }
        }
    }
}

impl UidAllocator for ZeroClient {
    fn assign_uids(&self, count: u64) -> io::Result<AssignedIds> {
        Ok(self.request("uids", count))
    }

    fn timestamps(&self, count: u64) -> io::Result<AssignedIds> {
        Ok(self.request("timestamps", count))
    }
}

/// The write timestamp every output KV carries, leased once at startup.
pub fn write_timestamp(allocator: &dyn UidAllocator) -> io::Result<u64> {
    Ok(allocator.timestamps(1)?.start)
}

/// Process-wide label → uid interning map.
///
/// Sharded by label hash; each shard holds its own cache and its own
/// allocation lease. Insertion is idempotent: the shard lock means a racing
/// thread either stores its allocation or observes the winner's.
pub struct XidMap {
    shards: Vec<Mutex<XidShard>>,
    allocator: Arc<dyn UidAllocator>,
}

#[derive(Default)]
struct XidShard {
    uids: FxHashMap<String, u64>,
    /// Unused portion of the current lease: `[reserved_start, reserved_end)`.
    reserved_start: u64,
    reserved_end: u64,
}

impl XidMap {
    pub fn new(allocator: Arc<dyn UidAllocator>, num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Mutex::new(XidShard::default()))
            .collect();
        Self { shards, allocator }
    }

    fn shard_idx(&self, xid: &str) -> usize {
        let mut h = rustc_hash::FxHasher::default();
        h.write(xid.as_bytes());
        (h.finish() as usize) % self.shards.len()
    }

    /// The uid for `xid`, allocating one on first sight. The label is copied
    /// into an owned string so the input chunk it was sliced from can be
    /// released.
    pub fn assign_uid(&self, xid: &str) -> io::Result<u64> {
        let mut shard = self.shards[self.shard_idx(xid)].lock();
        if let Some(&uid) = shard.uids.get(xid) {
            return Ok(uid);
        }
        if shard.reserved_start == shard.reserved_end {
            let lease = self.allocator.assign_uids(UID_LEASE_BATCH)?;
            shard.reserved_start = lease.start;
            shard.reserved_end = lease.start + lease.count;
        }
        let uid = shard.reserved_start;
        shard.reserved_start += 1;
        shard.uids.insert(xid.to_string(), uid);
        Ok(uid)
    }
}
