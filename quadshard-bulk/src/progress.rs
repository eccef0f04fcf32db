//! Periodic progress reporting.
//!
//! Atomic counters bumped on the hot paths, read once a second by a reporter
//! thread. Shutdown is a two-way rendezvous: the caller signals stop, the
//! reporter acknowledges after its final tick, and only then is the end
//! summary printed.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

const REPORT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Nothing = 0,
    Map = 1,
    Reduce = 2,
}

pub struct Progress {
    pub nquad_count: AtomicU64,
    pub err_count: AtomicU64,
    pub reduce_key_count: AtomicU64,
    pub reduce_edge_count: AtomicU64,
    start: Instant,
    phase: AtomicU8,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            nquad_count: AtomicU64::new(0),
            err_count: AtomicU64::new(0),
            reduce_key_count: AtomicU64::new(0),
            reduce_edge_count: AtomicU64::new(0),
            start: Instant::now(),
            phase: AtomicU8::new(Phase::Nothing as u8),
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn report_once(&self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        match self.phase.load(Ordering::SeqCst) {
            p if p == Phase::Map as u8 => {
                let nquads = self.nquad_count.load(Ordering::Relaxed);
                let errs = self.err_count.load(Ordering::Relaxed);
                info!(
                    "MAP {}s nquad_count:{} err_count:{} nquad_speed:{}/sec",
                    elapsed as u64,
                    nice_count(nquads),
                    nice_count(errs),
                    nice_count((nquads as f64 / elapsed.max(f64::EPSILON)) as u64),
                );
            }
            p if p == Phase::Reduce as u8 => {
                let keys = self.reduce_key_count.load(Ordering::Relaxed);
                let edges = self.reduce_edge_count.load(Ordering::Relaxed);
                info!(
                    "REDUCE {}s reduce_key_count:{} reduce_edge_count:{} edge_speed:{}/sec",
                    elapsed as u64,
                    nice_count(keys),
                    nice_count(edges),
                    nice_count((edges as f64 / elapsed.max(f64::EPSILON)) as u64),
                );
            }
            _ => {}
        }
    }

    /// Spawn the reporter thread.
    pub fn start_reporting(self: &Arc<Self>) -> Reporter {
        let (stop_tx, stop_rx) = std::sync::mpsc::sync_channel::<()>(0);
        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel::<()>(0);
        let prog = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("progress".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(REPORT_PERIOD) {
                    Err(RecvTimeoutError::Timeout) => prog.report_once(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = ack_tx.send(());
                        return;
                    }
                }
            })
            .expect("spawn progress reporter");
        Reporter {
            stop_tx,
            ack_rx,
            handle: Some(handle),
        }
    }
}

pub struct Reporter {
    stop_tx: SyncSender<()>,
    ack_rx: Receiver<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Reporter {
    /// Stop the reporter, wait for its acknowledgement, and print the final
    /// numbers.
    pub fn end_summary(mut self, prog: &Progress) {
        let _ = self.stop_tx.send(());
        let _ = self.ack_rx.recv();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        prog.report_once();
        info!("Total: {:.1}s", prog.start.elapsed().as_secs_f64());
    }
}

/// Humanize a counter: 1234 → "1.234k".
fn nice_count(mut value: u64) -> String {
    const SUFFIXES: [&str; 5] = ["", "k", "M", "G", "T"];
    let mut frac = 0u64;
    let mut idx = 0usize;
    while value >= 1000 && idx + 1 < SUFFIXES.len() {
        frac = value % 1000;
        value /= 1000;
        idx += 1;
    }
    if idx == 0 {
        format!("{value}")
    } else {
        format!("{value}.{frac:03}{}", SUFFIXES[idx])
    }
}
