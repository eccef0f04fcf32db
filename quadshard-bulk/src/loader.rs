//! Phase orchestration: map → shuffle → reduce.
//!
//! The loader owns the process-wide state shared by every worker — the
//! interning map, the predicate shard router, the schema store, the stream
//! id registry, the progress counters, and the write timestamp leased once
//! at startup. Phases run strictly in order; nothing crosses a phase
//! boundary except files on disk.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::info;

use crate::chunk::{data_format, file_reader, find_data_files, new_chunker, InputFormat};
use crate::error::{BulkError, Result};
use crate::mapper::Mapper;
use crate::options::Options;
use crate::progress::{Phase, Progress, Reporter};
use crate::reduce::run_reduce;
use crate::schema::SchemaStore;
use crate::shard_map::ShardMap;
use crate::shuffle::merge_map_shards_into_reduce_shards;
use crate::stream::StreamRegistry;
use crate::throttle::Throttle;
use crate::xid::{write_timestamp, UidAllocator, XidMap};

/// Process-wide pipeline state, shared by reference with every worker.
pub struct LoaderState {
    pub opt: Options,
    pub prog: Arc<Progress>,
    pub xids: XidMap,
    pub shards: ShardMap,
    pub schema: SchemaStore,
    pub registry: StreamRegistry,
    /// Version stamped on every output KV.
    pub write_ts: u64,
    /// Names mapper spill files; process-wide so sequence numbers never
    /// collide across workers.
    pub map_file_id: AtomicU32,
}

impl LoaderState {
    fn new(opt: Options, allocator: Arc<dyn UidAllocator>) -> Result<Arc<Self>> {
        let schema = SchemaStore::load(&opt.schema_file)?;
        let write_ts = write_timestamp(&*allocator)?;
        Ok(Arc::new(Self {
            xids: XidMap::new(allocator, opt.xid_shards),
            shards: ShardMap::new(opt.map_shards),
            prog: Arc::new(Progress::new()),
            schema,
            registry: StreamRegistry::new(),
            write_ts,
            map_file_id: AtomicU32::new(0),
            opt,
        }))
    }

    #[cfg(test)]
    pub(crate) fn for_testing(opt: Options, allocator: Arc<dyn UidAllocator>) -> Arc<Self> {
        let write_ts = write_timestamp(&*allocator).unwrap();
        Arc::new(Self {
            xids: XidMap::new(allocator, opt.xid_shards),
            shards: ShardMap::new(opt.map_shards),
            prog: Arc::new(Progress::new()),
            schema: SchemaStore::parse(""),
            registry: StreamRegistry::new(),
            write_ts,
            map_file_id: AtomicU32::new(0),
            opt,
        })
    }
}

pub struct Loader {
    state: Arc<LoaderState>,
    reporter: Option<Reporter>,
}

impl Loader {
    /// Validate the configuration, lease the write timestamp, and start the
    /// progress reporter.
    pub fn new(opt: Options, allocator: Arc<dyn UidAllocator>) -> Result<Self> {
        opt.validate()?;
        let state = LoaderState::new(opt, allocator)?;
        let reporter = state.prog.start_reporting();
        Ok(Self {
            state,
            reporter: Some(reporter),
        })
    }

    pub fn state(&self) -> &Arc<LoaderState> {
        &self.state
    }

    /// All phases in order, then the end summary.
    pub fn run(&mut self) -> Result<()> {
        self.map_stage()?;
        self.shuffle_stage()?;
        self.reduce_stage()?;
        self.cleanup();
        Ok(())
    }

    pub fn map_stage(&self) -> Result<()> {
        let state = &self.state;
        state.prog.set_phase(Phase::Map);

        let files = find_data_files(&state.opt.data_files)?;
        if files.is_empty() {
            return Err(BulkError::Config(format!(
                "no data files found in {}",
                state.opt.data_files
            )));
        }

        // Mappers may see chunks from any input file, so all files must
        // share one format: the user's override, or the first file's.
        let load_type = data_format(&files[0], &state.opt.data_format);
        if load_type == InputFormat::Unknown {
            return Err(BulkError::Config(format!(
                "need --format=rdf or --format=json to load {}",
                files[0]
            )));
        }
        // Refuse unsupported formats before any worker spawns.
        new_chunker(load_type).map(drop)?;

        let (chunk_tx, chunk_rx) =
            crossbeam_channel::bounded::<Vec<u8>>(2 * state.opt.num_go_routines);
        let throttle = Throttle::new(state.opt.num_chunkers);

        std::thread::scope(|scope| -> Result<()> {
            let mut mapper_handles = Vec::with_capacity(state.opt.num_go_routines);
            for i in 0..state.opt.num_go_routines {
                let rx = chunk_rx.clone();
                let state = Arc::clone(state);
                mapper_handles.push(
                    std::thread::Builder::new()
                        .name(format!("mapper-{i}"))
                        .spawn_scoped(scope, move || Mapper::new(state).run(rx))?,
                );
            }
            drop(chunk_rx);

            let total = files.len();
            let mut chunker_handles = Vec::with_capacity(total);
            for (i, file) in files.iter().enumerate() {
                throttle.acquire();
                info!("Processing file ({} out of {}): {file}", i + 1, total);
                let tx = chunk_tx.clone();
                let throttle = &throttle;
                chunker_handles.push(
                    std::thread::Builder::new()
                        .name(format!("chunker-{i}"))
                        .spawn_scoped(scope, move || {
                            let result = read_file_chunks(file, load_type, &tx);
                            throttle.release();
                            result
                        })?,
                );
            }
            throttle.wait_all();
            drop(chunk_tx);

            let join_err =
                || BulkError::Io(std::io::Error::other("map phase worker panicked"));
            for handle in chunker_handles {
                handle.join().map_err(|_| join_err())??;
            }
            for handle in mapper_handles {
                handle.join().map_err(|_| join_err())??;
            }
            Ok(())
        })
    }

    pub fn shuffle_stage(&self) -> Result<()> {
        merge_map_shards_into_reduce_shards(&self.state)
    }

    pub fn reduce_stage(&self) -> Result<()> {
        self.state.prog.set_phase(Phase::Reduce);
        run_reduce(&self.state)
    }

    /// Stop the progress reporter and print the end summary.
    pub fn cleanup(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.end_summary(&self.state.prog);
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// One chunker task: stream a file's chunks into the shared channel.
fn read_file_chunks(file: &str, format: InputFormat, tx: &Sender<Vec<u8>>) -> Result<()> {
    let mut reader = file_reader(file)?;
    let mut chunker = new_chunker(format)?;
    loop {
        let (chunk, eof) = chunker.next_chunk(&mut *reader)?;
        if !chunk.is_empty() && tx.send(chunk).is_err() {
            return Err(BulkError::Io(std::io::Error::other(
                "mapper workers terminated early",
            )));
        }
        if eof {
            return Ok(());
        }
    }
}
