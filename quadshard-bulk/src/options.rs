//! Validated pipeline configuration.
//!
//! The CLI fills this in from flags; `validate()` performs the checks whose
//! failure is a configuration error (exit code 1) rather than a runtime
//! fault. The struct is `Serialize` so the effective configuration can be
//! logged as JSON at startup.

use std::path::{Path, PathBuf};

use crate::error::{BulkError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Options {
    /// Comma-separated list of input paths; `-` reads stdin.
    pub data_files: String,
    /// Input format override (`rdf`, `json`, or empty for
    /// extension-derived).
    pub data_format: String,
    /// Schema file path.
    pub schema_file: PathBuf,
    /// Scratch directory for map/reduce shards.
    pub tmp_dir: PathBuf,
    /// Output directory; one sealed-table subdirectory per reduce shard.
    pub out_dir: PathBuf,
    /// Number of mapper workers.
    pub num_go_routines: usize,
    /// Per-shard spill threshold in bytes.
    pub map_buf_size: u64,
    /// Address to serve the profiling endpoint on (accepted, unused).
    pub http_addr: String,
    /// Count and skip malformed input lines instead of aborting.
    pub ignore_errors: bool,
    pub verbose: bool,
    /// Address of the uid-allocation service.
    pub zero_addr: String,
    /// Discard uids present in the input and intern fresh ones.
    pub new_uids: bool,
    /// Weight map-shard cost by schema index kinds during shuffle.
    pub weighted: bool,
    pub map_shards: usize,
    pub reduce_shards: usize,
    pub xid_shards: usize,
    pub num_chunkers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            data_files: String::new(),
            data_format: String::new(),
            schema_file: PathBuf::new(),
            tmp_dir: PathBuf::from("split_output"),
            out_dir: PathBuf::from("out"),
            num_go_routines: default_workers(),
            map_buf_size: 64 << 20,
            http_addr: "localhost:8080".to_string(),
            ignore_errors: true,
            verbose: false,
            zero_addr: "localhost:5080".to_string(),
            new_uids: false,
            weighted: true,
            map_shards: 1,
            reduce_shards: 1,
            xid_shards: 32,
            num_chunkers: 1,
        }
    }
}

/// Half the available cores, rounded up.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.div_ceil(2)
}

impl Options {
    /// The comma-split input paths, in flag order.
    pub fn data_file_list(&self) -> Vec<String> {
        self.data_files
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Check everything that counts as a configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.schema_file.as_os_str().is_empty() {
            return Err(BulkError::Config("schema file must be specified".into()));
        }
        if !self.schema_file.exists() {
            return Err(BulkError::Config(format!(
                "schema path ({}) does not exist",
                self.schema_file.display()
            )));
        }
        let files = self.data_file_list();
        if files.is_empty() {
            return Err(BulkError::Config(
                "RDF or JSON file(s) location must be specified".into(),
            ));
        }
        for file in &files {
            if file != "-" && !Path::new(file).exists() {
                return Err(BulkError::Config(format!(
                    "data path ({file}) does not exist"
                )));
            }
        }
        if self.map_shards == 0 || self.reduce_shards == 0 {
            return Err(BulkError::Config(
                "map_shards and reduce_shards must be at least 1".into(),
            ));
        }
        if self.map_shards < self.reduce_shards {
            return Err(BulkError::Config(format!(
                "map_shards ({}) must be greater than or equal to reduce_shards ({})",
                self.map_shards, self.reduce_shards
            )));
        }
        if self.num_go_routines == 0 || self.num_chunkers == 0 || self.xid_shards == 0 {
            return Err(BulkError::Config(
                "worker, chunker, and xid shard counts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
