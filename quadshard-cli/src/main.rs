use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing::{debug, error, info};

use quadshard_bulk::options::{default_workers, Options};
use quadshard_bulk::xid::ZeroClient;
use quadshard_bulk::{BulkError, Loader};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "quadshard", version, about = "Bulk loader front end for sharded graph stores")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Shard N-Quad input into per-reducer sealed tables.
    Shard(ShardArgs),
}

#[derive(Args)]
struct ShardArgs {
    /// Location of *.rdf(.gz) or *.json(.gz) file(s) to load. Comma
    /// separated; `-` for stdin.
    #[arg(short = 'f', long, default_value = "")]
    files: String,

    /// Location of the schema file.
    #[arg(short = 's', long, default_value = "")]
    schema: String,

    /// Specify file format (rdf or json) instead of getting it from the
    /// filename.
    #[arg(long, default_value = "")]
    format: String,

    /// Temp directory used for on-disk scratch space. Requires free space
    /// proportional to the size of the input and the amount of indexing.
    #[arg(long, default_value = "split_output")]
    tmp: PathBuf,

    /// Output directory; one sealed-table directory per reduce shard.
    #[arg(long, default_value = "out")]
    out: PathBuf,

    /// Number of worker threads to use. More threads lead to higher memory
    /// usage.
    #[arg(short = 'j', long = "num_go_routines", default_value_t = default_workers())]
    num_go_routines: usize,

    /// The estimated size of each map file output, in MiB. Increasing this
    /// increases memory usage.
    #[arg(long = "mapoutput_mb", default_value_t = 64)]
    mapoutput_mb: u64,

    /// Address of the uid-allocation service.
    #[arg(short = 'z', long, default_value = "localhost:5080")]
    zero: String,

    /// Address to serve http (pprof) on.
    #[arg(long, default_value = "localhost:8080")]
    http: String,

    /// Ignore line parsing errors in rdf files.
    #[arg(long = "ignore_errors", default_value_t = true, action = ArgAction::Set)]
    ignore_errors: bool,

    /// Output details to debug.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Ignore uids in load files and assign new ones.
    #[arg(long = "new_uids", action = ArgAction::SetTrue)]
    new_uids: bool,

    /// Weight map shards by their schema index kinds when packing reducers.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    weighted: bool,

    /// Number of map output shards. Must be greater than or equal to the
    /// number of reduce shards. Increasing allows more evenly sized reduce
    /// shards, at the expense of increased memory usage.
    #[arg(long = "map_shards", default_value_t = 1)]
    map_shards: usize,

    /// Number of reduce shards. This determines the number of store
    /// instances in the final cluster. Increasing this potentially
    /// decreases the reduce stage runtime by using more parallelism, but
    /// increases memory usage.
    #[arg(long = "reduce_shards", default_value_t = 1)]
    reduce_shards: usize,

    /// Number of shards in the uid interning map.
    #[arg(long = "xid_shards", default_value_t = 32)]
    xid_shards: usize,

    /// Number of concurrent input file readers.
    #[arg(long = "chunkers", default_value_t = 1)]
    chunkers: usize,
}

impl ShardArgs {
    fn into_options(self) -> Options {
        Options {
            data_files: self.files,
            data_format: self.format,
            schema_file: PathBuf::from(self.schema),
            tmp_dir: self.tmp,
            out_dir: self.out,
            num_go_routines: self.num_go_routines,
            map_buf_size: self.mapoutput_mb << 20,
            http_addr: self.http,
            ignore_errors: self.ignore_errors,
            verbose: self.verbose,
            zero_addr: self.zero,
            new_uids: self.new_uids,
            weighted: self.weighted,
            map_shards: self.map_shards,
            reduce_shards: self.reduce_shards,
            xid_shards: self.xid_shards,
            num_chunkers: self.chunkers,
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose {
        "quadshard=debug,quadshard_bulk=debug"
    } else {
        "quadshard=info,quadshard_bulk=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact());
    let _ = tracing::dispatcher::set_global_default(tracing::Dispatch::new(subscriber));
}

fn run_shard(args: ShardArgs) -> Result<(), BulkError> {
    let opt = args.into_options();
    opt.validate()?;

    match serde_json::to_string_pretty(&opt) {
        Ok(json) => info!("{json}"),
        Err(e) => debug!("could not render config: {e}"),
    }
    debug!(
        "profiling endpoint not served in this build (requested {})",
        opt.http_addr
    );

    let zero = ZeroClient::connect(&opt.zero_addr).map_err(|e| {
        BulkError::Config(format!(
            "unable to connect to zero at {}, is it running? {e}",
            opt.zero_addr
        ))
    })?;

    let mut loader = Loader::new(opt, Arc::new(zero))?;
    loader.map_stage()?;
    loader.shuffle_stage()?;
    loader.reduce_stage()?;
    loader.cleanup();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Shard(args) => {
            init_logging(args.verbose);
            if let Err(e) = run_shard(args) {
                match &e {
                    BulkError::Config(msg) => eprintln!("{msg}"),
                    other => error!("{other}"),
                }
                std::process::exit(1);
            }
        }
    }
}
