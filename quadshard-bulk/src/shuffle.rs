//! Shuffle planner: assign map shards to reduce shards.
//!
//! After the map phase drains, every map-shard directory is costed — by raw
//! on-disk size, or by size × schema index weight — and greedily bin-packed:
//! largest remaining map shard into the currently smallest reduce shard,
//! ties to the lowest index. Placement *renames* the directory under its
//! reduce shard, so the shuffle moves no data. Schema declarations follow
//! the same assignment; predicates absent from the data are round-robined so
//! their declarations still land somewhere.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{BulkError, Result};
use crate::loader::LoaderState;
use crate::schema::{index_weight, TYPE_PREDICATE};

pub const MAP_SHARD_DIR: &str = "map_shards";
pub const REDUCE_SHARD_DIR: &str = "reduce_shards";
/// Marker file recording which reduce shard received the type-metadata
/// predicate.
pub const TYPE_MARKER_FILE: &str = "dgraph_type";

#[derive(Debug, Clone)]
struct SizedDir {
    dir: PathBuf,
    size: i64,
}

/// Immediate children of `dir`, sorted; empty when `dir` does not exist.
pub fn read_shard_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    shards.sort();
    Ok(shards)
}

/// Total byte size of every file under `dir`.
pub fn tree_size(dir: &Path) -> Result<i64> {
    let mut sum = 0i64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            sum += tree_size(&entry.path())?;
        } else {
            sum += meta.len() as i64;
        }
    }
    Ok(sum)
}

/// Every `.gz` spill file under `dir`, recursively, sorted.
pub fn filenames_in_tree(dir: &Path) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, out)?;
            } else if path.to_string_lossy().ends_with(".gz") {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn uniform_costs(map_shard_root: &Path) -> Result<Vec<SizedDir>> {
    let mut sized = Vec::new();
    for dir in read_shard_dirs(map_shard_root)? {
        let size = tree_size(&dir)?;
        sized.push(SizedDir { dir, size });
    }
    Ok(sized)
}

/// Weighted cost: each predicate mapped to a shard contributes the shard's
/// tree size times its schema weight, so index-heavy predicates drag their
/// shard toward an emptier reducer.
fn weighted_costs(state: &LoaderState, map_shard_root: &Path) -> Result<Vec<SizedDir>> {
    let mut costs: rustc_hash::FxHashMap<PathBuf, i64> = rustc_hash::FxHashMap::default();
    for (pred, map_id) in state.shards.snapshot() {
        let dir = map_shard_root.join(format!("{map_id:03}"));
        if !dir.exists() {
            continue;
        }
        let weight = state
            .schema
            .get(&pred)
            .map(|entry| index_weight(&entry.raw))
            .unwrap_or(1);
        *costs.entry(dir.clone()).or_insert(0) += tree_size(&dir)? * weight;
    }
    let mut sized: Vec<SizedDir> = costs
        .into_iter()
        .map(|(dir, size)| SizedDir { dir, size })
        .collect();
    sized.sort_by(|a, b| a.dir.cmp(&b.dir));
    Ok(sized)
}

/// Plan and execute the shuffle. Every file error here is fatal.
pub fn merge_map_shards_into_reduce_shards(state: &LoaderState) -> Result<()> {
    let opt = &state.opt;
    let map_shard_root = opt.tmp_dir.join(MAP_SHARD_DIR);

    for (pred, shard) in state.shards.snapshot() {
        debug!("Predicate {pred} -> MapShard {shard}");
    }

    let mut shard_dirs = if opt.weighted {
        weighted_costs(state, &map_shard_root)?
    } else {
        uniform_costs(&map_shard_root)?
    };
    if shard_dirs.is_empty() {
        return Err(BulkError::Config(
            "no map shards found; possibly empty data files or wrong data format".into(),
        ));
    }

    // Largest first; stable so equal costs keep directory order.
    shard_dirs.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.dir.cmp(&b.dir)));

    let mut reduce_shards = Vec::with_capacity(opt.reduce_shards);
    let mut schema_files: rustc_hash::FxHashMap<String, BufWriter<File>> =
        rustc_hash::FxHashMap::default();
    for i in 0..opt.reduce_shards {
        let name = format!("shard_{i}");
        let shard_dir = opt.tmp_dir.join(REDUCE_SHARD_DIR).join(&name);
        std::fs::create_dir_all(&shard_dir)?;
        let schema_file = File::create(shard_dir.join("schema"))?;
        schema_files.insert(name.clone(), BufWriter::new(schema_file));
        reduce_shards.push(SizedDir {
            dir: shard_dir,
            size: 0,
        });
    }

    // Greedy LPT: place the largest remaining map shard into the reduce
    // shard with the smallest accumulated cost, lowest index on ties.
    let mut map_to_reduce: rustc_hash::FxHashMap<String, String> = rustc_hash::FxHashMap::default();
    for sized in &shard_dirs {
        let smallest = reduce_shards
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.size)
            .map(|(i, _)| i)
            .unwrap();
        let target = &mut reduce_shards[smallest];
        let dest = target.dir.join(sized.dir.file_name().unwrap());
        target.size += sized.size;
        info!(
            "MapShard {} -> ReduceShard {}",
            sized.dir.display(),
            dest.display()
        );

        let map_name = sized.dir.file_name().unwrap().to_string_lossy().into_owned();
        let reduce_name = target
            .dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        map_to_reduce.insert(map_name, reduce_name);

        std::fs::rename(&sized.dir, &dest)?;
    }

    // Schema declarations follow their predicate's shard; predicates absent
    // from the data are round-robined across reducers.
    let mut round_robin = 0usize;
    for (pred, line) in state.schema.raw_lines() {
        let reduce_name = if !state.shards.has(&pred) {
            let name = format!("shard_{}", round_robin % opt.reduce_shards);
            round_robin += 1;
            name
        } else {
            let map_id = state.shards.shard_for(&pred);
            map_to_reduce
                .get(&format!("{map_id:03}"))
                .cloned()
                .ok_or_else(|| {
                    BulkError::Config(format!(
                        "predicate {pred} maps to shard {map_id:03} which produced no spill files"
                    ))
                })?
        };
        let writer = schema_files.get_mut(&reduce_name).unwrap();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    for writer in schema_files.values_mut() {
        writer.flush()?;
    }

    // Record which reduce shard holds the type-metadata predicate.
    let type_shard = if state.shards.has(TYPE_PREDICATE) {
        let map_id = state.shards.shard_for(TYPE_PREDICATE);
        let reduce_name = map_to_reduce
            .get(&format!("{map_id:03}"))
            .cloned()
            .unwrap_or_else(|| format!("shard_{}", round_robin % opt.reduce_shards));
        reduce_name
            .strip_prefix("shard_")
            .unwrap_or(&reduce_name)
            .to_string()
    } else {
        format!("{}", round_robin % opt.reduce_shards)
    };
    let mut type_file = File::create(opt.tmp_dir.join(TYPE_MARKER_FILE))?;
    type_file.write_all(type_shard.as_bytes())?;
    type_file.write_all(b"\n")?;
    type_file.sync_all()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderState;
    use crate::options::Options;
    use crate::schema::SchemaStore;
    use crate::xid::SequentialAllocator;
    use std::sync::Arc;

    fn setup(tmp: &Path, weighted: bool, schema: &str) -> Arc<LoaderState> {
        let mut state = LoaderState::for_testing(
            Options {
                tmp_dir: tmp.to_path_buf(),
                map_shards: 2,
                reduce_shards: 2,
                weighted,
                ..Default::default()
            },
            Arc::new(SequentialAllocator::new(1)),
        );
        Arc::get_mut(&mut state).unwrap().schema = SchemaStore::parse(schema);
        state
    }

    /// Two map shards with different sizes, two predicates, one per shard.
    fn write_map_shards(tmp: &Path, size_a: usize, size_b: usize) {
        let base = tmp.join(MAP_SHARD_DIR);
        std::fs::create_dir_all(base.join("000")).unwrap();
        std::fs::create_dir_all(base.join("001")).unwrap();
        std::fs::write(base.join("000/000001.rdf.gz"), vec![0u8; size_a]).unwrap();
        std::fs::write(base.join("001/000002.rdf.gz"), vec![0u8; size_b]).unwrap();
    }

    fn reduce_children(tmp: &Path, shard: &str) -> Vec<String> {
        let dir = tmp.join(REDUCE_SHARD_DIR).join(shard);
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_uniform_packing_prefers_raw_size() {
        let tmp = std::env::temp_dir().join("quadshard_test_shuffle_uniform");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        let state = setup(&tmp, false, "a: string .\nb: string @index(trigram) .\n");
        state.shards.shard_for("<a>"); // -> map shard 0
        state.shards.shard_for("<b>"); // -> map shard 1
        write_map_shards(&tmp, 100, 50);

        merge_map_shards_into_reduce_shards(&state).unwrap();

        // Largest raw shard (000) lands in the first (empty) reduce shard.
        assert!(reduce_children(&tmp, "shard_0").contains(&"000".to_string()));
        assert!(reduce_children(&tmp, "shard_1").contains(&"001".to_string()));
        // Map shard dirs were renamed away.
        assert!(read_shard_dirs(&tmp.join(MAP_SHARD_DIR)).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_weighted_packing_prefers_index_weight() {
        let tmp = std::env::temp_dir().join("quadshard_test_shuffle_weighted");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        // Shard a: size 100, weight 1 -> cost 100.
        // Shard b: size 50, weight 1+5 -> cost 300.
        let state = setup(&tmp, true, "a: string .\nb: string @index(trigram) .\n");
        state.shards.shard_for("<a>");
        state.shards.shard_for("<b>");
        write_map_shards(&tmp, 100, 50);

        merge_map_shards_into_reduce_shards(&state).unwrap();

        assert!(reduce_children(&tmp, "shard_0").contains(&"001".to_string()));
        assert!(reduce_children(&tmp, "shard_1").contains(&"000".to_string()));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_schema_lines_follow_their_shard() {
        let tmp = std::env::temp_dir().join("quadshard_test_shuffle_schema");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        let state = setup(&tmp, false, "a: string .\nb: string .\nghost: uid .\n");
        state.shards.shard_for("<a>");
        state.shards.shard_for("<b>");
        write_map_shards(&tmp, 100, 50);

        merge_map_shards_into_reduce_shards(&state).unwrap();

        let schema_0 = std::fs::read_to_string(tmp.join(REDUCE_SHARD_DIR).join("shard_0/schema")).unwrap();
        let schema_1 = std::fs::read_to_string(tmp.join(REDUCE_SHARD_DIR).join("shard_1/schema")).unwrap();
        // Each data predicate's line appears in exactly one shard's file.
        assert_eq!(
            schema_0.contains("a: string") as u8 + schema_1.contains("a: string") as u8,
            1
        );
        assert_eq!(
            schema_0.contains("b: string") as u8 + schema_1.contains("b: string") as u8,
            1
        );
        // The dataless predicate was round-robined somewhere.
        assert_eq!(
            schema_0.contains("ghost") as u8 + schema_1.contains("ghost") as u8,
            1
        );

        // Type marker file exists and holds a shard number.
        let marker = std::fs::read_to_string(tmp.join(TYPE_MARKER_FILE)).unwrap();
        let n: usize = marker.trim().parse().unwrap();
        assert!(n < 2);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_no_map_shards_is_a_config_error() {
        let tmp = std::env::temp_dir().join("quadshard_test_shuffle_empty");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        let state = setup(&tmp, false, "a: string .\n");
        let err = merge_map_shards_into_reduce_shards(&state).unwrap_err();
        assert!(matches!(err, BulkError::Config(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
