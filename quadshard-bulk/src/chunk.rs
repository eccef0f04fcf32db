//! Input readers and line-aligned chunking.
//!
//! A chunk is up to [`MAX_CHUNK_LINES`] newline-terminated lines in one byte
//! buffer; no record is ever split across chunks. Gzip input is detected by
//! the `.gz` suffix first, then by sniffing the stream's first bytes, so
//! compressed files work regardless of their name. `-` reads stdin.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::bufread::MultiGzDecoder;

use crate::error::{BulkError, Result};

/// Lines per chunk.
pub const MAX_CHUNK_LINES: usize = 100_000;

/// How many bytes to sniff for the gzip magic.
const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Unknown,
    Rdf,
    Json,
}

/// Data format of a file, from the user-provided override or the filename.
/// The extension has precedence; a `.gz` suffix is stripped first.
pub fn data_format(filename: &str, format: &str) -> InputFormat {
    let format = format.to_lowercase();
    let name = filename.to_lowercase();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    if name.ends_with(".rdf") || format == "rdf" {
        InputFormat::Rdf
    } else if name.ends_with(".json") || format == "json" {
        InputFormat::Json
    } else {
        InputFormat::Unknown
    }
}

const DATA_SUFFIXES: [&str; 4] = [".rdf", ".rdf.gz", ".json", ".json.gz"];

/// Expand the comma-separated `--files` value: plain files pass through,
/// directories are walked for known data suffixes. Sorted for determinism.
pub fn find_data_files(spec: &str) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if part == "-" {
            files.push(part.to_string());
            continue;
        }
        let path = Path::new(part);
        if path.is_dir() {
            walk_data_files(path, &mut files)?;
        } else {
            files.push(part.to_string());
        }
    }
    files.sort();
    Ok(files)
}

fn walk_data_files(dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_data_files(&path, out)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if DATA_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                out.push(path.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

/// Open `file` for reading, transparently decompressing gzip. Detection is
/// by `.gz` suffix first, then by content sniffing.
pub fn file_reader(file: &str) -> Result<Box<dyn BufRead + Send>> {
    if file == "-" {
        return wrap_sniffed(BufReader::new(std::io::stdin()));
    }
    let f = File::open(file)?;
    if Path::new(file).extension().is_some_and(|e| e == "gz") {
        return Ok(Box::new(BufReader::new(MultiGzDecoder::new(
            BufReader::new(f),
        ))));
    }
    wrap_sniffed(BufReader::with_capacity(SNIFF_LEN.max(64 * 1024), f))
}

fn wrap_sniffed<R: Read + Send + 'static>(
    mut reader: BufReader<R>,
) -> Result<Box<dyn BufRead + Send>> {
    let head = reader.fill_buf()?;
    if head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Variation point between input formats: how raw bytes become line-aligned
/// chunks. The reduce phase only ever sees map entries, never text.
pub trait Chunker: Send {
    /// Read the next chunk. Returns the buffer (possibly empty) and whether
    /// EOF was reached. Fails only on non-EOF I/O errors, which are fatal.
    fn next_chunk(&mut self, reader: &mut dyn BufRead) -> Result<(Vec<u8>, bool)>;
}

pub struct RdfChunker;

impl Chunker for RdfChunker {
    fn next_chunk(&mut self, reader: &mut dyn BufRead) -> Result<(Vec<u8>, bool)> {
        let mut batch = Vec::with_capacity(1 << 20);
        for _ in 0..MAX_CHUNK_LINES {
            let n = reader.read_until(b'\n', &mut batch)?;
            if n == 0 {
                return Ok((batch, true));
            }
            // read_until stops at EOF as well as at the delimiter; a line
            // without its newline means the input is exhausted.
            if batch.last() != Some(&b'\n') {
                return Ok((batch, true));
            }
        }
        Ok((batch, false))
    }
}

/// Chunker for `format`. The pipeline parses N-Quads only; JSON is
/// recognized by [`data_format`] but refused here.
pub fn new_chunker(format: InputFormat) -> Result<Box<dyn Chunker>> {
    match format {
        InputFormat::Rdf => Ok(Box::new(RdfChunker)),
        InputFormat::Json => Err(BulkError::Config(
            "JSON input is not supported; re-export the data as N-Quads".into(),
        )),
        InputFormat::Unknown => Err(BulkError::Config("unknown input format".into())),
    }
}
