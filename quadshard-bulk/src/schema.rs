//! Schema file model.
//!
//! One declaration per line, `predicate: <type and index kinds> .`.
//! Predicates are keyed in their angle-bracketed data form (`<name>`). The
//! store is read-mostly: the single reduce-time mutation is the list upgrade
//! for uid predicates observed with more than one object.

use std::path::Path;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::Result;

/// The predicate that carries type metadata; its reduce shard is recorded in
/// the `dgraph_type` marker file at shuffle time.
pub const TYPE_PREDICATE: &str = "<dgraph.type>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Default,
    Uid,
    String,
    Int,
    Float,
    Bool,
    DateTime,
    Geo,
}

fn parse_value_type(token: &str) -> ValueType {
    match token {
        "uid" => ValueType::Uid,
        "string" => ValueType::String,
        "int" => ValueType::Int,
        "float" => ValueType::Float,
        "bool" => ValueType::Bool,
        "datetime" | "dateTime" => ValueType::DateTime,
        "geo" => ValueType::Geo,
        _ => ValueType::Default,
    }
}

#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub value_type: ValueType,
    pub list: bool,
    /// The declaration line, verbatim, for redistribution at shuffle time.
    pub raw: String,
}

/// Shuffle cost weight of a schema declaration: 1 plus a contribution per
/// index kind present. Non-decreasing as index kinds accumulate.
pub fn index_weight(schema_line: &str) -> i64 {
    let mut weight = 1i64;
    if schema_line.contains("hash") {
        weight += 1;
    }
    if schema_line.contains("exact") {
        weight += 2;
    }
    if schema_line.contains("term") {
        weight += 3;
    }
    if schema_line.contains("fulltext") {
        weight += 4;
    }
    if schema_line.contains("trigram") {
        weight += 5;
    }
    weight
}

pub struct SchemaStore {
    entries: RwLock<FxHashMap<String, SchemaEntry>>,
}

impl SchemaStore {
    /// Parse a schema file. Blank lines and `#` comments are skipped; a line
    /// without a `:` is skipped as well (it cannot name a predicate).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = FxHashMap::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((pred, decl)) = trimmed.split_once(':') else {
                continue;
            };
            let pred = format!("<{}>", pred.trim());
            let decl = decl.trim();
            let list = decl.starts_with('[');
            let type_token = decl
                .trim_start_matches('[')
                .split(|c: char| c == ']' || c.is_whitespace())
                .next()
                .unwrap_or("");
            entries.insert(
                pred,
                SchemaEntry {
                    value_type: parse_value_type(type_token),
                    list,
                    raw: line.to_string(),
                },
            );
        }
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, predicate: &str) -> Option<SchemaEntry> {
        self.entries.read().get(predicate).cloned()
    }

    /// Reduce-time upgrade: force the predicate to be a list.
    pub fn set_as_list(&self, predicate: &str) {
        if let Some(entry) = self.entries.write().get_mut(predicate) {
            entry.list = true;
        }
    }

    /// All declarations as (predicate, raw line), sorted by predicate so
    /// shuffle-time distribution is deterministic.
    pub fn raw_lines(&self) -> Vec<(String, String)> {
        let mut lines: Vec<(String, String)> = self
            .entries
            .read()
            .iter()
            .map(|(pred, entry)| (pred.clone(), entry.raw.clone()))
            .collect();
        lines.sort();
        lines
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
