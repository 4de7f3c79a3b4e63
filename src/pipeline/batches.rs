// src/pipeline/batches.rs
use crate::dart::models::{FetchKey, StatementRow};
use crate::storage::read_rows;
use crate::utils::error::StorageError;
use std::collections::HashSet;
use std::path::PathBuf;

/// Splits companies into contiguous teams of `chunk_size`, numbered from 1,
/// keeping input order. Callers sort first (by stock code) so membership is
/// stable between runs. A `chunk_size` of 0 yields no teams.
pub fn split(corp_codes: &[String], chunk_size: usize) -> Vec<(usize, Vec<String>)> {
    if chunk_size == 0 {
        return Vec::new();
    }
    corp_codes
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| (i + 1, chunk.to_vec()))
        .collect()
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub rows: Vec<StatementRow>,
    pub files: usize,
    /// Rows dropped because their FetchKey came from an earlier file.
    pub duplicates_dropped: usize,
}

/// Concatenates tables in the given order.
///
/// With `dedup`, the first table that contains a FetchKey owns it: rows for
/// that key in later tables are dropped. Several rows of one key inside a
/// single table are all kept (one key is many line items).
pub fn merge_tables<I>(tables: I, dedup: bool) -> MergeOutcome
where
    I: IntoIterator<Item = Vec<StatementRow>>,
{
    let mut outcome = MergeOutcome::default();
    let mut taken: HashSet<FetchKey> = HashSet::new();

    for table in tables {
        outcome.files += 1;
        let mut owned_here: HashSet<FetchKey> = HashSet::new();
        for row in table {
            if dedup {
                let key = row.key();
                if taken.contains(&key) {
                    outcome.duplicates_dropped += 1;
                    continue;
                }
                owned_here.insert(key);
            }
            outcome.rows.push(row);
        }
        taken.extend(owned_here);
    }
    outcome
}

/// Reads the listed team files in file-name order and merges them.
pub fn merge(paths: &[PathBuf], dedup: bool) -> Result<MergeOutcome, StorageError> {
    let mut sorted = paths.to_vec();
    sorted.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut tables = Vec::with_capacity(sorted.len());
    for path in &sorted {
        let rows = read_rows(path)?;
        tracing::info!("Loaded {} rows from {}", rows.len(), path.display());
        tables.push(rows);
    }

    let outcome = merge_tables(tables, dedup);
    if outcome.duplicates_dropped > 0 {
        tracing::warn!(
            "Dropped {} rows whose keys were already merged from an earlier file",
            outcome.duplicates_dropped
        );
    }
    Ok(outcome)
}
