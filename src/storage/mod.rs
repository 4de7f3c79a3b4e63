// src/storage/mod.rs
pub mod ledger;

use crate::dart::models::{Division, StatementRole, StatementRow};
use crate::utils::error::StorageError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub use ledger::{KeyOutcome, ProgressLedger};

const TEAM_FILE_PREFIX: &str = "dart_statements_team_";
const MERGED_FILE: &str = "dart_statements_merged.csv";
const SPLIT_DIR: &str = "split";

/// One file per division × statement, named the way downstream tooling
/// expects.
const SPLIT_FILES: [(Division, StatementRole, &str); 4] = [
    (Division::Consolidated, StatementRole::BalanceSheet, "연결재무제표_재무상태표.csv"),
    (Division::Consolidated, StatementRole::IncomeStatement, "연결재무제표_손익계산서.csv"),
    (Division::Separate, StatementRole::BalanceSheet, "재무제표_재무상태표.csv"),
    (Division::Separate, StatementRole::IncomeStatement, "재무제표_손익계산서.csv"),
];

pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    /// Creates a new StorageManager with the specified base directory
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_path = base_dir.as_ref().to_path_buf();

        // Create the base directory if it doesn't exist
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(StorageError::IoError)?;
        }

        Ok(Self { base_dir: base_path })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Working directory holding a team's ledger, e.g. `team_07/`.
    pub fn team_dir(&self, team: usize) -> PathBuf {
        self.base_dir.join(format!("team_{:02}", team))
    }

    /// Final per-team table, e.g. `dart_statements_team_07.csv`.
    pub fn team_output_path(&self, team: usize) -> PathBuf {
        self.base_dir.join(format!("{}{:02}.csv", TEAM_FILE_PREFIX, team))
    }

    pub fn merged_output_path(&self) -> PathBuf {
        self.base_dir.join(MERGED_FILE)
    }

    pub fn split_dir(&self) -> PathBuf {
        self.base_dir.join(SPLIT_DIR)
    }

    /// Every per-team output file in the base directory, sorted by file name.
    pub fn team_output_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            let is_team_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(TEAM_FILE_PREFIX) && n.ends_with(".csv"))
                .unwrap_or(false);
            if is_team_file && path.is_file() {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Writes `rows` as a CSV table, replacing any existing file.
    pub fn save_rows(&self, path: &Path, rows: &[StatementRow]) -> Result<PathBuf, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        tracing::info!("Saved {} rows to {}", rows.len(), path.display());
        Ok(path.to_path_buf())
    }

    /// Writes `rows` into `split/`, one UTF-8 (with BOM) CSV per division and
    /// statement. Empty slices produce no file.
    pub fn save_split(&self, rows: &[StatementRow]) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.split_dir();
        fs::create_dir_all(&dir)?;

        let mut written = Vec::new();
        for (fs_div, sj_div, name) in SPLIT_FILES {
            let subset: Vec<&StatementRow> = rows
                .iter()
                .filter(|r| r.fs_div == fs_div && r.sj_div == sj_div)
                .collect();
            if subset.is_empty() {
                continue;
            }

            let path = dir.join(name);
            let mut file = File::create(&path)?;
            file.write_all("\u{feff}".as_bytes())?;
            let mut writer = csv::Writer::from_writer(file);
            for row in &subset {
                writer.serialize(row)?;
            }
            writer.flush()?;

            tracing::info!("Saved {} {} {} rows to {}", subset.len(), fs_div, sj_div.code(), path.display());
            written.push(path);
        }
        Ok(written)
    }

    /// Saves run metadata next to a table: `x.csv` gets `x.meta.json`.
    pub fn save_metadata(&self, table_path: &Path, metadata: &serde_json::Value) -> Result<PathBuf, StorageError> {
        let file_path = table_path.with_extension("meta.json");

        let metadata_str = serde_json::to_string_pretty(metadata)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        fs::write(&file_path, metadata_str).map_err(StorageError::IoError)?;

        tracing::info!("Saved metadata to {}", file_path.display());

        Ok(file_path)
    }
}

/// Reads a table written by [`StorageManager::save_rows`].
pub fn read_rows(path: &Path) -> Result<Vec<StatementRow>, StorageError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}
