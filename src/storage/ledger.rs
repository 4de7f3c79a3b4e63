// src/storage/ledger.rs
use crate::dart::models::{Division, FetchKey, StatementRow};
use crate::utils::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const LEDGER_FILE: &str = "ledger.csv";
pub const ROWS_FILE: &str = "rows.csv";

/// How a completed FetchKey ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOutcome {
    Data,
    Empty,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    corp_code: String,
    bsns_year: u16,
    fs_div: Division,
    outcome: KeyOutcome,
    row_count: usize,
}

/// Append-only record of completed FetchKeys plus the rows fetched for them.
///
/// `ledger.csv` has one line per completed key, `rows.csv` one line per
/// statement row. A key counts as complete if it appears in either file, so a
/// crash between writing rows and marking the key does not cause a refetch.
pub struct ProgressLedger {
    dir: PathBuf,
    completed: HashSet<FetchKey>,
    prior_rows: Vec<StatementRow>,
    entries: csv::Writer<File>,
    rows: csv::Writer<File>,
}

impl ProgressLedger {
    /// Opens (or creates) the ledger in `dir` and loads what earlier runs
    /// recorded.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let ledger_path = dir.join(LEDGER_FILE);
        let rows_path = dir.join(ROWS_FILE);

        let mut completed = HashSet::new();
        for entry in read_lenient::<LedgerEntry>(&ledger_path)? {
            completed.insert(FetchKey::new(entry.corp_code, entry.bsns_year, entry.fs_div));
        }
        let prior_rows = read_lenient::<StatementRow>(&rows_path)?;
        completed.extend(prior_rows.iter().map(StatementRow::key));

        if !completed.is_empty() {
            tracing::info!(
                "Resuming from {}: {} completed keys, {} rows",
                dir.display(),
                completed.len(),
                prior_rows.len()
            );
        }

        Ok(Self {
            entries: open_append(&ledger_path)?,
            rows: open_append(&rows_path)?,
            dir,
            completed,
            prior_rows,
        })
    }

    /// Deletes both ledger files in `dir`.
    pub fn reset<P: AsRef<Path>>(dir: P) -> Result<(), StorageError> {
        for name in [LEDGER_FILE, ROWS_FILE] {
            let path = dir.as_ref().join(name);
            if path.exists() {
                fs::remove_file(&path)?;
                tracing::info!("Removed {}", path.display());
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, key: &FetchKey) -> bool {
        self.completed.contains(key)
    }

    /// Number of completed keys.
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Rows recorded by earlier runs, in file order.
    pub fn prior_rows(&self) -> &[StatementRow] {
        &self.prior_rows
    }

    /// Appends rows to `rows.csv` and flushes.
    pub fn record_rows(&mut self, rows: &[StatementRow]) -> Result<(), StorageError> {
        for row in rows {
            self.rows.serialize(row)?;
        }
        self.rows.flush()?;
        Ok(())
    }

    /// Marks a key complete. Keys already present are not written twice.
    pub fn mark_complete(&mut self, key: FetchKey, outcome: KeyOutcome, row_count: usize) -> Result<(), StorageError> {
        if self.completed.contains(&key) {
            return Ok(());
        }
        self.entries.serialize(LedgerEntry {
            corp_code: key.corp_code.clone(),
            bsns_year: key.bsns_year,
            fs_div: key.fs_div,
            outcome,
            row_count,
        })?;
        self.entries.flush()?;
        self.completed.insert(key);
        Ok(())
    }
}

/// Reads every complete record. Bytes after the last newline are a torn
/// write from an interrupted run and are ignored; records whose field count
/// differs from the header are skipped with a warning.
fn read_lenient<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)?;
    let complete = complete_prefix(&bytes);
    if complete < bytes.len() {
        tracing::warn!(
            "Ignoring {} bytes of torn trailing record in {}",
            bytes.len() - complete,
            path.display()
        );
    }

    let mut reader = csv::ReaderBuilder::new().from_reader(&bytes[..complete]);
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let parsed = result.map_err(StorageError::from).and_then(|record| {
            if record.len() != headers.len() {
                return Err(StorageError::SerializationError(format!(
                    "expected {} fields, found {}",
                    headers.len(),
                    record.len()
                )));
            }
            Ok(record.deserialize::<T>(Some(&headers))?)
        });
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping unreadable record {} in {}: {}", i + 1, path.display(), e),
        }
    }
    Ok(records)
}

/// Length of `bytes` up to and including the last newline.
fn complete_prefix(bytes: &[u8]) -> usize {
    bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
}

/// Opens `path` for appending; cuts off a torn last line first and writes the
/// CSV header only when the file is (then) empty.
fn open_append(path: &Path) -> Result<csv::Writer<File>, StorageError> {
    let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let complete = complete_prefix(&bytes);
    if complete < bytes.len() {
        tracing::warn!("Truncating torn trailing record in {}", path.display());
        file.set_len(complete as u64)?;
    }
    Ok(csv::WriterBuilder::new().has_headers(complete == 0).from_writer(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dart::models::StatementRole;
    use std::io::Write;

    fn row(corp: &str, year: u16, div: Division, account: &str) -> StatementRow {
        StatementRow {
            corp_code: corp.into(),
            bsns_year: year,
            fs_div: div,
            sj_div: StatementRole::BalanceSheet,
            account_nm: account.into(),
            thstrm_amount: Some(1_000),
            frmtrm_amount: None,
            bfefrmtrm_amount: Some(-5),
            currency: Some("KRW".into()),
            rcept_no: None,
        }
    }

    #[test]
    fn completed_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_key = FetchKey::new("A", 2020, Division::Consolidated);
        let empty_key = FetchKey::new("A", 2020, Division::Separate);
        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            assert!(ledger.is_empty());
            let rows = vec![row("A", 2020, Division::Consolidated, "자산총계, 합계")];
            ledger.record_rows(&rows).unwrap();
            ledger.mark_complete(data_key.clone(), KeyOutcome::Data, 1).unwrap();
            ledger.mark_complete(empty_key.clone(), KeyOutcome::Empty, 0).unwrap();
            ledger.mark_complete(empty_key.clone(), KeyOutcome::Empty, 0).unwrap();
        }

        let ledger = ProgressLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains(&data_key));
        assert!(ledger.contains(&empty_key));
        assert_eq!(ledger.prior_rows().len(), 1);
        assert_eq!(ledger.prior_rows()[0].account_nm, "자산총계, 합계");

        let lines = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 3, "header plus two keys");
    }

    #[test]
    fn rows_without_ledger_entry_still_count_as_complete() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            ledger.record_rows(&[row("B", 2021, Division::Separate, "매출액")]).unwrap();
        }
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        assert!(ledger.contains(&FetchKey::new("B", 2021, Division::Separate)));
    }

    #[test]
    fn torn_tail_is_skipped_and_appends_continue() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            ledger.mark_complete(FetchKey::new("A", 2020, Division::Consolidated), KeyOutcome::Empty, 0).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(dir.path().join(LEDGER_FILE)).unwrap();
        file.write_all(b"B,2020,CF").unwrap();
        drop(file);

        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            assert_eq!(ledger.len(), 1);
            ledger.mark_complete(FetchKey::new("C", 2020, Division::Separate), KeyOutcome::Failed, 0).unwrap();
        }
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains(&FetchKey::new("C", 2020, Division::Separate)));
    }

    #[test]
    fn row_cut_inside_an_amount_is_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            ledger.record_rows(&[row("A", 2020, Division::Consolidated, "자산총계")]).unwrap();
        }
        let rows_path = dir.path().join(ROWS_FILE);
        let mut file = OpenOptions::new().append(true).open(&rows_path).unwrap();
        file.write_all("B,2020,CFS,BS,부채총계,12".as_bytes()).unwrap();
        drop(file);

        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            assert_eq!(ledger.prior_rows().len(), 1);
            assert!(!ledger.contains(&FetchKey::new("B", 2020, Division::Consolidated)));
            ledger.record_rows(&[row("C", 2020, Division::Separate, "자본총계")]).unwrap();
        }

        let ledger = ProgressLedger::open(dir.path()).unwrap();
        let accounts: Vec<&str> = ledger.prior_rows().iter().map(|r| r.account_nm.as_str()).collect();
        assert_eq!(accounts, vec!["자산총계", "자본총계"]);
        assert!(!ledger.contains(&FetchKey::new("B", 2020, Division::Consolidated)));
        assert!(!fs::read_to_string(&rows_path).unwrap().contains("부채총계"));
    }

    #[test]
    fn short_rows_are_skipped_even_when_terminated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            ledger.record_rows(&[row("A", 2020, Division::Consolidated, "자산총계")]).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(dir.path().join(ROWS_FILE)).unwrap();
        file.write_all("B,2020,CFS,BS,부채총계,12\n".as_bytes()).unwrap();
        drop(file);

        let ledger = ProgressLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.prior_rows().len(), 1);
        assert!(!ledger.contains(&FetchKey::new("B", 2020, Division::Consolidated)));
    }

    #[test]
    fn reset_removes_progress() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ProgressLedger::open(dir.path()).unwrap();
            ledger.mark_complete(FetchKey::new("A", 2020, Division::Consolidated), KeyOutcome::Empty, 0).unwrap();
        }
        ProgressLedger::reset(dir.path()).unwrap();
        assert!(ProgressLedger::open(dir.path()).unwrap().is_empty());
    }
}
