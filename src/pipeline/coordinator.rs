// src/pipeline/coordinator.rs
use crate::dart::client::StatementSource;
use crate::dart::models::{Division, FetchKey, StatementRow};
use crate::storage::{KeyOutcome, ProgressLedger};
use crate::utils::error::{AppError, DartError};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::Semaphore;

const PROGRESS_EVERY: usize = 100;

/// How the division dimension of the key space is worked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivisionStrategy {
    /// One request per FetchKey; every division is fetched.
    EachDivision,
    /// One work item per company/year; divisions are tried in order and the
    /// first one with rows wins.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Requests in flight at once.
    pub workers: usize,
    /// Work items scheduled together; also the checkpoint granularity.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    pub divisions: Vec<Division>,
    pub strategy: DivisionStrategy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            batch_size: 50,
            batch_delay: Duration::from_secs(1),
            divisions: Division::ALL.to_vec(),
            strategy: DivisionStrategy::EachDivision,
        }
    }
}

/// Counters for one run, in work items.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub total: usize,
    /// Already complete in the ledger when the run started.
    pub skipped: usize,
    pub completed: usize,
    pub with_data: usize,
    pub empty: usize,
    pub failed: usize,
    pub new_rows: usize,
    pub batches_total: usize,
    pub batches_run: usize,
}

#[derive(Debug)]
pub struct RunReport {
    /// Rows from earlier runs followed by rows fetched in this one.
    pub rows: Vec<StatementRow>,
    pub stats: RunStats,
    /// Set when a quota condition stopped the run.
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone)]
struct WorkItem {
    corp_code: String,
    year: u16,
    divisions: Vec<Division>,
}

impl WorkItem {
    fn keys(&self) -> impl Iterator<Item = FetchKey> + '_ {
        self.divisions
            .iter()
            .map(move |d| FetchKey::new(self.corp_code.clone(), self.year, *d))
    }
}

/// Drives a [`StatementSource`] over company × year × division with bounded
/// concurrency, persisting progress to a [`ProgressLedger`] as it goes.
pub struct BulkCoordinator<S> {
    source: S,
    ledger: ProgressLedger,
    config: CoordinatorConfig,
    stats: RunStats,
    stop: Option<String>,
}

impl<S: StatementSource> BulkCoordinator<S> {
    pub fn new(source: S, ledger: ProgressLedger, mut config: CoordinatorConfig) -> Self {
        if config.divisions.is_empty() {
            config.divisions = Division::ALL.to_vec();
        }
        config.workers = config.workers.max(1);
        config.batch_size = config.batch_size.max(1);
        Self {
            source,
            ledger,
            config,
            stats: RunStats::default(),
            stop: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Work items not yet in the ledger, company-major.
    fn plan(&self, companies: &[String], years: &RangeInclusive<u16>) -> (Vec<WorkItem>, usize, usize) {
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut total = 0;
        let mut skipped = 0;

        for corp_code in companies.iter().filter(|c| seen.insert(c.as_str())) {
            for year in years.clone() {
                let items: Vec<WorkItem> = match self.config.strategy {
                    DivisionStrategy::EachDivision => self
                        .config
                        .divisions
                        .iter()
                        .map(|d| WorkItem { corp_code: corp_code.clone(), year, divisions: vec![*d] })
                        .collect(),
                    DivisionStrategy::Fallback => vec![WorkItem {
                        corp_code: corp_code.clone(),
                        year,
                        divisions: self.config.divisions.clone(),
                    }],
                };
                for item in items {
                    total += 1;
                    if item.keys().all(|k| self.ledger.contains(&k)) {
                        skipped += 1;
                    } else {
                        pending.push(item);
                    }
                }
            }
        }
        (pending, total, skipped)
    }

    /// Runs every pending item. A quota error stops the run after the current
    /// batch; the report then carries `stop_reason`.
    pub async fn run(&mut self, companies: &[String], years: RangeInclusive<u16>) -> Result<RunReport, AppError> {
        self.stats = RunStats::default();
        self.stop = None;

        let (pending, total, skipped) = self.plan(companies, &years);
        let batch_count = pending.len().div_ceil(self.config.batch_size);
        self.stats.total = total;
        self.stats.skipped = skipped;
        self.stats.batches_total = batch_count;

        tracing::info!(
            "🚀 {} work items ({} already done, {} pending) in {} batches, {} workers",
            total,
            skipped,
            pending.len(),
            batch_count,
            self.config.workers
        );

        let semaphore = Semaphore::new(self.config.workers);
        let mut new_rows = Vec::new();

        for (index, batch) in pending.chunks(self.config.batch_size).enumerate() {
            if self.stop.is_some() {
                break;
            }

            self.run_batch(batch, &semaphore, &mut new_rows).await?;
            self.stats.batches_run += 1;
            tracing::info!(
                "Batch {}/{} done: {}/{} items, {} with data, {} empty, {} failed",
                index + 1,
                batch_count,
                self.stats.completed,
                pending.len(),
                self.stats.with_data,
                self.stats.empty,
                self.stats.failed
            );

            if self.stop.is_some() {
                break;
            }
            if index + 1 < batch_count && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        match &self.stop {
            Some(reason) => tracing::error!(
                "🛑 Run stopped after {}/{} batches: {}",
                self.stats.batches_run,
                batch_count,
                reason
            ),
            None => tracing::info!(
                "✅ Run complete: {} items, {} new rows",
                self.stats.completed,
                self.stats.new_rows
            ),
        }

        let mut rows = self.ledger.prior_rows().to_vec();
        rows.extend(new_rows);
        Ok(RunReport {
            rows,
            stats: self.stats.clone(),
            stop_reason: self.stop.clone(),
        })
    }

    async fn run_batch(
        &mut self,
        batch: &[WorkItem],
        semaphore: &Semaphore,
        new_rows: &mut Vec<StatementRow>,
    ) -> Result<(), AppError> {
        let source = &self.source;
        let mut in_flight: FuturesUnordered<_> = batch
            .iter()
            .map(|item| async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => {
                        source
                            .fetch_with_fallback(&item.corp_code, item.year, &item.divisions)
                            .await
                    }
                    Err(_) => Err(DartError::Cancelled),
                };
                (item, result)
            })
            .collect();

        while let Some((item, result)) = in_flight.next().await {
            match result {
                Err(e) if e.is_fatal() => {
                    tracing::error!("Quota condition at {}/{}: {}", item.corp_code, item.year, e);
                    self.stop = Some(e.to_string());
                    break;
                }
                Ok(rows) if rows.is_empty() => {
                    for key in item.keys() {
                        self.ledger.mark_complete(key, KeyOutcome::Empty, 0)?;
                    }
                    self.stats.empty += 1;
                }
                Ok(rows) if self.ledger.contains(&rows[0].key()) => {
                    // Rows for this key are already stored; only the other
                    // division keys of a fallback item still need marking.
                    tracing::debug!("{} already stored, not recording again", rows[0].key());
                    for key in item.keys() {
                        self.ledger.mark_complete(key, KeyOutcome::Empty, 0)?;
                    }
                    self.stats.with_data += 1;
                }
                Ok(rows) => {
                    self.ledger.record_rows(&rows)?;
                    let winner = rows[0].fs_div;
                    for key in item.keys() {
                        if key.fs_div == winner {
                            self.ledger.mark_complete(key, KeyOutcome::Data, rows.len())?;
                        } else {
                            self.ledger.mark_complete(key, KeyOutcome::Empty, 0)?;
                        }
                    }
                    tracing::debug!("{}/{} {}: {} rows", item.corp_code, item.year, winner, rows.len());
                    self.stats.with_data += 1;
                    self.stats.new_rows += rows.len();
                    new_rows.extend(rows);
                }
                Err(e) => {
                    tracing::warn!("{}/{} failed: {}", item.corp_code, item.year, e);
                    for key in item.keys() {
                        self.ledger.mark_complete(key, KeyOutcome::Failed, 0)?;
                    }
                    self.stats.failed += 1;
                }
            }

            self.stats.completed += 1;
            if self.stats.completed % PROGRESS_EVERY == 0 {
                tracing::info!("Progress: {} items completed", self.stats.completed);
            }
        }

        if !in_flight.is_empty() {
            tracing::warn!("Cancelling {} in-flight requests", in_flight.len());
        }
        Ok(())
    }
}
