// src/main.rs
mod config;
mod dart;
mod pipeline;
mod storage;
mod utils;

use clap::Parser;
use dart::corp_codes::eligible_sorted;
use dart::models::Division;
use dart::{CorpCodeSource, DartClient, FetchPolicy, RateLimiter, RegistryPolicy};
use pipeline::{BulkCoordinator, CoordinatorConfig, DivisionStrategy};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{ProgressLedger, StorageManager};
use utils::AppError;

/// Command Line Interface for the DART bulk statement downloader
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Team (shard of the company list) to download, starting at 1
    #[arg(short, long)]
    team: Option<usize>,

    /// First team of a range to download one after another
    #[arg(long, conflicts_with = "team")]
    start_team: Option<usize>,

    /// Last team of the range (defaults to the last team)
    #[arg(long, requires = "start_team")]
    end_team: Option<usize>,

    /// Print the team split and exit
    #[arg(long)]
    list_teams: bool,

    /// Only merge existing team files
    #[arg(long)]
    merge_only: bool,

    /// Merge without dropping FetchKeys already taken from an earlier file
    #[arg(long)]
    keep_duplicates: bool,

    /// With --merge-only, also write one CSV per division and statement
    #[arg(long, requires = "merge_only")]
    split: bool,

    /// Concurrent requests
    #[arg(short, long, default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,

    /// Companies per team
    #[arg(long, default_value_t = config::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Work items scheduled per batch inside a team run
    #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Pause between batches, in milliseconds
    #[arg(long, default_value_t = 1000)]
    batch_delay_ms: u64,

    /// Pause between teams of a range, in seconds
    #[arg(long, default_value_t = 3)]
    team_delay_secs: u64,

    /// First fiscal year
    #[arg(long, default_value_t = config::DEFAULT_START_YEAR)]
    start_year: u16,

    /// Last fiscal year (inclusive)
    #[arg(long, default_value_t = config::DEFAULT_END_YEAR)]
    end_year: u16,

    /// Fetch separate statements only when consolidated ones are missing
    #[arg(long)]
    fallback: bool,

    /// Download the company registry even if a cache exists
    #[arg(long)]
    no_cache: bool,

    /// Delete the company registry cache and exit
    #[arg(long)]
    clear_cache: bool,

    /// Forget recorded progress for the selected teams
    #[arg(long)]
    reset_progress: bool,

    /// Output directory for ledgers and team files
    #[arg(short, long, default_value = "./data/team_downloads")]
    output_dir: String,

    /// Company registry cache file
    #[arg(long, default_value = "./data/corp_codes_cache.json")]
    cache_file: String,

    /// Maximum calls per rate window
    #[arg(long, default_value_t = config::DEFAULT_RATE_LIMIT)]
    rate_limit: usize,

    /// Length of the rate window in seconds
    #[arg(long, default_value_t = config::DEFAULT_RATE_PERIOD_SECS)]
    rate_period_secs: u64,

    /// Retries per request after the first attempt
    #[arg(long, default_value_t = 2)]
    max_retries: u32,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Setup Logging (reads RUST_LOG env var)
    utils::logging::setup_logging();

    // 2. Parse CLI Arguments
    let args = Args::parse();
    tracing::info!("Starting with args: {:?}", args);

    if args.chunk_size == 0 || args.batch_size == 0 || args.workers == 0 {
        return Err(AppError::Config("--chunk-size, --batch-size and --workers must be positive".to_string()));
    }
    let years = config::year_range(args.start_year, args.end_year)?;

    // 3. Initialize storage
    let storage = StorageManager::new(&args.output_dir)?;

    // 4. Merge-only and cache maintenance need no API key
    if args.merge_only {
        return merge_team_files(&storage, !args.keep_duplicates, args.split);
    }
    if args.clear_cache {
        if !CorpCodeSource::clear_cache(Path::new(&args.cache_file))? {
            tracing::info!("No registry cache at {}", args.cache_file);
        }
        return Ok(());
    }

    let api = config::ApiSettings::from_env()?;
    tracing::info!("Using API key {}", api.masked_key());

    // 5. Company registry, filtered and split into teams
    let corp_source = CorpCodeSource::new(&api.base_url, &api.api_key, &args.cache_file, RegistryPolicy::default())?;
    let companies = eligible_sorted(corp_source.load(args.no_cache).await?);
    tracing::info!(
        "{} eligible companies (registry cache {})",
        companies.len(),
        corp_source.cache_path().display()
    );
    let corp_codes: Vec<String> = companies.iter().map(|c| c.corp_code.clone()).collect();
    let teams = pipeline::split(&corp_codes, args.chunk_size);

    if args.list_teams {
        for (team, members) in &teams {
            let first = companies.iter().find(|c| Some(&c.corp_code) == members.first());
            tracing::info!(
                "Team {:>2}: {:>3} companies (first: {})",
                team,
                members.len(),
                first.map(|c| c.corp_name.as_str()).unwrap_or("-")
            );
        }
        tracing::info!("{} teams in total", teams.len());
        return Ok(());
    }

    let team_range = config::resolve_teams(args.team, args.start_team, args.end_team, teams.len())?;
    let is_range = team_range.start() != team_range.end();

    // 6. Shared client and coordinator settings
    let limiter = Arc::new(RateLimiter::new(args.rate_limit, Duration::from_secs(args.rate_period_secs)));
    tracing::info!("Rate limit: {} calls per {:?}", limiter.max_calls(), limiter.period());
    let policy = FetchPolicy {
        max_retries: args.max_retries,
        ..FetchPolicy::default()
    };
    let client = DartClient::new(&api.base_url, &api.api_key, limiter, policy)?;
    let coordinator_config = CoordinatorConfig {
        workers: args.workers,
        batch_size: args.batch_size,
        batch_delay: Duration::from_millis(args.batch_delay_ms),
        strategy: if args.fallback {
            DivisionStrategy::Fallback
        } else {
            DivisionStrategy::EachDivision
        },
        ..CoordinatorConfig::default()
    };

    // 7. Process each team
    let mut downloaded = 0;
    let mut skipped = 0;
    let last_team = *team_range.end();

    for team in team_range {
        let members = &teams[team - 1].1;
        let output_path = storage.team_output_path(team);

        if is_range && output_path.exists() && !args.reset_progress {
            tracing::info!("⏭️ Team {} already downloaded, skipping", team);
            skipped += 1;
            continue;
        }

        tracing::info!(
            "Team {}: {} companies, years {}~{}, about {} requests",
            team,
            members.len(),
            years.start(),
            years.end(),
            members.len() * years.len() * Division::ALL.len()
        );

        let team_dir = storage.team_dir(team);
        if args.reset_progress {
            ProgressLedger::reset(&team_dir)?;
        }
        let ledger = ProgressLedger::open(&team_dir)?;
        if !ledger.is_empty() {
            tracing::info!("Team {}: {} keys already complete", team, ledger.len());
        }
        let mut coordinator = BulkCoordinator::new(&client, ledger, coordinator_config.clone());

        let started = std::time::Instant::now();
        let report = coordinator.run(members, years.clone()).await?;

        if coordinator.is_stopped() {
            tracing::error!(
                "💥 Team {} stopped; progress is saved in {}. Rerun the same command to resume.",
                team,
                coordinator.ledger().dir().display()
            );
            return Err(AppError::Stopped(report.stop_reason.unwrap_or_default()));
        }

        if report.rows.is_empty() {
            tracing::warn!("Team {} produced no rows", team);
        }
        storage.save_rows(&output_path, &report.rows)?;
        let metadata = serde_json::json!({
            "team": team,
            "companies": members.len(),
            "start_year": years.start(),
            "end_year": years.end(),
            "rows": report.rows.len(),
            "stats": report.stats,
            "elapsed_secs": started.elapsed().as_secs_f64(),
            "completed_at": chrono::Utc::now().to_rfc3339(),
        });
        storage.save_metadata(&output_path, &metadata)?;
        tracing::info!(
            "✅ Team {} done: {} rows ({} completed, {} skipped, {} failed)",
            team,
            report.rows.len(),
            report.stats.completed,
            report.stats.skipped,
            report.stats.failed
        );
        downloaded += 1;

        if is_range && team < last_team && args.team_delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(args.team_delay_secs)).await;
        }
    }

    tracing::info!("Processing finished. Downloaded: {}, Skipped: {}", downloaded, skipped);
    Ok(())
}

fn merge_team_files(storage: &StorageManager, dedup: bool, split: bool) -> Result<(), AppError> {
    let files = storage.team_output_files()?;
    if files.is_empty() {
        return Err(AppError::Processing(format!(
            "No team files to merge in {}",
            storage.base_dir().display()
        )));
    }

    let outcome = pipeline::merge(&files, dedup)?;
    let merged_path = storage.merged_output_path();
    storage.save_rows(&merged_path, &outcome.rows)?;
    storage.save_metadata(
        &merged_path,
        &serde_json::json!({
            "files": outcome.files,
            "rows": outcome.rows.len(),
            "dedup": dedup,
            "duplicates_dropped": outcome.duplicates_dropped,
            "merged_at": chrono::Utc::now().to_rfc3339(),
        }),
    )?;
    tracing::info!("Merged {} files into {} rows", outcome.files, outcome.rows.len());

    if split {
        let written = storage.save_split(&outcome.rows)?;
        tracing::info!("Split merged rows into {} files under {}", written.len(), storage.split_dir().display());
    }
    Ok(())
}
