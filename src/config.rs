// src/config.rs
use crate::dart::client::DART_API_BASE;
use crate::utils::AppError;
use std::ops::RangeInclusive;

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Calls per window; DART allows 1000 a minute, this keeps a margin.
pub const DEFAULT_RATE_LIMIT: usize = 800;
pub const DEFAULT_RATE_PERIOD_SECS: u64 = 60;
pub const DEFAULT_START_YEAR: u16 = 2015;
pub const DEFAULT_END_YEAR: u16 = 2022;

/// Credentials and endpoint, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub api_key: String,
    pub base_url: String,
}

impl ApiSettings {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok(); // Load .env file if it exists
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("DART_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Config("DART_API_KEY environment variable required".to_string()))?;
        let base_url = lookup("DART_BASE_URL")
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DART_API_BASE.to_string());
        Ok(Self { api_key, base_url })
    }

    /// Key prefix safe to print in logs.
    pub fn masked_key(&self) -> String {
        let prefix: String = self.api_key.chars().take(6).collect();
        format!("{}...", prefix)
    }
}

pub fn year_range(start: u16, end: u16) -> Result<RangeInclusive<u16>, AppError> {
    if start > end {
        return Err(AppError::Config(format!("start year {} is after end year {}", start, end)));
    }
    Ok(start..=end)
}

/// Turns the team flags into an inclusive range of 1-based team numbers.
pub fn resolve_teams(
    team: Option<usize>,
    start_team: Option<usize>,
    end_team: Option<usize>,
    total_teams: usize,
) -> Result<RangeInclusive<usize>, AppError> {
    if total_teams == 0 {
        return Err(AppError::Config("No eligible companies to split into teams".to_string()));
    }
    let range = match (team, start_team) {
        (Some(team), _) => team..=team,
        (None, Some(start)) => start..=end_team.unwrap_or(total_teams).min(total_teams),
        (None, None) => {
            return Err(AppError::Config(
                "Specify --team, --start-team, --list-teams or --merge-only".to_string(),
            ))
        }
    };
    if *range.start() == 0 || *range.start() > total_teams || range.start() > range.end() {
        return Err(AppError::Config(format!(
            "Team range {}~{} is outside the available teams (1 ~ {})",
            range.start(),
            range.end(),
            total_teams
        )));
    }
    Ok(range)
}
