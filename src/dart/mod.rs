// src/dart/mod.rs
pub mod client;
pub mod corp_codes;
pub mod models;
pub mod rate_limiter;

pub use client::{DartClient, FetchPolicy, StatementSource};
pub use corp_codes::{CorpCodeSource, RegistryPolicy};
pub use rate_limiter::RateLimiter;
