pub mod config;
pub mod events;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod reaper;
