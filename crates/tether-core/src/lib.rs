pub mod ask_user;
pub mod config;
pub mod context_tracker;
pub mod error_manager;
pub mod event_bus;
pub mod handler;
pub mod message_hub;
pub mod message_queue;
pub mod processing_state;
pub mod query_options;
pub mod query_runner;
pub mod runtime;
pub mod storage;

/// Consecutive qualifying failures tolerated before the invalid-request
/// circuit breaker trips.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BREAKER_COOLDOWN_MS: u64 = 300_000;

pub use ask_user::*;
pub use config::*;
pub use context_tracker::*;
pub use error_manager::*;
pub use event_bus::*;
pub use handler::*;
pub use message_hub::*;
pub use message_queue::*;
pub use processing_state::*;
pub use query_options::*;
pub use query_runner::*;
pub use runtime::*;
pub use storage::*;

/// Caps free-form text destined for events or logs.
pub fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...<truncated>", &input[..cut])
}

pub fn resolve_startup_timeout_ms() -> u64 {
    std::env::var("TETHER_STARTUP_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS)
        .clamp(1_000, 300_000)
}

pub fn resolve_breaker_threshold() -> u32 {
    std::env::var("TETHER_BREAKER_THRESHOLD")
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_BREAKER_THRESHOLD)
        .clamp(1, 10)
}

pub fn resolve_breaker_cooldown_ms() -> u64 {
    std::env::var("TETHER_BREAKER_COOLDOWN_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_BREAKER_COOLDOWN_MS)
        .clamp(10_000, 3_600_000)
}
