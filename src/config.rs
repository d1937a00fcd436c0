use crate::constants::{
    DEFAULT_FALLBACK_DEADLINE, DEFAULT_REQUEST_DEADLINE, EVENT_CHANNEL_CAPACITY,
    FALLBACK_WORD_DELAY_MS, MAX_LINE_LENGTH, REAL_WORD_DELAY_MS,
};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the streaming answer route.
    Serve(ServeArgs),
    /// Ask a running server and print the assembled answer.
    Ask(AskArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Answer backend. Without one every request is served by the fallback.
    #[arg(long, env = "CITEFLOW_UPSTREAM_URL")]
    pub upstream_url: Option<String>,
    #[arg(long, default_value_t = 30)]
    pub upstream_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = REAL_WORD_DELAY_MS)]
    pub real_word_delay_ms: u64,
    #[arg(long, default_value_t = FALLBACK_WORD_DELAY_MS)]
    pub fallback_word_delay_ms: u64,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 30)]
    pub circuit_recovery_secs: u64,
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_body_size: usize,
}

impl ServeArgs {
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            real_word_delay: Duration::from_millis(self.real_word_delay_ms),
            fallback_word_delay: Duration::from_millis(self.fallback_word_delay_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    pub query: String,
    #[arg(long, default_value = "http://127.0.0.1:8080/api/answer")]
    pub url: String,
    #[arg(long)]
    pub mode: Option<String>,
    #[arg(long)]
    pub session_id: Option<String>,
    #[arg(long)]
    pub thread_id: Option<String>,
    #[arg(long, default_value_t = DEFAULT_REQUEST_DEADLINE.as_secs())]
    pub deadline_secs: u64,
    #[arg(long, default_value_t = DEFAULT_FALLBACK_DEADLINE.as_secs())]
    pub fallback_deadline_secs: u64,
    /// Print the final result as JSON instead of the rendered text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl AskArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            request_deadline: Duration::from_secs(self.deadline_secs),
            fallback_deadline: Duration::from_secs(self.fallback_deadline_secs),
            ..EngineConfig::default()
        }
    }
}

/// Consumer-side limits for one request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub request_deadline: Duration,
    pub fallback_deadline: Duration,
    pub max_line_length: usize,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_deadline: DEFAULT_REQUEST_DEADLINE,
            fallback_deadline: DEFAULT_FALLBACK_DEADLINE,
            max_line_length: MAX_LINE_LENGTH,
            event_buffer: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Per-word pacing. The two paths keep separate delays.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub real_word_delay: Duration,
    pub fallback_word_delay: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            real_word_delay: Duration::from_millis(REAL_WORD_DELAY_MS),
            fallback_word_delay: Duration::from_millis(FALLBACK_WORD_DELAY_MS),
        }
    }
}
