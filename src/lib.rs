pub mod assembler;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod engine;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod parser;
pub mod producer;
pub mod server;
pub mod status;
pub mod transport;
pub mod types;

pub use types::*;

pub use config::{Cli, EngineConfig, ProducerConfig};
pub use engine::{AnswerEngine, AnswerStream};
pub use server::{router, AppState};
pub use transport::{HttpTransport, Transport, TransportResponse};
