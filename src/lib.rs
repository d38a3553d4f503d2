//! Cost-optimizing reverse proxy for OpenAI- and Anthropic-compatible LLM
//! providers. Routes each request to a provider selected by configured rules,
//! fails over across candidates, streams responses through, and records
//! per-attempt usage.

pub mod config;
mod error;
pub mod gateway;
pub mod rule;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{ForwardError, GatewayError, Result};
pub use gateway::Gateway;
