//! Cost-optimizing reverse proxy for LLM chat APIs.
//!
//! Sits between a client and a pool of LLM providers. Each request is scored
//! for complexity, routed to the cheapest capable model, dispatched with the
//! provider's native wire protocol, and streamed back in the dialect the
//! client spoke, with token usage accounted along the way.

pub mod classify;
pub mod config;
pub mod llm;
pub mod overrides;
pub mod parse;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod route;
pub mod store;
pub mod telemetry;

pub use config::{Config, Mode};
pub use llm::{ProviderTag, ProxyError};
pub use registry::ModelRegistry;
