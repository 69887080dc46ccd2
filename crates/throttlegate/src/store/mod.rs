//! Process-lifetime in-memory state: session pins, the dedup cache, per-model
//! rate-limit cooldowns, and Anthropic dual-key cooldowns. Each store carries
//! its own lock; callers never hold two store locks at once.

pub mod dedup;
pub mod dualkey;
pub mod ratelimit;
pub mod session;

pub use dedup::DedupCache;
pub use dualkey::DualKeyState;
pub use ratelimit::RateLimiter;
pub use session::SessionStore;
