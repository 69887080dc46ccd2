//! Per-model rate-limit cooldowns.
//!
//! Any upstream 429 marks the model cooling for a fixed window. Entries are
//! logically absent once expired; readers prune lazily.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
	inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_rate_limited(&self, model: &str, cooldown: Duration) {
		let mut map = self.inner.lock().expect("rate limit lock");
		map.insert(model.to_string(), Instant::now() + cooldown);
	}

	pub fn is_rate_limited(&self, model: &str) -> bool {
		let mut map = self.inner.lock().expect("rate limit lock");
		let now = Instant::now();
		map.retain(|_, expires| *expires > now);
		map.contains_key(model)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn marked_model_is_limited_until_expiry() {
		let rl = RateLimiter::new();
		assert!(!rl.is_rate_limited("m"));
		rl.mark_rate_limited("m", Duration::from_secs(60));
		assert!(rl.is_rate_limited("m"));
		assert!(!rl.is_rate_limited("other"));
	}

	#[test]
	fn expired_entries_are_pruned_lazily() {
		let rl = RateLimiter::new();
		rl.mark_rate_limited("m", Duration::ZERO);
		assert!(!rl.is_rate_limited("m"));
	}

	#[test]
	fn remark_extends_the_cooldown() {
		let rl = RateLimiter::new();
		rl.mark_rate_limited("m", Duration::ZERO);
		rl.mark_rate_limited("m", Duration::from_secs(60));
		assert!(rl.is_rate_limited("m"));
	}
}
