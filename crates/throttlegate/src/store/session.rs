//! Per-session model pinning.
//!
//! A session pin is a (model, tier) binding for a client-supplied session id.
//! Pins only ever move up the simple < standard < complex order; a later
//! lower-tier decision keeps the existing pin. Entries expire after an idle
//! timeout, lazily on read and via a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::classify::Tier;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct SessionEntry {
	model: String,
	tier: Tier,
	last_used: Instant,
	last_failed: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
	inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
	idle_timeout: Duration,
}

impl Default for SessionStore {
	fn default() -> Self {
		Self::new(DEFAULT_IDLE_TIMEOUT)
	}
}

impl SessionStore {
	pub fn new(idle_timeout: Duration) -> Self {
		SessionStore {
			inner: Arc::new(Mutex::new(HashMap::new())),
			idle_timeout,
		}
	}

	pub fn get(&self, id: &str) -> Option<(String, Tier)> {
		let mut map = self.inner.lock().expect("session lock");
		match map.get(id) {
			Some(e) if e.last_used.elapsed() >= self.idle_timeout => {
				map.remove(id);
				None
			},
			Some(e) => Some((e.model.clone(), e.tier)),
			None => None,
		}
	}

	/// Create or upgrade a pin. A strictly higher tier replaces model and
	/// tier; equal or lower keeps the existing pin. Returns the effective
	/// (model, tier) after the call.
	pub fn set(&self, id: &str, model: &str, tier: Tier) -> (String, Tier) {
		let mut map = self.inner.lock().expect("session lock");
		let now = Instant::now();
		let entry = map
			.entry(id.to_string())
			.and_modify(|e| {
				if e.last_used.elapsed() >= self.idle_timeout {
					e.model = model.to_string();
					e.tier = tier;
					e.last_failed = None;
				} else if tier > e.tier {
					e.model = model.to_string();
					e.tier = tier;
				}
				e.last_used = now;
			})
			.or_insert_with(|| SessionEntry {
				model: model.to_string(),
				tier,
				last_used: now,
				last_failed: None,
			});
		(entry.model.clone(), entry.tier)
	}

	pub fn mark_failed(&self, id: &str) {
		let mut map = self.inner.lock().expect("session lock");
		if let Some(e) = map.get_mut(id) {
			e.last_failed = Some(Instant::now());
		}
	}

	/// One-shot: reports whether the session failed within `window` and
	/// clears the marker so the escalation fires exactly once.
	pub fn take_recent_failure(&self, id: &str, window: Duration) -> bool {
		let mut map = self.inner.lock().expect("session lock");
		let Some(e) = map.get_mut(id) else {
			return false;
		};
		match e.last_failed.take() {
			Some(at) if at.elapsed() < window => true,
			_ => false,
		}
	}

	pub fn sweep(&self) {
		let mut map = self.inner.lock().expect("session lock");
		map.retain(|_, e| e.last_used.elapsed() < self.idle_timeout);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("session lock").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Periodic eviction. The returned handle is aborted on shutdown, so the
	/// sweeper never keeps the process alive.
	pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
		let store = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(SWEEP_INTERVAL);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tick.tick().await;
				store.sweep();
			}
		})
	}
}
