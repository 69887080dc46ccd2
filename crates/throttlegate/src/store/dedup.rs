//! In-flight request deduplication and short-lived response replay.
//!
//! The cache key is content-derived: the first 16 hex chars of a SHA-256 over
//! the JSON encoding of `{system, messages}`, after stripping exactly one
//! leading `[DAY YYYY-MM-DD HH:MM TZ]` timestamp prefix from each message.
//! Multiple prefixes, or the pattern mid-message, are left untouched.
//!
//! For a given key at most one in-flight entry exists at a time, and a
//! completed entry and an in-flight entry never coexist. The producer/waiter
//! split is decided atomically under a single lock; waiters all observe the
//! producer's bytes through a watch channel resolved exactly once.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::classify::Tier;
use crate::llm::{NeutralMessage, ProviderTag};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

static TIMESTAMP_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)^\[(?:MON|TUE|WED|THU|FRI|SAT|SUN) \d{4}-\d{2}-\d{2} \d{2}:\d{2} [A-Z0-9+:/_-]+\]\s*")
		.expect("timestamp prefix regex")
});

/// A completed response ready for byte-for-byte replay, plus the routing
/// facts a replay needs for its own log entry.
#[derive(Debug, Clone)]
pub struct CachedResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Bytes,
	pub info: ReplayInfo,
}

#[derive(Debug, Clone)]
pub struct ReplayInfo {
	pub model: String,
	pub provider: ProviderTag,
	pub tier: Tier,
	pub input_tokens: u64,
	pub output_tokens: u64,
}

type DedupResult = Result<Arc<CachedResponse>, ()>;
type Waiter = watch::Receiver<Option<DedupResult>>;

struct CompletedEntry {
	response: Arc<CachedResponse>,
	completed_at: Instant,
}

#[derive(Default)]
struct Inner {
	completed: HashMap<String, CompletedEntry>,
	in_flight: HashMap<String, Waiter>,
}

/// What a caller holds after checking the cache.
pub enum DedupOutcome {
	/// A completed entry within TTL; replay it.
	Hit(Arc<CachedResponse>),
	/// Another request with the same key is in flight; await its result.
	Wait(Waiter),
	/// This caller is the producer and must complete or fail the guard.
	Produce(ProducerGuard),
}

#[derive(Clone)]
pub struct DedupCache {
	inner: Arc<Mutex<Inner>>,
	ttl: Duration,
}

impl Default for DedupCache {
	fn default() -> Self {
		Self::new(DEFAULT_TTL)
	}
}

impl DedupCache {
	pub fn new(ttl: Duration) -> Self {
		DedupCache {
			inner: Arc::new(Mutex::new(Inner::default())),
			ttl,
		}
	}

	/// Atomically decide the caller's role for `key`.
	pub fn begin(&self, key: &str) -> DedupOutcome {
		let mut inner = self.inner.lock().expect("dedup lock");
		if let Some(entry) = inner.completed.get(key) {
			if entry.completed_at.elapsed() < self.ttl {
				return DedupOutcome::Hit(entry.response.clone());
			}
			inner.completed.remove(key);
		}
		if let Some(waiter) = inner.in_flight.get(key) {
			return DedupOutcome::Wait(waiter.clone());
		}
		let (tx, rx) = watch::channel(None);
		inner.in_flight.insert(key.to_string(), rx);
		DedupOutcome::Produce(ProducerGuard {
			key: key.to_string(),
			tx: Some(tx),
			cache: self.clone(),
		})
	}

	/// Await the producer's outcome. `None` means the producer failed; the
	/// caller proceeds as a fresh request.
	pub async fn wait(mut waiter: Waiter) -> Option<Arc<CachedResponse>> {
		match waiter.wait_for(|v| v.is_some()).await {
			Ok(value) => value.clone().expect("checked some").ok(),
			// Producer dropped without resolving.
			Err(_) => None,
		}
	}

	fn finish(&self, key: &str, result: DedupResult) {
		let mut inner = self.inner.lock().expect("dedup lock");
		inner.in_flight.remove(key);
		if let Ok(response) = &result {
			inner.completed.insert(
				key.to_string(),
				CompletedEntry {
					response: response.clone(),
					completed_at: Instant::now(),
				},
			);
		}
		// Opportunistic prune on every completion.
		let ttl = self.ttl;
		inner
			.completed
			.retain(|_, e| e.completed_at.elapsed() < ttl);
	}
}

/// Held by the single producer for a key. Dropping it without `complete`
/// rejects the waiters and clears the in-flight slot, so a panicking or
/// erroring producer never wedges the key.
pub struct ProducerGuard {
	key: String,
	tx: Option<watch::Sender<Option<DedupResult>>>,
	cache: DedupCache,
}

impl ProducerGuard {
	pub fn complete(mut self, response: Arc<CachedResponse>) {
		self.resolve(Ok(response));
	}

	pub fn fail(mut self) {
		self.resolve(Err(()));
	}

	fn resolve(&mut self, result: DedupResult) {
		if let Some(tx) = self.tx.take() {
			self.cache.finish(&self.key, result.clone());
			let _ = tx.send(Some(result));
		}
	}
}

impl Drop for ProducerGuard {
	fn drop(&mut self) {
		self.resolve(Err(()));
	}
}

/// Strip exactly one leading timestamp prefix, case-insensitively.
fn canonical_content(content: &str) -> &str {
	match TIMESTAMP_PREFIX.find(content) {
		Some(m) => &content[m.end()..],
		None => content,
	}
}

/// Content-derived dedup key over the canonicalized conversation. Role order
/// is preserved as given.
pub fn canonical_key(system: Option<&str>, messages: &[NeutralMessage]) -> String {
	let canonical: Vec<serde_json::Value> = messages
		.iter()
		.map(|m| {
			serde_json::json!({
				"role": m.role,
				"content": canonical_content(&m.content),
			})
		})
		.collect();
	let doc = serde_json::json!({
		"system": system,
		"messages": canonical,
	});
	let encoded = serde_json::to_vec(&doc).expect("json encode");
	let digest = Sha256::digest(&encoded);
	let mut hex = String::with_capacity(16);
	for byte in digest.iter().take(8) {
		hex.push_str(&format!("{byte:02x}"));
	}
	hex
}
