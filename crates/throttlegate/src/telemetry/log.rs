//! Append-only routing log.
//!
//! One line-delimited JSON record per completed request. Records hold a
//! prompt hash, never content. The writer is a single mutex-guarded append;
//! a write error is logged and never surfaces to the client. The in-memory
//! request-id index backs sub-agent parent lookups, falling back to a file
//! scan for requests logged by an earlier process.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classify::Tier;
use crate::config::Mode;
use crate::llm::ProviderTag;
use crate::store::dualkey::KeyType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingLogEntry {
	pub request_id: String,
	/// ISO-8601 UTC.
	pub timestamp: DateTime<Utc>,
	/// First 16 hex chars of the prompt's SHA-256; never the prompt itself.
	pub prompt_hash: String,
	pub score: f64,
	pub confidence: f64,
	pub tier: Tier,
	pub model: String,
	pub provider: ProviderTag,
	pub mode: Mode,
	#[serde(rename = "override")]
	pub override_kind: String,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub cost_usd: f64,
	pub latency_ms: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_request_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key_type: Option<KeyType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failover: Option<bool>,
}

#[derive(Clone)]
pub struct RoutingLog {
	inner: Arc<Inner>,
}

struct Inner {
	path: PathBuf,
	file: Mutex<Option<std::fs::File>>,
	/// request id -> chosen model, for parent lookups.
	index: Mutex<HashMap<String, String>>,
}

impl RoutingLog {
	pub fn open(path: &Path) -> Self {
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.map_err(|e| warn!(path = %path.display(), "cannot open routing log: {e}"))
			.ok();
		RoutingLog {
			inner: Arc::new(Inner {
				path: path.to_path_buf(),
				file: Mutex::new(file),
				index: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// Best-effort append; a failed write must not abort the response.
	pub fn append(&self, entry: &RoutingLogEntry) {
		{
			let mut index = self.inner.index.lock().expect("log index lock");
			index.insert(entry.request_id.clone(), entry.model.clone());
		}
		let Ok(line) = serde_json::to_string(entry) else {
			warn!("routing log entry failed to serialize");
			return;
		};
		let mut file = self.inner.file.lock().expect("log file lock");
		if let Some(f) = file.as_mut()
			&& let Err(e) = writeln!(f, "{line}")
		{
			warn!("routing log write failed: {e}");
		}
	}

	/// The model a past request routed to, or `None` when the id is unknown.
	pub fn parent_model(&self, request_id: &str) -> Option<String> {
		if let Some(model) = self
			.inner
			.index
			.lock()
			.expect("log index lock")
			.get(request_id)
		{
			return Some(model.clone());
		}
		// Not seen this process; scan the file for a prior run's entry.
		self
			.read_entries()
			.into_iter()
			.find(|e| e.request_id == request_id)
			.map(|e| e.model)
	}

	pub fn read_entries(&self) -> Vec<RoutingLogEntry> {
		let Ok(file) = std::fs::File::open(&self.inner.path) else {
			return Vec::new();
		};
		BufReader::new(file)
			.lines()
			.map_while(Result::ok)
			.filter_map(|line| serde_json::from_str(&line).ok())
			.collect()
	}

	pub fn read_since(&self, since: DateTime<Utc>) -> Vec<RoutingLogEntry> {
		self
			.read_entries()
			.into_iter()
			.filter(|e| e.timestamp >= since)
			.collect()
	}
}
