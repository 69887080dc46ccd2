//! Routing-log aggregation.
//!
//! Scans log entries since a cutoff and reports totals, per-model and
//! per-tier distributions, and the hypothetical spend had every request used
//! the most expensive catalog model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::ModelSpec;
use crate::telemetry::log::RoutingLogEntry;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStat {
	pub count: u64,
	pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
	pub total_requests: u64,
	pub total_cost_usd: f64,
	/// Spend if every request had used the baseline (most expensive) model.
	pub baseline_cost_usd: f64,
	pub baseline_model: String,
	pub model_distribution: BTreeMap<String, ModelStat>,
	pub tier_distribution: BTreeMap<String, u64>,
	pub avg_latency_ms: f64,
	pub period_start: DateTime<Utc>,
	pub period_end: DateTime<Utc>,
}

pub fn aggregate(
	entries: &[RoutingLogEntry],
	since: DateTime<Utc>,
	baseline: &ModelSpec,
) -> StatsReport {
	let mut report = StatsReport {
		total_requests: 0,
		total_cost_usd: 0.0,
		baseline_cost_usd: 0.0,
		baseline_model: baseline.id.clone(),
		model_distribution: BTreeMap::new(),
		tier_distribution: BTreeMap::new(),
		avg_latency_ms: 0.0,
		period_start: since,
		period_end: Utc::now(),
	};
	let mut latency_total: u64 = 0;
	for e in entries {
		report.total_requests += 1;
		report.total_cost_usd += e.cost_usd;
		report.baseline_cost_usd += baseline.estimate_cost_usd(e.input_tokens, e.output_tokens);
		let stat = report.model_distribution.entry(e.model.clone()).or_default();
		stat.count += 1;
		stat.cost_usd += e.cost_usd;
		*report
			.tier_distribution
			.entry(e.tier.as_str().to_string())
			.or_default() += 1;
		latency_total += e.latency_ms;
	}
	if report.total_requests > 0 {
		report.avg_latency_ms = latency_total as f64 / report.total_requests as f64;
	}
	report
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classify::Tier;
	use crate::llm::ProviderTag;
	use crate::registry::testutil::spec;
	use crate::telemetry::log::testutil::entry;

	#[test]
	fn aggregate_sums_and_distributes() {
		let baseline = spec("opus-4", ProviderTag::Anthropic, 15.0, 75.0);
		let entries = vec![
			entry("r1", "mini-4", Tier::Simple, 0.002),
			entry("r2", "mini-4", Tier::Standard, 0.004),
			entry("r3", "opus-4", Tier::Complex, 0.09),
		];
		let since = Utc::now() - chrono::Duration::days(30);
		let got = aggregate(&entries, since, &baseline);
		assert_eq!(got.total_requests, 3);
		assert!((got.total_cost_usd - 0.096).abs() < 1e-9);
		assert_eq!(got.model_distribution["mini-4"].count, 2);
		assert_eq!(got.tier_distribution["complex"], 1);
		assert_eq!(got.avg_latency_ms, 120.0);
		// Each test entry is 100 in / 50 out against the opus baseline.
		let per_request = (100.0 * 15.0 + 50.0 * 75.0) / 1e6;
		assert!((got.baseline_cost_usd - 3.0 * per_request).abs() < 1e-9);
		assert!(got.baseline_cost_usd > got.total_cost_usd);
	}

	#[test]
	fn empty_window_reports_zeroes() {
		let baseline = spec("opus-4", ProviderTag::Anthropic, 15.0, 75.0);
		let got = aggregate(&[], Utc::now(), &baseline);
		assert_eq!(got.total_requests, 0);
		assert_eq!(got.avg_latency_ms, 0.0);
		assert!(got.model_distribution.is_empty());
	}
}
