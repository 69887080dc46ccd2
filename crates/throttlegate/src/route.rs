//! Model selection.
//!
//! Given a classification, the mode, any override, and the live rate-limit
//! view, picks the first available model from the mode/tier preference list,
//! applying the tool-calling floor and the low-confidence step-up. The
//! decision is then filtered through the session pin, which never downgrades.

use crate::classify::{Classification, Tier};
use crate::config::{Config, Mode};
use crate::llm::ProxyError;
use crate::overrides::Override;
use crate::registry::{ModelRegistry, ModelSpec};
use crate::store::{RateLimiter, SessionStore};

/// Confidence below which the tier is stepped up one level.
pub const CONFIDENCE_STEP_UP: f64 = 0.70;

#[derive(Debug, Clone)]
pub struct RoutingDecision {
	pub model: ModelSpec,
	pub tier: Tier,
	pub mode: Mode,
	pub override_: Override,
	/// Human-readable account of the decision, surfaced on response headers.
	pub reasoning: String,
	pub session_pinned: bool,
}

pub fn decide(
	classification: &Classification,
	mode: Mode,
	override_: &Override,
	registry: &ModelRegistry,
	cfg: &Config,
	rate: &RateLimiter,
) -> Result<RoutingDecision, ProxyError> {
	let available =
		|m: &ModelSpec| cfg.is_configured(m.provider) && !rate.is_rate_limited(&m.id);

	if let Override::Heartbeat = override_ {
		let model = registry
			.cheapest_where(&available)
			.ok_or(ProxyError::NoAvailableModel)?;
		return Ok(RoutingDecision {
			model: model.clone(),
			tier: Tier::Simple,
			mode,
			override_: override_.clone(),
			reasoning: format!(
				"mode={mode} tier=simple score={:.3}; heartbeat override, cheapest configured model",
				classification.score
			),
			session_pinned: false,
		});
	}

	// A forced or inherited model is honored when it resolves and is not
	// rate limited; otherwise routing proceeds normally but the override tag
	// is retained for logging.
	if let Some(id) = override_.forced_model()
		&& let Some(model) = registry.get(id)
		&& available(model)
	{
		return Ok(RoutingDecision {
			model: model.clone(),
			tier: classification.tier,
			mode,
			override_: override_.clone(),
			reasoning: format!(
				"mode={mode} tier={} score={:.3}; {} override pinned {}",
				classification.tier,
				classification.score,
				override_.kind(),
				model.id
			),
			session_pinned: false,
		});
	}

	let mut tier = classification.tier;
	let mut causes = Vec::new();
	if matches!(override_, Override::ToolCalling) && tier < Tier::Standard {
		tier = Tier::Standard;
		causes.push("tool_calling tier floor".to_string());
	}
	if classification.confidence < CONFIDENCE_STEP_UP && tier < Tier::Complex {
		tier = tier.step_up();
		causes.push(format!(
			"confidence step-up ({:.3} < {CONFIDENCE_STEP_UP})",
			classification.confidence
		));
	}

	let mut reasoning = format!(
		"mode={mode} tier={tier} score={:.3}",
		classification.score
	);
	for cause in &causes {
		reasoning.push_str("; ");
		reasoning.push_str(cause);
	}

	let chosen = registry
		.table()
		.preferences(mode, tier)
		.iter()
		.filter_map(|id| registry.get(id))
		.find(|m| available(m));

	let model = match chosen {
		Some(m) => m.clone(),
		None => {
			// Preference list exhausted; cheapest available model anywhere.
			let m = registry
				.cheapest_where(&available)
				.ok_or(ProxyError::NoAvailableModel)?;
			reasoning.push_str("; preference list exhausted, cheapest available fallback");
			m.clone()
		},
	};

	Ok(RoutingDecision {
		model,
		tier,
		mode,
		override_: override_.clone(),
		reasoning,
		session_pinned: false,
	})
}

/// Filter a decision through the session's monotonic pin. A prior pin of
/// higher-or-equal tier substitutes its model; a strictly higher decision
/// upgrades the pin.
pub fn apply_session_pin(
	mut decision: RoutingDecision,
	sessions: &SessionStore,
	session_id: &str,
	registry: &ModelRegistry,
) -> RoutingDecision {
	let (pinned_model, pinned_tier) = sessions.set(session_id, &decision.model.id, decision.tier);
	if pinned_model != decision.model.id
		&& let Some(model) = registry.get(&pinned_model)
	{
		decision
			.reasoning
			.push_str(&format!("; session-pinned from {}", decision.model.id));
		decision.model = model.clone();
		decision.tier = pinned_tier;
		decision.session_pinned = true;
	}
	decision
}
