//! Prompt complexity classification.
//!
//! Scores the last user utterance on twelve weighted dimensions, producing a
//! composite score in `[0, 1]`, a coarse tier, and a sigmoid-calibrated
//! confidence. The classifier is pure: for fixed weights and thresholds the
//! same `(text, meta)` always yields the same result.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::llm::ProxyError;

/// Sigmoid steepness for confidence calibration.
const CONFIDENCE_STEEPNESS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
	Simple,
	Standard,
	Complex,
}

impl Tier {
	pub fn step_up(self) -> Tier {
		match self {
			Tier::Simple => Tier::Standard,
			Tier::Standard | Tier::Complex => Tier::Complex,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Tier::Simple => "simple",
			Tier::Standard => "standard",
			Tier::Complex => "complex",
		}
	}
}

impl std::fmt::Display for Tier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Request-level metadata the classifier folds in alongside the utterance.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptMeta<'a> {
	pub message_count: usize,
	pub system_prompt: Option<&'a str>,
}

/// Raw per-dimension scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionScores {
	pub token_count: f64,
	pub code_presence: f64,
	pub reasoning_markers: f64,
	pub simple_indicators: f64,
	pub multi_step_patterns: f64,
	pub question_count: f64,
	pub system_prompt_signals: f64,
	pub conversation_depth: f64,
	pub agentic_task: f64,
	pub technical_terms: f64,
	pub constraint_count: f64,
	pub escalation_signals: f64,
}

/// Per-dimension weights. `simple_indicators` carries a negative weight so
/// trivial prompts pull the composite down.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
	pub token_count: f64,
	pub code_presence: f64,
	pub reasoning_markers: f64,
	pub simple_indicators: f64,
	pub multi_step_patterns: f64,
	pub question_count: f64,
	pub system_prompt_signals: f64,
	pub conversation_depth: f64,
	pub agentic_task: f64,
	pub technical_terms: f64,
	pub constraint_count: f64,
	pub escalation_signals: f64,
}

impl Default for Weights {
	fn default() -> Self {
		Weights {
			token_count: 0.15,
			code_presence: 0.12,
			reasoning_markers: 0.12,
			simple_indicators: -0.25,
			multi_step_patterns: 0.12,
			question_count: 0.05,
			system_prompt_signals: 0.05,
			conversation_depth: 0.05,
			agentic_task: 0.15,
			technical_terms: 0.08,
			constraint_count: 0.08,
			escalation_signals: 0.10,
		}
	}
}

impl Weights {
	/// Load overrides from a JSON `{dimension: weight}` map. Dimension names
	/// follow the camelCase names used in logs; an unknown name is a startup
	/// error.
	pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| ProxyError::Config(format!("classifier weights {}: {e}", path.display())))?;
		let map: HashMap<String, f64> = serde_json::from_str(&raw)
			.map_err(|e| ProxyError::Config(format!("classifier weights {}: {e}", path.display())))?;
		let mut w = Weights::default();
		for (name, value) in map {
			match name.as_str() {
				"tokenCount" => w.token_count = value,
				"codePresence" => w.code_presence = value,
				"reasoningMarkers" => w.reasoning_markers = value,
				"simpleIndicators" => w.simple_indicators = value,
				"multiStepPatterns" => w.multi_step_patterns = value,
				"questionCount" => w.question_count = value,
				"systemPromptSignals" => w.system_prompt_signals = value,
				"conversationDepth" => w.conversation_depth = value,
				"agenticTask" => w.agentic_task = value,
				"technicalTerms" => w.technical_terms = value,
				"constraintCount" => w.constraint_count = value,
				"escalationSignals" => w.escalation_signals = value,
				other => {
					return Err(ProxyError::Config(format!(
						"unknown classifier weight dimension: {other}"
					)));
				},
			}
		}
		Ok(w)
	}
}

/// Tier boundaries on the composite score.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
	pub simple_max: f64,
	pub complex_min: f64,
}

impl Default for Thresholds {
	fn default() -> Self {
		Thresholds {
			simple_max: 0.30,
			complex_min: 0.65,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Classification {
	pub score: f64,
	pub tier: Tier,
	pub confidence: f64,
	pub dimensions: DimensionScores,
	pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Classifier {
	weights: Weights,
	thresholds: Thresholds,
}

impl Classifier {
	pub fn new(weights: Weights, thresholds: Thresholds) -> Self {
		Classifier {
			weights,
			thresholds,
		}
	}

	pub fn classify(&self, text: &str, meta: &PromptMeta) -> Classification {
		let start = Instant::now();
		let dims = score_dimensions(text, meta);
		let w = &self.weights;
		let composite = w.token_count * dims.token_count
			+ w.code_presence * dims.code_presence
			+ w.reasoning_markers * dims.reasoning_markers
			+ w.simple_indicators * dims.simple_indicators
			+ w.multi_step_patterns * dims.multi_step_patterns
			+ w.question_count * dims.question_count
			+ w.system_prompt_signals * dims.system_prompt_signals
			+ w.conversation_depth * dims.conversation_depth
			+ w.agentic_task * dims.agentic_task
			+ w.technical_terms * dims.technical_terms
			+ w.constraint_count * dims.constraint_count
			+ w.escalation_signals * dims.escalation_signals;
		let score = composite.clamp(0.0, 1.0);
		let tier = self.tier_of(score);
		let confidence = confidence(score, tier, &self.thresholds);
		Classification {
			score,
			tier,
			confidence,
			dimensions: dims,
			elapsed: start.elapsed(),
		}
	}

	fn tier_of(&self, score: f64) -> Tier {
		if score <= self.thresholds.simple_max {
			Tier::Simple
		} else if score >= self.thresholds.complex_min {
			Tier::Complex
		} else {
			Tier::Standard
		}
	}
}

/// Sigmoid of the signed distance from the nearest relevant tier boundary.
/// Scores sitting on a boundary come out at 0.5.
fn confidence(score: f64, tier: Tier, t: &Thresholds) -> f64 {
	let d = match tier {
		Tier::Simple => t.simple_max - score,
		Tier::Complex => score - t.complex_min,
		Tier::Standard => (score - t.simple_max).min(t.complex_min - score),
	};
	1.0 / (1.0 + (-CONFIDENCE_STEEPNESS * d).exp())
}

fn score_dimensions(text: &str, meta: &PromptMeta) -> DimensionScores {
	let lower = text.to_lowercase();
	DimensionScores {
		token_count: token_count_signal(text),
		code_presence: code_presence_signal(text, &lower),
		reasoning_markers: phrase_signal(
			&lower,
			&[
				"explain",
				"why",
				"step by step",
				"analyze",
				"analyse",
				"because",
				"walk me through",
				"reason about",
			],
			3.0,
		),
		simple_indicators: simple_indicator_signal(&lower),
		multi_step_patterns: multi_step_signal(&lower),
		question_count: (text.matches('?').count() as f64 / 3.0).min(1.0),
		system_prompt_signals: meta
			.system_prompt
			.map(|s| log_scale(s.len() as f64, 4096.0))
			.unwrap_or(0.0),
		conversation_depth: (meta.message_count as f64 / 12.0).min(1.0),
		agentic_task: phrase_signal(
			&lower,
			&[
				"build",
				"implement",
				"design",
				"refactor",
				"create",
				"develop",
				"migrate",
				"integrate",
			],
			2.0,
		),
		technical_terms: phrase_signal(
			&lower,
			&[
				"api", "database", "async", "thread", "compile", "regex", "algorithm", "latency",
				"cache", "protocol", "schema", "deploy", "server", "runtime", "queue", "memory",
			],
			4.0,
		),
		constraint_count: phrase_signal(
			&lower,
			&[
				"must",
				"should not",
				"shouldn't",
				"at least",
				"at most",
				"no more than",
				"within",
				"exactly",
			],
			3.0,
		),
		escalation_signals: phrase_signal(
			&lower,
			&[
				"urgent",
				"asap",
				"critical",
				"carefully",
				"production",
				"complex",
				"thorough",
				"comprehensive",
			],
			2.0,
		),
	}
}

/// Log-scaled length signal: ~4 chars per token, saturating at `ceiling`.
fn token_count_signal(text: &str) -> f64 {
	let approx_tokens = text.len() as f64 / 4.0;
	log_scale(approx_tokens, 2048.0)
}

fn log_scale(value: f64, ceiling: f64) -> f64 {
	((1.0 + value).ln() / (1.0 + ceiling).ln()).min(1.0)
}

fn code_presence_signal(text: &str, lower: &str) -> f64 {
	if text.contains("```") {
		return 1.0;
	}
	let keywords = [
		"fn ", "def ", "class ", "import ", "#include", "return ", "=> ", "();", "struct ",
	];
	let hits = keywords.iter().filter(|k| lower.contains(*k)).count() as f64;
	let inline = if text.contains('`') { 0.3 } else { 0.0 };
	(hits * 0.2 + inline).min(1.0)
}

fn phrase_signal(lower: &str, phrases: &[&str], saturation: f64) -> f64 {
	let hits = phrases.iter().filter(|p| lower.contains(*p)).count() as f64;
	(hits / saturation).min(1.0)
}

fn simple_indicator_signal(lower: &str) -> f64 {
	let trimmed = lower.trim().trim_end_matches(['.', '!', '?']);
	const GREETINGS: &[&str] = &[
		"hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "yes", "no", "yep", "nope",
		"cool", "great", "good morning", "good night", "sounds good",
	];
	if GREETINGS.contains(&trimmed) {
		return 1.0;
	}
	if !trimmed.contains(char::is_whitespace) && !trimmed.is_empty() {
		return 1.0;
	}
	if trimmed.len() < 12 {
		return 0.5;
	}
	0.0
}

fn multi_step_signal(lower: &str) -> f64 {
	let numbered = lower
		.lines()
		.filter(|l| {
			let l = l.trim_start();
			l.len() >= 2
				&& l.starts_with(|c: char| c.is_ascii_digit())
				&& (l[1..].starts_with('.') || l[1..].starts_with(')'))
		})
		.count() as f64;
	let sequenced = if lower.contains("first") && lower.contains("then") {
		1.0
	} else {
		0.0
	};
	let conjunctions = lower.matches(" and then ").count() as f64;
	((numbered + sequenced + conjunctions) / 3.0).min(1.0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn classifier() -> Classifier {
		Classifier::new(Weights::default(), Thresholds::default())
	}

	#[test]
	fn trivial_prompt_is_simple_with_high_confidence() {
		let c = classifier();
		let got = c.classify("ping", &PromptMeta::default());
		assert_eq!(got.tier, Tier::Simple);
		assert!(got.score < 0.1, "score {}", got.score);
		assert!(got.confidence > 0.85, "confidence {}", got.confidence);
	}

	#[test]
	fn agentic_prompt_scores_above_simple() {
		let c = classifier();
		let prompt = "Design and implement a caching layer for our API server. \
			It must evict entries within 30 seconds, and you should analyze the \
			latency impact step by step.\n1. design the schema\n2. implement it\n3. deploy";
		let got = c.classify(
			prompt,
			&PromptMeta {
				message_count: 4,
				system_prompt: Some("You are a systems engineer."),
			},
		);
		assert!(got.tier >= Tier::Standard, "tier {:?} score {}", got.tier, got.score);
	}

	#[test]
	fn boundary_score_yields_half_confidence() {
		let t = Thresholds::default();
		let c = confidence(t.simple_max, Tier::Simple, &t);
		assert!((c - 0.5).abs() < 1e-9, "confidence {c}");
		let c = confidence(t.complex_min, Tier::Complex, &t);
		assert!((c - 0.5).abs() < 1e-9, "confidence {c}");
	}

	#[test]
	fn classification_is_deterministic() {
		let c = classifier();
		let meta = PromptMeta {
			message_count: 3,
			system_prompt: Some("helper"),
		};
		let a = c.classify("explain why the cache misses", &meta);
		let b = c.classify("explain why the cache misses", &meta);
		assert_eq!(a.score, b.score);
		assert_eq!(a.tier, b.tier);
		assert_eq!(a.confidence, b.confidence);
	}

	#[test]
	fn weights_file_rejects_unknown_dimension() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("weights.json");
		std::fs::write(&path, r#"{"tokenCount": 0.2, "bogus": 1.0}"#).unwrap();
		let err = Weights::from_file(&path).unwrap_err();
		assert!(err.to_string().contains("bogus"), "{err}");
	}

	#[test]
	fn weights_file_overrides_named_dimensions_only() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("weights.json");
		std::fs::write(&path, r#"{"agenticTask": 0.4}"#).unwrap();
		let w = Weights::from_file(&path).unwrap();
		assert_eq!(w.agentic_task, 0.4);
		assert_eq!(w.token_count, Weights::default().token_count);
	}

	#[test]
	fn step_up_saturates_at_complex() {
		assert_eq!(Tier::Simple.step_up(), Tier::Standard);
		assert_eq!(Tier::Standard.step_up(), Tier::Complex);
		assert_eq!(Tier::Complex.step_up(), Tier::Complex);
	}
}
