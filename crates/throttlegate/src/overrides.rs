//! Classification-bypassing overrides.
//!
//! Evaluated in order, first match wins: heartbeat/summary prompts, explicit
//! force-model directives (header or inline `/alias` prefix), sub-agent tier
//! inheritance from a named parent request, then the tool-calling floor.

use std::sync::LazyLock;

use regex::RegexSet;
use tracing::warn;

use crate::llm::ProxyError;
use crate::registry::ModelRegistry;

static HEARTBEAT: LazyLock<RegexSet> = LazyLock::new(|| {
	RegexSet::new([
		r"(?i)^\s*(ping|pong|heartbeat|status)\s*[.!?]*\s*$",
		r"(?i)^\s*are you (there|alive|up)\??\s*$",
		r"(?i)^\s*(summarize|summarise|recap)\b",
		r"(?i)^\s*tl;?dr\b",
		r"(?i)^\s*give me a (brief |short |quick )?summary\b",
	])
	.expect("heartbeat patterns")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
	None,
	/// Keepalive or summary prompt; routes to the cheapest configured model.
	Heartbeat,
	ForceModel(String),
	ToolCalling,
	/// Parent was already at the hierarchy floor (or outside it); reuse its
	/// model unchanged.
	SubAgentInherit(String),
	/// One hierarchy step below the parent's model.
	SubAgentStepdown(String),
}

impl Override {
	pub fn kind(&self) -> &'static str {
		match self {
			Override::None => "none",
			Override::Heartbeat => "heartbeat",
			Override::ForceModel(_) => "force_model",
			Override::ToolCalling => "tool_calling",
			Override::SubAgentInherit(_) => "sub_agent_inherit",
			Override::SubAgentStepdown(_) => "sub_agent_stepdown",
		}
	}

	/// The model the override pins, when it pins one.
	pub fn forced_model(&self) -> Option<&str> {
		match self {
			Override::ForceModel(id)
			| Override::SubAgentInherit(id)
			| Override::SubAgentStepdown(id) => Some(id),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverrideInput<'a> {
	pub last_user_text: &'a str,
	/// `X-Throttle-Force-Model` header value.
	pub force_model_header: Option<&'a str>,
	/// `X-Parent-Request-ID` header value.
	pub parent_request_id: Option<&'a str>,
	pub has_tools: bool,
}

pub fn detect(
	input: &OverrideInput,
	registry: &ModelRegistry,
	parent_model: impl Fn(&str) -> Option<String>,
) -> Result<Override, ProxyError> {
	if HEARTBEAT.is_match(input.last_user_text) {
		return Ok(Override::Heartbeat);
	}

	if let Some(alias) = input.force_model_header {
		let Some(model) = registry.resolve_alias(alias.trim()) else {
			return Err(ProxyError::InvalidRequest(format!(
				"unknown force-model alias: {alias}"
			)));
		};
		return Ok(Override::ForceModel(model.id.clone()));
	}
	if let Some(alias) = inline_command(input.last_user_text)
		&& let Some(model) = registry.resolve_alias(alias)
	{
		return Ok(Override::ForceModel(model.id.clone()));
	}

	if let Some(parent_id) = input.parent_request_id {
		match parent_model(parent_id) {
			Some(parent) => {
				return Ok(match registry.step_down(&parent) {
					Some(below) => Override::SubAgentStepdown(below.id.clone()),
					None => Override::SubAgentInherit(parent),
				});
			},
			None => {
				warn!(parent_id, "parent request id not found in routing log");
			},
		}
	}

	if input.has_tools {
		return Ok(Override::ToolCalling);
	}
	Ok(Override::None)
}

/// `/opus`, `/flash`, ... as the first token of the utterance. Unknown
/// commands are left for the classifier; only configured aliases fire.
fn inline_command(text: &str) -> Option<&str> {
	let trimmed = text.trim_start();
	let rest = trimmed.strip_prefix('/')?;
	let end = rest
		.find(char::is_whitespace)
		.unwrap_or(rest.len());
	let alias = &rest[..end];
	(!alias.is_empty()).then_some(alias)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::testutil::registry;

	fn no_parent(_: &str) -> Option<String> {
		None
	}

	#[test]
	fn heartbeat_prompts_match_anchored() {
		let r = registry();
		for text in [
			"ping",
			"PING",
			" pong ",
			"heartbeat",
			"are you there?",
			"tldr",
			"TL;DR the thread",
			"summarize the discussion",
			"give me a brief summary of this",
		] {
			let input = OverrideInput {
				last_user_text: text,
				..Default::default()
			};
			assert_eq!(
				detect(&input, &r, no_parent).unwrap(),
				Override::Heartbeat,
				"text: {text}"
			);
		}
		// Not anchored at the start, not a heartbeat.
		let input = OverrideInput {
			last_user_text: "can you ping the server from rust?",
			..Default::default()
		};
		assert_eq!(detect(&input, &r, no_parent).unwrap(), Override::None);
	}

	#[test]
	fn force_model_header_resolves_alias() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "do something hard",
			force_model_header: Some("opus"),
			..Default::default()
		};
		assert_eq!(
			detect(&input, &r, no_parent).unwrap(),
			Override::ForceModel("opus-4".to_string())
		);
	}

	#[test]
	fn unknown_force_model_alias_is_invalid_request() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "hello there friend",
			force_model_header: Some("mystery"),
			..Default::default()
		};
		let err = detect(&input, &r, no_parent).unwrap_err();
		assert_eq!(err.kind(), "invalid_request");
	}

	#[test]
	fn inline_prefix_command_forces_model() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "/flash what's the capital of France",
			..Default::default()
		};
		assert_eq!(
			detect(&input, &r, no_parent).unwrap(),
			Override::ForceModel("flash-2".to_string())
		);
		// Unknown inline commands fall through to the classifier.
		let input = OverrideInput {
			last_user_text: "/etc/passwd looks odd to me today",
			..Default::default()
		};
		assert_eq!(detect(&input, &r, no_parent).unwrap(), Override::None);
	}

	#[test]
	fn sub_agent_steps_down_from_parent() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "work on the subtask now",
			parent_request_id: Some("req-1"),
			..Default::default()
		};
		let got = detect(&input, &r, |_| Some("opus-4".to_string())).unwrap();
		assert_eq!(got, Override::SubAgentStepdown("sonnet-4".to_string()));
	}

	#[test]
	fn sub_agent_inherits_at_the_floor_and_off_hierarchy() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "work on the subtask now",
			parent_request_id: Some("req-1"),
			..Default::default()
		};
		let got = detect(&input, &r, |_| Some("local-8b".to_string())).unwrap();
		assert_eq!(got, Override::SubAgentInherit("local-8b".to_string()));
		// A parent model outside the hierarchy is reused unchanged.
		let got = detect(&input, &r, |_| Some("imported-model".to_string())).unwrap();
		assert_eq!(got, Override::SubAgentInherit("imported-model".to_string()));
	}

	#[test]
	fn unknown_parent_falls_through_to_tool_floor() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "run the search tool over the corpus",
			parent_request_id: Some("missing"),
			has_tools: true,
			..Default::default()
		};
		assert_eq!(detect(&input, &r, no_parent).unwrap(), Override::ToolCalling);
	}

	#[test]
	fn tools_without_other_overrides_floor_the_tier() {
		let r = registry();
		let input = OverrideInput {
			last_user_text: "look this up for me please",
			has_tools: true,
			..Default::default()
		};
		assert_eq!(detect(&input, &r, no_parent).unwrap(), Override::ToolCalling);
	}
}
