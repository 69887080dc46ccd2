//! ChatCompletions wire format, shared by the OpenAI-compatible family
//! (OpenAI, DeepSeek, xAI, Moonshot, Mistral, Ollama). Providers differ only
//! in base URL and key header.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::llm::{IngressFormat, NeutralMessage, ParsedRequest, ProxyError, ProxyResponse, Role};
use crate::parse::sse::SseFrame;

pub const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Deserialize)]
struct ChatRequest {
	#[serde(default)]
	messages: Vec<WireMessage>,
	#[serde(default)]
	max_tokens: Option<u64>,
	#[serde(default)]
	max_completion_tokens: Option<u64>,
	#[serde(default)]
	temperature: Option<f64>,
	#[serde(default)]
	stream: Option<bool>,
	#[serde(default)]
	tools: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
	role: String,
	#[serde(default)]
	content: Value,
}

fn content_text(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		// Content-part arrays: keep the text parts.
		Value::Array(parts) => parts
			.iter()
			.filter_map(|p| match p.get("type").and_then(Value::as_str) {
				Some("text") => p.get("text").and_then(Value::as_str),
				_ => None,
			})
			.collect::<Vec<_>>()
			.join("\n"),
		_ => String::new(),
	}
}

pub fn parse_ingress(body: Value) -> Result<ParsedRequest, ProxyError> {
	let req: ChatRequest = serde_json::from_value(body)
		.map_err(|e| ProxyError::InvalidRequest(format!("malformed chat request: {e}")))?;
	if req.messages.is_empty() {
		return Err(ProxyError::InvalidRequest("messages must not be empty".into()));
	}
	let mut system_parts = Vec::new();
	let mut messages = Vec::new();
	for m in &req.messages {
		match m.role.as_str() {
			"system" | "developer" => system_parts.push(content_text(&m.content)),
			"user" => messages.push(NeutralMessage {
				role: Role::User,
				content: content_text(&m.content),
			}),
			"assistant" => messages.push(NeutralMessage {
				role: Role::Assistant,
				content: content_text(&m.content),
			}),
			other => {
				return Err(ProxyError::InvalidRequest(format!(
					"unsupported message role: {other}"
				)));
			},
		}
	}
	if messages.is_empty() {
		return Err(ProxyError::InvalidRequest(
			"messages must include a user or assistant turn".into(),
		));
	}
	let has_tools = req
		.tools
		.as_ref()
		.is_some_and(|t| t.as_array().is_some_and(|a| !a.is_empty()));
	Ok(ParsedRequest {
		messages,
		system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
		max_tokens: req
			.max_completion_tokens
			.or(req.max_tokens)
			.unwrap_or(DEFAULT_MAX_TOKENS),
		temperature: req.temperature,
		stream: req.stream.unwrap_or(false),
		ingress: IngressFormat::OpenAi,
		raw_body: None,
		has_tools,
		anthropic_version: None,
		anthropic_beta: None,
	})
}

/// Provider-native body built from the neutral request. Streaming requests
/// always ask for usage in the final chunk; token accounting depends on it.
pub fn build_body(req: &ParsedRequest, model: &str, stream: bool) -> Value {
	let mut messages = Vec::with_capacity(req.messages.len() + 1);
	if let Some(system) = &req.system {
		messages.push(json!({"role": "system", "content": system}));
	}
	for m in &req.messages {
		messages.push(json!({
			"role": match m.role {
				Role::User => "user",
				Role::Assistant => "assistant",
			},
			"content": m.content,
		}));
	}
	let mut body = json!({
		"model": model,
		"messages": messages,
		"max_tokens": req.max_tokens,
		"stream": stream,
	});
	if let Some(t) = req.temperature {
		body["temperature"] = json!(t);
	}
	if stream {
		body["stream_options"] = json!({"include_usage": true});
	}
	body
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub prompt_tokens: u64,
	#[serde(default)]
	pub completion_tokens: u64,
	#[serde(default)]
	pub total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
	#[serde(default)]
	pub model: String,
	#[serde(default)]
	pub choices: Vec<Choice>,
	#[serde(default)]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
	pub message: ResponseMessage,
	#[serde(default)]
	pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
	#[serde(default)]
	pub content: Option<String>,
}

pub fn decode_response(bytes: &[u8]) -> Result<ChatResponse, ProxyError> {
	serde_json::from_slice(bytes)
		.map_err(|e| ProxyError::UpstreamStream(format!("bad chat response: {e}")))
}

/// One streamed `chat.completion.chunk`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub model: Option<String>,
	#[serde(default)]
	pub choices: Vec<StreamChoice>,
	#[serde(default)]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
	#[serde(default)]
	pub delta: Delta,
	#[serde(default)]
	pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
	#[serde(default)]
	pub content: Option<String>,
}

pub fn parse_stream_chunk(data: &str) -> Result<StreamChunk, ProxyError> {
	serde_json::from_str(data)
		.map_err(|e| ProxyError::UpstreamStream(format!("bad stream chunk: {e}")))
}

/// Anthropic stop reasons rendered as OpenAI finish reasons.
pub fn finish_from_stop_reason(stop: &str) -> &'static str {
	match stop {
		"max_tokens" | "model_context_window_exceeded" => "length",
		"tool_use" => "tool_calls",
		"refusal" => "content_filter",
		_ => "stop",
	}
}

// Client-dialect frame synthesis for cross-family streams.

pub fn delta_frame(id: &str, model: &str, created: i64, text: &str) -> SseFrame {
	let payload = json!({
		"id": id,
		"object": "chat.completion.chunk",
		"created": created,
		"model": model,
		"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}],
	});
	SseFrame::new(None, payload.to_string())
}

pub fn role_frame(id: &str, model: &str, created: i64) -> SseFrame {
	let payload = json!({
		"id": id,
		"object": "chat.completion.chunk",
		"created": created,
		"model": model,
		"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}, "finish_reason": null}],
	});
	SseFrame::new(None, payload.to_string())
}

pub fn finish_frame(
	id: &str,
	model: &str,
	created: i64,
	finish_reason: &str,
	usage: Option<(u64, u64)>,
) -> SseFrame {
	let usage = usage.map(|(input, output)| {
		json!({
			"prompt_tokens": input,
			"completion_tokens": output,
			"total_tokens": input + output,
		})
	});
	let payload = json!({
		"id": id,
		"object": "chat.completion.chunk",
		"created": created,
		"model": model,
		"choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}],
		"usage": usage,
	});
	SseFrame::new(None, payload.to_string())
}

pub fn done_frame() -> SseFrame {
	SseFrame::new(None, "[DONE]")
}

/// Non-streaming ChatCompletions-style encoding of a neutral response.
pub fn encode_response(resp: &ProxyResponse, request_id: &str, created: i64) -> Value {
	json!({
		"id": format!("chatcmpl-{request_id}"),
		"object": "chat.completion",
		"created": created,
		"model": resp.model,
		"choices": [{
			"index": 0,
			"message": {"role": "assistant", "content": resp.content},
			"finish_reason": resp
				.finish_reason
				.as_deref()
				.map(finish_from_stop_reason)
				.unwrap_or("stop"),
		}],
		"usage": {
			"prompt_tokens": resp.input_tokens,
			"completion_tokens": resp.output_tokens,
			"total_tokens": resp.input_tokens + resp.output_tokens,
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn system_role_is_lifted_into_the_system_prompt() {
		let parsed = parse_ingress(json!({
			"model": "gpt-x",
			"messages": [
				{"role": "system", "content": "be brief"},
				{"role": "user", "content": "hello"},
			],
			"max_tokens": 32
		}))
		.unwrap();
		assert_eq!(parsed.system.as_deref(), Some("be brief"));
		assert_eq!(parsed.messages.len(), 1);
		assert_eq!(parsed.messages[0].role, Role::User);
		assert!(parsed.raw_body.is_none());
	}

	#[test]
	fn tool_role_is_rejected() {
		let err = parse_ingress(json!({
			"messages": [{"role": "tool", "content": "x"}]
		}))
		.unwrap_err();
		assert_eq!(err.kind(), "invalid_request");
	}

	#[test]
	fn streaming_body_always_requests_usage() {
		let parsed = parse_ingress(json!({
			"messages": [{"role": "user", "content": "hi"}],
			"stream": true
		}))
		.unwrap();
		let body = build_body(&parsed, "m", true);
		assert_eq!(body["stream_options"]["include_usage"], true);
		let body = build_body(&parsed, "m", false);
		assert!(body.get("stream_options").is_none());
	}

	#[test]
	fn max_completion_tokens_wins_over_max_tokens() {
		let parsed = parse_ingress(json!({
			"messages": [{"role": "user", "content": "hi"}],
			"max_tokens": 10,
			"max_completion_tokens": 20
		}))
		.unwrap();
		assert_eq!(parsed.max_tokens, 20);
	}

	#[test]
	fn stream_chunks_tolerate_sparse_fields() {
		let chunk = parse_stream_chunk(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
		assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
		// The usage-only terminal chunk has an empty choices array.
		let chunk = parse_stream_chunk(
			r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#,
		)
		.unwrap();
		assert_eq!(chunk.usage.unwrap().completion_tokens, 5);
	}

	#[test]
	fn finish_reason_mapping_covers_the_anthropic_set() {
		assert_eq!(finish_from_stop_reason("end_turn"), "stop");
		assert_eq!(finish_from_stop_reason("max_tokens"), "length");
		assert_eq!(finish_from_stop_reason("tool_use"), "tool_calls");
		assert_eq!(finish_from_stop_reason("refusal"), "content_filter");
	}
}
