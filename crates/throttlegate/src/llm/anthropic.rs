//! Anthropic Messages wire format.
//!
//! Ingress parsing keeps the raw body alongside the neutral decode so that
//! `tools`, `tool_choice`, `thinking`, `metadata` and tool-content blocks
//! round-trip exactly when the chosen provider is Anthropic-family; only
//! `model` and `stream` are overridden on the way out.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::AuthType;
use crate::llm::{IngressFormat, NeutralMessage, ParsedRequest, ProxyError, ProxyResponse, Role};
use crate::parse::sse::SseFrame;

pub const DEFAULT_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Deserialize)]
struct MessagesRequest {
	#[serde(default)]
	messages: Vec<WireMessage>,
	#[serde(default)]
	system: Option<Value>,
	#[serde(default)]
	max_tokens: Option<u64>,
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

/// Text of a Messages content value: a bare string or the text blocks of an
/// array. Tool blocks contribute nothing here; they ride along in the raw
/// body.
fn content_text(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		Value::Array(blocks) => blocks
			.iter()
			.filter_map(|b| match b.get("type").and_then(Value::as_str) {
				Some("text") => b.get("text").and_then(Value::as_str),
				_ => None,
			})
			.collect::<Vec<_>>()
			.join("\n"),
		_ => String::new(),
	}
}

pub fn parse_ingress(body: Value) -> Result<ParsedRequest, ProxyError> {
	let req: MessagesRequest = serde_json::from_value(body.clone())
		.map_err(|e| ProxyError::InvalidRequest(format!("malformed messages request: {e}")))?;
	if req.messages.is_empty() {
		return Err(ProxyError::InvalidRequest("messages must not be empty".into()));
	}
	let mut messages = Vec::with_capacity(req.messages.len());
	for m in &req.messages {
		let role = match m.role.as_str() {
			"user" => Role::User,
			"assistant" => Role::Assistant,
			other => {
				return Err(ProxyError::InvalidRequest(format!(
					"unsupported message role: {other}"
				)));
			},
		};
		messages.push(NeutralMessage {
			role,
			content: content_text(&m.content),
		});
	}
	let has_tools = req
		.tools
		.as_ref()
		.is_some_and(|t| t.as_array().is_some_and(|a| !a.is_empty()));
	Ok(ParsedRequest {
		messages,
		system: req.system.as_ref().map(content_text).filter(|s| !s.is_empty()),
		max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
		temperature: req.temperature,
		stream: req.stream.unwrap_or(false),
		ingress: IngressFormat::Anthropic,
		raw_body: Some(body),
		has_tools,
		anthropic_version: None,
		anthropic_beta: None,
	})
}

/// Provider-native body built from the neutral request.
pub fn build_body(req: &ParsedRequest, model: &str, stream: bool) -> Value {
	let messages: Vec<Value> = req
		.messages
		.iter()
		.map(|m| {
			json!({
				"role": match m.role {
					Role::User => "user",
					Role::Assistant => "assistant",
				},
				"content": m.content,
			})
		})
		.collect();
	let mut body = json!({
		"model": model,
		"messages": messages,
		"max_tokens": req.max_tokens,
		"stream": stream,
	});
	if let Some(system) = &req.system {
		body["system"] = json!(system);
	}
	if let Some(t) = req.temperature {
		body["temperature"] = json!(t);
	}
	body
}

/// Raw-body passthrough: the client's Messages body verbatim, with only the
/// routed model and the stream flag overridden.
pub fn passthrough_body(raw: &Value, model: &str, stream: bool) -> Value {
	let mut body = raw.clone();
	body["model"] = json!(model);
	body["stream"] = json!(stream);
	body
}

/// How to present a key upstream, resolved per the configured auth type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
	XApiKey,
	Bearer,
}

pub fn auth_scheme(key: &str, auth_type: AuthType) -> AuthScheme {
	match auth_type {
		AuthType::ApiKey => AuthScheme::XApiKey,
		AuthType::Bearer => AuthScheme::Bearer,
		AuthType::Auto => {
			if key.starts_with("sk-ant-") {
				AuthScheme::XApiKey
			} else {
				AuthScheme::Bearer
			}
		},
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
	pub id: String,
	pub model: String,
	#[serde(default)]
	pub content: Vec<Value>,
	#[serde(default)]
	pub stop_reason: Option<String>,
	#[serde(default)]
	pub usage: Usage,
}

impl MessagesResponse {
	pub fn text(&self) -> String {
		self
			.content
			.iter()
			.filter_map(|b| match b.get("type").and_then(Value::as_str) {
				Some("text") => b.get("text").and_then(Value::as_str),
				_ => None,
			})
			.collect::<Vec<_>>()
			.join("")
	}
}

pub fn decode_response(bytes: &[u8]) -> Result<MessagesResponse, ProxyError> {
	serde_json::from_slice(bytes)
		.map_err(|e| ProxyError::UpstreamStream(format!("bad messages response: {e}")))
}

/// Typed streaming events.
/// <https://docs.anthropic.com/en/docs/build-with-claude/streaming>
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
	MessageStart { message: StartedMessage },
	ContentBlockStart {
		index: u64,
		#[serde(default)]
		content_block: Value,
	},
	ContentBlockDelta { index: u64, delta: ContentDelta },
	ContentBlockStop { index: u64 },
	MessageDelta {
		#[serde(default)]
		delta: MessageDeltaInfo,
		#[serde(default)]
		usage: Option<Usage>,
	},
	MessageStop,
	Ping,
	Error {
		#[serde(default)]
		error: Value,
	},
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartedMessage {
	pub id: String,
	pub model: String,
	#[serde(default)]
	pub usage: Usage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDeltaInfo {
	#[serde(default)]
	pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
	ThinkingDelta { thinking: String },
	SignatureDelta { signature: String },
	#[serde(other)]
	Unknown,
}

pub fn parse_stream_event(data: &str) -> Result<StreamEvent, ProxyError> {
	serde_json::from_str(data)
		.map_err(|e| ProxyError::UpstreamStream(format!("bad stream event: {e}")))
}

/// OpenAI finish reasons rendered as Anthropic stop reasons.
pub fn stop_reason_from_finish(finish: &str) -> &'static str {
	match finish {
		"length" => "max_tokens",
		"tool_calls" | "function_call" => "tool_use",
		"content_filter" => "refusal",
		_ => "end_turn",
	}
}

// Client-dialect frame synthesis for cross-family streams.

pub fn message_start_frame(id: &str, model: &str, input_tokens: u64) -> SseFrame {
	let payload = json!({
		"type": "message_start",
		"message": {
			"id": id,
			"type": "message",
			"role": "assistant",
			"content": [],
			"model": model,
			"stop_reason": null,
			"stop_sequence": null,
			"usage": {"input_tokens": input_tokens, "output_tokens": 0},
		},
	});
	SseFrame::new(Some("message_start"), payload.to_string())
}

pub fn content_block_start_frame(index: u64) -> SseFrame {
	let payload = json!({
		"type": "content_block_start",
		"index": index,
		"content_block": {"type": "text", "text": ""},
	});
	SseFrame::new(Some("content_block_start"), payload.to_string())
}

pub fn text_delta_frame(index: u64, text: &str) -> SseFrame {
	let payload = json!({
		"type": "content_block_delta",
		"index": index,
		"delta": {"type": "text_delta", "text": text},
	});
	SseFrame::new(Some("content_block_delta"), payload.to_string())
}

pub fn content_block_stop_frame(index: u64) -> SseFrame {
	let payload = json!({"type": "content_block_stop", "index": index});
	SseFrame::new(Some("content_block_stop"), payload.to_string())
}

pub fn message_delta_frame(stop_reason: &str, output_tokens: u64) -> SseFrame {
	let payload = json!({
		"type": "message_delta",
		"delta": {"stop_reason": stop_reason, "stop_sequence": null},
		"usage": {"output_tokens": output_tokens},
	});
	SseFrame::new(Some("message_delta"), payload.to_string())
}

pub fn message_stop_frame() -> SseFrame {
	SseFrame::new(Some("message_stop"), json!({"type": "message_stop"}).to_string())
}

/// Non-streaming Messages-style encoding of a neutral response.
pub fn encode_response(resp: &ProxyResponse, request_id: &str) -> Value {
	json!({
		"id": format!("msg_{request_id}"),
		"type": "message",
		"role": "assistant",
		"model": resp.model,
		"content": [{"type": "text", "text": resp.content}],
		"stop_reason": resp.finish_reason.as_deref().unwrap_or("end_turn"),
		"stop_sequence": null,
		"usage": {
			"input_tokens": resp.input_tokens,
			"output_tokens": resp.output_tokens,
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ingress_decodes_text_and_keeps_raw_body() {
		let body = json!({
			"model": "claude-x",
			"messages": [
				{"role": "user", "content": "hello"},
				{"role": "assistant", "content": [{"type": "text", "text": "hi"}]},
				{"role": "user", "content": [
					{"type": "text", "text": "use the tool"},
					{"type": "tool_result", "tool_use_id": "t1", "content": "42"}
				]}
			],
			"system": "be brief",
			"max_tokens": 64,
			"stream": true,
			"tools": [{"name": "search"}],
			"metadata": {"user_id": "u1"}
		});
		let parsed = parse_ingress(body.clone()).unwrap();
		assert_eq!(parsed.messages.len(), 3);
		assert_eq!(parsed.messages[1].content, "hi");
		assert_eq!(parsed.messages[2].content, "use the tool");
		assert_eq!(parsed.system.as_deref(), Some("be brief"));
		assert_eq!(parsed.max_tokens, 64);
		assert!(parsed.stream);
		assert!(parsed.has_tools);
		assert_eq!(parsed.raw_body, Some(body));
	}

	#[test]
	fn unsupported_role_is_invalid_request() {
		let body = json!({"messages": [{"role": "tool", "content": "x"}]});
		let err = parse_ingress(body).unwrap_err();
		assert_eq!(err.kind(), "invalid_request");
	}

	#[test]
	fn empty_messages_is_invalid_request() {
		let err = parse_ingress(json!({"messages": []})).unwrap_err();
		assert_eq!(err.kind(), "invalid_request");
	}

	#[test]
	fn passthrough_overrides_only_model_and_stream() {
		let raw = json!({
			"model": "requested",
			"stream": false,
			"messages": [{"role": "user", "content": "x"}],
			"tools": [{"name": "t"}],
			"thinking": {"type": "enabled", "budget_tokens": 1024},
		});
		let body = passthrough_body(&raw, "routed", true);
		assert_eq!(body["model"], "routed");
		assert_eq!(body["stream"], true);
		assert_eq!(body["tools"], raw["tools"]);
		assert_eq!(body["thinking"], raw["thinking"]);
		assert_eq!(body["messages"], raw["messages"]);
	}

	#[test]
	fn auto_auth_routes_sk_ant_keys_to_api_key_header() {
		assert_eq!(auth_scheme("sk-ant-abc", AuthType::Auto), AuthScheme::XApiKey);
		assert_eq!(auth_scheme("oat-token", AuthType::Auto), AuthScheme::Bearer);
		assert_eq!(auth_scheme("oat-token", AuthType::ApiKey), AuthScheme::XApiKey);
		assert_eq!(auth_scheme("sk-ant-abc", AuthType::Bearer), AuthScheme::Bearer);
	}

	#[test]
	fn stream_events_decode_by_type_tag() {
		let ev = parse_stream_event(
			r#"{"type":"message_start","message":{"id":"msg_1","model":"m","usage":{"input_tokens":7,"output_tokens":1}}}"#,
		)
		.unwrap();
		let StreamEvent::MessageStart { message } = ev else {
			panic!("wrong variant");
		};
		assert_eq!(message.usage.input_tokens, 7);

		let ev = parse_stream_event(
			r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
		)
		.unwrap();
		let StreamEvent::ContentBlockDelta { delta, .. } = ev else {
			panic!("wrong variant");
		};
		assert!(matches!(delta, ContentDelta::TextDelta { text } if text == "hi"));

		let ev = parse_stream_event(
			r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
		)
		.unwrap();
		let StreamEvent::MessageDelta { usage, .. } = ev else {
			panic!("wrong variant");
		};
		assert_eq!(usage.unwrap().output_tokens, 42);

		// Unknown event types do not break the stream.
		assert!(matches!(
			parse_stream_event(r#"{"type":"shiny_new_event","x":1}"#).unwrap(),
			StreamEvent::Unknown
		));
	}

	#[test]
	fn response_text_concatenates_text_blocks() {
		let resp = decode_response(
			br#"{"id":"msg_1","model":"m","content":[{"type":"text","text":"a"},{"type":"tool_use","id":"t","name":"n","input":{}},{"type":"text","text":"b"}],"stop_reason":"end_turn","usage":{"input_tokens":1,"output_tokens":2}}"#,
		)
		.unwrap();
		assert_eq!(resp.text(), "ab");
		assert_eq!(resp.usage.output_tokens, 2);
	}
}
