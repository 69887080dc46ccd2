//! Gemini generate-content wire format. The API key rides in the query
//! string; streaming uses the SSE variant of the same endpoint, one JSON
//! object per `data:` line.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::llm::{ParsedRequest, ProxyError, Role};

/// Endpoint path for `model`, with the key as a query parameter.
pub fn request_path(model: &str, stream: bool, api_key: &str) -> String {
	if stream {
		format!("/v1beta/models/{model}:streamGenerateContent?alt=sse&key={api_key}")
	} else {
		format!("/v1beta/models/{model}:generateContent?key={api_key}")
	}
}

pub fn build_body(req: &ParsedRequest, _model: &str) -> Value {
	let contents: Vec<Value> = req
		.messages
		.iter()
		.map(|m| {
			json!({
				"role": match m.role {
					Role::User => "user",
					Role::Assistant => "model",
				},
				"parts": [{"text": m.content}],
			})
		})
		.collect();
	let mut body = json!({
		"contents": contents,
		"generationConfig": {
			"maxOutputTokens": req.max_tokens,
		},
	});
	if let Some(t) = req.temperature {
		body["generationConfig"]["temperature"] = json!(t);
	}
	if let Some(system) = &req.system {
		body["systemInstruction"] = json!({"parts": [{"text": system}]});
	}
	body
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
	#[serde(default)]
	pub prompt_token_count: u64,
	#[serde(default)]
	pub candidates_token_count: u64,
	#[serde(default)]
	pub total_token_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
	#[serde(default)]
	pub candidates: Vec<Candidate>,
	#[serde(default)]
	pub usage_metadata: Option<UsageMetadata>,
	#[serde(default)]
	pub model_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
	#[serde(default)]
	pub content: Option<Content>,
	#[serde(default)]
	pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Content {
	#[serde(default)]
	pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Part {
	#[serde(default)]
	pub text: Option<String>,
}

impl GenerateResponse {
	pub fn text(&self) -> String {
		self
			.candidates
			.first()
			.and_then(|c| c.content.as_ref())
			.map(|c| {
				c.parts
					.iter()
					.filter_map(|p| p.text.as_deref())
					.collect::<Vec<_>>()
					.join("")
			})
			.unwrap_or_default()
	}

	pub fn finish_reason(&self) -> Option<&str> {
		self.candidates.first().and_then(|c| c.finish_reason.as_deref())
	}
}

pub fn decode_response(bytes: &[u8]) -> Result<GenerateResponse, ProxyError> {
	serde_json::from_slice(bytes)
		.map_err(|e| ProxyError::UpstreamStream(format!("bad generate response: {e}")))
}

pub fn parse_stream_chunk(data: &str) -> Result<GenerateResponse, ProxyError> {
	serde_json::from_str(data)
		.map_err(|e| ProxyError::UpstreamStream(format!("bad stream chunk: {e}")))
}

/// Gemini finish reasons rendered as Anthropic-style stop reasons.
pub fn stop_reason_from_finish(finish: &str) -> &'static str {
	match finish {
		"MAX_TOKENS" => "max_tokens",
		"SAFETY" | "PROHIBITED_CONTENT" => "refusal",
		_ => "end_turn",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::llm::{IngressFormat, NeutralMessage};

	fn parsed() -> ParsedRequest {
		ParsedRequest {
			messages: vec![
				NeutralMessage {
					role: Role::User,
					content: "hi".into(),
				},
				NeutralMessage {
					role: Role::Assistant,
					content: "hello".into(),
				},
			],
			system: Some("be brief".into()),
			max_tokens: 128,
			temperature: Some(0.2),
			stream: false,
			ingress: IngressFormat::OpenAi,
			raw_body: None,
			has_tools: false,
			anthropic_version: None,
			anthropic_beta: None,
		}
	}

	#[test]
	fn body_maps_assistant_to_model_role() {
		let body = build_body(&parsed(), "flash");
		assert_eq!(body["contents"][0]["role"], "user");
		assert_eq!(body["contents"][1]["role"], "model");
		assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
		assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
	}

	#[test]
	fn stream_path_uses_sse_variant() {
		assert_eq!(
			request_path("flash", true, "K"),
			"/v1beta/models/flash:streamGenerateContent?alt=sse&key=K"
		);
		assert_eq!(
			request_path("flash", false, "K"),
			"/v1beta/models/flash:generateContent?key=K"
		);
	}

	#[test]
	fn response_text_joins_parts() {
		let resp = decode_response(
			br#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":9,"totalTokenCount":14}}"#,
		)
		.unwrap();
		assert_eq!(resp.text(), "ab");
		assert_eq!(resp.finish_reason(), Some("STOP"));
		assert_eq!(resp.usage_metadata.unwrap().candidates_token_count, 9);
	}
}
