use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::store::dualkey::KeyType;

pub mod anthropic;
pub mod dispatch;
pub mod google;
pub mod openai;

/// The closed set of supported LLM backends. Each tag binds at configuration
/// time to an (apiKey, baseUrl) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
	Anthropic,
	Openai,
	Deepseek,
	Xai,
	Moonshot,
	Mistral,
	Ollama,
	Google,
}

/// Which upstream wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
	Anthropic,
	OpenAiCompat,
	Google,
}

impl ProviderTag {
	pub fn family(&self) -> Family {
		match self {
			ProviderTag::Anthropic => Family::Anthropic,
			ProviderTag::Google => Family::Google,
			ProviderTag::Openai
			| ProviderTag::Deepseek
			| ProviderTag::Xai
			| ProviderTag::Moonshot
			| ProviderTag::Mistral
			| ProviderTag::Ollama => Family::OpenAiCompat,
		}
	}

	/// Ollama binds to a local daemon and does not require a key.
	pub fn requires_key(&self) -> bool {
		!matches!(self, ProviderTag::Ollama)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ProviderTag::Anthropic => "anthropic",
			ProviderTag::Openai => "openai",
			ProviderTag::Deepseek => "deepseek",
			ProviderTag::Xai => "xai",
			ProviderTag::Moonshot => "moonshot",
			ProviderTag::Mistral => "mistral",
			ProviderTag::Ollama => "ollama",
			ProviderTag::Google => "google",
		}
	}

	pub const ALL: [ProviderTag; 8] = [
		ProviderTag::Anthropic,
		ProviderTag::Openai,
		ProviderTag::Deepseek,
		ProviderTag::Xai,
		ProviderTag::Moonshot,
		ProviderTag::Mistral,
		ProviderTag::Ollama,
		ProviderTag::Google,
	];
}

impl std::fmt::Display for ProviderTag {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	User,
	Assistant,
}

/// A provider-neutral chat message. Tool-call content blocks in raw requests
/// are opaque and only survive through the passthrough path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeutralMessage {
	pub role: Role,
	pub content: String,
}

/// Which chat-API shape the request arrived in. Drives the dialect of the
/// outbound translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressFormat {
	Anthropic,
	OpenAi,
}

impl IngressFormat {
	pub fn as_str(&self) -> &'static str {
		match self {
			IngressFormat::Anthropic => "anthropic",
			IngressFormat::OpenAi => "openai",
		}
	}
}

/// The neutral decoded form of an inbound request.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
	pub messages: Vec<NeutralMessage>,
	pub system: Option<String>,
	pub max_tokens: u64,
	pub temperature: Option<f64>,
	pub stream: bool,
	pub ingress: IngressFormat,
	/// Original request body, kept for verbatim provider passthrough when the
	/// ingress was Messages-style and the chosen provider is Anthropic-family.
	pub raw_body: Option<serde_json::Value>,
	pub has_tools: bool,
	/// `anthropic-version` / `anthropic-beta` request headers, forwarded
	/// verbatim when the upstream is Anthropic-family.
	pub anthropic_version: Option<String>,
	pub anthropic_beta: Option<String>,
}

impl ParsedRequest {
	/// Text of the last user utterance; the classifier and override detector
	/// both key off this.
	pub fn last_user_text(&self) -> &str {
		self
			.messages
			.iter()
			.rev()
			.find(|m| m.role == Role::User)
			.map(|m| m.content.as_str())
			.unwrap_or("")
	}
}

/// A provider-neutral non-streaming completion, decoded from whichever wire
/// format the upstream spoke.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
	pub content: String,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub finish_reason: Option<String>,
	pub model: String,
	pub provider: ProviderTag,
	pub key_type: Option<KeyType>,
	pub failover: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("no model is configured and not rate limited")]
	NoAvailableModel,
	#[error("upstream rate limited: {0}")]
	UpstreamRateLimited(String),
	#[error("upstream auth failed: {0}")]
	UpstreamAuthFailed(String),
	#[error("upstream {provider} returned {status}: {body}")]
	Upstream {
		status: u16,
		provider: ProviderTag,
		body: String,
	},
	#[error("upstream stream error: {0}")]
	UpstreamStream(String),
	#[error("configuration: {0}")]
	Config(String),
	#[error("internal: {0}")]
	Internal(String),
}

impl ProxyError {
	/// Stable error kind, used for the typed JSON error body.
	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::InvalidRequest(_) => "invalid_request",
			ProxyError::NoAvailableModel => "no_available_model",
			ProxyError::UpstreamRateLimited(_) => "upstream_rate_limited",
			ProxyError::UpstreamAuthFailed(_) => "upstream_auth_failed",
			ProxyError::Upstream { .. } => "upstream_error",
			ProxyError::UpstreamStream(_) => "upstream_stream_error",
			ProxyError::Config(_) | ProxyError::Internal(_) => "internal",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::NoAvailableModel => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::UpstreamAuthFailed(_) => StatusCode::UNAUTHORIZED,
			ProxyError::Upstream { .. } | ProxyError::UpstreamStream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Config(_) | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Typed JSON body surfaced to clients: `{error: {type, message}}`.
	pub fn to_body(&self) -> serde_json::Value {
		serde_json::json!({
			"error": {
				"type": self.kind(),
				"message": self.to_string(),
			}
		})
	}
}
