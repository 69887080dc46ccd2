//! Configuration file loading.
//!
//! A single JSON file describes the routing mode, provider credentials, file
//! paths for the classifier weights, model catalog, routing table and routing
//! log, and the HTTP bind. Environment variables override provider keys and
//! the mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::llm::{ProviderTag, ProxyError};

/// User-selected routing posture. `performance` is the older name for
/// `gigachad` in one configuration vintage; it loads, but the canonical value
/// in logs and stats is always `gigachad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	Eco,
	Standard,
	#[serde(alias = "performance")]
	Gigachad,
}

impl Mode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Mode::Eco => "eco",
			Mode::Standard => "standard",
			Mode::Gigachad => "gigachad",
		}
	}
}

impl std::fmt::Display for Mode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for Mode {
	type Err = ProxyError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"eco" => Ok(Mode::Eco),
			"standard" => Ok(Mode::Standard),
			"gigachad" | "performance" => Ok(Mode::Gigachad),
			other => Err(ProxyError::Config(format!("unknown mode: {other}"))),
		}
	}
}

/// How the Anthropic key is presented upstream. `auto` routes `sk-ant-*` keys
/// through `x-api-key` and anything else through a bearer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
	ApiKey,
	Bearer,
	#[default]
	Auto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
	pub api_key: String,
	pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnthropicConfig {
	/// Enterprise key.
	pub api_key: String,
	/// Setup-token credential, independently rate limited from the key above.
	pub setup_token: String,
	pub prefer_setup_token: bool,
	pub base_url: Option<String>,
	pub auth_type: AuthType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Providers {
	pub anthropic: Option<AnthropicConfig>,
	pub openai: Option<ProviderConfig>,
	pub deepseek: Option<ProviderConfig>,
	pub xai: Option<ProviderConfig>,
	pub moonshot: Option<ProviderConfig>,
	pub mistral: Option<ProviderConfig>,
	pub ollama: Option<ProviderConfig>,
	pub google: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
	pub weights_path: Option<PathBuf>,
	pub thresholds: ThresholdsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdsConfig {
	pub simple_max: f64,
	pub complex_min: f64,
}

impl Default for ThresholdsConfig {
	fn default() -> Self {
		ThresholdsConfig {
			simple_max: 0.30,
			complex_min: 0.65,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
	pub level: String,
	pub log_file_path: PathBuf,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		LoggingConfig {
			level: "info".to_string(),
			log_file_path: PathBuf::from("throttlegate-routing.jsonl"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
	pub port: u16,
	pub enabled: bool,
}

impl Default for HttpConfig {
	fn default() -> Self {
		HttpConfig {
			port: 8484,
			enabled: true,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub mode: Mode,
	pub providers: Providers,
	pub classifier: ClassifierConfig,
	pub model_catalog_path: PathBuf,
	pub routing_table_path: PathBuf,
	/// Force-model aliases (`opus`, `flash`, ...) to catalog model ids.
	pub aliases: HashMap<String, String>,
	pub logging: LoggingConfig,
	pub http: HttpConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			mode: Mode::Standard,
			providers: Providers::default(),
			classifier: ClassifierConfig::default(),
			model_catalog_path: PathBuf::from("models.json"),
			routing_table_path: PathBuf::from("routing.json"),
			aliases: HashMap::new(),
			logging: LoggingConfig::default(),
			http: HttpConfig::default(),
		}
	}
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, ProxyError> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| ProxyError::Config(format!("config {}: {e}", path.display())))?;
		let mut cfg: Config = serde_json::from_str(&raw)
			.map_err(|e| ProxyError::Config(format!("config {}: {e}", path.display())))?;
		cfg.apply_env_overrides(|name| std::env::var(name).ok());
		Ok(cfg)
	}

	/// Env vars override file values for provider keys and the mode. Split
	/// out from the env itself so it can be exercised without process state.
	pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
		if let Some(mode) = get("THROTTLE_MODE")
			&& let Ok(mode) = mode.parse()
		{
			self.mode = mode;
		}
		if let Some(key) = get("ANTHROPIC_API_KEY") {
			self.providers.anthropic.get_or_insert_default().api_key = key;
		}
		if let Some(token) = get("ANTHROPIC_SETUP_TOKEN") {
			self.providers.anthropic.get_or_insert_default().setup_token = token;
		}
		for (var, slot) in [
			("OPENAI_API_KEY", &mut self.providers.openai),
			("DEEPSEEK_API_KEY", &mut self.providers.deepseek),
			("XAI_API_KEY", &mut self.providers.xai),
			("MOONSHOT_API_KEY", &mut self.providers.moonshot),
			("MISTRAL_API_KEY", &mut self.providers.mistral),
			("GEMINI_API_KEY", &mut self.providers.google),
		] {
			if let Some(key) = get(var) {
				slot.get_or_insert_default().api_key = key;
			}
		}
	}

	/// A provider is configured iff its section is present and, for backends
	/// that require one, a key is set. Anthropic counts either credential.
	pub fn is_configured(&self, tag: ProviderTag) -> bool {
		match tag {
			ProviderTag::Anthropic => self
				.providers
				.anthropic
				.as_ref()
				.is_some_and(|a| !a.api_key.is_empty() || !a.setup_token.is_empty()),
			ProviderTag::Ollama => self.providers.ollama.is_some(),
			_ => self
				.provider(tag)
				.is_some_and(|p| !p.api_key.is_empty()),
		}
	}

	pub fn provider(&self, tag: ProviderTag) -> Option<&ProviderConfig> {
		match tag {
			ProviderTag::Anthropic => None,
			ProviderTag::Openai => self.providers.openai.as_ref(),
			ProviderTag::Deepseek => self.providers.deepseek.as_ref(),
			ProviderTag::Xai => self.providers.xai.as_ref(),
			ProviderTag::Moonshot => self.providers.moonshot.as_ref(),
			ProviderTag::Mistral => self.providers.mistral.as_ref(),
			ProviderTag::Ollama => self.providers.ollama.as_ref(),
			ProviderTag::Google => self.providers.google.as_ref(),
		}
	}

	pub fn base_url(&self, tag: ProviderTag) -> String {
		let configured = match tag {
			ProviderTag::Anthropic => self
				.providers
				.anthropic
				.as_ref()
				.and_then(|a| a.base_url.clone()),
			_ => self.provider(tag).and_then(|p| p.base_url.clone()),
		};
		configured.unwrap_or_else(|| default_base_url(tag).to_string())
	}
}

pub fn default_base_url(tag: ProviderTag) -> &'static str {
	match tag {
		ProviderTag::Anthropic => "https://api.anthropic.com",
		ProviderTag::Openai => "https://api.openai.com",
		ProviderTag::Deepseek => "https://api.deepseek.com",
		ProviderTag::Xai => "https://api.x.ai",
		ProviderTag::Moonshot => "https://api.moonshot.ai",
		ProviderTag::Mistral => "https://api.mistral.ai",
		ProviderTag::Ollama => "http://127.0.0.1:11434",
		ProviderTag::Google => "https://generativelanguage.googleapis.com",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn performance_vintage_loads_as_gigachad() {
		let cfg: Config = serde_json::from_str(r#"{"mode": "performance"}"#).unwrap();
		assert_eq!(cfg.mode, Mode::Gigachad);
		assert_eq!(cfg.mode.to_string(), "gigachad");
		let cfg: Config = serde_json::from_str(r#"{"mode": "gigachad"}"#).unwrap();
		assert_eq!(cfg.mode, Mode::Gigachad);
	}

	#[test]
	fn env_overrides_take_precedence() {
		let mut cfg: Config = serde_json::from_str(
			r#"{"mode": "eco", "providers": {"openai": {"apiKey": "file-key"}}}"#,
		)
		.unwrap();
		cfg.apply_env_overrides(|name| match name {
			"THROTTLE_MODE" => Some("gigachad".to_string()),
			"OPENAI_API_KEY" => Some("env-key".to_string()),
			"DEEPSEEK_API_KEY" => Some("ds-key".to_string()),
			_ => None,
		});
		assert_eq!(cfg.mode, Mode::Gigachad);
		assert_eq!(cfg.providers.openai.unwrap().api_key, "env-key");
		assert_eq!(cfg.providers.deepseek.unwrap().api_key, "ds-key");
	}

	#[test]
	fn configured_requires_a_key_except_for_ollama() {
		let cfg: Config = serde_json::from_str(
			r#"{"providers": {
				"openai": {"apiKey": ""},
				"ollama": {},
				"anthropic": {"setupToken": "tok"}
			}}"#,
		)
		.unwrap();
		assert!(!cfg.is_configured(ProviderTag::Openai));
		assert!(cfg.is_configured(ProviderTag::Ollama));
		assert!(cfg.is_configured(ProviderTag::Anthropic));
		assert!(!cfg.is_configured(ProviderTag::Mistral));
	}

	#[test]
	fn base_url_falls_back_to_provider_default() {
		let cfg: Config =
			serde_json::from_str(r#"{"providers": {"openai": {"apiKey": "k", "baseUrl": "http://x"}}}"#)
				.unwrap();
		assert_eq!(cfg.base_url(ProviderTag::Openai), "http://x");
		assert_eq!(
			cfg.base_url(ProviderTag::Deepseek),
			"https://api.deepseek.com"
		);
	}
}
