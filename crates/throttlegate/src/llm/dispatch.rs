//! Upstream dispatch.
//!
//! Builds the provider-native request for the routed model and sends it with
//! that provider's authentication. The Anthropic family gets transparent
//! dual-key failover: a 429/401 on the primary key type puts it on cooldown
//! and retries once with the fallback, annotating the response. Any final
//! 429 marks the model rate limited for the router.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::llm::{Family, IngressFormat, ParsedRequest, ProviderTag, ProxyError, anthropic, google, openai};
use crate::registry::ModelSpec;
use crate::store::dualkey::{DualKeyState, KEY_COOLDOWN, KeyType};
use crate::store::ratelimit::{DEFAULT_COOLDOWN, RateLimiter};

const ERROR_EXCERPT_LIMIT: usize = 512;

pub struct Dispatcher {
	client: reqwest::Client,
	cfg: Arc<Config>,
	rate: RateLimiter,
	dual: DualKeyState,
}

/// A successful (2xx) upstream response plus failover annotations.
pub struct DispatchOutcome {
	pub response: reqwest::Response,
	pub key_type: Option<KeyType>,
	pub failover: bool,
}

impl Dispatcher {
	pub fn new(cfg: Arc<Config>, rate: RateLimiter, dual: DualKeyState) -> Self {
		Dispatcher {
			client: reqwest::Client::new(),
			cfg,
			rate,
			dual,
		}
	}

	pub async fn dispatch(
		&self,
		model: &ModelSpec,
		req: &ParsedRequest,
	) -> Result<DispatchOutcome, ProxyError> {
		match model.provider.family() {
			Family::Anthropic => self.dispatch_anthropic(model, req).await,
			Family::Google => self.dispatch_google(model, req).await,
			Family::OpenAiCompat => self.dispatch_openai_compat(model, req).await,
		}
	}

	async fn dispatch_anthropic(
		&self,
		model: &ModelSpec,
		req: &ParsedRequest,
	) -> Result<DispatchOutcome, ProxyError> {
		let provider = self
			.cfg
			.providers
			.anthropic
			.as_ref()
			.ok_or_else(|| ProxyError::Internal("anthropic routed but not configured".into()))?;
		let plan = self
			.dual
			.plan(
				!provider.setup_token.is_empty(),
				!provider.api_key.is_empty(),
				provider.prefer_setup_token,
			)
			.ok_or_else(|| {
				ProxyError::UpstreamRateLimited("all anthropic key types are cooling down".into())
			})?;

		// Messages-style ingress passes the raw body through so tool blocks
		// and vendor fields round-trip; only model and stream are overridden.
		let body = match (&req.raw_body, req.ingress) {
			(Some(raw), IngressFormat::Anthropic) => {
				anthropic::passthrough_body(raw, &model.id, req.stream)
			},
			_ => anthropic::build_body(req, &model.id, req.stream),
		};

		let resp = self.send_anthropic(provider, plan.primary, req, &body).await?;
		if !matches!(
			resp.status(),
			StatusCode::TOO_MANY_REQUESTS | StatusCode::UNAUTHORIZED
		) {
			let resp = self.ensure_success(resp, model).await?;
			return Ok(DispatchOutcome {
				response: resp,
				key_type: Some(plan.primary),
				failover: false,
			});
		}

		self.dual.mark_cooldown(plan.primary, KEY_COOLDOWN);
		let Some(fallback) = plan.fallback else {
			return Err(self.upstream_error(resp, model).await);
		};
		debug!(model = %model.id, from = %plan.primary, to = %fallback, "anthropic key failover");
		let retry = self.send_anthropic(provider, fallback, req, &body).await?;
		if matches!(
			retry.status(),
			StatusCode::TOO_MANY_REQUESTS | StatusCode::UNAUTHORIZED
		) {
			self.dual.mark_cooldown(fallback, KEY_COOLDOWN);
		}
		let retry = self.ensure_success(retry, model).await?;
		Ok(DispatchOutcome {
			response: retry,
			key_type: Some(fallback),
			failover: true,
		})
	}

	async fn send_anthropic(
		&self,
		provider: &crate::config::AnthropicConfig,
		key_type: KeyType,
		req: &ParsedRequest,
		body: &Value,
	) -> Result<reqwest::Response, ProxyError> {
		let key = match key_type {
			KeyType::SetupToken => &provider.setup_token,
			KeyType::Enterprise => &provider.api_key,
		};
		let url = format!("{}/v1/messages", self.cfg.base_url(ProviderTag::Anthropic));
		let mut builder = self.client.post(&url).json(body);
		builder = match anthropic::auth_scheme(key, provider.auth_type) {
			anthropic::AuthScheme::XApiKey => builder.header("x-api-key", key),
			anthropic::AuthScheme::Bearer => builder.bearer_auth(key),
		};
		builder = builder.header(
			"anthropic-version",
			req
				.anthropic_version
				.as_deref()
				.unwrap_or(anthropic::DEFAULT_VERSION),
		);
		if let Some(beta) = &req.anthropic_beta {
			builder = builder.header("anthropic-beta", beta);
		}
		builder
			.send()
			.await
			.map_err(|e| ProxyError::UpstreamStream(format!("anthropic request failed: {e}")))
	}

	async fn dispatch_google(
		&self,
		model: &ModelSpec,
		req: &ParsedRequest,
	) -> Result<DispatchOutcome, ProxyError> {
		let key = self
			.cfg
			.provider(ProviderTag::Google)
			.map(|p| p.api_key.clone())
			.unwrap_or_default();
		let url = format!(
			"{}{}",
			self.cfg.base_url(ProviderTag::Google),
			google::request_path(&model.id, req.stream, &key)
		);
		let body = google::build_body(req, &model.id);
		let resp = self
			.client
			.post(&url)
			.json(&body)
			.send()
			.await
			.map_err(|e| ProxyError::UpstreamStream(format!("google request failed: {e}")))?;
		let resp = self.ensure_success(resp, model).await?;
		Ok(DispatchOutcome {
			response: resp,
			key_type: None,
			failover: false,
		})
	}

	async fn dispatch_openai_compat(
		&self,
		model: &ModelSpec,
		req: &ParsedRequest,
	) -> Result<DispatchOutcome, ProxyError> {
		let url = format!(
			"{}/v1/chat/completions",
			self.cfg.base_url(model.provider)
		);
		let body = openai::build_body(req, &model.id, req.stream);
		let mut builder = self.client.post(&url).json(&body);
		if let Some(p) = self.cfg.provider(model.provider)
			&& !p.api_key.is_empty()
		{
			builder = builder.bearer_auth(&p.api_key);
		}
		let resp = builder.send().await.map_err(|e| {
			ProxyError::UpstreamStream(format!("{} request failed: {e}", model.provider))
		})?;
		let resp = self.ensure_success(resp, model).await?;
		Ok(DispatchOutcome {
			response: resp,
			key_type: None,
			failover: false,
		})
	}

	async fn ensure_success(
		&self,
		resp: reqwest::Response,
		model: &ModelSpec,
	) -> Result<reqwest::Response, ProxyError> {
		if resp.status().is_success() {
			Ok(resp)
		} else {
			Err(self.upstream_error(resp, model).await)
		}
	}

	async fn upstream_error(&self, resp: reqwest::Response, model: &ModelSpec) -> ProxyError {
		let status = resp.status();
		let body = resp.text().await.unwrap_or_default();
		if status == StatusCode::TOO_MANY_REQUESTS {
			self.rate.mark_rate_limited(&model.id, DEFAULT_COOLDOWN);
		}
		warn!(model = %model.id, %status, "upstream error");
		classify_upstream_error(status.as_u16(), model.provider, &body)
	}
}

fn excerpt(body: &str) -> String {
	let mut s = body.trim().to_string();
	if s.len() > ERROR_EXCERPT_LIMIT {
		let mut end = ERROR_EXCERPT_LIMIT;
		while !s.is_char_boundary(end) {
			end -= 1;
		}
		s.truncate(end);
	}
	s
}

fn classify_upstream_error(status: u16, provider: ProviderTag, body: &str) -> ProxyError {
	let body = excerpt(body);
	match status {
		429 => ProxyError::UpstreamRateLimited(body),
		401 => ProxyError::UpstreamAuthFailed(body),
		_ => ProxyError::Upstream {
			status,
			provider,
			body,
		},
	}
}
