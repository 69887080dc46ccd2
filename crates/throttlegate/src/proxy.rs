//! HTTP surface and the request-path pipeline.
//!
//! Two chat ingress shapes plus health and stats. Each chat request walks:
//! classify → override detect → dedup → route → session pin → dispatch →
//! mediate → log. The pipeline stages before dispatch are synchronous;
//! suspension happens only on the body read, the dedup wait, the upstream
//! call, and the stream relay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{Classifier, PromptMeta, Thresholds, Weights};
use crate::config::Config;
use crate::llm::dispatch::Dispatcher;
use crate::llm::{IngressFormat, ParsedRequest, ProxyError, anthropic, openai};
use crate::overrides::{self, Override, OverrideInput};
use crate::registry::ModelRegistry;
use crate::relay::{self, StreamTranslator};
use crate::route::{self, RoutingDecision};
use crate::store::dedup::{CachedResponse, DedupOutcome, ProducerGuard, ReplayInfo};
use crate::store::{DedupCache, DualKeyState, RateLimiter, SessionStore};
use crate::telemetry::{RoutingLog, RoutingLogEntry, stats};

/// How recently a session failure forces the one-shot tier escalation.
const FAILURE_ESCALATION_WINDOW: Duration = Duration::from_secs(5 * 60);

pub struct App {
	pub cfg: Arc<Config>,
	pub registry: Arc<ModelRegistry>,
	pub classifier: Classifier,
	pub sessions: SessionStore,
	pub dedup: DedupCache,
	pub rate: RateLimiter,
	pub dispatcher: Dispatcher,
	pub log: RoutingLog,
	pub started: Instant,
}

impl App {
	pub fn new(cfg: Config) -> Result<Arc<Self>, ProxyError> {
		let cfg = Arc::new(cfg);
		let registry = Arc::new(ModelRegistry::load(
			&cfg.model_catalog_path,
			&cfg.routing_table_path,
			cfg.aliases.clone(),
		)?);
		let weights = match &cfg.classifier.weights_path {
			Some(path) => Weights::from_file(path)?,
			None => Weights::default(),
		};
		let thresholds = Thresholds {
			simple_max: cfg.classifier.thresholds.simple_max,
			complex_min: cfg.classifier.thresholds.complex_min,
		};
		let rate = RateLimiter::new();
		let dual = DualKeyState::new();
		let dispatcher = Dispatcher::new(cfg.clone(), rate.clone(), dual);
		let log = RoutingLog::open(&cfg.logging.log_file_path);
		Ok(Arc::new(App {
			cfg,
			registry,
			classifier: Classifier::new(weights, thresholds),
			sessions: SessionStore::default(),
			dedup: DedupCache::default(),
			rate,
			dispatcher,
			log,
			started: Instant::now(),
		}))
	}
}

pub fn router(app: Arc<App>) -> Router {
	Router::new()
		.route("/v1/messages", post(handle_messages))
		.route("/v1/chat/completions", post(handle_completions))
		.route("/health", get(handle_health))
		.route("/stats", get(handle_stats))
		.with_state(app)
}

/// Loopback bind; the proxy trusts its local clients.
pub async fn serve(app: Arc<App>) -> anyhow::Result<()> {
	let addr = format!("127.0.0.1:{}", app.cfg.http.port);
	let sweeper = app.sessions.spawn_sweeper();
	let listener = tokio::net::TcpListener::bind(&addr).await?;
	info!(%addr, mode = %app.cfg.mode, "throttlegate listening");
	axum::serve(listener, router(app))
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutting down");
		})
		.await?;
	sweeper.abort();
	Ok(())
}

async fn handle_messages(
	State(app): State<Arc<App>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let request_id = Uuid::new_v4().to_string();
	let parsed = serde_json::from_slice(&body)
		.map_err(|e| ProxyError::InvalidRequest(format!("malformed JSON: {e}")))
		.and_then(anthropic::parse_ingress);
	match parsed {
		Ok(parsed) => run_pipeline(app, parsed, &headers, request_id).await,
		Err(e) => error_response(&e, &request_id),
	}
}

async fn handle_completions(
	State(app): State<Arc<App>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let request_id = Uuid::new_v4().to_string();
	let parsed = serde_json::from_slice(&body)
		.map_err(|e| ProxyError::InvalidRequest(format!("malformed JSON: {e}")))
		.and_then(openai::parse_ingress);
	match parsed {
		Ok(parsed) => run_pipeline(app, parsed, &headers, request_id).await,
		Err(e) => error_response(&e, &request_id),
	}
}

async fn handle_health(State(app): State<Arc<App>>) -> Response {
	json_response(
		StatusCode::OK,
		serde_json::json!({
			"status": "ok",
			"mode": app.cfg.mode,
			"uptime_seconds": app.started.elapsed().as_secs(),
		}),
	)
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
	days: Option<i64>,
}

async fn handle_stats(State(app): State<Arc<App>>, Query(q): Query<StatsQuery>) -> Response {
	let days = q.days.unwrap_or(30).max(0);
	let since = Utc::now() - chrono::Duration::days(days);
	let Some(baseline) = app.registry.most_expensive() else {
		return error_response(
			&ProxyError::Internal("empty model catalog".into()),
			&Uuid::new_v4().to_string(),
		);
	};
	let entries = app.log.read_since(since);
	json_response(
		StatusCode::OK,
		serde_json::to_value(stats::aggregate(&entries, since, baseline))
			.unwrap_or_default(),
	)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

async fn run_pipeline(
	app: Arc<App>,
	mut parsed: ParsedRequest,
	headers: &HeaderMap,
	request_id: String,
) -> Response {
	let session_id = header_str(headers, "x-session-id").map(str::to_string);
	let client_id = header_str(headers, "x-client-id").map(str::to_string);
	let force_model = header_str(headers, "x-throttle-force-model");
	let parent_id = header_str(headers, "x-parent-request-id");
	parsed.anthropic_version = header_str(headers, "anthropic-version").map(str::to_string);
	parsed.anthropic_beta = header_str(headers, "anthropic-beta").map(str::to_string);

	// Classify the last user utterance, with the one-shot failure escalation.
	let mut classification = app.classifier.classify(
		parsed.last_user_text(),
		&PromptMeta {
			message_count: parsed.messages.len(),
			system_prompt: parsed.system.as_deref(),
		},
	);
	if let Some(sid) = &session_id
		&& app
			.sessions
			.take_recent_failure(sid, FAILURE_ESCALATION_WINDOW)
	{
		classification.tier = classification.tier.step_up();
	}

	let override_ = match overrides::detect(
		&OverrideInput {
			last_user_text: parsed.last_user_text(),
			force_model_header: force_model,
			parent_request_id: parent_id,
			has_tools: parsed.has_tools,
		},
		&app.registry,
		|id| app.log.parent_model(id),
	) {
		Ok(o) => o,
		Err(e) => return error_response(&e, &request_id),
	};

	// Dedup applies to buffered responses only; an SSE stream is too
	// expensive to hold for replay.
	let mut producer: Option<ProducerGuard> = None;
	if !parsed.stream {
		let key = crate::store::dedup::canonical_key(parsed.system.as_deref(), &parsed.messages);
		loop {
			match app.dedup.begin(&key) {
				DedupOutcome::Hit(cached) => {
					log_replay(&app, &cached, &request_id, &classification, &override_, parent_id, client_id);
					return replay_response(&cached);
				},
				DedupOutcome::Wait(waiter) => {
					if let Some(cached) = DedupCache::wait(waiter).await {
						log_replay(&app, &cached, &request_id, &classification, &override_, parent_id, client_id);
						return replay_response(&cached);
					}
					// Producer failed; try again as a fresh request.
				},
				DedupOutcome::Produce(guard) => {
					producer = Some(guard);
					break;
				},
			}
		}
	}

	let decision = match route::decide(
		&classification,
		app.cfg.mode,
		&override_,
		&app.registry,
		&app.cfg,
		&app.rate,
	) {
		Ok(d) => d,
		Err(e) => {
			if let Some(sid) = &session_id {
				app.sessions.mark_failed(sid);
			}
			if let Some(guard) = producer {
				guard.fail();
			}
			return error_response(&e, &request_id);
		},
	};

	// Session pinning; overrides that force a model bypass the pin so a
	// heartbeat stays on the cheapest model.
	let decision = match (&session_id, &override_) {
		(Some(sid), Override::None | Override::ToolCalling) => {
			route::apply_session_pin(decision, &app.sessions, sid, &app.registry)
		},
		_ => decision,
	};

	let dispatch_start = Instant::now();
	let outcome = match app.dispatcher.dispatch(&decision.model, &parsed).await {
		Ok(o) => o,
		Err(e) => {
			if let Some(sid) = &session_id {
				app.sessions.mark_failed(sid);
			}
			if let Some(guard) = producer {
				guard.fail();
			}
			log_completion(
				&app,
				&request_id,
				&parsed,
				&classification,
				&decision,
				relay::TokenTally::default(),
				dispatch_start.elapsed(),
				parent_id,
				client_id,
				None,
				false,
			);
			return error_response(&e, &request_id);
		},
	};
	let key_type = outcome.key_type;
	let failover = outcome.failover;

	if parsed.stream {
		stream_response(
			app,
			parsed,
			outcome.response,
			request_id,
			classification,
			decision,
			dispatch_start,
			session_id,
			parent_id.map(str::to_string),
			client_id,
			key_type,
			failover,
		)
	} else {
		buffered_response(
			app,
			parsed,
			outcome.response,
			request_id,
			classification,
			decision,
			dispatch_start,
			session_id,
			parent_id,
			client_id,
			key_type,
			failover,
			producer,
		)
		.await
	}
}

#[allow(clippy::too_many_arguments)]
async fn buffered_response(
	app: Arc<App>,
	parsed: ParsedRequest,
	upstream: reqwest::Response,
	request_id: String,
	classification: crate::classify::Classification,
	decision: RoutingDecision,
	dispatch_start: Instant,
	session_id: Option<String>,
	parent_id: Option<&str>,
	client_id: Option<String>,
	key_type: Option<crate::store::dualkey::KeyType>,
	failover: bool,
	producer: Option<ProducerGuard>,
) -> Response {
	let bytes = match upstream.bytes().await {
		Ok(b) => b,
		Err(e) => {
			if let Some(sid) = &session_id {
				app.sessions.mark_failed(sid);
			}
			if let Some(guard) = producer {
				guard.fail();
			}
			log_completion(
				&app,
				&request_id,
				&parsed,
				&classification,
				&decision,
				relay::TokenTally::default(),
				dispatch_start.elapsed(),
				parent_id,
				client_id,
				key_type,
				failover,
			);
			let err = ProxyError::UpstreamStream(format!("upstream body read failed: {e}"));
			return error_response(&err, &request_id);
		},
	};
	let mut neutral =
		match relay::decode_response(decision.model.provider.family(), &bytes, decision.model.provider)
		{
			Ok(n) => n,
			Err(e) => {
				if let Some(sid) = &session_id {
					app.sessions.mark_failed(sid);
				}
				if let Some(guard) = producer {
					guard.fail();
				}
				log_completion(
					&app,
					&request_id,
					&parsed,
					&classification,
					&decision,
					relay::TokenTally::default(),
					dispatch_start.elapsed(),
					parent_id,
					client_id,
					key_type,
					failover,
				);
				return error_response(&e, &request_id);
			},
		};
	neutral.model = decision.model.id.clone();
	neutral.key_type = key_type;
	neutral.failover = failover;

	let body = relay::encode_response(parsed.ingress, &neutral, &request_id);
	let body_bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
	let tally = relay::TokenTally {
		input: neutral.input_tokens,
		output: neutral.output_tokens,
	};

	let mut headers = decision_headers(&request_id, &classification, &decision);
	headers.push(("content-type".to_string(), "application/json".to_string()));
	if let Some(kt) = key_type {
		headers.push(("x-throttle-key-type".to_string(), kt.to_string()));
	}
	if failover {
		headers.push(("x-throttle-failover".to_string(), "true".to_string()));
	}

	if let Some(guard) = producer {
		guard.complete(Arc::new(CachedResponse {
			status: StatusCode::OK.as_u16(),
			headers: headers.clone(),
			body: body_bytes.clone(),
			info: ReplayInfo {
				model: decision.model.id.clone(),
				provider: decision.model.provider,
				tier: decision.tier,
				input_tokens: tally.input,
				output_tokens: tally.output,
			},
		}));
	}

	log_completion(
		&app,
		&request_id,
		&parsed,
		&classification,
		&decision,
		tally,
		dispatch_start.elapsed(),
		parent_id,
		client_id,
		key_type,
		failover,
	);

	let mut builder = Response::builder().status(StatusCode::OK);
	for (name, value) in &headers {
		builder = builder.header(name, value);
	}
	builder
		.body(Body::from(body_bytes))
		.unwrap_or_else(|_| internal_response())
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
	app: Arc<App>,
	parsed: ParsedRequest,
	upstream: reqwest::Response,
	request_id: String,
	classification: crate::classify::Classification,
	decision: RoutingDecision,
	dispatch_start: Instant,
	session_id: Option<String>,
	parent_id: Option<String>,
	client_id: Option<String>,
	key_type: Option<crate::store::dualkey::KeyType>,
	failover: bool,
) -> Response {
	let translator = StreamTranslator::new(
		decision.model.provider.family(),
		parsed.ingress,
		&decision.model.id,
		&request_id,
	);
	let mut builder = Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.header(header::CONNECTION, "keep-alive");
	for (name, value) in decision_headers(&request_id, &classification, &decision) {
		builder = builder.header(name, value);
	}
	if let Some(kt) = key_type {
		builder = builder.header("x-throttle-key-type", kt.as_str());
	}
	if failover {
		builder = builder.header("x-throttle-failover", "true");
	}

	let finalize = {
		let app = app.clone();
		move |tally: relay::TokenTally, result: Result<(), String>| {
			if let Err(reason) = &result {
				warn!(%request_id, %reason, "stream ended abnormally");
				if let Some(sid) = &session_id {
					app.sessions.mark_failed(sid);
				}
			}
			log_completion(
				&app,
				&request_id,
				&parsed,
				&classification,
				&decision,
				tally,
				dispatch_start.elapsed(),
				parent_id.as_deref(),
				client_id,
				key_type,
				failover,
			);
		}
	};
	let body = relay::stream_body(upstream.bytes_stream(), translator, finalize);
	builder.body(body).unwrap_or_else(|_| internal_response())
}

fn decision_headers(
	request_id: &str,
	classification: &crate::classify::Classification,
	decision: &RoutingDecision,
) -> Vec<(String, String)> {
	vec![
		("x-throttle-model".to_string(), decision.model.id.clone()),
		("x-throttle-tier".to_string(), decision.tier.to_string()),
		(
			"x-throttle-score".to_string(),
			format!("{:.3}", classification.score),
		),
		(
			"x-throttle-confidence".to_string(),
			format!("{:.3}", classification.confidence),
		),
		("x-throttle-request-id".to_string(), request_id.to_string()),
		(
			"x-throttle-reasoning".to_string(),
			decision.reasoning.clone(),
		),
	]
}

fn prompt_hash(parsed: &ParsedRequest) -> String {
	let digest = Sha256::digest(parsed.last_user_text().as_bytes());
	digest
		.iter()
		.take(8)
		.map(|b| format!("{b:02x}"))
		.collect()
}

#[allow(clippy::too_many_arguments)]
fn log_completion(
	app: &App,
	request_id: &str,
	parsed: &ParsedRequest,
	classification: &crate::classify::Classification,
	decision: &RoutingDecision,
	tally: relay::TokenTally,
	latency: Duration,
	parent_id: Option<&str>,
	client_id: Option<String>,
	key_type: Option<crate::store::dualkey::KeyType>,
	failover: bool,
) {
	app.log.append(&RoutingLogEntry {
		request_id: request_id.to_string(),
		timestamp: Utc::now(),
		prompt_hash: prompt_hash(parsed),
		score: classification.score,
		confidence: classification.confidence,
		tier: decision.tier,
		model: decision.model.id.clone(),
		provider: decision.model.provider,
		mode: decision.mode,
		override_kind: decision.override_.kind().to_string(),
		input_tokens: tally.input,
		output_tokens: tally.output,
		cost_usd: decision.model.estimate_cost_usd(tally.input, tally.output),
		latency_ms: latency.as_millis() as u64,
		parent_request_id: parent_id.map(str::to_string),
		client_id,
		key_type,
		failover: failover.then_some(true),
	});
}

/// A dedup replay logs its own entry: the cached routing facts, zero fresh
/// cost, and no dispatcher latency.
fn log_replay(
	app: &App,
	cached: &CachedResponse,
	request_id: &str,
	classification: &crate::classify::Classification,
	override_: &Override,
	parent_id: Option<&str>,
	client_id: Option<String>,
) {
	app.log.append(&RoutingLogEntry {
		request_id: request_id.to_string(),
		timestamp: Utc::now(),
		prompt_hash: String::new(),
		score: classification.score,
		confidence: classification.confidence,
		tier: cached.info.tier,
		model: cached.info.model.clone(),
		provider: cached.info.provider,
		mode: app.cfg.mode,
		override_kind: override_.kind().to_string(),
		input_tokens: cached.info.input_tokens,
		output_tokens: cached.info.output_tokens,
		cost_usd: 0.0,
		latency_ms: 0,
		parent_request_id: parent_id.map(str::to_string),
		client_id,
		key_type: None,
		failover: None,
	});
}

fn replay_response(cached: &CachedResponse) -> Response {
	let mut builder = Response::builder()
		.status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));
	for (name, value) in &cached.headers {
		builder = builder.header(name, value);
	}
	builder
		.body(Body::from(cached.body.clone()))
		.unwrap_or_else(|_| internal_response())
}

fn error_response(err: &ProxyError, request_id: &str) -> Response {
	if matches!(err, ProxyError::Internal(_) | ProxyError::Config(_)) {
		warn!(request_id, "internal error: {err}");
	}
	Response::builder()
		.status(err.status())
		.header("content-type", "application/json")
		.header("x-throttle-request-id", request_id)
		.body(Body::from(err.to_body().to_string()))
		.unwrap_or_else(|_| internal_response())
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Body::from(value.to_string()))
		.unwrap_or_else(|_| internal_response())
}

fn internal_response() -> Response {
	let mut resp = Response::new(Body::from(r#"{"error":{"type":"internal"}}"#));
	*resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
	resp
}
