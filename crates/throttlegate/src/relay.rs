//! Response mediation.
//!
//! Non-streaming upstream JSON is decoded into the neutral response and
//! re-encoded in the client's dialect. Streaming responses are translated
//! frame by frame between the three SSE families; same-family streams pass
//! through unchanged. Token usage is accumulated as the latest observed
//! value, since providers variously report running totals or a single final
//! total. Until the first upstream byte, an SSE comment heartbeat keeps
//! intermediate proxies from timing out.
//!
//! Cross-family translation is stateful per request: the translator
//! remembers whether the client-dialect prologue has been emitted and closes
//! the stream with the matching epilogue.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::llm::{Family, IngressFormat, ProviderTag, ProxyError, ProxyResponse};
use crate::llm::{anthropic, google, openai};
use crate::parse::sse::{SseDecoder, SseFrame};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Latest-observed token counts for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTally {
	pub input: u64,
	pub output: u64,
}

/// Per-request stream translation state machine.
pub struct StreamTranslator {
	upstream: Family,
	client: IngressFormat,
	model: String,
	message_id: String,
	created: i64,
	tally: TokenTally,
	/// Prologue emitted (synthesized directions only).
	started: bool,
	/// Neutral (Anthropic-vocabulary) stop reason observed so far.
	stop_reason: Option<String>,
}

impl StreamTranslator {
	pub fn new(upstream: Family, client: IngressFormat, model: &str, request_id: &str) -> Self {
		StreamTranslator {
			upstream,
			client,
			model: model.to_string(),
			message_id: format!("msg_{request_id}"),
			created: chrono::Utc::now().timestamp(),
			tally: TokenTally::default(),
			started: false,
			stop_reason: None,
		}
	}

	pub fn tally(&self) -> TokenTally {
		self.tally
	}

	fn is_passthrough(&self) -> bool {
		matches!(
			(self.upstream, self.client),
			(Family::Anthropic, IngressFormat::Anthropic)
				| (Family::OpenAiCompat, IngressFormat::OpenAi)
		)
	}

	/// Translate one upstream frame into zero or more client frames,
	/// folding its usage into the tally.
	pub fn on_frame(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
		match self.upstream {
			Family::Anthropic => self.on_anthropic_frame(frame),
			Family::OpenAiCompat => self.on_openai_frame(frame),
			Family::Google => self.on_google_frame(frame),
		}
	}

	/// Close the stream: emit the client-dialect epilogue for synthesized
	/// directions. Passthrough streams end however the upstream ended.
	pub fn finish(&mut self) -> Vec<SseFrame> {
		if self.is_passthrough() || !self.started {
			return Vec::new();
		}
		let stop = self.stop_reason.clone().unwrap_or_else(|| "end_turn".into());
		match self.client {
			IngressFormat::Anthropic => vec![
				anthropic::content_block_stop_frame(0),
				anthropic::message_delta_frame(&stop, self.tally.output),
				anthropic::message_stop_frame(),
			],
			IngressFormat::OpenAi => vec![
				openai::finish_frame(
					&self.message_id,
					&self.model,
					self.created,
					openai::finish_from_stop_reason(&stop),
					Some((self.tally.input, self.tally.output)),
				),
				openai::done_frame(),
			],
		}
	}

	fn on_anthropic_frame(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
		let Ok(event) = anthropic::parse_stream_event(&frame.data) else {
			debug!("unparseable anthropic stream event");
			return self.passthrough_or_nothing(frame);
		};
		match &event {
			anthropic::StreamEvent::MessageStart { message } => {
				self.tally.input = message.usage.input_tokens;
				self.tally.output = message.usage.output_tokens;
				self.message_id = message.id.clone();
				self.model = message.model.clone();
			},
			anthropic::StreamEvent::MessageDelta { delta, usage } => {
				if let Some(u) = usage {
					self.tally.output = u.output_tokens;
				}
				if let Some(stop) = &delta.stop_reason {
					self.stop_reason = Some(stop.clone());
				}
			},
			_ => {},
		}
		if self.is_passthrough() {
			return vec![frame.clone()];
		}
		// Anthropic upstream rendered as ChatCompletions chunks.
		match event {
			anthropic::StreamEvent::MessageStart { .. } => {
				self.started = true;
				vec![openai::role_frame(&self.message_id, &self.model, self.created)]
			},
			anthropic::StreamEvent::ContentBlockDelta { delta, .. } => match delta {
				anthropic::ContentDelta::TextDelta { text } => {
					self.started = true;
					vec![openai::delta_frame(
						&self.message_id,
						&self.model,
						self.created,
						&text,
					)]
				},
				_ => Vec::new(),
			},
			_ => Vec::new(),
		}
	}

	fn on_openai_frame(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
		if frame.is_done() {
			// The epilogue (including our own [DONE]) is emitted by finish().
			return self.passthrough_or_nothing(frame);
		}
		let Ok(chunk) = openai::parse_stream_chunk(&frame.data) else {
			debug!("unparseable chat completion chunk");
			return self.passthrough_or_nothing(frame);
		};
		if let Some(usage) = &chunk.usage {
			self.tally.input = usage.prompt_tokens;
			self.tally.output = usage.completion_tokens;
		}
		if let Some(model) = &chunk.model {
			self.model = model.clone();
		}
		let text = chunk
			.choices
			.first()
			.and_then(|c| c.delta.content.clone())
			.unwrap_or_default();
		if let Some(finish) = chunk.choices.first().and_then(|c| c.finish_reason.as_deref()) {
			self.stop_reason = Some(anthropic::stop_reason_from_finish(finish).to_string());
		}
		if self.is_passthrough() {
			return vec![frame.clone()];
		}
		// ChatCompletions upstream rendered as Messages events.
		self.anthropic_text_frames(&text)
	}

	fn on_google_frame(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
		let Ok(chunk) = google::parse_stream_chunk(&frame.data) else {
			debug!("unparseable generate content chunk");
			return Vec::new();
		};
		if let Some(usage) = &chunk.usage_metadata {
			self.tally.input = usage.prompt_token_count;
			self.tally.output = usage.candidates_token_count;
		}
		if let Some(finish) = chunk.finish_reason() {
			self.stop_reason = Some(google::stop_reason_from_finish(finish).to_string());
		}
		let text = chunk.text();
		match self.client {
			IngressFormat::Anthropic => self.anthropic_text_frames(&text),
			IngressFormat::OpenAi => {
				if text.is_empty() {
					return Vec::new();
				}
				let mut out = Vec::new();
				if !self.started {
					self.started = true;
					out.push(openai::role_frame(&self.message_id, &self.model, self.created));
				}
				out.push(openai::delta_frame(
					&self.message_id,
					&self.model,
					self.created,
					&text,
				));
				out
			},
		}
	}

	/// Text delta rendered in the Messages dialect, with the prologue on the
	/// first chunk.
	fn anthropic_text_frames(&mut self, text: &str) -> Vec<SseFrame> {
		if text.is_empty() {
			return Vec::new();
		}
		let mut out = Vec::new();
		if !self.started {
			self.started = true;
			out.push(anthropic::message_start_frame(
				&self.message_id,
				&self.model,
				self.tally.input,
			));
			out.push(anthropic::content_block_start_frame(0));
		}
		out.push(anthropic::text_delta_frame(0, text));
		out
	}

	fn passthrough_or_nothing(&self, frame: &SseFrame) -> Vec<SseFrame> {
		if self.is_passthrough() {
			vec![frame.clone()]
		} else {
			Vec::new()
		}
	}
}

/// Drive an upstream byte stream through the translator into a response
/// body. Emits `: heartbeat` comments until the first upstream frame. The
/// finalization callback always runs — on normal end, stream error, and
/// client disconnect alike — with the accumulated tally.
pub fn stream_body<S, E>(
	upstream: S,
	mut translator: StreamTranslator,
	finalize: impl FnOnce(TokenTally, Result<(), String>) + Send + 'static,
) -> axum::body::Body
where
	S: Stream<Item = Result<Bytes, E>> + Send + 'static,
	E: std::error::Error + Send + Sync + 'static,
{
	let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
	tokio::spawn(async move {
		let reader = StreamReader::new(upstream.map_err(std::io::Error::other));
		let frames = FramedRead::new(reader, SseDecoder::new());
		tokio::pin!(frames);
		let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
		heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// The first tick completes immediately; swallow it.
		heartbeat.tick().await;
		let mut saw_frame = false;
		let mut result: Result<(), String> = Ok(());
		'stream: loop {
			tokio::select! {
				_ = heartbeat.tick(), if !saw_frame => {
					if tx.send(Ok(Bytes::from_static(b": heartbeat\n\n"))).await.is_err() {
						result = Err("client disconnected".to_string());
						break 'stream;
					}
				},
				frame = frames.next() => match frame {
					Some(Ok(frame)) => {
						saw_frame = true;
						for out in translator.on_frame(&frame) {
							if tx.send(Ok(out.encode())).await.is_err() {
								result = Err("client disconnected".to_string());
								break 'stream;
							}
						}
					},
					Some(Err(e)) => {
						result = Err(e.to_string());
						break 'stream;
					},
					None => break 'stream,
				},
			}
		}
		if result.is_ok() {
			for out in translator.finish() {
				let _ = tx.send(Ok(out.encode())).await;
			}
		}
		finalize(translator.tally(), result);
	});
	axum::body::Body::from_stream(ReceiverStream::new(rx))
}

/// Decode a non-streaming upstream body into the neutral response. The
/// neutral finish reason uses the Anthropic vocabulary; encoders map it out.
pub fn decode_response(
	family: Family,
	bytes: &[u8],
	provider: ProviderTag,
) -> Result<ProxyResponse, ProxyError> {
	match family {
		Family::Anthropic => {
			let resp = anthropic::decode_response(bytes)?;
			Ok(ProxyResponse {
				content: resp.text(),
				input_tokens: resp.usage.input_tokens,
				output_tokens: resp.usage.output_tokens,
				finish_reason: resp.stop_reason,
				model: resp.model,
				provider,
				key_type: None,
				failover: false,
			})
		},
		Family::OpenAiCompat => {
			let resp = openai::decode_response(bytes)?;
			let usage = resp.usage.unwrap_or_default();
			let choice = resp.choices.into_iter().next();
			Ok(ProxyResponse {
				content: choice
					.as_ref()
					.and_then(|c| c.message.content.clone())
					.unwrap_or_default(),
				input_tokens: usage.prompt_tokens,
				output_tokens: usage.completion_tokens,
				finish_reason: choice
					.and_then(|c| c.finish_reason)
					.map(|f| anthropic::stop_reason_from_finish(&f).to_string()),
				model: resp.model,
				provider,
				key_type: None,
				failover: false,
			})
		},
		Family::Google => {
			let resp = google::decode_response(bytes)?;
			let usage = resp.usage_metadata.clone().unwrap_or_default();
			Ok(ProxyResponse {
				content: resp.text(),
				input_tokens: usage.prompt_token_count,
				output_tokens: usage.candidates_token_count,
				finish_reason: resp
					.finish_reason()
					.map(|f| google::stop_reason_from_finish(f).to_string()),
				model: resp.model_version.clone().unwrap_or_default(),
				provider,
				key_type: None,
				failover: false,
			})
		},
	}
}

/// Re-encode the neutral response in the client's dialect with the fresh
/// request id.
pub fn encode_response(
	client: IngressFormat,
	resp: &ProxyResponse,
	request_id: &str,
) -> serde_json::Value {
	match client {
		IngressFormat::Anthropic => anthropic::encode_response(resp, request_id),
		IngressFormat::OpenAi => {
			openai::encode_response(resp, request_id, chrono::Utc::now().timestamp())
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frames_to_string(frames: &[SseFrame]) -> String {
		frames
			.iter()
			.map(|f| String::from_utf8(f.encode().to_vec()).unwrap())
			.collect()
	}

	fn anthropic_stream() -> Vec<SseFrame> {
		vec![
			SseFrame::new(
				Some("message_start"),
				r#"{"type":"message_start","message":{"id":"msg_up","model":"claude-x","usage":{"input_tokens":12,"output_tokens":1}}}"#,
			),
			SseFrame::new(
				Some("content_block_start"),
				r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
			),
			SseFrame::new(
				Some("content_block_delta"),
				r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
			),
			SseFrame::new(
				Some("content_block_delta"),
				r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
			),
			SseFrame::new(
				Some("content_block_stop"),
				r#"{"type":"content_block_stop","index":0}"#,
			),
			SseFrame::new(
				Some("message_delta"),
				r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
			),
			SseFrame::new(Some("message_stop"), r#"{"type":"message_stop"}"#),
		]
	}

	#[test]
	fn anthropic_passthrough_is_frame_identical() {
		let mut t = StreamTranslator::new(
			Family::Anthropic,
			IngressFormat::Anthropic,
			"claude-x",
			"rid",
		);
		let upstream = anthropic_stream();
		let mut out = Vec::new();
		for f in &upstream {
			out.extend(t.on_frame(f));
		}
		out.extend(t.finish());
		assert_eq!(out, upstream);
		assert_eq!(t.tally(), TokenTally {
			input: 12,
			output: 9
		});
	}

	#[test]
	fn anthropic_upstream_renders_as_chat_chunks() {
		let mut t = StreamTranslator::new(
			Family::Anthropic,
			IngressFormat::OpenAi,
			"claude-x",
			"rid",
		);
		let mut out = Vec::new();
		for f in &anthropic_stream() {
			out.extend(t.on_frame(f));
		}
		out.extend(t.finish());
		let text = frames_to_string(&out);
		assert!(text.contains(r#""role":"assistant""#));
		assert!(text.contains(r#""content":"Hel""#));
		assert!(text.contains(r#""finish_reason":"stop""#));
		assert!(text.contains(r#""prompt_tokens":12"#));
		assert!(text.contains(r#""completion_tokens":9"#));
		assert!(text.ends_with("data: [DONE]\n\n"));
		// Provider message id is reused for the chunk ids.
		assert!(text.contains(r#""id":"msg_up""#));
	}

	fn openai_stream() -> Vec<SseFrame> {
		vec![
			SseFrame::new(
				None,
				r#"{"id":"cc-1","model":"gpt-x","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
			),
			SseFrame::new(
				None,
				r#"{"id":"cc-1","model":"gpt-x","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
			),
			SseFrame::new(
				None,
				r#"{"id":"cc-1","model":"gpt-x","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
			),
			SseFrame::new(
				None,
				r#"{"id":"cc-1","model":"gpt-x","choices":[],"usage":{"prompt_tokens":4,"completion_tokens":7,"total_tokens":11}}"#,
			),
			SseFrame::new(None, "[DONE]"),
		]
	}

	#[test]
	fn openai_passthrough_keeps_done_marker() {
		let mut t =
			StreamTranslator::new(Family::OpenAiCompat, IngressFormat::OpenAi, "gpt-x", "rid");
		let upstream = openai_stream();
		let mut out = Vec::new();
		for f in &upstream {
			out.extend(t.on_frame(f));
		}
		out.extend(t.finish());
		assert_eq!(out, upstream);
		assert_eq!(t.tally(), TokenTally {
			input: 4,
			output: 7
		});
	}

	#[test]
	fn openai_upstream_renders_as_messages_events() {
		let mut t = StreamTranslator::new(
			Family::OpenAiCompat,
			IngressFormat::Anthropic,
			"gpt-x",
			"rid",
		);
		let mut out = Vec::new();
		for f in &openai_stream() {
			out.extend(t.on_frame(f));
		}
		out.extend(t.finish());
		let events: Vec<_> = out.iter().map(|f| f.event.clone().unwrap()).collect();
		assert_eq!(
			events,
			vec![
				"message_start",
				"content_block_start",
				"content_block_delta",
				"content_block_stop",
				"message_delta",
				"message_stop",
			]
		);
		let text = frames_to_string(&out);
		assert!(text.contains(r#""text":"Hi""#));
		assert!(text.contains(r#""stop_reason":"end_turn""#));
		assert!(text.contains(r#""output_tokens":7"#));
	}

	fn google_stream() -> Vec<SseFrame> {
		vec![
			SseFrame::new(
				None,
				r#"{"candidates":[{"content":{"parts":[{"text":"He"}]}}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1,"totalTokenCount":4}}"#,
			),
			SseFrame::new(
				None,
				r#"{"candidates":[{"content":{"parts":[{"text":"y"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
			),
		]
	}

	#[test]
	fn google_usage_takes_the_latest_running_total() {
		let mut t = StreamTranslator::new(
			Family::Google,
			IngressFormat::Anthropic,
			"flash-2",
			"rid",
		);
		let mut out = Vec::new();
		for f in &google_stream() {
			out.extend(t.on_frame(f));
		}
		out.extend(t.finish());
		assert_eq!(t.tally(), TokenTally {
			input: 3,
			output: 2
		});
		let events: Vec<_> = out.iter().map(|f| f.event.clone().unwrap()).collect();
		assert_eq!(events[0], "message_start");
		assert_eq!(*events.last().unwrap(), "message_stop");
	}

	#[test]
	fn google_to_openai_emits_role_then_deltas() {
		let mut t =
			StreamTranslator::new(Family::Google, IngressFormat::OpenAi, "flash-2", "rid");
		let mut out = Vec::new();
		for f in &google_stream() {
			out.extend(t.on_frame(f));
		}
		out.extend(t.finish());
		let text = frames_to_string(&out);
		assert!(text.contains(r#""role":"assistant""#));
		assert!(text.contains(r#""content":"He""#));
		assert!(text.ends_with("data: [DONE]\n\n"));
	}

	#[test]
	fn empty_upstream_synthesizes_no_epilogue() {
		let mut t = StreamTranslator::new(
			Family::OpenAiCompat,
			IngressFormat::Anthropic,
			"gpt-x",
			"rid",
		);
		assert!(t.finish().is_empty());
	}

	#[tokio::test]
	async fn stream_body_finalizes_with_the_tally() {
		let upstream = futures_util::stream::iter(
			openai_stream()
				.into_iter()
				.map(|f| Ok::<_, std::io::Error>(f.encode())),
		);
		let t = StreamTranslator::new(Family::OpenAiCompat, IngressFormat::OpenAi, "gpt-x", "rid");
		let (done_tx, done_rx) = tokio::sync::oneshot::channel();
		let body = stream_body(upstream, t, move |tally, result| {
			let _ = done_tx.send((tally, result));
		});
		let collected = axum::body::to_bytes(body, usize::MAX).await.unwrap();
		let (tally, result) = done_rx.await.unwrap();
		assert!(result.is_ok());
		assert_eq!(tally, TokenTally {
			input: 4,
			output: 7
		});
		let text = String::from_utf8(collected.to_vec()).unwrap();
		assert!(text.ends_with("data: [DONE]\n\n"));
	}

	#[tokio::test]
	async fn upstream_error_still_finalizes() {
		let upstream = futures_util::stream::iter(vec![
			Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"choices\":[]}\n\n")),
			Err(std::io::Error::other("connection reset")),
		]);
		let t = StreamTranslator::new(Family::OpenAiCompat, IngressFormat::OpenAi, "gpt-x", "rid");
		let (done_tx, done_rx) = tokio::sync::oneshot::channel();
		let body = stream_body(upstream, t, move |tally, result| {
			let _ = done_tx.send((tally, result));
		});
		let _ = axum::body::to_bytes(body, usize::MAX).await;
		let (_, result) = done_rx.await.unwrap();
		assert!(result.is_err());
	}

	#[test]
	fn nonstream_decode_normalizes_finish_reasons() {
		let got = decode_response(
			Family::OpenAiCompat,
			br#"{"model":"gpt-x","choices":[{"message":{"content":"hi"},"finish_reason":"length"}],"usage":{"prompt_tokens":2,"completion_tokens":3,"total_tokens":5}}"#,
			ProviderTag::Openai,
		)
		.unwrap();
		assert_eq!(got.finish_reason.as_deref(), Some("max_tokens"));
		assert_eq!(got.content, "hi");

		// And the OpenAI encoder maps it back out.
		let body = encode_response(IngressFormat::OpenAi, &got, "rid");
		assert_eq!(body["choices"][0]["finish_reason"], "length");
		let body = encode_response(IngressFormat::Anthropic, &got, "rid");
		assert_eq!(body["stop_reason"], "max_tokens");
		assert_eq!(body["usage"]["input_tokens"], 2);
	}
}
