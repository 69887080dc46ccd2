//! Incremental server-sent-event framing.
//!
//! The decoder carries `event:`/`data:` state across network chunks, so a
//! frame split anywhere — even mid-line — reassembles correctly. Comment
//! lines (leading `:`) are dropped; a blank line closes the pending frame.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// One SSE frame: an optional event name and the joined data payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
	pub event: Option<String>,
	pub data: String,
}

impl SseFrame {
	pub fn new(event: Option<&str>, data: impl Into<String>) -> Self {
		SseFrame {
			event: event.map(str::to_string),
			data: data.into(),
		}
	}

	/// Wire encoding: `event: …\n` (when named), one `data:` line per payload
	/// line, then the blank separator.
	pub fn encode(&self) -> Bytes {
		let mut out = String::new();
		if let Some(event) = &self.event {
			out.push_str("event: ");
			out.push_str(event);
			out.push('\n');
		}
		for line in self.data.split('\n') {
			out.push_str("data: ");
			out.push_str(line);
			out.push('\n');
		}
		out.push('\n');
		Bytes::from(out)
	}

	/// The OpenAI-compatible stream terminator.
	pub fn is_done(&self) -> bool {
		self.data.trim() == "[DONE]"
	}
}

#[derive(Debug, Default)]
pub struct SseDecoder {
	event: Option<String>,
	data_lines: Vec<String>,
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	fn take_frame(&mut self) -> Option<SseFrame> {
		if self.event.is_none() && self.data_lines.is_empty() {
			return None;
		}
		Some(SseFrame {
			event: self.event.take(),
			data: std::mem::take(&mut self.data_lines).join("\n"),
		})
	}

	fn consume_line(&mut self, line: &str) -> Option<SseFrame> {
		let line = line.strip_suffix('\r').unwrap_or(line);
		if line.is_empty() {
			return self.take_frame();
		}
		if line.starts_with(':') {
			// Comment (e.g. a keepalive heartbeat).
			return None;
		}
		let (field, value) = match line.split_once(':') {
			Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
			None => (line, ""),
		};
		match field {
			"event" => self.event = Some(value.to_string()),
			"data" => self.data_lines.push(value.to_string()),
			// id/retry and unknown fields are ignored.
			_ => {},
		}
		None
	}
}

impl Decoder for SseDecoder {
	type Item = SseFrame;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		while let Some(pos) = src.iter().position(|b| *b == b'\n') {
			let line = src.split_to(pos + 1);
			let line = std::str::from_utf8(&line[..pos])
				.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
				.to_string();
			if let Some(frame) = self.consume_line(&line) {
				return Ok(Some(frame));
			}
		}
		Ok(None)
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if let Some(frame) = self.decode(src)? {
			return Ok(Some(frame));
		}
		// Flush a trailing frame that was never closed by a blank line.
		if !src.is_empty() {
			let rest = std::str::from_utf8(src)
				.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
				.to_string();
			src.advance(src.len());
			if let Some(frame) = self.consume_line(&rest) {
				return Ok(Some(frame));
			}
		}
		Ok(self.take_frame())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn decode_all(chunks: &[&str]) -> Vec<SseFrame> {
		let mut dec = SseDecoder::new();
		let mut buf = BytesMut::new();
		let mut out = Vec::new();
		for chunk in chunks {
			buf.extend_from_slice(chunk.as_bytes());
			while let Some(frame) = dec.decode(&mut buf).unwrap() {
				out.push(frame);
			}
		}
		while let Some(frame) = dec.decode_eof(&mut buf).unwrap() {
			out.push(frame);
		}
		out
	}

	#[test]
	fn parses_named_events() {
		let got = decode_all(&["event: ping\ndata: {}\n\n"]);
		assert_eq!(got, vec![SseFrame::new(Some("ping"), "{}")]);
	}

	#[test]
	fn frame_state_survives_chunk_splits() {
		let got = decode_all(&["event: message_de", "lta\nda", "ta: {\"a\":", "1}\n", "\n"]);
		assert_eq!(got, vec![SseFrame::new(Some("message_delta"), "{\"a\":1}")]);
	}

	#[test]
	fn multiple_data_lines_join_with_newline() {
		let got = decode_all(&["data: one\ndata: two\n\n"]);
		assert_eq!(got, vec![SseFrame::new(None, "one\ntwo")]);
	}

	#[test]
	fn comments_and_crlf_are_tolerated() {
		let got = decode_all(&[": heartbeat\r\n\r\ndata: x\r\n\r\n"]);
		assert_eq!(got, vec![SseFrame::new(None, "x")]);
	}

	#[test]
	fn unterminated_final_frame_flushes_at_eof() {
		let got = decode_all(&["data: tail"]);
		assert_eq!(got, vec![SseFrame::new(None, "tail")]);
	}

	#[test]
	fn done_marker_is_recognized() {
		assert!(SseFrame::new(None, "[DONE]").is_done());
		assert!(!SseFrame::new(None, "{\"x\":1}").is_done());
	}

	#[test]
	fn encode_round_trips_through_decode() {
		let frame = SseFrame::new(Some("content_block_delta"), "{\"type\":\"text_delta\"}");
		let bytes = frame.encode();
		let got = decode_all(&[std::str::from_utf8(&bytes).unwrap()]);
		assert_eq!(got, vec![frame]);
	}
}
