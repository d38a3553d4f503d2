//! Post-hoc response analysis: provider request id and completion-token
//! extraction from captured JSON or SSE bodies.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Read;

use axum::http::StatusCode;
use serde_json::Value;

use super::token_count::{bpe_for_model, token_len};
use super::RequestKind;

/// Returns `(provider_request_id, response_tokens)` for a captured response
/// body. Empty id and zero tokens mean nothing usable was found.
pub fn extract_response_metadata(
    model: &str,
    kind: RequestKind,
    body: &[u8],
    is_stream: bool,
) -> (String, i64) {
    if body.is_empty() {
        return (String::new(), 0);
    }

    let (texts, provider_id) = extract_response_texts(kind, is_stream, body);
    if texts.is_empty() {
        return (provider_id, 0);
    }

    let bpe = bpe_for_model(model);
    let total: usize = texts.iter().map(|text| token_len(bpe, text)).sum();
    (provider_id, total as i64)
}

/// Undoes gzip before analysis when the upstream said so; the captured bytes
/// themselves are forwarded verbatim either way.
pub fn decode_body_for_analysis<'a>(data: &'a [u8], content_encoding: &str) -> Cow<'a, [u8]> {
    if data.is_empty() || !content_encoding.to_ascii_lowercase().contains("gzip") {
        return Cow::Borrowed(data);
    }
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut decoded = Vec::new();
    match decoder.read_to_end(&mut decoded) {
        Ok(_) => Cow::Owned(decoded),
        Err(_) => Cow::Borrowed(data),
    }
}

/// Picks a human-readable error message out of an upstream failure body.
pub fn extract_error_message(body: &[u8], content_encoding: &str, status: StatusCode) -> String {
    let decoded = decode_body_for_analysis(body, content_encoding);
    let trimmed = String::from_utf8_lossy(&decoded).trim().to_string();
    if !trimmed.is_empty() {
        return trimmed;
    }
    if let Some(reason) = status.canonical_reason() {
        return reason.to_string();
    }
    if status.as_u16() > 0 {
        return format!("status {}", status.as_u16());
    }
    "request failed".to_string()
}

/// Usage records keep at most 512 code points of an error message.
pub fn shorten_error_message(message: &str) -> String {
    const MAX_CHARS: usize = 512;
    if message.chars().count() <= MAX_CHARS {
        return message.to_string();
    }
    message.chars().take(MAX_CHARS).collect()
}

fn extract_response_texts(
    kind: RequestKind,
    is_stream: bool,
    body: &[u8],
) -> (Vec<String>, String) {
    match kind {
        RequestKind::ChatCompletions => {
            if is_stream {
                extract_chat_stream_texts(body)
            } else {
                extract_chat_texts(body)
            }
        }
        RequestKind::Responses => {
            if is_stream {
                extract_responses_stream_texts(body)
            } else {
                extract_responses_texts(body)
            }
        }
        RequestKind::AnthropicMessages => {
            if is_stream {
                extract_anthropic_stream_texts(body)
            } else {
                extract_anthropic_texts(body)
            }
        }
    }
}

fn extract_chat_texts(body: &[u8]) -> (Vec<String>, String) {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return (Vec::new(), String::new());
    };
    let provider_id = string_at(&payload, &["id"]);

    let mut texts = Vec::new();
    if let Some(choices) = payload.get("choices").and_then(Value::as_array) {
        for choice in choices {
            let mut out = String::new();
            gather_text(&mut out, choice.get("message").and_then(|m| m.get("content")));
            gather_text(&mut out, choice.get("content"));
            gather_text(&mut out, choice.get("text"));
            push_trimmed(&mut texts, out);
        }
    }
    (texts, provider_id)
}

fn extract_chat_stream_texts(body: &[u8]) -> (Vec<String>, String) {
    let payloads = parse_sse_payloads(body);
    if payloads.is_empty() {
        return (Vec::new(), String::new());
    }

    let mut buckets: BTreeMap<i64, String> = BTreeMap::new();
    let mut provider_id = String::new();
    for payload in payloads {
        let Ok(frame) = serde_json::from_slice::<Value>(payload) else {
            continue;
        };
        if provider_id.is_empty() {
            provider_id = string_at(&frame, &["id"]);
            if provider_id.is_empty() {
                provider_id = string_at(&frame, &["response", "id"]);
            }
        }
        if let Some(choices) = frame.get("choices").and_then(Value::as_array) {
            for choice in choices {
                let index = choice.get("index").and_then(Value::as_i64).unwrap_or(0);
                let bucket = buckets.entry(index).or_default();
                gather_text(bucket, choice.get("delta"));
                gather_text(bucket, choice.get("message"));
                gather_text(bucket, choice.get("content"));
                gather_text(bucket, choice.get("text"));
            }
        }
    }
    (buckets_to_texts(buckets), provider_id)
}

fn extract_responses_texts(body: &[u8]) -> (Vec<String>, String) {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return (Vec::new(), String::new());
    };
    let provider_id = string_at(&payload, &["id"]);

    let mut texts = Vec::new();
    match payload.get("output_text") {
        Some(Value::String(text)) => texts.push(text.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(text) = item {
                    texts.push(text.clone());
                }
            }
        }
        _ => {}
    }
    if let Some(outputs) = payload.get("output").and_then(Value::as_array) {
        for output in outputs {
            let mut out = String::new();
            gather_text(&mut out, output.get("content"));
            push_trimmed(&mut texts, out);
        }
    }
    (texts, provider_id)
}

fn extract_responses_stream_texts(body: &[u8]) -> (Vec<String>, String) {
    let payloads = parse_sse_payloads(body);
    if payloads.is_empty() {
        return (Vec::new(), String::new());
    }

    let mut buckets: BTreeMap<i64, String> = BTreeMap::new();
    let mut provider_id = String::new();
    for payload in payloads {
        let Ok(frame) = serde_json::from_slice::<Value>(payload) else {
            continue;
        };
        if provider_id.is_empty() {
            provider_id = string_at(&frame, &["id"]);
            if provider_id.is_empty() {
                provider_id = string_at(&frame, &["response", "id"]);
            }
        }
        let index = frame.get("index").and_then(Value::as_i64).unwrap_or(0);
        let bucket = buckets.entry(index).or_default();
        gather_text(bucket, frame.get("delta"));
        gather_text(bucket, frame.get("text"));
        gather_text(bucket, frame.get("output_text"));
        gather_text(bucket, frame.get("content"));
    }
    (buckets_to_texts(buckets), provider_id)
}

fn extract_anthropic_texts(body: &[u8]) -> (Vec<String>, String) {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return (Vec::new(), String::new());
    };
    let provider_id = string_at(&payload, &["id"]);

    let mut out = String::new();
    gather_text(&mut out, payload.get("content"));
    let trimmed = out.trim();
    if trimmed.is_empty() {
        (Vec::new(), provider_id)
    } else {
        (vec![trimmed.to_string()], provider_id)
    }
}

const ANTHROPIC_STREAM_FRAMES: &[&str] = &[
    "message_start",
    "message_delta",
    "content_block_delta",
    "content_block_start",
    "message_stop",
    "content_block_stop",
    "",
];

fn extract_anthropic_stream_texts(body: &[u8]) -> (Vec<String>, String) {
    let payloads = parse_sse_payloads(body);
    if payloads.is_empty() {
        return (Vec::new(), String::new());
    }

    let mut out = String::new();
    let mut provider_id = String::new();
    for payload in payloads {
        let Ok(frame) = serde_json::from_slice::<Value>(payload) else {
            continue;
        };
        if provider_id.is_empty() {
            provider_id = string_at(&frame, &["id"]);
            if provider_id.is_empty() {
                provider_id = string_at(&frame, &["message", "id"]);
            }
        }
        let frame_type = frame.get("type").and_then(Value::as_str).unwrap_or("");
        if ANTHROPIC_STREAM_FRAMES.contains(&frame_type) {
            gather_text(&mut out, Some(&frame));
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        (Vec::new(), provider_id)
    } else {
        (vec![trimmed.to_string()], provider_id)
    }
}

/// Walks a JSON node collecting human-visible text: strings contribute
/// directly, arrays recurse, objects recurse into the keys `text`,
/// `content`, `delta`, `value`.
fn gather_text(out: &mut String, node: Option<&Value>) {
    let Some(node) = node else {
        return;
    };
    match node {
        Value::String(text) => out.push_str(text),
        Value::Array(items) => {
            for item in items {
                gather_text(out, Some(item));
            }
        }
        Value::Object(object) => {
            for key in ["text", "content", "delta", "value"] {
                if let Some(child) = object.get(key) {
                    gather_text(out, Some(child));
                }
            }
        }
        _ => {}
    }
}

/// SSE framing: newline-delimited `data:` lines; blank payloads and the
/// `[DONE]` sentinel are dropped.
pub fn parse_sse_payloads(body: &[u8]) -> Vec<&[u8]> {
    body.split(|b| *b == b'\n')
        .filter_map(|line| {
            let line = trim_ascii(line);
            let payload = trim_ascii(line.strip_prefix(b"data:")?);
            if payload.is_empty() || payload == b"[DONE]" {
                None
            } else {
                Some(payload)
            }
        })
        .collect()
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

fn string_at(value: &Value, path: &[&str]) -> String {
    let mut node = value;
    for key in path {
        match node.get(key) {
            Some(next) => node = next,
            None => return String::new(),
        }
    }
    node.as_str().unwrap_or_default().to_string()
}

fn push_trimmed(texts: &mut Vec<String>, out: String) {
    let trimmed = out.trim();
    if !trimmed.is_empty() {
        texts.push(trimmed.to_string());
    }
}

fn buckets_to_texts(buckets: BTreeMap<i64, String>) -> Vec<String> {
    buckets
        .into_values()
        .filter_map(|bucket| {
            let trimmed = bucket.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sse_framing_keeps_data_lines_and_drops_done() {
        let payloads = parse_sse_payloads(b"data: {\"a\":1}\ndata: [DONE]\n");
        assert_eq!(payloads, vec![b"{\"a\":1}".as_slice()]);
    }

    #[test]
    fn sse_framing_ignores_event_lines_and_blanks() {
        let body = b"event: message\n\ndata: {\"a\":1}\n\ndata:\ndata: {\"b\":2}\n";
        let payloads = parse_sse_payloads(body);
        assert_eq!(
            payloads,
            vec![b"{\"a\":1}".as_slice(), b"{\"b\":2}".as_slice()]
        );
    }

    #[test]
    fn chat_response_collects_choice_texts() {
        let body = br#"{"id":"chatcmpl-1","choices":[
            {"message":{"content":"first answer"}},
            {"message":{"content":"second answer"}}
        ]}"#;
        let (provider_id, tokens) = extract_response_metadata(
            "gpt-4o",
            RequestKind::ChatCompletions,
            body,
            false,
        );
        assert_eq!(provider_id, "chatcmpl-1");
        assert!(tokens > 0);
    }

    #[test]
    fn chat_stream_concatenates_deltas_per_index() {
        let body = concat!(
            "data: {\"id\":\"chatcmpl-2\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hel\"}}]}\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: {\"choices\":[{\"index\":1,\"delta\":{\"content\":\"bye\"}}]}\n",
            "data: [DONE]\n",
        );
        let (texts, provider_id) = extract_chat_stream_texts(body.as_bytes());
        assert_eq!(provider_id, "chatcmpl-2");
        assert_eq!(texts, vec!["hello".to_string(), "bye".to_string()]);
    }

    #[test]
    fn responses_body_collects_output_text_variants() {
        let body = br#"{"id":"resp-1","output_text":["part one"],"output":[
            {"content":[{"type":"output_text","text":"part two"}]}
        ]}"#;
        let (texts, provider_id) = extract_responses_texts(body);
        assert_eq!(provider_id, "resp-1");
        assert_eq!(texts, vec!["part one".to_string(), "part two".to_string()]);
    }

    #[test]
    fn responses_stream_reads_response_id_fallback() {
        let body = concat!(
            "data: {\"response\":{\"id\":\"resp-9\"},\"delta\":\"he\"}\n",
            "data: {\"delta\":\"y\"}\n",
        );
        let (texts, provider_id) = extract_responses_stream_texts(body.as_bytes());
        assert_eq!(provider_id, "resp-9");
        assert_eq!(texts, vec!["hey".to_string()]);
    }

    #[test]
    fn anthropic_body_gathers_nested_text() {
        let body = br#"{"id":"msg-1","content":[
            {"type":"text","text":"alpha "},
            {"type":"text","text":"beta"}
        ]}"#;
        let (texts, provider_id) = extract_anthropic_texts(body);
        assert_eq!(provider_id, "msg-1");
        assert_eq!(texts, vec!["alpha beta".to_string()]);
    }

    #[test]
    fn anthropic_stream_walks_all_frame_types() {
        let body = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg-2\",\"content\":[]}}\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi \"}}\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"there\"}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        let (texts, provider_id) = extract_anthropic_stream_texts(body.as_bytes());
        assert_eq!(provider_id, "msg-2");
        assert_eq!(texts, vec!["hi there".to_string()]);
    }

    #[test]
    fn gzip_bodies_are_decoded_for_analysis() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(br#"{"id":"gz-1","choices":[{"message":{"content":"zipped"}}]}"#)
            .expect("write");
        let compressed = encoder.finish().expect("finish");

        let decoded = decode_body_for_analysis(&compressed, "gzip");
        let (provider_id, tokens) = extract_response_metadata(
            "gpt-4o",
            RequestKind::ChatCompletions,
            &decoded,
            false,
        );
        assert_eq!(provider_id, "gz-1");
        assert!(tokens > 0);
    }

    #[test]
    fn error_message_falls_back_to_status_reason() {
        let message = extract_error_message(b"  ", "", StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(message, "Service Unavailable");

        let message = extract_error_message(b"{\"error\":\"x\"}", "", StatusCode::BAD_REQUEST);
        assert_eq!(message, "{\"error\":\"x\"}");
    }

    #[test]
    fn long_error_messages_are_cut_at_512_code_points() {
        let long: String = "é".repeat(600);
        let short = shorten_error_message(&long);
        assert_eq!(short.chars().count(), 512);
    }
}
