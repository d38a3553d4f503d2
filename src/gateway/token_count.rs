use serde_json::Value;
use tiktoken_rs::{tokenizer, CoreBPE};

use super::RequestKind;

/// Estimates prompt tokens for a request body before dispatch. Counting is
/// best effort: a body that does not parse, or a model with no usable
/// encoding, yields zero.
pub fn count_request_tokens(model: &str, kind: RequestKind, body: &[u8]) -> i64 {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return 0;
    };
    let bpe = bpe_for_model(model);

    let total = match kind {
        RequestKind::ChatCompletions => count_chat_tokens(bpe, &payload),
        RequestKind::Responses => count_responses_tokens(bpe, &payload),
        RequestKind::AnthropicMessages => count_anthropic_tokens(bpe, &payload),
    };
    total as i64
}

pub(crate) fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

pub(crate) fn token_len(bpe: &CoreBPE, text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    bpe.encode_with_special_tokens(text).len()
}

fn count_chat_tokens(bpe: &CoreBPE, payload: &Value) -> usize {
    let mut total = 0;
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(role) = message.get("role").and_then(Value::as_str) {
                total += token_len(bpe, role);
            }
            if let Some(content) = message.get("content") {
                total += count_content_tokens(bpe, content);
            }
        }
    }
    if let Some(system) = payload.get("system") {
        total += count_scalar_tokens(bpe, system);
    }
    if let Some(prompt) = payload.get("prompt") {
        total += count_scalar_tokens(bpe, prompt);
    }
    total
}

fn count_responses_tokens(bpe: &CoreBPE, payload: &Value) -> usize {
    let mut total = 0;
    if let Some(input) = payload.get("input") {
        match input {
            Value::Array(items) => {
                for item in items {
                    total += count_scalar_tokens(bpe, item);
                }
            }
            other => total += count_scalar_tokens(bpe, other),
        }
    }
    if let Some(instructions) = payload.get("instructions") {
        total += count_scalar_tokens(bpe, instructions);
    }
    total + count_chat_tokens(bpe, payload)
}

fn count_anthropic_tokens(bpe: &CoreBPE, payload: &Value) -> usize {
    let mut total = 0;
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(content) = message.get("content") {
                total += count_content_tokens(bpe, content);
            }
        }
    }
    if let Some(system) = payload.get("system") {
        total += count_scalar_tokens(bpe, system);
    }
    total
}

/// Message content is either a plain string or an array of typed parts, of
/// which only `text` parts count.
fn count_content_tokens(bpe: &CoreBPE, content: &Value) -> usize {
    match content {
        Value::Array(parts) => parts
            .iter()
            .map(|part| {
                let is_text = part
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| kind == "text");
                if !is_text {
                    return 0;
                }
                part.get("text")
                    .and_then(Value::as_str)
                    .map(|text| token_len(bpe, text))
                    .unwrap_or(0)
            })
            .sum(),
        other => count_scalar_tokens(bpe, other),
    }
}

fn count_scalar_tokens(bpe: &CoreBPE, value: &Value) -> usize {
    match value {
        Value::String(text) => token_len(bpe, text),
        Value::Null => 0,
        other => token_len(bpe, &other.to_string()),
    }
}
