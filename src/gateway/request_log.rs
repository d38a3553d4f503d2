use axum::http::HeaderMap;
use chrono::Utc;

use crate::storage::RequestLog;

/// Builds the sanitized capture of an incoming request. Credential headers
/// keep their first and last four characters; everything between becomes `*`.
pub fn build_request_log(
    request_id: &str,
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> RequestLog {
    RequestLog {
        created_at: Utc::now(),
        request_id: request_id.to_string(),
        method: method.to_string(),
        path: path_and_query.to_string(),
        headers: sanitize_headers(headers),
        body: String::from_utf8_lossy(body).to_string(),
    }
}

fn sanitize_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let raw = value.to_str().unwrap_or("<binary>");
            let cleaned = match name.as_str() {
                "authorization" => mask_authorization_value(raw),
                "x-api-key" => mask_token(raw),
                _ => raw.to_string(),
            };
            (name.as_str().to_string(), cleaned)
        })
        .collect()
}

/// Masks the credential part of an `Authorization` value, keeping the scheme
/// words readable.
fn mask_authorization_value(value: &str) -> String {
    let mut parts: Vec<&str> = value.split_whitespace().collect();
    match parts.len() {
        0 => String::new(),
        1 => mask_token(parts[0]),
        _ => {
            let masked = mask_token(parts[parts.len() - 1]);
            let last = parts.len() - 1;
            parts[last] = &masked;
            parts.join(" ")
        }
    }
}

fn mask_token(token: &str) -> String {
    const PREFIX: usize = 4;
    const SUFFIX: usize = 4;
    let token = token.trim();
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= PREFIX + SUFFIX {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..PREFIX].iter().collect();
    let tail: String = chars[chars.len() - SUFFIX..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - PREFIX - SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn masks_keep_edges_and_length() {
        let token = "sk-abcdefghijklmnop";
        let masked = mask_token(token);
        assert_eq!(masked.len(), token.len());
        assert!(masked.starts_with("sk-a"));
        assert!(masked.ends_with("mnop"));
        assert!(masked[4..masked.len() - 4].chars().all(|c| c == '*'));
    }

    #[test]
    fn short_tokens_are_fully_masked() {
        assert_eq!(mask_token("12345678"), "********");
        assert_eq!(mask_token("abc"), "***");
        assert_eq!(mask_token(""), "");
    }

    #[test]
    fn bearer_scheme_stays_readable() {
        assert_eq!(
            mask_authorization_value("Bearer sk-abcdefghijklmnop"),
            "Bearer sk-a***********mnop"
        );
        assert_eq!(mask_authorization_value("sk-abcdefghijklmnop"), "sk-a***********mnop");
    }

    #[test]
    fn sanitizes_credential_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abcdefghijklmnop"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-abcdefghijklmnop"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let log = build_request_log("req-1", "POST", "/v1/chat/completions?x=1", &headers, b"{}");
        assert_eq!(log.request_id, "req-1");
        assert_eq!(log.path, "/v1/chat/completions?x=1");

        let lookup = |name: &str| {
            log.headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        };
        assert_eq!(lookup("authorization"), "Bearer sk-a***********mnop");
        assert_eq!(lookup("x-api-key"), "sk-a***********mnop");
        assert_eq!(lookup("content-type"), "application/json");
    }
}
