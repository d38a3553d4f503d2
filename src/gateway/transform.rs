use serde_json::Value;

use super::RequestKind;

/// Rewrites a small fixed set of ill-formed payload shapes before dispatch:
/// tool-role messages whose `content` is an array get that array serialized
/// into a JSON string, and content parts typed `"image"` become
/// `"image_url"`. Anything that does not parse as JSON passes through
/// untouched; the upstream provider owns rejecting it.
///
/// Returns `Some(new_body)` only when an edit occurred.
pub fn normalize_request_body(
    body: &[u8],
    kind: RequestKind,
) -> Result<Option<Vec<u8>>, serde_json::Error> {
    match kind {
        RequestKind::ChatCompletions | RequestKind::Responses => {}
        RequestKind::AnthropicMessages => return Ok(None),
    }

    let Ok(mut payload) = serde_json::from_slice::<Value>(body) else {
        return Ok(None);
    };
    let Some(messages) = payload
        .get_mut("messages")
        .and_then(|value| value.as_array_mut())
    else {
        return Ok(None);
    };

    let mut changed = false;
    for message in messages.iter_mut() {
        let Some(object) = message.as_object_mut() else {
            continue;
        };
        let role_is_tool = object
            .get("role")
            .and_then(|role| role.as_str())
            .is_some_and(|role| role.eq_ignore_ascii_case("tool"));

        let Some(content) = object.get_mut("content") else {
            continue;
        };
        let Some(parts) = content.as_array_mut() else {
            continue;
        };

        if role_is_tool {
            let serialized = serde_json::to_string(parts)?;
            *content = Value::String(serialized);
            changed = true;
            continue;
        }

        for part in parts.iter_mut() {
            let Some(part) = part.as_object_mut() else {
                continue;
            };
            let is_image = part
                .get("type")
                .and_then(|kind| kind.as_str())
                .is_some_and(|kind| kind.eq_ignore_ascii_case("image"));
            if is_image {
                part.insert("type".to_string(), Value::String("image_url".to_string()));
                changed = true;
            }
        }
    }

    if !changed {
        return Ok(None);
    }
    serde_json::to_vec(&payload).map(Some)
}
