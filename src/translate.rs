//! Payload mapping between the public `/v1/responses` shape and the
//! chat-completion shape text backends speak natively.

use serde_json::{Map, Value, json};

/// Sampling fields copied verbatim from a responses request
const PASSTHROUGH_FIELDS: [&str; 9] = [
    "model",
    "temperature",
    "top_p",
    "stream",
    "stop",
    "seed",
    "presence_penalty",
    "frequency_penalty",
    "user",
];

/// Build a chat-completion request from a responses request
///
/// `instructions` becomes a leading system message; `input` may be a plain
/// string or a list of message items whose content is a string or a list of
/// text parts.
pub fn responses_to_chat(body: &Value) -> Result<Value, String> {
    let request = body
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;

    let mut messages = Vec::new();
    if let Some(instructions) = request.get("instructions").and_then(Value::as_str)
        && !instructions.is_empty()
    {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    match request.get("input") {
        Some(Value::String(text)) => messages.push(json!({"role": "user", "content": text})),
        Some(Value::Array(items)) => {
            for item in items {
                messages.push(input_item_to_message(item)?);
            }
        }
        None | Some(Value::Null) => {}
        Some(_) => return Err("'input' must be a string or an array".into()),
    }

    if messages.is_empty() {
        return Err("'input' is required".into());
    }

    let mut chat = Map::new();
    for field in PASSTHROUGH_FIELDS {
        if let Some(value) = request.get(field) {
            chat.insert(field.to_string(), value.clone());
        }
    }
    if let Some(max) = request.get("max_output_tokens") {
        chat.insert("max_tokens".into(), max.clone());
    }
    chat.insert("messages".into(), Value::Array(messages));

    Ok(Value::Object(chat))
}

fn input_item_to_message(item: &Value) -> Result<Value, String> {
    if let Some(text) = item.as_str() {
        return Ok(json!({"role": "user", "content": text}));
    }
    let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
    let content = match item.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return Err("each input item needs a 'content' string or part list".into()),
    };
    Ok(json!({"role": role, "content": content}))
}

/// Re-express a non-streaming chat completion as a `response` object
pub fn chat_to_response(chat: &Value) -> Value {
    let text = chat
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let id = chat.get("id").and_then(Value::as_str).unwrap_or("chat");
    let created = chat
        .get("created")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let finish = chat
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str);

    let mut response = json!({
        "id": format!("resp_{id}"),
        "object": "response",
        "created_at": created,
        "model": chat.get("model").cloned().unwrap_or(Value::Null),
        "status": if finish == Some("length") { "incomplete" } else { "completed" },
        "output": [{
            "type": "message",
            "id": format!("msg_{id}"),
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": text, "annotations": []}]
        }],
        "output_text": text,
    });

    if let Some(usage) = chat.get("usage") {
        let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
        let total = usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(input + output);
        response["usage"] = json!({
            "input_tokens": input,
            "output_tokens": output,
            "total_tokens": total,
        });
    }
    response
}
