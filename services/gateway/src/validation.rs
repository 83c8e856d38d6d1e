use chrono::Utc;
use fabric_protocol::{error_types, message_types, Envelope, ValidationError};
use serde_json::Value;

const XSS_PATTERNS: &[&str] = &[
    "onclick=", "onerror=", "onload=", "onmouseover=", "<iframe", "<object", "<embed", "<form",
];

const HTML_ALREADY_ENCODED: &[&str] = &["&lt;", "&gt;", "&amp;", "&quot;", "&#x27;"];

/// Whether unknown `type` values are tolerated (rewritten into a fallback
/// error envelope and passed through) or rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Lenient,
    Strict,
}

impl ValidationMode {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        }
    }
}

/// Outcome of validating one inbound frame.
pub enum InboundOutcome {
    /// The message is well-formed and of a recognized (or, in lenient mode,
    /// any) type; hand it to the application message handler.
    Accept,
    /// The message's `type` was not recognized. In lenient mode this still
    /// carries the fallback error envelope to send back to the client
    /// instead of disconnecting it (§4.3 rule 2).
    Fallback(Envelope),
}

/// Inbound message shape and content checks run before a frame reaches the
/// application message handler.
///
/// A `payload.text` field is checked for script-injection and XSS patterns
/// and for a length ceiling, mirroring the micro-validator pipeline the
/// original system runs on its hot path. `max_text_chars` and
/// `max_message_bytes` are the operator-configured ceilings (§6). Checks run
/// in order: type presence, type acceptance, text security, then the
/// `raw_len` byte-size cap last, matching the original's check ordering.
pub fn validate_inbound(
    raw: &Value,
    raw_len: usize,
    known_types: &[&str],
    mode: ValidationMode,
    max_text_chars: usize,
    max_message_bytes: usize,
) -> Result<InboundOutcome, ValidationError> {
    let Some(kind) = raw.get("type").and_then(Value::as_str) else {
        return Err(ValidationError {
            error_type: error_types::VALIDATION.to_owned(),
            field: Some("type".to_owned()),
            message: "message is missing a \"type\" field".to_owned(),
            received_data: Some(raw.clone()),
        });
    };

    if !known_types.contains(&kind) {
        if mode == ValidationMode::Strict {
            return Err(ValidationError {
                error_type: error_types::UNKNOWN_TYPE.to_owned(),
                field: Some("type".to_owned()),
                message: format!("unrecognized message type \"{kind}\""),
                received_data: Some(raw.clone()),
            });
        }
        return Ok(InboundOutcome::Fallback(unknown_type_fallback(kind, raw)));
    }

    if let Some(text) = raw.pointer("/payload/text").and_then(Value::as_str) {
        validate_text_security(text, raw, max_text_chars)?;
    }

    if raw_len > max_message_bytes {
        return Err(ValidationError {
            error_type: error_types::VALIDATION.to_owned(),
            field: None,
            message: format!("message of {raw_len} bytes exceeds the {max_message_bytes}-byte cap"),
            received_data: None,
        });
    }

    Ok(InboundOutcome::Accept)
}

/// Builds the lenient-mode fallback envelope for an unrecognized `type`
/// (§4.3 rule 2 / seed test 6): the client is told its message type wasn't
/// recognized rather than being silently dropped or disconnected.
fn unknown_type_fallback(kind: &str, raw: &Value) -> Envelope {
    let original_payload = raw.get("payload").cloned().unwrap_or(Value::Null);
    Envelope::new(
        message_types::ERROR,
        serde_json::json!({
            "error": format!("Unknown message type: {kind}"),
            "original_type": kind,
            "original_payload": original_payload,
            "fallback_applied": true,
        }),
        Utc::now(),
    )
}

fn validate_text_security(text: &str, message: &Value, max_text_chars: usize) -> Result<(), ValidationError> {
    let lower = text.to_lowercase();

    if lower.contains("<script") || lower.contains("javascript:") {
        return Err(ValidationError {
            error_type: "security_error".to_owned(),
            field: Some("payload.text".to_owned()),
            message: "potential script injection detected in message".to_owned(),
            received_data: Some(message.clone()),
        });
    }

    if let Some(pattern) = XSS_PATTERNS.iter().find(|p| lower.contains(**p)) {
        return Err(ValidationError {
            error_type: "security_error".to_owned(),
            field: Some("payload.text".to_owned()),
            message: format!("potentially dangerous content detected: {pattern}"),
            received_data: Some(message.clone()),
        });
    }

    if text.chars().count() > max_text_chars {
        return Err(ValidationError {
            error_type: error_types::VALIDATION.to_owned(),
            field: Some("payload.text".to_owned()),
            message: format!("text too long: {} characters", text.chars().count()),
            received_data: Some(message.clone()),
        });
    }

    Ok(())
}

/// Sanitizes `payload` in place: HTML-encodes and strips control characters
/// from every string value except `payload.text` itself, which is encoded
/// separately (and left untouched if already encoded, to avoid double
/// escaping a client that pre-sanitized its own input).
pub fn sanitize_message(mut message: Value) -> Value {
    if let Some(payload) = message.get_mut("payload").and_then(Value::as_object_mut) {
        if let Some(text) = payload.get("text").and_then(Value::as_str) {
            let sanitized = sanitize_text_content(text);
            payload.insert("text".to_owned(), Value::String(sanitized));
        }
        for (key, value) in payload.iter_mut() {
            if key != "text" {
                sanitize_value_in_place(value);
            }
        }
    }
    message
}

/// Sanitizes `payload` but leaves `payload.text` byte-for-byte untouched —
/// used for message types (e.g. pre-formatted code blocks) where HTML
/// encoding the primary text field would corrupt content the client is
/// expected to render verbatim.
pub fn sanitize_message_skip_text(mut message: Value) -> Value {
    if let Some(payload) = message.get_mut("payload").and_then(Value::as_object_mut) {
        for (key, value) in payload.iter_mut() {
            if key != "text" {
                sanitize_value_in_place(value);
            }
        }
    }
    message
}

fn sanitize_value_in_place(value: &mut Value) {
    match value {
        Value::String(s) => *s = sanitize_text_content(s),
        Value::Object(map) => {
            for v in map.values_mut() {
                sanitize_value_in_place(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                sanitize_value_in_place(v);
            }
        }
        _ => {}
    }
}

fn sanitize_text_content(text: &str) -> String {
    if is_text_already_encoded(text) {
        return text.to_owned();
    }
    let encoded = encode_html_entities(text);
    remove_control_characters(&encoded)
}

fn is_text_already_encoded(text: &str) -> bool {
    HTML_ALREADY_ENCODED.iter().any(|entity| text.contains(entity))
}

fn encode_html_entities(text: &str) -> String {
    text.replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn remove_control_characters(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{0}' | '\u{8}' | '\u{c}' | '\u{e}' | '\u{f}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX_TEXT_LENGTH: usize = 10_000;
    const MAX_MESSAGE_BYTES: usize = 1_048_576;

    fn validate(raw: &Value, known_types: &[&str], mode: ValidationMode) -> Result<InboundOutcome, ValidationError> {
        let raw_len = serde_json::to_vec(raw).unwrap().len();
        validate_inbound(raw, raw_len, known_types, mode, MAX_TEXT_LENGTH, MAX_MESSAGE_BYTES)
    }

    #[test]
    fn lenient_mode_rewrites_unknown_type_into_a_fallback_envelope() {
        let msg = json!({"type": "mystery_event", "payload": {"x": 1}});
        match validate(&msg, &["chat"], ValidationMode::Lenient).unwrap() {
            InboundOutcome::Fallback(envelope) => {
                assert_eq!(envelope.kind, message_types::ERROR);
                assert_eq!(envelope.payload["original_type"], "mystery_event");
                assert_eq!(envelope.payload["fallback_applied"], true);
                assert_eq!(envelope.payload["error"], "Unknown message type: mystery_event");
            }
            InboundOutcome::Accept => panic!("expected a fallback envelope"),
        }
    }

    #[test]
    fn strict_mode_rejects_unknown_type_outright() {
        let msg = json!({"type": "mystery_event", "payload": {}});
        let err = validate(&msg, &["chat"], ValidationMode::Strict).unwrap_err();
        assert_eq!(err.error_type, error_types::UNKNOWN_TYPE);
    }

    #[test]
    fn missing_type_field_is_always_rejected() {
        let msg = json!({"payload": {}});
        let err = validate(&msg, &["chat"], ValidationMode::Lenient).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("type"));
    }

    #[test]
    fn oversized_message_is_rejected_after_type_and_security_checks_pass() {
        let msg = json!({"type": "chat", "payload": {"text": "a".repeat(10)}});
        let err = validate_inbound(&msg, MAX_MESSAGE_BYTES + 1, &["chat"], ValidationMode::Lenient, MAX_TEXT_LENGTH, MAX_MESSAGE_BYTES)
            .unwrap_err();
        assert_eq!(err.error_type, error_types::VALIDATION);
        assert!(err.field.is_none());
    }

    #[test]
    fn script_tag_in_payload_text_is_rejected_as_a_security_error() {
        let msg = json!({"type": "chat", "payload": {"text": "<script>alert(1)</script>"}});
        let err = validate(&msg, &["chat"], ValidationMode::Lenient).unwrap_err();
        assert_eq!(err.error_type, "security_error");
    }

    #[test]
    fn onerror_attribute_pattern_is_rejected() {
        let msg = json!({"type": "chat", "payload": {"text": "<img onerror=alert(1)>"}});
        let err = validate(&msg, &["chat"], ValidationMode::Lenient).unwrap_err();
        assert_eq!(err.error_type, "security_error");
    }

    #[test]
    fn overlong_text_is_rejected_with_a_validation_error() {
        let long_text = "a".repeat(MAX_TEXT_LENGTH + 1);
        let msg = json!({"type": "chat", "payload": {"text": long_text}});
        let err = validate(&msg, &["chat"], ValidationMode::Lenient).unwrap_err();
        assert_eq!(err.error_type, error_types::VALIDATION);
    }

    #[test]
    fn sanitize_encodes_angle_brackets_and_strips_control_characters() {
        let msg = json!({"type": "log", "payload": {"line": "<b>hi\u{8}</b>"}});
        let sanitized = sanitize_message(msg);
        assert_eq!(sanitized["payload"]["line"], "&lt;b&gt;hi&lt;/b&gt;");
    }

    #[test]
    fn sanitize_leaves_payload_text_field_untouched_by_the_generic_pass() {
        let msg = json!({"type": "chat", "payload": {"text": "<b>hi</b>", "note": "<i>x</i>"}});
        let sanitized = sanitize_message(msg);
        assert_eq!(sanitized["payload"]["text"], "&lt;b&gt;hi&lt;/b&gt;");
        assert_eq!(sanitized["payload"]["note"], "&lt;i&gt;x&lt;/i&gt;");
    }

    #[test]
    fn sanitize_skip_text_leaves_text_field_completely_untouched() {
        let msg = json!({"type": "code_block", "payload": {"text": "<pre>raw</pre>", "note": "<i>x</i>"}});
        let sanitized = sanitize_message_skip_text(msg);
        assert_eq!(sanitized["payload"]["text"], "<pre>raw</pre>");
        assert_eq!(sanitized["payload"]["note"], "&lt;i&gt;x&lt;/i&gt;");
    }

    #[test]
    fn already_encoded_text_is_left_as_is() {
        let already = "&lt;script&gt;";
        assert_eq!(sanitize_text_content(already), already);
    }
}
