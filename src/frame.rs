use serde::Serialize;
use serde_json::Value;

/// Outgoing request frame (client to Core).
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub command: String,
    pub args: Value,
    #[serde(rename = "sendTime")]
    pub send_time: u64,
    #[serde(rename = "commandId", skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

/// Classification of an inbound frame, decided purely by which tags are present.
///
/// The controller never interprets `command`/`args`/event payloads beyond these
/// tags — everything else is carried opaquely as `serde_json::Value`.
pub enum FrameKind {
    Response { response_id: String, data: Value },
    Event(Value),
}

/// Classify a raw inbound frame as a response or an event, or `None` if neither
/// tag is present (in which case the frame is dropped).
#[must_use]
pub fn classify(frame: &Value) -> Option<FrameKind> {
    if let Some(response_id) = frame.get("responseId").and_then(Value::as_str) {
        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        return Some(FrameKind::Response {
            response_id: response_id.to_string(),
            data,
        });
    }
    if frame.get("listenerId").is_some() || frame.get("eventType").is_some() {
        return Some(FrameKind::Event(frame.clone()));
    }
    None
}

/// An inbound `data` payload that looks like an error: a JSON object carrying
/// at least a string `name` field. Anything else is treated as a successful payload.
#[derive(Debug, Clone)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    pub is_disconnecting: bool,
}

/// Attempt to read `data` as an error-shaped value.
#[must_use]
pub fn as_error_payload(data: &Value) -> Option<ErrorPayload> {
    let obj = data.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let is_disconnecting = obj
        .get("isDisconnecting")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some(ErrorPayload {
        name,
        message,
        is_disconnecting,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_response_extracts_id_and_data() {
        let frame = json!({"responseId": "1", "data": {"pong": true}});
        match classify(&frame) {
            Some(FrameKind::Response { response_id, data }) => {
                assert_eq!(response_id, "1");
                assert_eq!(data["pong"], true);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn classify_event_by_listener_id() {
        let frame = json!({"listenerId": "l1", "foo": "bar"});
        assert!(matches!(classify(&frame), Some(FrameKind::Event(_))));
    }

    #[test]
    fn classify_event_by_event_type() {
        let frame = json!({"eventType": "dialog"});
        assert!(matches!(classify(&frame), Some(FrameKind::Event(_))));
    }

    #[test]
    fn classify_unrecognized_frame_is_dropped() {
        let frame = json!({"foo": "bar"});
        assert!(classify(&frame).is_none());
    }

    #[test]
    fn error_payload_detected_by_name_field() {
        let data = json!({"name": "SessionClosedOrMissingError", "message": "closed"});
        let err = as_error_payload(&data).unwrap();
        assert_eq!(err.name, "SessionClosedOrMissingError");
        assert_eq!(err.message, "closed");
        assert!(!err.is_disconnecting);
    }

    #[test]
    fn error_payload_reads_is_disconnecting_marker() {
        let data = json!({"name": "X", "isDisconnecting": true});
        let err = as_error_payload(&data).unwrap();
        assert!(err.is_disconnecting);
    }

    #[test]
    fn plain_payload_is_not_error_shaped() {
        let data = json!({"pong": true});
        assert!(as_error_payload(&data).is_none());
    }

    #[test]
    fn request_frame_serializes_optional_fields_conditionally() {
        let frame = RequestFrame {
            message_id: "5".into(),
            command: "Page.navigate".into(),
            args: json!({"url": "https://example.com"}),
            send_time: 1_732_999_999_000,
            command_id: None,
            start_time: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("commandId").is_none());
        assert!(value.get("startTime").is_none());
        assert_eq!(value["messageId"], "5");
    }
}
