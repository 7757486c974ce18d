// Verify the wire format matches what gateway clients expect.
// These tests ensure protocol compatibility is never broken.

use haya_core::HayaError;
use haya_protocol::frames::{EventFrame, RequestFrame, ResponseFrame};

#[test]
fn request_frame_round_trip() {
    let json = r#"{"id":"abc-123","method":"chat.send","params":{"sessionId":"abc","message":"hi"}}"#;
    let req: RequestFrame = serde_json::from_str(json).unwrap();
    assert_eq!(req.id, "abc-123");
    assert_eq!(req.method, "chat.send");
    assert_eq!(req.params.unwrap()["message"], "hi");
}

#[test]
fn request_params_are_optional() {
    let req: RequestFrame = serde_json::from_str(r#"{"id":"1","method":"sessions.list"}"#).unwrap();
    assert!(req.params.is_none());
}

#[test]
fn response_ok_serialization() {
    let res = ResponseFrame::ok("req-1", serde_json::json!({"text": "hello"}));
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""id":"req-1""#));
    assert!(json.contains(r#""text":"hello""#));
    // error field must be absent on success
    assert!(!json.contains(r#""error""#));
}

#[test]
fn response_err_serialization() {
    let res = ResponseFrame::err("req-2", "UNAUTHORIZED", "bad token");
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""code":"UNAUTHORIZED""#));
    assert!(json.contains(r#""message":"bad token""#));
    // result field must be absent on error
    assert!(!json.contains(r#""result""#));
}

#[test]
fn response_from_taxonomy_error() {
    let res = ResponseFrame::from_error("req-3", &HayaError::NotFound("session xyz".into()));
    assert_eq!(res.error.unwrap().code, "NOT_FOUND");
}

#[test]
fn event_frame_serialization() {
    let ev = EventFrame::new("chat.delta", serde_json::json!({"id": "s1", "content": "par"}));
    let json = ev.to_json();

    assert!(json.contains(r#""event":"chat.delta""#));
    assert!(json.contains(r#""content":"par""#));
    // events carry no request id
    assert!(!json.contains(r#""id":"s1","method""#));
}
