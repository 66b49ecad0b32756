use crate::handshake::messages::{ControlMessage, ExtensionRuntimeParams};

use serde_json::{Value, json};

/// **VALUE**: Verifies the JSON shape of host replies.
///
/// **WHY THIS MATTERS**: Clients switch on `type` and read camelCase fields.
///
/// **BUG THIS CATCHES**: Would catch snake_case leaking onto the wire or `debugPort`
/// being sent as `null`.
#[test]
fn given_host_replies_when_encoded_then_json_matches_wire_shape() {
    let ok: Value = serde_json::from_slice(&ControlMessage::ok(Some(9229)).encode()).expect("ok");
    let bare_ok: Value = serde_json::from_slice(&ControlMessage::ok(None).encode()).expect("bare ok");
    let error: Value =
        serde_json::from_slice(&ControlMessage::error("Management connection is not running.").encode()).expect("error");

    assert_eq!(ok, json!({"type": "ok", "debugPort": 9229}));
    assert_eq!(bare_ok, json!({"type": "ok"}));
    assert_eq!(
        error,
        json!({"type": "error", "reason": "Management connection is not running."})
    );
}

/// **VALUE**: Verifies runtime start parameters and their defaults.
///
/// **BUG THIS CATCHES**: Would catch `break` not mapping to `break_on_start` or
/// the language default disappearing.
#[test]
fn given_args_when_parsed_then_fields_and_defaults_apply() {
    let args = json!({"port": 0, "break": true, "debugId": "d1", "env": {"A": "1"}});

    let params = ExtensionRuntimeParams::from_args(Some(&args)).expect("params");
    let defaults = ExtensionRuntimeParams::from_args(None).expect("defaults");

    assert_eq!(params.port, Some(0));
    assert!(params.break_on_start);
    assert_eq!(params.debug_id.as_deref(), Some("d1"));
    assert_eq!(params.env.get("A").map(String::as_str), Some("1"));
    assert_eq!(params.language, "en");
    assert_eq!(defaults, ExtensionRuntimeParams::default());
}
