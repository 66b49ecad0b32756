use crate::helpers::{
    DeflateClient, EXTENSION_RUNTIME, TestClient, next_event, start, test_config,
};

use host_core::{ClientToken, HostConfig, HostEvent};

use serde_json::json;

fn runtime_config() -> HostConfig {
    let mut config = test_config(2_000, 500);
    config.extension_runtime.program = env!("CARGO_BIN_EXE_echo-runtime").to_string();
    config.extension_runtime.log_level = "debug".to_string();
    config
}

/// A runtime program that never connects to the IPC hook and so never reports ready.
fn silent_runtime_config() -> HostConfig {
    let mut config = test_config(2_000, 500);
    config.extension_runtime.program = "/bin/sh".to_string();
    config.extension_runtime.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
    config
}

/// **VALUE**: Verifies the full runtime path: spawn, ready, descriptor handoff,
/// and traffic served by the runtime process itself.
///
/// **WHY THIS MATTERS**: After the handoff the host is out of the data path.
/// Any byte lost in the handoff (buffered frames, replay bytes) breaks the
/// client's first message.
///
/// **BUG THIS CATCHES**: Would catch:
/// - The handoff being sent before the runtime reported ready
/// - Bytes the host already read not reaching the runtime
/// - The descriptor not being usable on the runtime side
#[tokio::test]
async fn given_runtime_program_when_client_connects_then_runtime_echoes_messages() {
    // GIVEN: A host configured with the echo runtime
    let (handle, mut events) = start(runtime_config()).await;

    // WHEN: A client asks for an extension runtime
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    let reply = client
        .handshake(EXTENSION_RUNTIME, false, Some(json!({"language": "en"})))
        .await;

    // THEN: The host confirms and reports the process
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    let HostEvent::ExtensionRuntimeStarted { token, pid } = next_event(&mut events).await else {
        panic!("expected ExtensionRuntimeStarted");
    };
    assert_eq!(token.as_str(), "alpha");
    assert!(pid > 0);

    // THEN: The runtime answers on the handed-over connection
    client.send_regular(b"ping").await;
    assert_eq!(client.next_regular().await, b"ping");

    handle.shutdown().await;
}

/// **VALUE**: Verifies a reconnecting client is handed to the same runtime.
///
/// **WHY THIS MATTERS**: The runtime holds extension state. A reconnection must
/// reach the running process, not spawn a new one.
///
/// **BUG THIS CATCHES**: Would catch a second process being started, or the new
/// descriptor never reaching the runtime.
#[tokio::test]
async fn given_running_runtime_when_client_reconnects_then_same_runtime_serves_it() {
    // GIVEN: A runtime that has served one message
    let (handle, mut events) = start(runtime_config()).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(client.handshake(EXTENSION_RUNTIME, false, None).await["type"], "ok");
    let HostEvent::ExtensionRuntimeStarted { pid, .. } = next_event(&mut events).await else {
        panic!("expected ExtensionRuntimeStarted");
    };
    client.send_regular(b"first").await;
    assert_eq!(client.next_regular().await, b"first");

    // WHEN: The client drops and reconnects
    let resumed = TestClient::connect(handle.local_addr(), "alpha", true).await;
    let mut resumed = resumed.resume_from(&client);
    drop(client);
    let reply = resumed.handshake(EXTENSION_RUNTIME, true, None).await;

    // THEN: The same process answers
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    resumed.send_regular(b"second").await;
    assert_eq!(resumed.next_regular().await, b"second");
    let runtime = handle
        .registry()
        .extension_runtime(&host_core::ClientToken::new("alpha"))
        .await
        .expect("runtime still registered");
    assert_eq!(runtime.pid(), pid);

    handle.shutdown().await;
}

/// **VALUE**: Verifies the runtime conflict and missing-runtime replies.
///
/// **BUG THIS CATCHES**: Would catch a second runtime being spawned for one
/// token, or a reconnection to nothing being accepted.
#[tokio::test]
async fn given_runtime_state_when_conflicting_requests_arrive_then_refused_with_reason() {
    // GIVEN: A host with one running runtime for alpha
    let (handle, mut events) = start(runtime_config()).await;
    let mut alpha = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(alpha.handshake(EXTENSION_RUNTIME, false, None).await["type"], "ok");
    let HostEvent::ExtensionRuntimeStarted { .. } = next_event(&mut events).await else {
        panic!("expected ExtensionRuntimeStarted");
    };

    // WHEN: alpha asks for a second fresh runtime, and beta reconnects to none
    let mut duplicate = TestClient::connect(handle.local_addr(), "alpha", false).await;
    let duplicate_reply = duplicate.handshake(EXTENSION_RUNTIME, false, None).await;
    let mut missing = TestClient::connect(handle.local_addr(), "beta", true).await;
    let missing_reply = missing.handshake(EXTENSION_RUNTIME, true, None).await;

    // THEN: Both are refused with their reasons
    assert_eq!(duplicate_reply["reason"], "Extension host is already running.");
    assert_eq!(missing_reply["reason"], "Extension host is not running.");

    handle.shutdown().await;
}

/// **VALUE**: Verifies the host reports the runtime's exit.
///
/// **BUG THIS CATCHES**: Would catch the registry keeping a dead runtime, which
/// would refuse every later fresh request for that token.
#[tokio::test]
async fn given_running_runtime_when_client_disconnects_then_exit_is_reported() {
    // GIVEN: A running runtime
    let (handle, mut events) = start(runtime_config()).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(client.handshake(EXTENSION_RUNTIME, false, None).await["type"], "ok");
    let HostEvent::ExtensionRuntimeStarted { pid, .. } = next_event(&mut events).await else {
        panic!("expected ExtensionRuntimeStarted");
    };
    client.send_regular(b"hello").await;
    assert_eq!(client.next_regular().await, b"hello");

    // WHEN: The client sends a disconnect, which makes the echo runtime exit
    client.send_disconnect().await;

    // THEN: The exit is reported as normal and the entry is gone
    let HostEvent::ExtensionRuntimeExited { token, pid: exited, exit } = next_event(&mut events).await
    else {
        panic!("expected ExtensionRuntimeExited");
    };
    assert_eq!(exited, pid);
    assert!(exit.normal, "echo runtime should exit cleanly, got {exit:?}");
    assert!(!handle.registry().has_extension_runtime(&token).await);

    handle.shutdown().await;
}

/// **VALUE**: Verifies a program that cannot be started is reported to the client.
#[tokio::test]
async fn given_missing_runtime_program_when_client_connects_then_error_reply() {
    let mut config = test_config(2_000, 500);
    config.extension_runtime.program = "/nonexistent/remote-host-runtime".to_string();
    let (handle, _events) = start(config).await;

    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    let reply = client.handshake(EXTENSION_RUNTIME, false, None).await;

    // The ok reply goes out before the spawn, so the failure arrives as an error
    // control message afterwards.
    let failure = if reply["type"] == "ok" { client.next_control().await } else { reply };
    assert_eq!(failure["type"], "error");
    assert!(!handle.registry().has_extension_runtime(&host_core::ClientToken::new("alpha")).await);

    handle.shutdown().await;
}

/// **VALUE**: Verifies a reconnection that arrives before the runtime is ready
/// replaces the waiting transport, and the replaced client is told why.
///
/// **WHY THIS MATTERS**: Only one transport can be waiting for `ready`. The
/// client that lost its slot has to learn it rather than hang.
///
/// **BUG THIS CATCHES**: Would catch:
/// - The older transport being delivered instead of the newer one
/// - The replaced client never getting a reply or a close
#[tokio::test]
async fn given_runtime_not_ready_when_client_reconnects_then_waiting_transport_superseded() {
    // GIVEN: A runtime that never reports ready, with one transport waiting
    let (handle, mut events) = start(silent_runtime_config()).await;
    let mut first = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(first.handshake(EXTENSION_RUNTIME, false, None).await["type"], "ok");
    let HostEvent::ExtensionRuntimeStarted { .. } = next_event(&mut events).await else {
        panic!("expected ExtensionRuntimeStarted");
    };

    // WHEN: The same token reconnects before ready
    let mut second = TestClient::connect(handle.local_addr(), "alpha", true).await;
    let reply = second.handshake(EXTENSION_RUNTIME, true, None).await;

    // THEN: The reconnection is accepted and the first client is superseded
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    let superseded = first.next_control().await;
    assert_eq!(superseded["type"], "error");
    assert_eq!(superseded["reason"], "Superseded by a newer connection.");
    assert!(first.closed_by_host().await);
    assert!(handle.registry().has_extension_runtime(&ClientToken::new("alpha")).await);

    handle.shutdown().await;
}

/// **VALUE**: Verifies a runtime that dies on its own is reported as an
/// abnormal exit with its code, and the waiting client is refused.
///
/// **WHY THIS MATTERS**: Embedders decide whether to restart or alert from the
/// exit event. A crash must not read as a clean shutdown.
///
/// **BUG THIS CATCHES**: Would catch:
/// - A non-zero exit being flagged as normal
/// - The registry keeping a dead runtime, which blocks the next establish
/// - The pending transport being dropped without an error reply
#[tokio::test]
async fn given_runtime_exits_with_failure_when_waiting_client_then_abnormal_exit_reported() {
    // GIVEN: A runtime program that exits with code 3 straight away
    let mut config = test_config(2_000, 500);
    config.extension_runtime.program = "/bin/sh".to_string();
    config.extension_runtime.args = vec!["-c".to_string(), "exit 3".to_string()];
    let (handle, mut events) = start(config).await;

    // WHEN: A client asks for an extension runtime
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(client.handshake(EXTENSION_RUNTIME, false, None).await["type"], "ok");

    // THEN: The exit is abnormal and carries the code
    let exit = loop {
        match next_event(&mut events).await {
            HostEvent::ExtensionRuntimeExited { token, exit, .. } => {
                assert_eq!(token.as_str(), "alpha");
                break exit;
            }
            _ => continue,
        }
    };
    assert!(!exit.normal, "exit code 3 must be abnormal, got {exit:?}");
    assert_eq!(exit.code, Some(3));
    assert!(!handle.registry().has_extension_runtime(&ClientToken::new("alpha")).await);

    // THEN: The client that was waiting for the runtime is refused
    let refusal = client.next_control().await;
    assert_eq!(refusal["type"], "error");
    assert_eq!(refusal["reason"], "Extension host is not running.");

    handle.shutdown().await;
}

/// **VALUE**: Verifies a compressed connection keeps decoding after the
/// runtime adopts it, including bytes the host inflated during the handshake.
///
/// **WHY THIS MATTERS**: With context takeover the client compresses every
/// message against everything it sent before. The runtime only understands
/// the next frame if its inflater has seen the handshake frames too.
///
/// **BUG THIS CATCHES**: Would catch:
/// - Handshake inflate bytes not travelling with the descriptor
/// - A regular message read with the handshake being lost or decoded twice
/// - The runtime compressing replies the client cannot inflate
#[tokio::test]
async fn given_compressed_client_when_handed_to_runtime_then_runtime_continues_the_stream() {
    // GIVEN: A client that negotiated permessage-deflate
    let (handle, mut events) = start(runtime_config()).await;
    let mut client = DeflateClient::connect(handle.local_addr(), "alpha").await;
    let auth = json!({"type": "auth", "auth": "compressed handshake payload"});
    client.send(&[DeflateClient::control(auth.clone())]).await;
    let sign = client.next_control().await;
    assert_eq!(sign["type"], "sign", "expected sign, got {sign}");

    // WHEN: connectionType and a first message arrive in the same write
    let request = DeflateClient::control(json!({
        "type": "connectionType",
        "desiredConnectionType": EXTENSION_RUNTIME,
        "reconnection": false,
        "signedData": sign["data"],
    }));
    let early = client.regular(b"early message");
    client.send(&[request, early]).await;

    // THEN: The host confirms and the runtime echoes the early message
    let reply = client.next_control().await;
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    let HostEvent::ExtensionRuntimeStarted { .. } = next_event(&mut events).await else {
        panic!("expected ExtensionRuntimeStarted");
    };
    assert_eq!(client.next_regular().await, b"early message");

    // THEN: A message that back-references the handshake bytes still decodes
    let repeated = serde_json::to_vec(&auth).expect("auth json");
    let late = client.regular(&repeated);
    client.send(&[late]).await;
    assert_eq!(client.next_regular().await, repeated);

    handle.shutdown().await;
}
