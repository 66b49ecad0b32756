use crate::helpers::{
    MANAGEMENT, TestClient, disconnected, management_status, next_event, start, test_config,
    wait_for_status,
};

use host_core::HostEvent;
use host_core::session::DisposeReason;

use std::time::Duration;

use tokio::time::{sleep, timeout};

// ============================================================================
// Establishing and talking
// ============================================================================

/// **VALUE**: Verifies a fresh management connection completes the handshake and
/// carries regular messages in both directions.
///
/// **WHY THIS MATTERS**: Every other feature sits on top of this path. If `ok`
/// is not sent or the channel is not activated, no client can ever work.
///
/// **BUG THIS CATCHES**: Would catch:
/// - The handshake stalling after `sign`
/// - Client messages not reaching the embedding application
/// - Host messages not reaching the client
#[tokio::test]
async fn given_running_host_when_client_connects_management_then_messages_flow_both_ways() {
    // GIVEN: A running host
    let (handle, mut events) = start(test_config(2_000, 500)).await;

    // WHEN: A client establishes a management connection
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    let reply = client.handshake(MANAGEMENT, false, None).await;

    // THEN: The host confirms and publishes the connection
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    let HostEvent::ManagementConnected(mut connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };
    assert_eq!(connection.token.as_str(), "alpha");

    // THEN: Messages flow both ways
    client.send_regular(b"from client").await;
    let received = timeout(Duration::from_secs(5), connection.messages.recv())
        .await
        .expect("timed out")
        .expect("message");
    assert_eq!(received, b"from client");

    assert!(connection.sender.send(b"from host".to_vec()));
    assert_eq!(client.next_regular().await, b"from host");

    handle.shutdown().await;
}

/// **VALUE**: Verifies a second fresh management connection for a token that
/// already has one is refused, and the first keeps working.
///
/// **WHY THIS MATTERS**: One client token owns exactly one management channel.
///
/// **BUG THIS CATCHES**: Would catch the new connection silently replacing the
/// live one, which would orphan the first client's RPC state.
#[tokio::test]
async fn given_live_management_when_same_token_connects_again_then_refused() {
    // GIVEN: A connected management client
    let (handle, mut events) = start(test_config(2_000, 500)).await;
    let mut first = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(first.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(mut connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };

    // WHEN: Another fresh connection uses the same token
    let mut second = TestClient::connect(handle.local_addr(), "alpha", false).await;
    let reply = second.handshake(MANAGEMENT, false, None).await;

    // THEN: It gets the conflict reason and is closed
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "Management connection is already running.");
    assert!(second.closed_by_host().await);

    // THEN: The first connection still works
    first.send_regular(b"still here").await;
    let received = timeout(Duration::from_secs(5), connection.messages.recv())
        .await
        .expect("timed out")
        .expect("message");
    assert_eq!(received, b"still here");

    handle.shutdown().await;
}

/// **VALUE**: Verifies a reconnection for an unknown token is refused.
///
/// **BUG THIS CATCHES**: Would catch a reconnection silently creating a new
/// session instead of telling the client its old one is gone.
#[tokio::test]
async fn given_no_management_when_client_reconnects_then_not_running_error() {
    let (handle, _events) = start(test_config(2_000, 500)).await;

    let mut client = TestClient::connect(handle.local_addr(), "ghost", true).await;
    let reply = client.handshake(MANAGEMENT, true, None).await;

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "Management connection is not running.");
    assert!(management_status(handle.registry(), "ghost").await.is_none());

    handle.shutdown().await;
}

// ============================================================================
// Reconnection
// ============================================================================

/// **VALUE**: Verifies a dropped client can reconnect within the grace time and
/// receives what the host sent while it was away.
///
/// **WHY THIS MATTERS**: This is the point of the persistent channel. Network
/// blips must not lose management traffic.
///
/// **BUG THIS CATCHES**: Would catch:
/// - Unacknowledged messages not being re-sent on the new transport
/// - The grace timer still running after the reconnection
/// - Client messages after the reconnection being dropped as a gap
#[tokio::test]
async fn given_dropped_client_when_reconnecting_in_grace_then_queued_messages_arrive() {
    // GIVEN: An established management connection that has exchanged one message
    let (handle, mut events) = start(test_config(2_000, 500)).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(client.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(mut connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };
    client.send_regular(b"before").await;
    connection.messages.recv().await.expect("before");

    // WHEN: The transport drops and the host sends while it is down
    let resumed = TestClient::connect(handle.local_addr(), "alpha", true).await;
    let mut resumed = resumed.resume_from(&client);
    drop(client);
    assert!(wait_for_status(handle.registry(), "alpha", disconnected).await);
    assert!(connection.sender.send(b"while away".to_vec()));

    // WHEN: The client reconnects
    let reply = resumed.handshake(MANAGEMENT, true, None).await;

    // THEN: The reconnection is accepted, the queued message arrives and the
    // timers are cleared
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    assert_eq!(resumed.next_regular().await, b"while away");
    assert!(
        wait_for_status(handle.registry(), "alpha", |status| status
            .is_some_and(|status| status.connected && !status.grace_scheduled))
        .await
    );

    // THEN: Client traffic resumes with the continued id sequence
    resumed.send_regular(b"after").await;
    let received = timeout(Duration::from_secs(5), connection.messages.recv())
        .await
        .expect("timed out")
        .expect("after");
    assert_eq!(received, b"after");

    handle.shutdown().await;
}

/// **VALUE**: Verifies the long grace timer disposes an abandoned session.
///
/// **WHY THIS MATTERS**: Without expiry, every client that ever dropped would
/// keep a session and its buffers forever.
///
/// **BUG THIS CATCHES**: Would catch the registry entry surviving disposal, so a
/// later reconnect would be accepted against a dead session.
#[tokio::test]
async fn given_dropped_client_when_grace_expires_then_session_is_disposed() {
    // GIVEN: A management connection with a short long-grace
    let (handle, mut events) = start(test_config(300, 100)).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(client.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(_connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };

    // WHEN: The client drops and never comes back
    drop(client);

    // THEN: The session is disposed for grace expiry
    let HostEvent::ManagementDisconnected { token, reason } = next_event(&mut events).await else {
        panic!("expected ManagementDisconnected");
    };
    assert_eq!(token.as_str(), "alpha");
    assert_eq!(reason, DisposeReason::GraceExpired);
    assert!(!handle.registry().has_management(&token).await);

    // THEN: A late reconnection is refused
    let mut late = TestClient::connect(handle.local_addr(), "alpha", true).await;
    let reply = late.handshake(MANAGEMENT, true, None).await;
    assert_eq!(reply["reason"], "Management connection is not running.");

    handle.shutdown().await;
}

/// **VALUE**: Verifies a client that asks to disconnect is disposed at once.
#[tokio::test]
async fn given_connected_client_when_it_sends_disconnect_then_disposed_immediately() {
    let (handle, mut events) = start(test_config(60_000, 30_000)).await;
    let mut client = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(client.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(_connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };

    client.send_disconnect().await;

    let HostEvent::ManagementDisconnected { reason, .. } = next_event(&mut events).await else {
        panic!("expected ManagementDisconnected");
    };
    assert_eq!(reason, DisposeReason::PeerDisconnected);

    handle.shutdown().await;
}

// ============================================================================
// Preemption
// ============================================================================

/// **VALUE**: Verifies a new client shortens the wait for a dropped one.
///
/// **WHY THIS MATTERS**: When someone else connects, the dropped client is
/// probably gone for good. Holding its session for the full long grace wastes
/// the host's resources.
///
/// **BUG THIS CATCHES**: Would catch the short timer never being armed, or the
/// session being disposed immediately instead of after the short grace.
#[tokio::test]
async fn given_dropped_client_when_another_client_connects_then_short_grace_disposes() {
    // GIVEN: A dropped management session on a long grace
    let (handle, mut events) = start(test_config(30_000, 300)).await;
    let mut alpha = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(alpha.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(_alpha_connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };
    drop(alpha);
    assert!(wait_for_status(handle.registry(), "alpha", disconnected).await);

    // WHEN: Another client connects
    let mut beta = TestClient::connect(handle.local_addr(), "beta", false).await;
    assert_eq!(beta.handshake(MANAGEMENT, false, None).await["type"], "ok");

    // THEN: The short timer is armed and then disposes alpha
    assert!(
        wait_for_status(handle.registry(), "alpha", |status| status
            .is_some_and(|status| status.short_grace_scheduled))
        .await
            || management_status(handle.registry(), "alpha").await.is_none()
    );
    loop {
        match next_event(&mut events).await {
            HostEvent::ManagementDisconnected { token, reason } => {
                assert_eq!(token.as_str(), "alpha");
                assert_eq!(reason, DisposeReason::ShortGraceExpired);
                break;
            }
            HostEvent::ManagementConnected(connection) => {
                assert_eq!(connection.token.as_str(), "beta");
            }
            _ => {}
        }
    }

    // THEN: beta is unaffected
    let beta_status = management_status(handle.registry(), "beta").await;
    assert!(beta_status.is_some_and(|status| status.connected));

    handle.shutdown().await;
}

/// **VALUE**: Verifies a preempted client that comes back within the short
/// grace keeps its session.
///
/// **BUG THIS CATCHES**: Would catch the short timer not being cancelled by the
/// reconnection and disposing a healthy session afterwards.
#[tokio::test]
async fn given_preempted_client_when_it_reconnects_in_short_grace_then_session_survives() {
    // GIVEN: alpha dropped and preempted by beta
    let (handle, mut events) = start(test_config(30_000, 800)).await;
    let mut alpha = TestClient::connect(handle.local_addr(), "alpha", false).await;
    assert_eq!(alpha.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(_alpha_connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };
    let resumed = TestClient::connect(handle.local_addr(), "alpha", true).await;
    let mut resumed = resumed.resume_from(&alpha);
    drop(alpha);
    assert!(wait_for_status(handle.registry(), "alpha", disconnected).await);

    let mut beta = TestClient::connect(handle.local_addr(), "beta", false).await;
    assert_eq!(beta.handshake(MANAGEMENT, false, None).await["type"], "ok");
    assert!(
        wait_for_status(handle.registry(), "alpha", |status| status
            .is_some_and(|status| status.short_grace_scheduled))
        .await
    );

    // WHEN: alpha reconnects before the short grace runs out
    let reply = resumed.handshake(MANAGEMENT, true, None).await;
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");

    // THEN: Past the short grace, alpha is still connected
    sleep(Duration::from_millis(1_200)).await;
    let status = management_status(handle.registry(), "alpha").await;
    assert!(
        status.is_some_and(|status| status.connected
            && !status.grace_scheduled
            && !status.short_grace_scheduled),
        "alpha should be connected with no timers, got {status:?}"
    );

    handle.shutdown().await;
}

/// **VALUE**: Verifies a session blocked writing to a client that stopped
/// reading does not hold up other clients' handshakes.
///
/// **WHY THIS MATTERS**: Handshakes are dispatched one at a time. If that
/// serialization spans the wait for a busy session, one stuck peer freezes
/// every new connection on the host.
///
/// **BUG THIS CATCHES**: Would catch:
/// - The dispatch lock being held until the session adopts the reconnection
/// - A write to a silent peer blocking the session forever
#[tokio::test]
async fn given_session_blocked_on_silent_peer_when_it_reconnects_then_other_handshakes_proceed() {
    // GIVEN: A management client that stopped reading while the host sends
    // more than the socket buffers hold
    let mut config = test_config(10_000, 5_000);
    config.channel.write_stall_timeout_ms = 3_000;
    let (handle, mut events) = start(config).await;
    let mut stalled = TestClient::connect(handle.local_addr(), "stuck", false).await;
    assert_eq!(stalled.handshake(MANAGEMENT, false, None).await["type"], "ok");
    let HostEvent::ManagementConnected(connection) = next_event(&mut events).await else {
        panic!("expected ManagementConnected");
    };
    let chunk = vec![0x5a_u8; 512 * 1024];
    for _ in 0..64 {
        assert!(connection.sender.send(chunk.clone()));
    }
    sleep(Duration::from_millis(300)).await;

    // WHEN: The stuck token reconnects while its session is mid-write
    let resumed = TestClient::connect(handle.local_addr(), "stuck", true).await;
    let reconnecting = tokio::spawn(async move {
        let mut resumed = resumed;
        let reply = resumed.handshake(MANAGEMENT, true, None).await;
        (resumed, reply)
    });
    sleep(Duration::from_millis(100)).await;

    // THEN: Another client completes its handshake well inside the stall timeout
    let mut bystander = TestClient::connect(handle.local_addr(), "bystander", false).await;
    let reply = timeout(
        Duration::from_millis(1_500),
        bystander.handshake(MANAGEMENT, false, None),
    )
    .await
    .expect("bystander handshake waited on the blocked session");
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");

    // THEN: The stuck session gives up on the silent peer and adopts the new
    // transport, replaying everything
    let (mut resumed, reply) = reconnecting.await.expect("reconnect task");
    assert_eq!(reply["type"], "ok", "unexpected reply {reply}");
    for _ in 0..64 {
        assert_eq!(resumed.next_regular().await.len(), chunk.len());
    }
    assert!(
        wait_for_status(handle.registry(), "stuck", |status| status
            .is_some_and(|status| status.connected))
        .await
    );

    drop(stalled);
    handle.shutdown().await;
}
