use crate::error::session::SessionError;
use crate::runtime::supervisor::{RuntimeCommand, RuntimeHandle};
use crate::session::grace::GraceStatus;
use crate::session::management::{ManagementCommand, ManagementHandle};
use crate::session::registry::SessionRegistry;
use crate::session::token::ClientToken;

use tokio::sync::{mpsc, watch};

struct FakeManagement {
    handle: ManagementHandle,
    commands: mpsc::UnboundedReceiver<ManagementCommand>,
    _status: watch::Sender<GraceStatus>,
}

fn fake_management(registry: &SessionRegistry, status: GraceStatus) -> FakeManagement {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(status);
    FakeManagement {
        handle: ManagementHandle::new(registry.next_generation(), commands_tx, status_rx),
        commands,
        _status: status_tx,
    }
}

fn fake_runtime(
    registry: &SessionRegistry,
    pid: u32,
) -> (RuntimeHandle, mpsc::UnboundedReceiver<RuntimeCommand>) {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    (RuntimeHandle::new(registry.next_generation(), pid, commands_tx), commands)
}

fn waiting_on_grace() -> GraceStatus {
    GraceStatus {
        connected: false,
        grace_scheduled: true,
        short_grace_scheduled: false,
    }
}

/// **VALUE**: Verifies a second live management entry is refused.
///
/// **WHY THIS MATTERS**: One token owns at most one management channel.
///
/// **BUG THIS CATCHES**: Would catch the insert overwriting a running session.
#[tokio::test]
async fn given_live_management_when_inserting_another_then_already_running() {
    // GIVEN: A registered management session
    let registry = SessionRegistry::new();
    let token = ClientToken::new("a");
    let first = fake_management(&registry, GraceStatus::default());
    let second = fake_management(&registry, GraceStatus::default());
    registry
        .insert_management(token.clone(), first.handle.clone())
        .await
        .expect("first insert");

    // WHEN: Inserting a second one
    let result = registry.insert_management(token.clone(), second.handle.clone()).await;

    // THEN: It is refused with the wire reason
    let Err(error) = result else {
        panic!("second insert must fail");
    };
    assert!(matches!(error, SessionError::ManagementAlreadyRunning { .. }));
    assert_eq!(error.reason(), "Management connection is already running.");
    assert_eq!(
        registry.management(&token).await.map(|handle| handle.generation()),
        Some(first.handle.generation())
    );
}

/// **VALUE**: Verifies a dead entry does not block a new one.
///
/// **BUG THIS CATCHES**: Would catch a crashed session locking its token out forever.
#[tokio::test]
async fn given_dead_management_when_inserting_then_replaced() {
    let registry = SessionRegistry::new();
    let token = ClientToken::new("a");
    let dead = fake_management(&registry, GraceStatus::default());
    registry.insert_management(token.clone(), dead.handle.clone()).await.expect("insert");
    drop(dead.commands);

    let fresh = fake_management(&registry, GraceStatus::default());
    let result = registry.insert_management(token.clone(), fresh.handle.clone()).await;

    assert!(result.is_ok());
    assert!(registry.has_management(&token).await);
}

/// **VALUE**: Verifies removal only clears the generation it names.
///
/// **WHY THIS MATTERS**: An old session finishing its dispose after a new one
/// registered must not clear the new entry.
///
/// **BUG THIS CATCHES**: Would catch removal by token alone.
#[tokio::test]
async fn given_newer_generation_when_removing_old_then_entry_kept() {
    // GIVEN: A runtime entry
    let registry = SessionRegistry::new();
    let token = ClientToken::new("a");
    let (runtime, _commands) = fake_runtime(&registry, 42);
    registry
        .insert_extension_runtime(token.clone(), runtime.clone())
        .await
        .expect("insert");

    // WHEN: Removing with a stale generation, then the right one
    let stale = registry
        .remove_extension_runtime(&token, runtime.generation() + 100)
        .await;
    let current = registry.remove_extension_runtime(&token, runtime.generation()).await;

    // THEN: Only the matching removal took effect and the empty record is gone
    assert!(!stale);
    assert!(current);
    assert_eq!(registry.client_count().await, 0);
}

/// **VALUE**: Verifies the two roles of a token are independent.
#[tokio::test]
async fn given_management_and_runtime_when_one_removed_then_other_remains() {
    let registry = SessionRegistry::new();
    let token = ClientToken::new("a");
    let management = fake_management(&registry, GraceStatus::default());
    let (runtime, _commands) = fake_runtime(&registry, 7);
    registry.insert_management(token.clone(), management.handle.clone()).await.expect("management");
    registry.insert_extension_runtime(token.clone(), runtime).await.expect("runtime");

    registry.remove_management(&token, management.handle.generation()).await;

    assert!(!registry.has_management(&token).await);
    assert!(registry.has_extension_runtime(&token).await);
    assert_eq!(registry.client_count().await, 1);
}

/// **VALUE**: Verifies the reduce-grace broadcast shortens only other
/// sessions waiting on their long timer, and reaches every runtime.
///
/// **WHY THIS MATTERS**: A client reconnecting must not shorten its own
/// management window, and connected sessions have no timer to shorten. Its own
/// extension runtime still has to hear that a client connected.
///
/// **BUG THIS CATCHES**: Would catch the origin's management session being
/// preempted, or the origin's runtime being left out of the notice.
#[tokio::test]
async fn given_several_clients_when_publishing_reduce_grace_then_origin_management_skipped() {
    // GIVEN: Origin waiting with a runtime, one other waiting, one other connected with a runtime
    let registry = SessionRegistry::new();
    let origin = ClientToken::new("origin");
    let waiting = ClientToken::new("waiting");
    let connected = ClientToken::new("connected");
    let mut origin_management = fake_management(&registry, waiting_on_grace());
    let mut waiting_management = fake_management(&registry, waiting_on_grace());
    let mut connected_management = fake_management(
        &registry,
        GraceStatus {
            connected: true,
            ..GraceStatus::default()
        },
    );
    let (runtime, mut runtime_commands) = fake_runtime(&registry, 9);
    let (origin_runtime, mut origin_runtime_commands) = fake_runtime(&registry, 10);
    registry.insert_management(origin.clone(), origin_management.handle.clone()).await.expect("origin");
    registry.insert_management(waiting.clone(), waiting_management.handle.clone()).await.expect("waiting");
    registry
        .insert_management(connected.clone(), connected_management.handle.clone())
        .await
        .expect("connected");
    registry.insert_extension_runtime(connected.clone(), runtime).await.expect("runtime");
    registry
        .insert_extension_runtime(origin.clone(), origin_runtime)
        .await
        .expect("origin runtime");

    // WHEN: The origin dispatches
    let report = registry.publish_reduce_grace_time(&origin).await;

    // THEN: Only the other waiting session was shortened
    assert_eq!(report.management_shortened, 1);
    assert!(matches!(
        waiting_management.commands.try_recv(),
        Ok(ManagementCommand::ReduceGraceTime)
    ));
    assert!(origin_management.commands.try_recv().is_err());
    assert!(connected_management.commands.try_recv().is_err());

    // THEN: Both runtimes were told, the origin's included
    assert_eq!(report.runtimes_notified, 2);
    assert!(matches!(runtime_commands.try_recv(), Ok(RuntimeCommand::ReduceGraceTime)));
    assert!(matches!(
        origin_runtime_commands.try_recv(),
        Ok(RuntimeCommand::ReduceGraceTime)
    ));
}

/// **VALUE**: Verifies the snapshot lists clients in token order with their state.
#[tokio::test]
async fn given_clients_when_snapshotting_then_sorted_with_state() {
    let registry = SessionRegistry::new();
    let management = fake_management(&registry, waiting_on_grace());
    let (runtime, _commands) = fake_runtime(&registry, 1234);
    registry.insert_management(ClientToken::new("b"), management.handle.clone()).await.expect("b");
    registry.insert_extension_runtime(ClientToken::new("a"), runtime).await.expect("a");

    let snapshot = registry.snapshot().await;

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].token, ClientToken::new("a"));
    assert_eq!(snapshot[0].extension_runtime_pid, Some(1234));
    assert_eq!(snapshot[0].management, None);
    assert_eq!(snapshot[1].management, Some(waiting_on_grace()));
}

/// **VALUE**: Verifies shutdown reaches every session.
#[tokio::test]
async fn given_clients_when_disposing_all_then_each_gets_a_command() {
    let registry = SessionRegistry::new();
    let mut management = fake_management(&registry, GraceStatus::default());
    let (runtime, mut runtime_commands) = fake_runtime(&registry, 5);
    registry.insert_management(ClientToken::new("m"), management.handle.clone()).await.expect("m");
    registry.insert_extension_runtime(ClientToken::new("r"), runtime).await.expect("r");

    registry.dispose_all().await;

    assert!(matches!(management.commands.try_recv(), Ok(ManagementCommand::Dispose)));
    assert!(matches!(runtime_commands.try_recv(), Ok(RuntimeCommand::Terminate)));
}
