use crate::config::ExtensionRuntimeConfig;
use crate::handshake::messages::ExtensionRuntimeParams;
use crate::runtime::launch::{
    DEBUG_PORT_ENV, INSPECT_ENV, IPC_HOOK_ENV, LOG_LEVEL_ENV, RuntimeLaunch, TOKEN_ENV,
    WILL_SEND_SOCKET_ENV, inspect_flag, ipc_socket_path, negotiate_debug_port,
};
use crate::session::token::ClientToken;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

/// **VALUE**: Verifies the debugger flag for each port request.
///
/// **BUG THIS CATCHES**: Would catch `break` being ignored or port 0 producing
/// `--inspect=0`.
#[test]
fn given_debug_requests_when_building_inspect_flag_then_matches_mode() {
    let run = ExtensionRuntimeParams::default();
    let brk = ExtensionRuntimeParams {
        break_on_start: true,
        ..ExtensionRuntimeParams::default()
    };

    assert_eq!(inspect_flag(&run, None), None);
    assert_eq!(inspect_flag(&run, Some(0)).as_deref(), Some("--inspect-port=0"));
    assert_eq!(inspect_flag(&run, Some(9229)).as_deref(), Some("--inspect=9229"));
    assert_eq!(inspect_flag(&brk, Some(9229)).as_deref(), Some("--inspect-brk=9229"));
}

/// **VALUE**: Verifies the runtime gets the IPC hook, token and log level.
///
/// **WHY THIS MATTERS**: Without the hook path the runtime cannot report ready,
/// and the transport is never handed over.
///
/// **BUG THIS CATCHES**: Would catch `verbose` not forcing trace, or client
/// supplied env being dropped.
#[test]
fn given_launch_when_building_command_then_environment_is_complete() {
    // GIVEN: A verbose runtime config and client env
    let token = ClientToken::new("client-1");
    let config = ExtensionRuntimeConfig {
        program: "runtime-bin".to_string(),
        verbose: true,
        ..ExtensionRuntimeConfig::default()
    };
    let mut params = ExtensionRuntimeParams::default();
    params.env.insert("CLIENT_VAR".to_string(), "1".to_string());
    let launch = RuntimeLaunch {
        token: &token,
        config: &config,
        params: &params,
        ipc_path: Path::new("/tmp/hook.sock"),
        debug_port: Some(9229),
    };

    // WHEN: Building the command
    let command = launch.command();
    let std_command = command.as_std();
    let envs: HashMap<&OsStr, Option<&OsStr>> = std_command.get_envs().collect();
    let env = |key: &str| envs.get(OsStr::new(key)).copied().flatten();

    // THEN: Program and environment are set
    assert_eq!(std_command.get_program(), "runtime-bin");
    assert_eq!(env(IPC_HOOK_ENV), Some(OsStr::new("/tmp/hook.sock")));
    assert_eq!(env(TOKEN_ENV), Some(OsStr::new("client-1")));
    assert_eq!(env(LOG_LEVEL_ENV), Some(OsStr::new("trace")));
    assert_eq!(env(WILL_SEND_SOCKET_ENV), Some(OsStr::new("true")));
    assert_eq!(env(INSPECT_ENV), Some(OsStr::new("--inspect=9229")));
    assert_eq!(env(DEBUG_PORT_ENV), Some(OsStr::new("9229")));
    assert_eq!(env("CLIENT_VAR"), Some(OsStr::new("1")));
}

/// **VALUE**: Verifies each runtime gets its own hook path.
#[test]
fn given_two_calls_when_generating_ipc_paths_then_distinct() {
    let first = ipc_socket_path();
    let second = ipc_socket_path();

    assert_ne!(first, second);
    assert!(first.to_string_lossy().ends_with(".sock"));
}

/// **VALUE**: Verifies debug port negotiation.
///
/// **BUG THIS CATCHES**: Would catch a port being reported when none was asked
/// for, or `0` not being resolved to a real port.
#[tokio::test]
async fn given_port_requests_when_negotiating_then_none_stays_none_and_zero_resolves() {
    assert_eq!(negotiate_debug_port(None).await, None);

    let resolved = negotiate_debug_port(Some(0)).await.expect("some port");

    assert!(resolved > 0);
}

/// **VALUE**: Verifies a missing program is a spawn error, not a panic.
#[tokio::test]
async fn given_missing_program_when_spawning_then_spawn_error() {
    let token = ClientToken::new("client-1");
    let config = ExtensionRuntimeConfig {
        program: "/nonexistent/remote-host-runtime".to_string(),
        ..ExtensionRuntimeConfig::default()
    };
    let params = ExtensionRuntimeParams::default();
    let launch = RuntimeLaunch {
        token: &token,
        config: &config,
        params: &params,
        ipc_path: Path::new("/tmp/unused.sock"),
        debug_port: None,
    };

    let result = launch.spawn();

    assert!(matches!(
        result,
        Err(crate::error::runtime::RuntimeError::Spawn { .. })
    ));
}
