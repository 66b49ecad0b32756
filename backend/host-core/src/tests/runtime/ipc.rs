use crate::runtime::ipc::{HostIpc, RuntimeIpc};
use crate::runtime::protocol::{HostMessage, RuntimeMessage};

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream as StdUnixStream;

use serde_json::json;
use tempfile::TempDir;
use tokio::net::UnixListener;

async fn connected_pair(dir: &TempDir) -> (HostIpc, RuntimeIpc) {
    let path = dir.path().join("hook.sock");
    let listener = UnixListener::bind(&path).expect("bind");
    let runtime = RuntimeIpc::connect(&path).await.expect("connect");
    let (stream, _) = listener.accept().await.expect("accept");
    (HostIpc::new(stream), runtime)
}

/// **VALUE**: Verifies runtime messages reach the host as typed values.
#[tokio::test]
async fn given_runtime_messages_when_sent_then_host_decodes_them_in_order() {
    // GIVEN: A connected hook
    let dir = TempDir::new().expect("temp dir");
    let (mut host, mut runtime) = connected_pair(&dir).await;

    // WHEN: The runtime reports ready and logs
    runtime.send(&RuntimeMessage::Ready).await.expect("ready");
    runtime
        .send(&RuntimeMessage::Console {
            arguments: json!(["hello"]),
        })
        .await
        .expect("console");

    // THEN: The host reads both, then end of stream once the runtime leaves
    assert_eq!(host.recv().await.expect("recv"), Some(RuntimeMessage::Ready));
    assert_eq!(
        host.recv().await.expect("recv"),
        Some(RuntimeMessage::Console {
            arguments: json!(["hello"])
        })
    );
    drop(runtime);
    assert_eq!(host.recv().await.expect("eof"), None);
}

/// **VALUE**: Verifies the handoff message and its descriptor stay paired.
///
/// **WHY THIS MATTERS**: The runtime must adopt the descriptor that belongs to
/// the `socket` message, with the buffered bytes that came with it.
///
/// **BUG THIS CATCHES**: Would catch the descriptor being dropped when the
/// line is split across reads, or a notice being handed a descriptor.
#[tokio::test]
async fn given_socket_handoff_when_received_then_descriptor_is_attached() {
    // GIVEN: A connected hook and a socket pair to hand over
    let dir = TempDir::new().expect("temp dir");
    let (mut host, mut runtime) = connected_pair(&dir).await;
    let (passed, mut peer) = StdUnixStream::pair().expect("pair");
    let message = HostMessage::Socket {
        initial_data_chunk: b"first bytes".to_vec(),
        pending_frame_bytes: Vec::new(),
        skip_frames: true,
        compression_enabled: false,
        inflate_bytes: Vec::new(),
    };

    // WHEN: The host sends a notice and then the handoff
    host.send(&HostMessage::ReduceGraceTime).await.expect("notice");
    host.send_with_fd(&message, passed.as_fd()).await.expect("handoff");
    drop(passed);

    // THEN: The notice has no descriptor and the handoff has a working one
    let (notice, notice_fd) = runtime.recv().await.expect("recv").expect("notice");
    assert_eq!(notice, HostMessage::ReduceGraceTime);
    assert!(notice_fd.is_none());

    let (handoff, fd) = runtime.recv().await.expect("recv").expect("handoff");
    assert_eq!(handoff, message);
    let mut adopted = StdUnixStream::from(fd.expect("descriptor"));
    adopted.write_all(b"ok").expect("write");
    let mut buffer = [0u8; 2];
    peer.read_exact(&mut buffer).expect("read");
    assert_eq!(&buffer, b"ok");
}
