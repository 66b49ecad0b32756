//! Extension runtime processes: launch, IPC hook, transport handoff.

pub mod client;
pub mod fd_passing;
pub mod ipc;
pub mod launch;
pub mod protocol;
pub mod supervisor;

pub use client::{AdoptedTransport, RuntimeClient, RuntimeEvent};
pub use protocol::{HostMessage, RuntimeMessage};
pub use supervisor::{RuntimeExit, RuntimeHandle};
