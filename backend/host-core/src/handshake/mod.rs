//! The `auth` / `sign` / `connectionType` exchange that decides what a
//! connection becomes.

pub mod driver;
pub mod machine;
pub mod messages;
pub mod verifier;

pub use driver::run_connection;
pub use machine::{ConnectionRequest, HandshakeMachine, HandshakeState, HandshakeStep};
pub use messages::{ConnectionKind, ControlMessage, ExtensionRuntimeParams};
pub use verifier::{HandshakeVerifier, TokenPossession};
