use crate::session::token::ClientToken;

/// Decides whether a peer may dispatch after the `auth`/`sign` exchange.
pub trait HandshakeVerifier: Send + Sync {
    /// `challenge` is the `sign` data sent to the peer, if the peer asked for it.
    fn verify(
        &self,
        token: &ClientToken,
        challenge: Option<&str>,
        signed_data: Option<&str>,
    ) -> Result<(), String>;
}

/// Holding the reconnection token is enough.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenPossession;

impl HandshakeVerifier for TokenPossession {
    fn verify(
        &self,
        _token: &ClientToken,
        _challenge: Option<&str>,
        _signed_data: Option<&str>,
    ) -> Result<(), String> {
        Ok(())
    }
}
