//! Security context provider capability.
//!
//! The handshake never computes NTLM tokens itself. It asks a
//! [`SecurityProvider`] for credentials and a client context, then feeds the
//! proxy's challenge to that context. Credentials and contexts are released
//! when dropped, so every exit path releases each handle exactly once.

pub mod ntlm;

use crate::error::BoxError;

pub use ntlm::NtlmProvider;

/// Source of NTLM credentials and client contexts.
pub trait SecurityProvider {
    /// Credential handle, released on drop.
    type Credential;
    /// One in-progress exchange, released on drop.
    type Context: SecurityContext;

    /// Acquire credentials for an explicit identity.
    fn acquire_credentials(
        &self,
        domain: &str,
        username: &str,
        password: &str,
    ) -> Result<Self::Credential, BoxError>;

    /// Acquire credentials for the ambient identity of the process.
    fn acquire_default_credentials(&self) -> Result<Self::Credential, BoxError>;

    /// Create a fresh client context and return it with the Negotiate token.
    fn new_client_context(
        &self,
        credential: &Self::Credential,
    ) -> Result<(Self::Context, Vec<u8>), BoxError>;
}

pub trait SecurityContext {
    /// Consume the proxy's Challenge token and produce the Authenticate token.
    ///
    /// Called once per context.
    fn update(&mut self, challenge: &[u8]) -> Result<Vec<u8>, BoxError>;
}
