pub mod auth;
pub mod checker;
pub mod config;
pub mod error;
pub mod logger;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::{HandshakeFailure, TunnelError};
pub use proxy::ntlm::{authenticate, authenticate_request, HandshakeState};
