/// Tunnel reachability checker.

use crate::auth::SecurityProvider;
use crate::config::ProxyConfig;
use crate::proxy::dial_proxy;
use crate::proxy::ntlm::{authenticate, HandshakeState};
use std::time::{Duration, Instant};
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TunnelCheckResult {
    pub proxy: String,
    pub target: String,
    pub authenticated: bool,
    /// Last handshake state reached.
    pub state: HandshakeState,
    pub status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Single tunnel check
// ---------------------------------------------------------------------------

/// Open one authenticated tunnel to `target` through the configured proxy,
/// then drop it. The whole attempt is bounded by the proxy timeout.
pub async fn check_tunnel<P>(provider: &P, config: &ProxyConfig, target: &str) -> TunnelCheckResult
where
    P: SecurityProvider,
{
    let limit = Duration::from_secs(config.proxy.timeout_secs);
    let start = Instant::now();

    let mut result = TunnelCheckResult {
        proxy: config.proxy.address(),
        target: target.to_string(),
        authenticated: false,
        state: HandshakeState::Dialing,
        status: None,
        latency_ms: None,
        error: None,
    };

    let attempt = authenticate(provider, config, target, || dial_proxy(&config.proxy));
    match timeout(limit, attempt).await {
        Err(_) => {
            result.error = Some("Handshake timed out".into());
        }
        Ok(Ok(_stream)) => {
            result.authenticated = true;
            result.state = HandshakeState::Authenticated;
            result.status = Some(200);
            result.latency_ms = Some(start.elapsed().as_millis() as u64);
        }
        Ok(Err(failure)) => {
            result.state = failure.state();
            result.status = failure.error().status().map(|s| s.as_u16());
            if failure.stream().is_some() {
                result.latency_ms = Some(start.elapsed().as_millis() as u64);
            }
            result.error = Some(failure.error().to_string());
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
