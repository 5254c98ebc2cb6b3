//! NTLM-over-CONNECT handshake.
//!
//! Two CONNECT requests are sent on one connection: the first carries the
//! Negotiate token and must be answered with `407` and a single
//! `Proxy-Authenticate: NTLM <challenge>` header, the second carries the
//! Authenticate token and must be answered with `200`. Nothing is retried.

use crate::auth::{SecurityContext, SecurityProvider};
use crate::config::ProxyConfig;
use crate::error::{HandshakeFailure, TunnelError};
use crate::proxy::http::{read_response, write_request, ConnectRequest};
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use http::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::fmt;
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

pub const SCHEME_PREFIX: &str = "NTLM ";

/// Standard alphabet that tolerates non-zero trailing bits in challenges.
const CHALLENGE_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Progress of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Dialing,
    CredentialsAcquired,
    NegotiateSent,
    ChallengeReceived,
    AuthenticateSent,
    Authenticated,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Dialing => "dialing",
            HandshakeState::CredentialsAcquired => "credentials acquired",
            HandshakeState::NegotiateSent => "negotiate sent",
            HandshakeState::ChallengeReceived => "challenge received",
            HandshakeState::AuthenticateSent => "authenticate sent",
            HandshakeState::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

/// Open an NTLM-authenticated CONNECT tunnel to `target`.
///
/// `dial` supplies the raw proxy connection. On success the connection is
/// returned positioned at the first tunnel byte. On failure it is handed
/// back inside the [`HandshakeFailure`] unless dialing itself failed.
pub async fn authenticate<P, F, Fut, S>(
    provider: &P,
    config: &ProxyConfig,
    target: &str,
    dial: F,
) -> Result<S, HandshakeFailure<S>>
where
    P: SecurityProvider,
    F: FnOnce() -> Fut,
    Fut: Future<Output = io::Result<S>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    authenticate_request(provider, config, ConnectRequest::new(target), dial).await
}

/// Like [`authenticate`] but sends a caller-built request, which may carry
/// its own headers and a body. The body must be replayable if present.
pub async fn authenticate_request<P, F, Fut, S>(
    provider: &P,
    config: &ProxyConfig,
    mut request: ConnectRequest,
    dial: F,
) -> Result<S, HandshakeFailure<S>>
where
    P: SecurityProvider,
    F: FnOnce() -> Fut,
    Fut: Future<Output = io::Result<S>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = match dial().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target_addr = request.target(), "ntlm> dial failed: {}", e);
            return Err(HandshakeFailure::new(None, HandshakeState::Dialing, e.into()));
        }
    };

    let mut state = HandshakeState::Dialing;
    match handshake(provider, config, &mut request, &mut stream, &mut state).await {
        Ok(()) => Ok(stream),
        Err(e) => {
            debug!(target_addr = request.target(), %state, "ntlm> handshake failed: {}", e);
            Err(HandshakeFailure::new(Some(stream), state, e))
        }
    }
}

async fn handshake<P, S>(
    provider: &P,
    config: &ProxyConfig,
    request: &mut ConnectRequest,
    stream: &mut S,
    state: &mut HandshakeState,
) -> Result<(), TunnelError>
where
    P: SecurityProvider,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let credential = if config.has_explicit_credentials() {
        debug!("ntlm> acquiring credentials for {}\\{}", config.domain, config.username);
        provider.acquire_credentials(&config.domain, &config.username, &config.password)
    } else {
        debug!("ntlm> acquiring default credentials");
        provider.acquire_default_credentials()
    }
    .map_err(TunnelError::Credentials)?;
    *state = HandshakeState::CredentialsAcquired;

    // Declared after `credential` so it is released first.
    let (mut context, negotiate) = provider
        .new_client_context(&credential)
        .map_err(TunnelError::Context)?;

    request.merge_headers(&config.headers);
    request.set_header(PROXY_AUTHORIZATION, authorization(&negotiate)?);
    request.set_header(
        HeaderName::from_static("proxy-connection"),
        HeaderValue::from_static("Keep-Alive"),
    );

    debug!(len = negotiate.len(), "ntlm> sending negotiate to {}", request.target());
    write_request(stream, request).await?;
    *state = HandshakeState::NegotiateSent;

    let response = read_response(stream, request).await?;
    if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        warn!(
            status = response.status().as_u16(),
            body_len = response.body_len(),
            "ntlm> expected 407 after negotiate"
        );
        return Err(TunnelError::UnexpectedStatus(response.status()));
    }

    let challenge = extract_challenge(response.headers())?;
    *state = HandshakeState::ChallengeReceived;
    debug!(len = challenge.len(), "ntlm> received challenge");

    let authenticate = context.update(&challenge).map_err(TunnelError::Token)?;

    request.rewind_body()?;
    request.set_header(PROXY_AUTHORIZATION, authorization(&authenticate)?);

    debug!(len = authenticate.len(), "ntlm> sending authenticate");
    write_request(stream, request).await?;
    *state = HandshakeState::AuthenticateSent;

    let response = read_response(stream, request).await?;
    if response.status() != StatusCode::OK {
        debug!(
            status = response.status().as_u16(),
            body_len = response.body_len(),
            "ntlm> proxy rejected authenticate"
        );
        return Err(TunnelError::Rejected(response.status()));
    }

    *state = HandshakeState::Authenticated;
    debug!("ntlm> tunnel to {} established", request.target());
    Ok(())
}

fn authorization(token: &[u8]) -> Result<HeaderValue, TunnelError> {
    let value = format!("{}{}", SCHEME_PREFIX, STANDARD.encode(token));
    Ok(HeaderValue::from_str(&value)?)
}

/// Pull the raw challenge out of the single `Proxy-Authenticate` header.
fn extract_challenge(headers: &HeaderMap) -> Result<Vec<u8>, TunnelError> {
    let mut values = headers.get_all(PROXY_AUTHENTICATE).iter();
    let Some(value) = values.next() else {
        warn!("ntlm> no Proxy-Authenticate header in 407 response");
        return Err(TunnelError::MissingChallenge);
    };
    if values.next().is_some() {
        warn!("ntlm> more than one Proxy-Authenticate header");
        return Err(TunnelError::MalformedChallenge);
    }

    let value = value.to_str().map_err(|_| TunnelError::MalformedChallenge)?;
    if value.len() < SCHEME_PREFIX.len() + 1 || !value.starts_with(SCHEME_PREFIX) {
        warn!("ntlm> Proxy-Authenticate is not an NTLM challenge");
        return Err(TunnelError::MalformedChallenge);
    }

    CHALLENGE_ENGINE.decode(&value[SCHEME_PREFIX.len()..]).map_err(|e| {
        debug!("ntlm> could not decode challenge");
        TunnelError::ChallengeDecode(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(PROXY_AUTHENTICATE, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn test_extract_challenge_ok() {
        let got = extract_challenge(&headers(&["NTLM AQID"])).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn test_extract_challenge_missing() {
        assert!(matches!(
            extract_challenge(&HeaderMap::new()),
            Err(TunnelError::MissingChallenge)
        ));
    }

    #[test]
    fn test_extract_challenge_duplicate() {
        assert!(matches!(
            extract_challenge(&headers(&["NTLM AQID", "NTLM AQID"])),
            Err(TunnelError::MalformedChallenge)
        ));
    }

    #[test]
    fn test_extract_challenge_bad_prefix_or_length() {
        for v in ["Basic realm=x", "NTLM ", "NTLM", "ntlm AQID", "Negotiate AQID"] {
            assert!(
                matches!(extract_challenge(&headers(&[v])), Err(TunnelError::MalformedChallenge)),
                "{v:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_extract_challenge_bad_base64() {
        assert!(matches!(
            extract_challenge(&headers(&["NTLM !!!not-base64"])),
            Err(TunnelError::ChallengeDecode(_))
        ));
    }

    #[test]
    fn test_extract_challenge_allows_trailing_bits() {
        assert!(STANDARD.decode("AQJ=").is_err());
        let got = extract_challenge(&headers(&["NTLM AQJ="])).unwrap();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn test_authorization_value() {
        assert_eq!(authorization(&[1, 2, 3]).unwrap(), "NTLM AQID");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(HandshakeState::ChallengeReceived.to_string(), "challenge received");
        assert_eq!(HandshakeState::Dialing.to_string(), "dialing");
    }
}
