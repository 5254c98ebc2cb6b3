//! End-to-end handshake scenarios against a scripted in-memory proxy.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::StatusCode;
use ntlm_connect_core::auth::ntlm::{NEGOTIATE_NTLM, NEGOTIATE_UNICODE};
use ntlm_connect_core::auth::{NtlmProvider, SecurityContext, SecurityProvider};
use ntlm_connect_core::error::BoxError;
use ntlm_connect_core::proxy::http::{BodyReader, ConnectRequest};
use ntlm_connect_core::{authenticate, authenticate_request, HandshakeState, ProxyConfig, TunnelError};
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const TARGET: &str = "example.com:443";
const NEGOTIATE: &[u8] = b"negotiate-token";
const CHALLENGE: &[u8] = b"\x00\x01server-challenge\xff";
const AUTHENTICATE: &[u8] = b"authenticate-token";

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    explicit: AtomicUsize,
    default: AtomicUsize,
    credentials_released: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_released: AtomicUsize,
    updates: AtomicUsize,
    identity: Mutex<Option<(String, String, String)>>,
    challenge: Mutex<Option<Vec<u8>>>,
}

impl Counters {
    fn acquired(&self) -> usize {
        self.explicit.load(Ordering::SeqCst) + self.default.load(Ordering::SeqCst)
    }

    fn assert_balanced(&self) {
        assert_eq!(self.acquired(), self.credentials_released.load(Ordering::SeqCst));
        assert_eq!(
            self.contexts_created.load(Ordering::SeqCst),
            self.contexts_released.load(Ordering::SeqCst)
        );
    }
}

#[derive(Default)]
struct MockProvider {
    counters: Arc<Counters>,
    fail_credentials: bool,
    fail_context: bool,
    fail_update: bool,
}

struct MockCredential(Arc<Counters>);

impl Drop for MockCredential {
    fn drop(&mut self) {
        self.0.credentials_released.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockContext {
    counters: Arc<Counters>,
    fail_update: bool,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        // The credential must still be alive when its context goes away.
        assert!(
            self.counters.credentials_released.load(Ordering::SeqCst) < self.counters.acquired(),
            "credential released before its context"
        );
        self.counters.contexts_released.fetch_add(1, Ordering::SeqCst);
    }
}

impl SecurityProvider for MockProvider {
    type Credential = MockCredential;
    type Context = MockContext;

    fn acquire_credentials(&self, domain: &str, username: &str, password: &str) -> Result<MockCredential, BoxError> {
        if self.fail_credentials {
            return Err("logon failure".into());
        }
        self.counters.explicit.fetch_add(1, Ordering::SeqCst);
        *self.counters.identity.lock().unwrap() =
            Some((domain.to_string(), username.to_string(), password.to_string()));
        Ok(MockCredential(Arc::clone(&self.counters)))
    }

    fn acquire_default_credentials(&self) -> Result<MockCredential, BoxError> {
        if self.fail_credentials {
            return Err("no default identity".into());
        }
        self.counters.default.fetch_add(1, Ordering::SeqCst);
        Ok(MockCredential(Arc::clone(&self.counters)))
    }

    fn new_client_context(&self, credential: &MockCredential) -> Result<(MockContext, Vec<u8>), BoxError> {
        if self.fail_context {
            return Err("context refused".into());
        }
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        let context = MockContext {
            counters: Arc::clone(&credential.0),
            fail_update: self.fail_update,
        };
        Ok((context, NEGOTIATE.to_vec()))
    }
}

impl SecurityContext for MockContext {
    fn update(&mut self, challenge: &[u8]) -> Result<Vec<u8>, BoxError> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        *self.counters.challenge.lock().unwrap() = Some(challenge.to_vec());
        if self.fail_update {
            return Err("bad challenge".into());
        }
        Ok(AUTHENTICATE.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Mock proxy
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Recorded {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

async fn read_request(stream: &mut DuplexStream) -> Option<Recorded> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }

    let mut header_buf = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut header_buf);
    req.parse(&head).unwrap();
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let len = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    Some(Recorded {
        method: req.method.unwrap().to_string(),
        path: req.path.unwrap().to_string(),
        headers,
        body,
    })
}

/// Answer each request with the next scripted response, then record
/// anything else the client sends until it hangs up.
fn spawn_proxy(responses: Vec<Vec<u8>>) -> (DuplexStream, JoinHandle<Vec<Recorded>>) {
    let (client, mut server) = duplex(64 * 1024);
    let handle = tokio::spawn(async move {
        let mut recorded = Vec::new();
        let mut script = responses.into_iter();
        while let Some(request) = read_request(&mut server).await {
            recorded.push(request);
            match script.next() {
                Some(response) => server.write_all(&response).await.unwrap(),
                None => break,
            }
        }
        recorded
    });
    (client, handle)
}

fn challenge_response(values: &[&str]) -> Vec<u8> {
    let mut out = b"HTTP/1.1 407 Proxy Authentication Required\r\n".to_vec();
    for v in values {
        out.extend_from_slice(format!("Proxy-Authenticate: {}\r\n", v).as_bytes());
    }
    out.extend_from_slice(b"Content-Length: 0\r\n\r\n");
    out
}

fn ntlm_challenge() -> String {
    format!("NTLM {}", STANDARD.encode(CHALLENGE))
}

/// Non-2xx answers to CONNECT carry a body, so frame it explicitly.
fn status_response(line: &str) -> Vec<u8> {
    format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", line).into_bytes()
}

/// Response with a filler body of `len` bytes framed by Content-Length.
fn status_response_with_body(line: &str, len: usize) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n", line, len).into_bytes();
    out.extend(std::iter::repeat(b'x').take(len));
    out
}

fn explicit_config() -> ProxyConfig {
    let mut config = ProxyConfig::default().with_credentials("CORP", "alice", "s3cret");
    config.add_header("X-Custom", "kept").unwrap();
    config
}

fn dial(stream: DuplexStream) -> impl FnOnce() -> std::future::Ready<io::Result<DuplexStream>> {
    move || std::future::ready(Ok(stream))
}

// ---------------------------------------------------------------------------
// Success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_successful_handshake() {
    let mut established = status_response("200 Connection Established");
    established.extend_from_slice(b"TUNNEL");
    let (client, proxy) = spawn_proxy(vec![challenge_response(&[&ntlm_challenge()]), established]);
    let provider = MockProvider::default();

    let mut stream = authenticate(&provider, &explicit_config(), TARGET, dial(client))
        .await
        .unwrap();

    let mut first = [0u8; 6];
    stream.read_exact(&mut first).await.unwrap();
    assert_eq!(&first, b"TUNNEL");
    drop(stream);

    let requests = proxy.await.unwrap();
    assert_eq!(requests.len(), 2);

    let leg1 = format!("NTLM {}", STANDARD.encode(NEGOTIATE));
    let leg2 = format!("NTLM {}", STANDARD.encode(AUTHENTICATE));
    for (req, auth) in requests.iter().zip([leg1, leg2]) {
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.path, TARGET);
        assert_eq!(req.header("Host"), vec![TARGET]);
        assert_eq!(req.header("Proxy-Authorization"), vec![auth.as_str()]);
        assert_eq!(req.header("Proxy-Connection"), vec!["Keep-Alive"]);
        assert_eq!(req.header("X-Custom"), vec!["kept"]);
        assert!(req.body.is_empty());
    }

    let counters = &provider.counters;
    assert_eq!(counters.explicit.load(Ordering::SeqCst), 1);
    assert_eq!(counters.default.load(Ordering::SeqCst), 0);
    assert_eq!(
        counters.identity.lock().unwrap().clone(),
        Some(("CORP".to_string(), "alice".to_string(), "s3cret".to_string()))
    );
    assert_eq!(counters.challenge.lock().unwrap().as_deref(), Some(CHALLENGE));
    assert_eq!(counters.updates.load(Ordering::SeqCst), 1);
    counters.assert_balanced();
}

#[tokio::test]
async fn test_default_credentials_when_any_field_empty() {
    for (domain, user, pass) in [("", "alice", "pw"), ("CORP", "", "pw"), ("CORP", "alice", ""), ("", "", "")] {
        let (client, proxy) = spawn_proxy(vec![
            challenge_response(&[&ntlm_challenge()]),
            status_response("200 OK"),
        ]);
        let provider = MockProvider::default();
        let config = ProxyConfig::default().with_credentials(domain, user, pass);

        let stream = authenticate(&provider, &config, TARGET, dial(client)).await.unwrap();
        drop(stream);
        proxy.await.unwrap();

        assert_eq!(provider.counters.explicit.load(Ordering::SeqCst), 0);
        assert_eq!(provider.counters.default.load(Ordering::SeqCst), 1);
        provider.counters.assert_balanced();
    }
}

#[tokio::test]
async fn test_request_headers_win_over_config_defaults() {
    let (client, proxy) = spawn_proxy(vec![
        challenge_response(&[&ntlm_challenge()]),
        status_response("200 OK"),
    ]);
    let provider = MockProvider::default();
    let mut request = ConnectRequest::new(TARGET);
    request.set_header(
        http::HeaderName::from_static("x-custom"),
        http::HeaderValue::from_static("mine"),
    );
    request.set_header(
        http::header::PROXY_AUTHORIZATION,
        http::HeaderValue::from_static("Basic stale"),
    );

    let stream = authenticate_request(&provider, &explicit_config(), request, dial(client))
        .await
        .unwrap();
    drop(stream);

    let requests = proxy.await.unwrap();
    assert_eq!(requests[0].header("X-Custom"), vec!["mine"]);
    assert_eq!(requests[0].header("Proxy-Authorization").len(), 1);
    assert!(requests[0].header("Proxy-Authorization")[0].starts_with("NTLM "));
}

#[tokio::test]
async fn test_configured_framing_headers_never_reach_the_wire() {
    let mut config = explicit_config();
    config.add_header("Content-Length", "5").unwrap();
    config.add_header("Transfer-Encoding", "chunked").unwrap();

    let (client, proxy) = spawn_proxy(vec![
        challenge_response(&[&ntlm_challenge()]),
        status_response("200 Connection Established"),
    ]);
    let provider = MockProvider::default();
    let stream = authenticate(&provider, &config, TARGET, dial(client)).await.unwrap();
    drop(stream);

    let requests = proxy.await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert!(request.header("content-length").is_empty());
        assert!(request.header("transfer-encoding").is_empty());
        assert!(request.body.is_empty());
        assert_eq!(request.header("x-custom"), vec!["kept"]);
    }
}

#[tokio::test]
async fn test_407_body_is_drained() {
    let chunked = format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: {}\r\n\
Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        ntlm_challenge()
    );
    let sized = format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: {}\r\n\
Content-Length: 11\r\n\r\naccess deny",
        ntlm_challenge()
    );
    for leg1 in [chunked, sized] {
        let (client, proxy) = spawn_proxy(vec![leg1.into_bytes(), status_response("200 OK")]);
        let provider = MockProvider::default();
        let stream = authenticate(&provider, &explicit_config(), TARGET, dial(client))
            .await
            .unwrap();
        drop(stream);
        assert_eq!(proxy.await.unwrap().len(), 2);
    }
}

// ---------------------------------------------------------------------------
// Protocol violations
// ---------------------------------------------------------------------------

async fn run_failing(responses: Vec<Vec<u8>>, provider: &MockProvider) -> (TunnelError, HandshakeState, Vec<Recorded>) {
    let (client, proxy) = spawn_proxy(responses);
    let failure = authenticate(provider, &explicit_config(), TARGET, dial(client))
        .await
        .unwrap_err();
    let state = failure.state();
    let (stream, error) = failure.into_parts();
    assert!(stream.is_some(), "connection must be handed back");
    drop(stream);
    let requests = proxy.await.unwrap();
    provider.counters.assert_balanced();
    (error, state, requests)
}

#[tokio::test]
async fn test_leg1_not_407_is_unexpected_status() {
    let provider = MockProvider::default();
    let (error, state, requests) = run_failing(vec![status_response("200 Connection Established")], &provider).await;

    assert!(matches!(error, TunnelError::UnexpectedStatus(StatusCode::OK)));
    assert_eq!(error.to_string(), "Unexpected HTTP status code");
    assert_eq!(state, HandshakeState::NegotiateSent);
    assert_eq!(requests.len(), 1);
    assert_eq!(provider.counters.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_leg1_large_error_page_is_unexpected_status() {
    let provider = MockProvider::default();
    let (error, state, requests) =
        run_failing(vec![status_response_with_body("502 Bad Gateway", 2_000_000)], &provider).await;

    assert!(matches!(error, TunnelError::UnexpectedStatus(StatusCode::BAD_GATEWAY)));
    assert_eq!(error.to_string(), "Unexpected HTTP status code");
    assert_eq!(state, HandshakeState::NegotiateSent);
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn test_missing_challenge_header() {
    let provider = MockProvider::default();
    let (error, _, requests) = run_failing(vec![challenge_response(&[])], &provider).await;
    assert!(matches!(error, TunnelError::MissingChallenge));
    assert_eq!(error.to_string(), "did not receive a challenge from the server");
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn test_two_challenge_headers() {
    let provider = MockProvider::default();
    let challenge = ntlm_challenge();
    let (error, _, requests) = run_failing(vec![challenge_response(&[&challenge, &challenge])], &provider).await;
    assert!(matches!(error, TunnelError::MalformedChallenge));
    assert_eq!(error.to_string(), "received malformed challenge from the server");
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn test_non_ntlm_challenge() {
    for value in ["Basic realm=\"corp\"", "NTLM", "Negotiate YIIB"] {
        let provider = MockProvider::default();
        let (error, _, requests) = run_failing(vec![challenge_response(&[value])], &provider).await;
        assert!(matches!(error, TunnelError::MalformedChallenge), "{value}");
        assert_eq!(requests.len(), 1);
    }
}

#[tokio::test]
async fn test_undecodable_challenge() {
    let provider = MockProvider::default();
    let (error, _, requests) = run_failing(vec![challenge_response(&["NTLM @@@@"])], &provider).await;
    assert!(matches!(error, TunnelError::ChallengeDecode(_)));
    assert_eq!(requests.len(), 1);
    assert_eq!(provider.counters.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_final_status_reason_phrase() {
    for (line, code, reason) in [
        ("403 Forbidden", 403, "Forbidden"),
        ("407 Proxy Authentication Required", 407, "Proxy Authentication Required"),
        ("599 Whatever", 599, ""),
    ] {
        let provider = MockProvider::default();
        let (error, state, requests) = run_failing(
            vec![challenge_response(&[&ntlm_challenge()]), status_response(line)],
            &provider,
        )
        .await;
        assert!(matches!(error, TunnelError::Rejected(_)));
        assert_eq!(error.status().map(|s| s.as_u16()), Some(code));
        assert_eq!(error.to_string(), reason);
        assert_eq!(state, HandshakeState::AuthenticateSent);
        assert_eq!(requests.len(), 2);
    }
}

#[tokio::test]
async fn test_final_rejection_with_large_error_page() {
    let provider = MockProvider::default();
    let (error, state, requests) = run_failing(
        vec![
            challenge_response(&[&ntlm_challenge()]),
            status_response_with_body("403 Forbidden", 2_000_000),
        ],
        &provider,
    )
    .await;

    assert!(matches!(error, TunnelError::Rejected(StatusCode::FORBIDDEN)));
    assert_eq!(error.to_string(), "Forbidden");
    assert_eq!(state, HandshakeState::AuthenticateSent);
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn test_proxy_hangs_up() {
    let provider = MockProvider::default();
    let (error, state, requests) = run_failing(vec![], &provider).await;
    match error {
        TunnelError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
        other => panic!("expected io error, got {other:?}"),
    }
    assert_eq!(state, HandshakeState::NegotiateSent);
    assert_eq!(requests.len(), 1);
}

// ---------------------------------------------------------------------------
// Provider failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_credential_failure() {
    let provider = MockProvider { fail_credentials: true, ..Default::default() };
    let (error, state, requests) = run_failing(vec![], &provider).await;
    assert!(matches!(error, TunnelError::Credentials(_)));
    assert!(error.to_string().contains("logon failure"));
    assert_eq!(state, HandshakeState::Dialing);
    assert!(requests.is_empty());
    assert_eq!(provider.counters.acquired(), 0);
}

#[tokio::test]
async fn test_context_failure_releases_credential() {
    let provider = MockProvider { fail_context: true, ..Default::default() };
    let (error, state, requests) = run_failing(vec![], &provider).await;
    assert!(matches!(error, TunnelError::Context(_)));
    assert_eq!(state, HandshakeState::CredentialsAcquired);
    assert!(requests.is_empty());
    assert_eq!(provider.counters.credentials_released.load(Ordering::SeqCst), 1);
    assert_eq!(provider.counters.contexts_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_update_failure_releases_both() {
    let provider = MockProvider { fail_update: true, ..Default::default() };
    let (error, state, requests) =
        run_failing(vec![challenge_response(&[&ntlm_challenge()])], &provider).await;
    assert!(matches!(error, TunnelError::Token(_)));
    assert_eq!(state, HandshakeState::ChallengeReceived);
    assert_eq!(requests.len(), 1);
    assert_eq!(provider.counters.contexts_released.load(Ordering::SeqCst), 1);
    assert_eq!(provider.counters.credentials_released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dial_failure_is_surfaced_unchanged() {
    let provider = MockProvider::default();
    let failure = authenticate(&provider, &explicit_config(), TARGET, || async {
        Err::<DuplexStream, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    })
    .await
    .unwrap_err();

    assert!(failure.stream().is_none());
    assert_eq!(failure.state(), HandshakeState::Dialing);
    match failure.error() {
        TunnelError::Io(e) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
            assert_eq!(e.to_string(), "refused");
        }
        other => panic!("expected io error, got {other:?}"),
    }
    assert_eq!(provider.counters.acquired(), 0);
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replayable_body_sent_on_both_legs() {
    let (client, proxy) = spawn_proxy(vec![
        challenge_response(&[&ntlm_challenge()]),
        status_response("200 OK"),
    ]);
    let provider = MockProvider::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let request = ConnectRequest::new(TARGET)
        .with_body_source(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(b"payload".to_vec())) as BodyReader)
        }))
        .unwrap();

    let stream = authenticate_request(&provider, &explicit_config(), request, dial(client))
        .await
        .unwrap();
    drop(stream);

    let requests = proxy.await.unwrap();
    assert_eq!(requests.len(), 2);
    for req in &requests {
        assert_eq!(req.body, b"payload");
        assert_eq!(req.header("Content-Length"), vec!["7"]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_single_read_body_fails_before_leg2() {
    let (client, proxy) = spawn_proxy(vec![challenge_response(&[&ntlm_challenge()])]);
    let provider = MockProvider::default();
    let body: BodyReader = Box::new(Cursor::new(b"payload".to_vec()));
    let request = ConnectRequest::new(TARGET).with_body(body);

    let failure = authenticate_request(&provider, &explicit_config(), request, dial(client))
        .await
        .unwrap_err();
    assert!(matches!(failure.error(), TunnelError::BodyNotReplayable));
    assert_eq!(failure.state(), HandshakeState::ChallengeReceived);
    drop(failure);

    let requests = proxy.await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, b"payload");
    provider.counters.assert_balanced();
}

// ---------------------------------------------------------------------------
// Built-in NTLM provider
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_builtin_provider_produces_authenticate_message() {
    let mut challenge = Vec::new();
    challenge.extend_from_slice(b"NTLMSSP\0");
    challenge.extend_from_slice(&2u32.to_le_bytes());
    challenge.extend_from_slice(&[0, 0, 0, 0, 32, 0, 0, 0]); // empty target name
    challenge.extend_from_slice(&(NEGOTIATE_UNICODE | NEGOTIATE_NTLM).to_le_bytes());
    challenge.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

    let (client, proxy) = spawn_proxy(vec![
        challenge_response(&[&format!("NTLM {}", STANDARD.encode(&challenge))]),
        status_response("200 OK"),
    ]);
    let provider = NtlmProvider::new().with_workstation("TESTBOX");

    let stream = authenticate(&provider, &explicit_config(), TARGET, dial(client))
        .await
        .unwrap();
    drop(stream);

    let requests = proxy.await.unwrap();
    let decode = |req: &Recorded| {
        let value = req.header("Proxy-Authorization")[0];
        STANDARD.decode(value.strip_prefix("NTLM ").unwrap()).unwrap()
    };

    let type1 = decode(&requests[0]);
    assert_eq!(&type1[..8], b"NTLMSSP\0");
    assert_eq!(u32::from_le_bytes(type1[8..12].try_into().unwrap()), 1);

    let type3 = decode(&requests[1]);
    assert_eq!(&type3[..8], b"NTLMSSP\0");
    assert_eq!(u32::from_le_bytes(type3[8..12].try_into().unwrap()), 3);
    let alice: Vec<u8> = "alice".encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    assert!(type3.windows(alice.len()).any(|w| w == alice.as_slice()));
}
