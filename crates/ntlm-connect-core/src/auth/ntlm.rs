//! Pure-Rust NTLM security provider.
//!
//! Implements the three-message NTLM handshake used by HTTP/HTTPS proxies:
//!   Type 1 – Negotiate
//!   Type 2 – Challenge  (proxy → client)
//!   Type 3 – Authenticate
//!
//! The Authenticate message carries an NTLMv2 response (HMAC-MD5 over the
//! server challenge and a client blob) and the matching LMv2 response.

use crate::auth::{SecurityContext, SecurityProvider};
use crate::error::BoxError;
use chrono::Utc;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use std::fmt;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// NTLM flag bits (subset)
// ---------------------------------------------------------------------------
pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
pub const REQUEST_TARGET: u32 = 0x0000_0004;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
pub const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
pub const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
pub const NEGOTIATE_128: u32 = 0x2000_0000;
pub const NEGOTIATE_56: u32 = 0x8000_0000;

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const CHALLENGE_MIN_LEN: usize = 32;
const CHALLENGE_TARGET_INFO_END: usize = 48;
const AUTHENTICATE_HEADER_LEN: usize = 64;

const MSV_AV_EOL: u16 = 0x0000;
const MSV_AV_TIMESTAMP: u16 = 0x0007;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

pub const DEFAULT_WORKSTATION: &str = "WORKSTATION";

pub const ENV_DOMAIN: &str = "NTLM_DOMAIN";
pub const ENV_USERNAME: &str = "NTLM_USERNAME";
pub const ENV_PASSWORD: &str = "NTLM_PASSWORD";

#[derive(Debug, Error)]
pub enum NtlmError {
    #[error("NTLM challenge too short: {0} bytes")]
    ChallengeTooShort(usize),

    #[error("invalid NTLM signature")]
    InvalidSignature,

    #[error("expected NTLM type 2, got {0}")]
    UnexpectedMessageType(u32),

    #[error("NTLM security buffer at offset {0} lies outside the message")]
    BufferOutOfRange(usize),

    #[error("no default NTLM credentials: {0} is not set")]
    MissingDefaultCredential(&'static str),

    #[error("NTLM context has already produced its authenticate message")]
    ContextCompleted,

    #[error("NTLM authenticate field of {0} bytes does not fit a security buffer")]
    FieldTooLong(usize),
}

// ---------------------------------------------------------------------------
// Type 1 – Negotiate
// ---------------------------------------------------------------------------

/// Build an NTLM Type 1 (Negotiate) message.
pub fn create_negotiate_message() -> Vec<u8> {
    let flags: u32 = NEGOTIATE_UNICODE
        | NEGOTIATE_OEM
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_ALWAYS_SIGN
        | NEGOTIATE_EXTENDED_SESSIONSECURITY;

    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(NTLMSSP_SIGNATURE); // 8 bytes
    msg.extend_from_slice(&1u32.to_le_bytes()); // MessageType = 1
    msg.extend_from_slice(&flags.to_le_bytes()); // NegotiateFlags
    // DomainNameFields and WorkstationFields, both empty
    write_security_buffer(&mut msg, 0, 32);
    write_security_buffer(&mut msg, 0, 32);
    msg
}

// ---------------------------------------------------------------------------
// Type 2 – Challenge (parse proxy message)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NtlmChallenge {
    pub server_challenge: [u8; 8],
    pub flags: u32,
    pub target_name: String,
    pub target_info: Vec<u8>,
}

impl NtlmChallenge {
    /// `MsvAvTimestamp` from the target info, as a FILETIME.
    pub fn timestamp(&self) -> Option<u64> {
        let mut rest = self.target_info.as_slice();
        while rest.len() >= 4 {
            let id = le_u16(rest, 0);
            let len = le_u16(rest, 2) as usize;
            if id == MSV_AV_EOL {
                break;
            }
            let value = rest.get(4..4 + len)?;
            if id == MSV_AV_TIMESTAMP && len == 8 {
                return Some(u64::from_le_bytes(value.try_into().ok()?));
            }
            rest = &rest[4 + len..];
        }
        None
    }
}

/// Parse an NTLM Type 2 (Challenge) message.
pub fn parse_challenge(data: &[u8]) -> Result<NtlmChallenge, NtlmError> {
    if data.len() < CHALLENGE_MIN_LEN {
        return Err(NtlmError::ChallengeTooShort(data.len()));
    }
    if &data[0..8] != NTLMSSP_SIGNATURE {
        return Err(NtlmError::InvalidSignature);
    }
    let msg_type = le_u32(data, 8);
    if msg_type != 2 {
        return Err(NtlmError::UnexpectedMessageType(msg_type));
    }

    let flags = le_u32(data, 20);

    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    let raw_name = security_buffer(data, 12)?;
    let target_name = if flags & NEGOTIATE_UNICODE != 0 {
        let utf16: Vec<u16> = raw_name
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        String::from_utf16_lossy(&utf16)
    } else {
        String::from_utf8_lossy(raw_name).to_string()
    };

    // Older servers stop after the reserved field and send no target info.
    let target_info = if data.len() >= CHALLENGE_TARGET_INFO_END && flags & NEGOTIATE_TARGET_INFO != 0 {
        security_buffer(data, 40)?.to_vec()
    } else {
        Vec::new()
    };

    Ok(NtlmChallenge { server_challenge, flags, target_name, target_info })
}

// ---------------------------------------------------------------------------
// Type 3 – Authenticate
// ---------------------------------------------------------------------------

/// Build an NTLM Type 3 (Authenticate) message with NTLMv2/LMv2 responses.
pub fn create_authenticate_message(
    challenge: &NtlmChallenge,
    credential: &NtlmCredential,
    workstation: &str,
    client_challenge: &[u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>, NtlmError> {
    let key = ntowf_v2(&credential.password, &credential.username, &credential.domain);
    let lm_response = lmv2_response(&key, &challenge.server_challenge, client_challenge);
    let nt_response = ntlmv2_response(
        &key,
        &challenge.server_challenge,
        client_challenge,
        timestamp,
        &challenge.target_info,
    );

    let unicode = challenge.flags & NEGOTIATE_UNICODE != 0;
    let encode = |s: &str| if unicode { to_utf16le(s) } else { s.as_bytes().to_vec() };
    let domain = encode(credential.domain.as_str());
    let username = encode(credential.username.as_str());
    let workstation = encode(workstation);

    let mut flags: u32 = REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_ALWAYS_SIGN
        | NEGOTIATE_EXTENDED_SESSIONSECURITY;
    flags |= if unicode { NEGOTIATE_UNICODE } else { NEGOTIATE_OEM };
    flags |= challenge.flags & (NEGOTIATE_TARGET_INFO | NEGOTIATE_128 | NEGOTIATE_56);

    // Header order and payload order are the same.
    let fields: [&[u8]; 5] = [
        lm_response.as_slice(),
        nt_response.as_slice(),
        domain.as_slice(),
        username.as_slice(),
        workstation.as_slice(),
    ];
    let payload_len: usize = fields.iter().map(|f| f.len()).sum();

    let mut msg = Vec::with_capacity(AUTHENTICATE_HEADER_LEN + payload_len);
    msg.extend_from_slice(NTLMSSP_SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes()); // MessageType

    let mut offset = AUTHENTICATE_HEADER_LEN as u32;
    for field in fields {
        let len = u16::try_from(field.len()).map_err(|_| NtlmError::FieldTooLong(field.len()))?;
        write_security_buffer(&mut msg, len, offset);
        offset += u32::from(len);
    }
    // EncryptedRandomSessionKeyFields (empty)
    write_security_buffer(&mut msg, 0, offset);
    msg.extend_from_slice(&flags.to_le_bytes());

    for field in fields {
        msg.extend_from_slice(field);
    }
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Response computation
// ---------------------------------------------------------------------------

/// NT hash: MD4 of the UTF-16LE password.
pub fn nt_hash(password: &str) -> [u8; 16] {
    let digest = Md4::digest(to_utf16le(password));
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// NTLMv2 response key: HMAC-MD5 of upper-cased user + domain under the NT hash.
pub fn ntowf_v2(password: &str, username: &str, domain: &str) -> [u8; 16] {
    let identity = to_utf16le(&format!("{}{}", username.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity[..]])
}

pub fn lmv2_response(key: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Vec<u8> {
    let proof = hmac_md5(key, &[&server_challenge[..], &client_challenge[..]]);
    [&proof[..], &client_challenge[..]].concat()
}

pub fn ntlmv2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(28 + target_info.len() + 4);
    blob.extend_from_slice(&[0x01, 0x01]); // RespType, HiRespType
    blob.extend_from_slice(&[0u8; 6]); // Reserved1, Reserved2
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]); // Reserved3
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]); // Reserved4

    let proof = hmac_md5(key, &[&server_challenge[..], &blob[..]]);
    [&proof[..], &blob[..]].concat()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Current time as a Windows FILETIME (100ns ticks since 1601).
fn filetime_now() -> u64 {
    let now = Utc::now();
    let secs = (now.timestamp() + FILETIME_EPOCH_OFFSET) as u64;
    secs * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct NtlmCredential {
    domain: String,
    username: String,
    password: String,
}

impl NtlmCredential {
    pub fn new(domain: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        NtlmCredential {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Build credentials from `NTLM_DOMAIN`, `NTLM_USERNAME` and `NTLM_PASSWORD`
    /// as returned by `lookup`. The domain may be absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, NtlmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = lookup(ENV_USERNAME)
            .filter(|v| !v.is_empty())
            .ok_or(NtlmError::MissingDefaultCredential(ENV_USERNAME))?;
        let password = lookup(ENV_PASSWORD)
            .filter(|v| !v.is_empty())
            .ok_or(NtlmError::MissingDefaultCredential(ENV_PASSWORD))?;
        let domain = lookup(ENV_DOMAIN).unwrap_or_default();
        Ok(NtlmCredential { domain, username, password })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for NtlmCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmCredential")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// [`SecurityProvider`] backed by this module's NTLM implementation.
///
/// Default credentials come from the process environment.
#[derive(Debug, Clone)]
pub struct NtlmProvider {
    workstation: String,
}

impl NtlmProvider {
    pub fn new() -> Self {
        let workstation = std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| DEFAULT_WORKSTATION.to_string());
        NtlmProvider { workstation }
    }

    pub fn with_workstation(mut self, workstation: impl Into<String>) -> Self {
        self.workstation = workstation.into();
        self
    }

    pub fn workstation(&self) -> &str {
        &self.workstation
    }
}

impl Default for NtlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityProvider for NtlmProvider {
    type Credential = NtlmCredential;
    type Context = NtlmContext;

    fn acquire_credentials(
        &self,
        domain: &str,
        username: &str,
        password: &str,
    ) -> Result<NtlmCredential, BoxError> {
        Ok(NtlmCredential::new(domain, username, password))
    }

    fn acquire_default_credentials(&self) -> Result<NtlmCredential, BoxError> {
        Ok(NtlmCredential::from_lookup(|key| std::env::var(key).ok())?)
    }

    fn new_client_context(
        &self,
        credential: &NtlmCredential,
    ) -> Result<(NtlmContext, Vec<u8>), BoxError> {
        let context = NtlmContext {
            credential: credential.clone(),
            workstation: self.workstation.clone(),
            completed: false,
        };
        Ok((context, create_negotiate_message()))
    }
}

/// Client side of one NTLM exchange.
#[derive(Debug)]
pub struct NtlmContext {
    credential: NtlmCredential,
    workstation: String,
    completed: bool,
}

impl SecurityContext for NtlmContext {
    fn update(&mut self, challenge: &[u8]) -> Result<Vec<u8>, BoxError> {
        if self.completed {
            return Err(NtlmError::ContextCompleted.into());
        }
        let challenge = parse_challenge(challenge)?;
        debug!(
            target_name = %challenge.target_name,
            flags = challenge.flags,
            "ntlm> parsed challenge"
        );

        let client_challenge: [u8; 8] = rand::random();
        let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);
        let msg = create_authenticate_message(
            &challenge,
            &self.credential,
            &self.workstation,
            &client_challenge,
            timestamp,
        )?;
        self.completed = true;
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn write_security_buffer(buf: &mut Vec<u8>, length: u16, offset: u32) {
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes()); // MaxLength == Length
    buf.extend_from_slice(&offset.to_le_bytes());
}

/// Resolve the security buffer descriptor stored at `at`.
fn security_buffer(data: &[u8], at: usize) -> Result<&[u8], NtlmError> {
    let len = le_u16(data, at) as usize;
    let offset = le_u32(data, at + 4) as usize;
    if len == 0 {
        return Ok(&[]);
    }
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(NtlmError::BufferOutOfRange(offset))
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
