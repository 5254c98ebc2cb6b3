/// ntlm-connect – main entry point.
///
/// Acts as a local HTTP CONNECT relay. Every client tunnel is opened through
/// the configured upstream proxy with its own NTLM handshake.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ntlm_connect_core::{
    auth::NtlmProvider,
    checker,
    logger::{failure_status, Logger, RelayEvent, TunnelLog},
    proxy::{dial_proxy, ntlm::authenticate},
    ProxyConfig,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ntlm-connect", about = "Local CONNECT relay with upstream NTLM proxy authentication")]
struct Cli {
    /// Path to the XML configuration file
    #[arg(short, long, default_value = "ntlm-connect.xml")]
    config: String,

    /// Override listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Open one tunnel to HOST:PORT through the proxy and exit
    #[arg(long, value_name = "HOST:PORT")]
    check: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = if std::path::Path::new(&cli.config).exists() {
        Some(ProxyConfig::load_from_file(&cli.config))
    } else {
        None
    };

    let level = match &loaded {
        _ if cli.verbose => "debug".to_string(),
        Some(Ok(cfg)) => cfg.settings.log_level.clone(),
        _ => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let mut config = match loaded {
        Some(Ok(cfg)) => cfg,
        Some(Err(e)) => {
            warn!("Failed to load config '{}': {}. Using defaults.", cli.config, e);
            ProxyConfig::default()
        }
        None => {
            info!("Config file '{}' not found, using defaults.", cli.config);
            ProxyConfig::default()
        }
    };

    if let Some(port) = cli.port {
        config.settings.listen_port = port;
    }

    if cli.init_config {
        config.save_to_file(&cli.config)?;
        println!("Wrote configuration to {}", cli.config);
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if let Some(target) = cli.check {
        let ok = rt.block_on(run_check(&config, &target));
        std::process::exit(if ok { 0 } else { 1 });
    }

    rt.block_on(run_relay(config))
}

// ---------------------------------------------------------------------------
// Tunnel checker
// ---------------------------------------------------------------------------

async fn run_check(config: &ProxyConfig, target: &str) -> bool {
    println!("Checking tunnel to {} via {}...", target, config.proxy.address());
    let r = checker::check_tunnel(&NtlmProvider::new(), config, target).await;
    if r.authenticated {
        println!("  [OK]  {} – {}ms", r.target, r.latency_ms.unwrap_or(0));
    } else {
        println!(
            "  [ERR] {} – {} (after {})",
            r.target,
            r.error.as_deref().unwrap_or("unknown error"),
            r.state
        );
    }
    r.authenticated
}

// ---------------------------------------------------------------------------
// Relay server
// ---------------------------------------------------------------------------

async fn run_relay(config: ProxyConfig) -> Result<()> {
    // Use the tuple form so IPv6 listen hosts (e.g. "::1") work correctly.
    let listener = TcpListener::bind((
        config.settings.listen_host.as_str(),
        config.settings.listen_port,
    ))
    .await?;
    let local_addr = listener.local_addr()?;

    let logger = Arc::new(Logger::new(&config.settings.log_path)?);
    let tunnel_log = match logger.log_path() {
        "" => "off",
        path => path,
    };
    logger.log_relay_event(
        RelayEvent::Listening,
        &format!(
            "{} via upstream proxy {}, tunnel log {}",
            local_addr,
            config.proxy.address(),
            tunnel_log
        ),
    );
    if !config.has_explicit_credentials() {
        info!("No explicit credentials configured, using default identity");
    }

    let provider = Arc::new(NtlmProvider::new());
    let config = Arc::new(config);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let cfg = Arc::clone(&config);
                let prov = Arc::clone(&provider);
                let log = Arc::clone(&logger);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, cfg, prov, Arc::clone(&log)).await {
                        log.log_relay_event(RelayEvent::ConnectionFailed, &format!("{}: {}", peer, e));
                    }
                });
            }
            Err(e) => {
                logger.log_relay_event(RelayEvent::AcceptFailed, &e.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    provider: Arc<NtlmProvider>,
    logger: Arc<Logger>,
) -> Result<()> {
    let target = parse_http_connect_request(&mut stream).await?;
    info!("Connection from {} -> {}", peer, target);

    let conn_id = generate_connection_id();
    let started = Instant::now();
    let mut log = TunnelLog {
        timestamp: chrono::Utc::now(),
        connection_id: conn_id,
        source_addr: peer.to_string(),
        target: target.clone(),
        proxy: config.proxy.address(),
        state: String::new(),
        bytes_sent: 0,
        bytes_received: 0,
        duration_ms: 0,
        status: String::new(),
        error: None,
    };

    let result = authenticate(provider.as_ref(), &config, &target, || dial_proxy(&config.proxy)).await;

    match result {
        Ok(upstream) => {
            log.state = "authenticated".into();
            send_http_success(&mut stream).await?;
            let (sent, received) = pipe_streams(stream, upstream).await;
            log.bytes_sent = sent;
            log.bytes_received = received;
            log.status = "success".into();
        }
        Err(failure) => {
            log.state = failure.state().to_string();
            log.status = failure_status(failure.error()).into();
            log.error = Some(failure.error().to_string());
            let _ = send_http_error(&mut stream).await;
            // The upstream connection is in an unknown NTLM state; close it.
            drop(failure.into_stream());
        }
    }

    log.duration_ms = started.elapsed().as_millis() as u64;
    logger.log_tunnel(&log);
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP CONNECT server-side parsing
// ---------------------------------------------------------------------------

/// Read the client's CONNECT request and return its `host:port` target.
async fn parse_http_connect_request(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return Err(anyhow::anyhow!("HTTP CONNECT request too large"));
        }
    }

    let req = String::from_utf8_lossy(&buf);
    let first_line = req.lines().next().ok_or_else(|| anyhow::anyhow!("Empty HTTP request"))?;

    // Expect: CONNECT host:port HTTP/1.x
    let mut parts = first_line.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if method != "CONNECT" {
        stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
        return Err(anyhow::anyhow!("HTTP: only CONNECT is supported (got {})", method));
    }

    parse_host_port(target)?;
    Ok(target.to_string())
}

async fn send_http_success(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    Ok(())
}

async fn send_http_error(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
    Ok(())
}

/// Parse `host:port` or `[ipv6]:port` from an HTTP CONNECT target string.
fn parse_host_port(target: &str) -> Result<(String, u16)> {
    // Handle bracketed IPv6: [2001:db8::1]:443
    if target.starts_with('[') {
        if let Some(bracket_end) = target.find(']') {
            let host = target[1..bracket_end].to_string();
            let rest = &target[bracket_end + 1..];
            if let Some(port_str) = rest.strip_prefix(':') {
                let port: u16 = port_str.parse()?;
                return Ok((host, port));
            }
            return Err(anyhow::anyhow!("No port in IPv6 CONNECT target: {}", target));
        }
    }
    if let Some(pos) = target.rfind(':') {
        let host = target[..pos].to_string();
        if host.is_empty() {
            return Err(anyhow::anyhow!("No host in CONNECT target: {}", target));
        }
        let port: u16 = target[pos + 1..].parse()?;
        Ok((host, port))
    } else {
        Err(anyhow::anyhow!("No port in CONNECT target: {}", target))
    }
}

// ---------------------------------------------------------------------------
// Bidirectional pipe
// ---------------------------------------------------------------------------

/// Copy bytes both ways until each side closes. Returns (sent, received).
async fn pipe_streams(client: TcpStream, upstream: TcpStream) -> (u64, u64) {
    let (mut cr, mut cw) = tokio::io::split(client);
    let (mut ur, mut uw) = tokio::io::split(upstream);

    let client_to_upstream = async move {
        let n = tokio::io::copy(&mut cr, &mut uw).await.unwrap_or(0);
        let _ = uw.shutdown().await;
        n
    };

    let upstream_to_client = async move {
        let n = tokio::io::copy(&mut ur, &mut cw).await.unwrap_or(0);
        let _ = cw.shutdown().await;
        n
    };

    tokio::join!(client_to_upstream, upstream_to_client)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a unique connection ID from the timestamp and a counter.
fn generate_connection_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = chrono::Utc::now();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:06x}", now.format("%Y%m%dT%H%M%S%.3f"), seq & 0xFF_FFFF)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
