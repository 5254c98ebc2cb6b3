pub mod http;
pub mod ntlm;

use crate::config::ProxyEndpoint;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Open a TCP connection to the proxy, bounded by the endpoint's timeout.
pub async fn dial_proxy(endpoint: &ProxyEndpoint) -> io::Result<TcpStream> {
    let connect_timeout = Duration::from_secs(endpoint.timeout_secs);
    let addr = endpoint.address();

    match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to proxy {} timed out after {}s", addr, endpoint.timeout_secs),
        )),
    }
}
