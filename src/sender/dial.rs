use std::io;
use std::net::IpAddr;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

const DEFAULT_HTTPS_PORT: u16 = 443;

/// Local address the OS picks when connecting to the service (or to the
/// proxy, when one is configured). Reported to the service on registration.
pub async fn local_address(target: &Url, proxy: Option<&Url>) -> io::Result<IpAddr> {
    let endpoint = proxy.unwrap_or(target);
    let host = endpoint
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
    let port = endpoint.port_or_known_default().unwrap_or(DEFAULT_HTTPS_PORT);

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let stream = TcpStream::connect((host, port)).await?;
    let address = stream.local_addr()?.ip();
    debug!(%address, host, port, "Resolved local address");
    Ok(address)
}
