use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncWrite};
use url::Host;

/// Destination of an outbound tunnel.
///
/// DNS hosts are stored in their IDNA ASCII form so they can be written into
/// a SOCKS5 connect frame without further mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Dns(String, u16),
}

/// Error type for destination classification
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid destination host {0:?}")]
    InvalidHost(String),

    #[error("destination host exceeds 255 bytes after IDNA mapping")]
    HostTooLong,
}

impl Endpoint {
    /// Classify a host as a literal IP address or a DNS name.
    ///
    /// Accepts bracketed IPv6 literals. Non-ASCII labels are mapped to their
    /// IDNA ASCII form; the mapped host must fit the 255-byte SOCKS5 limit.
    pub fn resolve(host: &str, port: u16) -> Result<Self, EndpointError> {
        match Host::parse(host) {
            Ok(Host::Ipv4(addr)) => Ok(Endpoint::V4(addr, port)),
            Ok(Host::Ipv6(addr)) => Ok(Endpoint::V6(addr, port)),
            Ok(Host::Domain(domain)) => {
                if domain.len() > 255 {
                    return Err(EndpointError::HostTooLong);
                }
                Ok(Endpoint::Dns(domain, port))
            }
            Err(_) => Err(EndpointError::InvalidHost(host.to_string())),
        }
    }

}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4(addr, port) => write!(f, "{addr}:{port}"),
            Endpoint::V6(addr, port) => write!(f, "[{addr}]:{port}"),
            Endpoint::Dns(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Boundary between the HTTP-facing session and the outbound transport.
pub trait TunnelFactory: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a duplex channel to `destination`.
    fn create(
        &self,
        destination: &Endpoint,
    ) -> impl Future<Output = Result<Self::Stream, Self::Error>> + Send;
}

/// Plain TCP tunnels, bypassing the SOCKS5 upstream.
#[cfg(test)]
pub struct DirectConnector;

#[cfg(test)]
impl TunnelFactory for DirectConnector {
    type Stream = tokio::net::TcpStream;
    type Error = std::io::Error;

    async fn create(&self, destination: &Endpoint) -> std::io::Result<Self::Stream> {
        match destination {
            Endpoint::V4(addr, port) => tokio::net::TcpStream::connect((*addr, *port)).await,
            Endpoint::V6(addr, port) => tokio::net::TcpStream::connect((*addr, *port)).await,
            Endpoint::Dns(host, port) => {
                tokio::net::TcpStream::connect((host.as_str(), *port)).await
            }
        }
    }
}
