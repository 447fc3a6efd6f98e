use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::tunnel::{Endpoint, TunnelFactory};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const AUTH_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;
const REPLY_SUCCESS: u8 = 0x00;

/// Error type for SOCKS5 tunnel establishment
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("failed to reach SOCKS5 server: {0}")]
    OutboundConnectFailed(#[source] std::io::Error),

    #[error("SOCKS5 server rejected method negotiation")]
    NegotiateRejected,

    #[error("SOCKS5 server requires authentication but no credential is configured")]
    AuthRequiredButNoCredential,

    #[error("SOCKS5 server rejected the credential")]
    AuthRejected,

    #[error("SOCKS5 server rejected the connect request")]
    ConnectRejected,

    #[error("destination host does not fit in a SOCKS5 connect frame")]
    InvalidDestination,

    #[error("SOCKS5 server closed the connection mid-handshake")]
    OutboundClosed,
}

/// Handshake scheduling against the upstream server.
///
/// `Sequential` completes one round-trip per frame. `Pipelined` writes the
/// negotiate, auth, and connect frames back-to-back with a single flush,
/// saving two round-trips at the cost of offering the credential before the
/// server has asked for it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum HandshakeMode {
    Sequential,
    #[default]
    Pipelined,
}

/// Opens tunnels through the upstream SOCKS5 server.
#[derive(Debug)]
pub struct SocksConnector {
    server: SocketAddr,
    credential: Option<Bytes>,
    mode: HandshakeMode,
}

impl SocksConnector {
    /// `credential` is the pre-serialized RFC 1929 sub-negotiation packet.
    pub fn new(server: SocketAddr, credential: Option<Bytes>, mode: HandshakeMode) -> Self {
        Self {
            server,
            credential,
            mode,
        }
    }

    /// Open a TCP connection to the server and drive the handshake. On
    /// success the stream is positioned just past the server's bound-address
    /// reply; on failure the socket is dropped.
    pub async fn connect(&self, destination: &Endpoint) -> Result<TcpStream, SocksError> {
        let mut stream = TcpStream::connect(self.server)
            .await
            .map_err(SocksError::OutboundConnectFailed)?;
        handshake(&mut stream, destination, self.credential.as_deref(), self.mode).await?;
        Ok(stream)
    }
}

impl TunnelFactory for SocksConnector {
    type Stream = TcpStream;
    type Error = SocksError;

    async fn create(&self, destination: &Endpoint) -> Result<TcpStream, SocksError> {
        self.connect(destination).await
    }
}

pub(crate) async fn handshake<S>(
    stream: &mut S,
    destination: &Endpoint,
    credential: Option<&[u8]>,
    mode: HandshakeMode,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connect = connect_frame(destination)?;
    let negotiate = negotiate_frame(credential.is_some());

    match mode {
        HandshakeMode::Sequential => {
            write_frame(stream, &negotiate).await?;
            let offered = read_negotiate_reply(stream).await?;
            if offered == METHOD_USERPASS {
                let credential = credential.ok_or(SocksError::AuthRequiredButNoCredential)?;
                write_frame(stream, credential).await?;
                read_auth_reply(stream).await?;
            }
            write_frame(stream, &connect).await?;
            read_connect_reply(stream).await
        }
        HandshakeMode::Pipelined => {
            let credential_len = credential.map_or(0, <[u8]>::len);
            let mut frames = Vec::with_capacity(negotiate.len() + credential_len + connect.len());
            frames.extend_from_slice(&negotiate);
            if let Some(credential) = credential {
                frames.extend_from_slice(credential);
            }
            frames.extend_from_slice(&connect);
            write_frame(stream, &frames).await?;

            let offered = read_negotiate_reply(stream).await?;
            if offered == METHOD_USERPASS {
                if credential.is_none() {
                    return Err(SocksError::AuthRequiredButNoCredential);
                }
                // An auth reply arrives only for the method the server chose;
                // under METHOD_NONE the blindly sent packet is discarded.
                read_auth_reply(stream).await?;
            }
            read_connect_reply(stream).await
        }
    }
}

fn negotiate_frame(with_auth: bool) -> [u8; 3] {
    let method = if with_auth { METHOD_USERPASS } else { METHOD_NONE };
    [SOCKS_VERSION, 0x01, method]
}

fn connect_frame(destination: &Endpoint) -> Result<Vec<u8>, SocksError> {
    let mut frame = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    let port = match destination {
        Endpoint::V4(addr, port) => {
            frame.push(ATYP_IPV4);
            frame.extend_from_slice(&addr.octets());
            *port
        }
        Endpoint::V6(addr, port) => {
            frame.push(ATYP_IPV6);
            frame.extend_from_slice(&addr.octets());
            *port
        }
        Endpoint::Dns(host, port) => {
            let host = host.as_bytes();
            if host.is_empty() || host.len() > 255 {
                return Err(SocksError::InvalidDestination);
            }
            frame.push(ATYP_DOMAIN);
            frame.push(host.len() as u8);
            frame.extend_from_slice(host);
            *port
        }
    };
    frame.extend_from_slice(&port.to_be_bytes());
    Ok(frame)
}

async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(frame)
        .await
        .map_err(|_| SocksError::OutboundClosed)?;
    stream.flush().await.map_err(|_| SocksError::OutboundClosed)
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), SocksError>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|_| SocksError::OutboundClosed)
}

async fn read_negotiate_reply<S>(stream: &mut S) -> Result<u8, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut reply = [0u8; 2];
    read_exact(stream, &mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::NegotiateRejected);
    }
    match reply[1] {
        METHOD_NONE | METHOD_USERPASS => Ok(reply[1]),
        _ => Err(SocksError::NegotiateRejected),
    }
}

async fn read_auth_reply<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut reply = [0u8; 2];
    read_exact(stream, &mut reply).await?;
    if reply != [AUTH_VERSION, AUTH_SUCCESS] {
        return Err(SocksError::AuthRejected);
    }
    Ok(())
}

/// Consume the connect reply, including the variable-length bound address,
/// without reading past it.
async fn read_connect_reply<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    read_exact(stream, &mut head).await?;
    if head[0] != SOCKS_VERSION || head[1] != REPLY_SUCCESS {
        return Err(SocksError::ConnectRejected);
    }

    let bound_len = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact(stream, &mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(SocksError::ConnectRejected),
    };

    let mut bound = vec![0u8; bound_len];
    read_exact(stream, &mut bound).await?;
    Ok(())
}
