use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use clap::{Args, Parser};
use color_eyre::eyre::eyre;

use crate::auth::Auth;
use crate::socks::HandshakeMode;

/// Upstream SOCKS5 credentials
#[derive(Debug, Clone, Args)]
pub struct Auths {
    /// SOCKS5 username for the upstream server
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// SOCKS5 password for the upstream server
    #[arg(short = 'P', long)]
    pub password: Option<String>,
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP proxy forwarding through an upstream SOCKS5 proxy",
    long_about = "htsp accepts HTTP/1.1 proxy requests (CONNECT tunnels and \
absolute-form requests) and forwards every session through an upstream \
SOCKS5 proxy.\n\nFeatures:\n- Optional HTTP Basic auth on the inbound side\n\
- Optional username/password auth against the upstream SOCKS5 server\n\
- Pipelined SOCKS5 handshake (one round-trip) or classic sequential mode\n"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// IP address to bind the listener; an IPv6 address gives a dual-stack
    /// listener where the OS allows it
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_ip: IpAddr,

    /// Listen backlog
    #[arg(long, default_value_t = 1_024)]
    pub backlog: u32,

    /// Upstream SOCKS5 proxy address or hostname:port
    #[arg(short, long, default_value = "127.0.0.1:1080", value_name = "HOST:PORT")]
    pub socks_address: String,

    /// SOCKS5 authentication credentials for the upstream server
    #[command(flatten)]
    pub auth: Option<Auths>,

    /// HTTP Basic Auth credentials clients must present, in the format "user:passwd"
    #[arg(long)]
    pub http_basic: Option<String>,

    /// SOCKS5 handshake scheduling against the upstream server
    #[arg(long, value_enum, default_value_t = HandshakeMode::Pipelined)]
    pub handshake: HandshakeMode,
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub backlog: u32,
    pub socks_addr: SocketAddr,
    pub handshake: HandshakeMode,
    /// Base64 token clients must present after `Basic `, encoded once here.
    pub basic_token: Option<Arc<str>>,
    /// Pre-serialized RFC 1929 sub-negotiation packet for the upstream.
    pub socks_credential: Option<Bytes>,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub async fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let socks_addr = match tokio::net::lookup_host(&args.socks_address).await {
            Ok(mut addrs) => addrs
                .next()
                .ok_or_else(|| eyre!("no addresses found for {}", args.socks_address))?,
            Err(e) => return Err(eyre!("failed to resolve {}: {}", args.socks_address, e)),
        };

        let listen_addr = SocketAddr::from((args.listen_ip, args.port));

        let basic_token = match args.http_basic.as_deref() {
            Some(raw) => {
                let auth = Auth::parse(raw)
                    .ok_or_else(|| eyre!("invalid --http-basic, expected user:pass"))?;
                Some(Arc::<str>::from(auth.basic_token()))
            }
            None => None,
        };

        let socks_credential = match args.auth.as_ref() {
            Some(auth) => match (&auth.username, &auth.password) {
                (Some(username), Some(password)) => {
                    Some(Auth::new(username.clone(), password.clone()).subnegotiation()?)
                }
                (None, None) => None,
                _ => return Err(eyre!("upstream auth requires both --username and --password")),
            },
            None => None,
        };

        Ok(Self {
            listen_addr,
            backlog: args.backlog,
            socks_addr,
            handshake: args.handshake,
            basic_token,
            socks_credential,
        })
    }
}
