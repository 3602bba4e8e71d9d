//! Transport layer
//!
//! Server URI parsing and a unified byte stream over plain TCP, TLS and
//! WebSocket connections.

pub mod tls;
mod websocket;

pub use websocket::WsStream;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::debug;
use url::Url;

use crate::error::ClientError;

/// Transport scheme of a server URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP (`tcp://`)
    Tcp,
    /// TLS (`ssl://`)
    Ssl,
    /// WebSocket (`ws://`)
    Ws,
    /// WebSocket over TLS (`wss://`)
    Wss,
}

impl Scheme {
    fn from_str(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Scheme::Tcp),
            "ssl" => Some(Scheme::Ssl),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn uses_tls(self) -> bool {
        matches!(self, Scheme::Ssl | Scheme::Wss)
    }

    pub fn uses_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

/// A parsed server URI: `tcp://host:port`, `ssl://host:port`,
/// `ws://host:port/mqtt` or `wss://host:port/mqtt`. The port is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request path for WebSocket upgrades
    pub path: String,
}

impl ServerUri {
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let url = Url::parse(input).map_err(|_| ClientError::InvalidInput("invalid server URI"))?;

        let scheme = Scheme::from_str(url.scheme())
            .ok_or(ClientError::InvalidInput("unsupported URI scheme"))?;
        let host = url
            .host_str()
            .ok_or(ClientError::InvalidInput("server URI has no host"))?
            .to_string();
        // The url crate elides an explicit default port on ws/wss; fall back
        // to the scheme default there so `ws://host:80/mqtt` stays valid
        let port = url
            .port()
            .or_else(|| {
                if scheme.uses_websocket() {
                    url.port_or_known_default()
                } else {
                    None
                }
            })
            .ok_or(ClientError::InvalidInput("server URI has no port"))?;

        let path = match url.path() {
            "" | "/" => "/mqtt".to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// The ws:// or wss:// URL used for the HTTP upgrade request.
    fn ws_url(&self) -> String {
        let scheme = match self.scheme {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            _ => unreachable!("not a websocket URI"),
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

impl std::fmt::Display for ServerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)?;
        if self.scheme.uses_websocket() {
            f.write_str(&self.path)?;
        }
        Ok(())
    }
}

/// A connected bidirectional byte stream to a broker
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Ws(Box<WsStream>),
}

/// Open a transport to the given server with a connect deadline.
pub async fn dial(uri: &ServerUri, connect_timeout: Duration) -> Result<Stream, ClientError> {
    let stream = timeout(connect_timeout, dial_inner(uri))
        .await
        .map_err(|_| ClientError::Timeout)??;
    debug!(%uri, "transport connected");
    Ok(stream)
}

async fn dial_inner(uri: &ServerUri) -> Result<Stream, ClientError> {
    match uri.scheme {
        Scheme::Tcp => {
            let stream = TcpStream::connect((uri.host.as_str(), uri.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Stream::Tcp(stream))
        }
        Scheme::Ssl => {
            let stream = TcpStream::connect((uri.host.as_str(), uri.port)).await?;
            stream.set_nodelay(true)?;
            let tls = tls::TlsConfig::new()?;
            let stream = tls.connect(stream, &uri.host).await?;
            Ok(Stream::Tls(Box::new(stream)))
        }
        Scheme::Ws | Scheme::Wss => {
            let stream = WsStream::connect(&uri.ws_url()).await?;
            Ok(Stream::Ws(Box::new(stream)))
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Stream::Ws(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Stream::Ws(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Stream::Ws(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Stream::Ws(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri() {
        let uri = ServerUri::parse("tcp://broker.example.com:1883").unwrap();
        assert_eq!(uri.scheme, Scheme::Tcp);
        assert_eq!(uri.host, "broker.example.com");
        assert_eq!(uri.port, 1883);
    }

    #[test]
    fn test_parse_ssl_uri() {
        let uri = ServerUri::parse("ssl://broker.example.com:8883").unwrap();
        assert_eq!(uri.scheme, Scheme::Ssl);
        assert!(uri.scheme.uses_tls());
    }

    #[test]
    fn test_parse_ws_uri_defaults_path() {
        let uri = ServerUri::parse("ws://broker.example.com:8080").unwrap();
        assert_eq!(uri.scheme, Scheme::Ws);
        assert_eq!(uri.path, "/mqtt");
        assert_eq!(uri.ws_url(), "ws://broker.example.com:8080/mqtt");

        let uri = ServerUri::parse("wss://broker.example.com:443/mqtt").unwrap();
        assert_eq!(uri.scheme, Scheme::Wss);
        assert_eq!(uri.ws_url(), "wss://broker.example.com:443/mqtt");
    }

    #[test]
    fn test_port_is_mandatory() {
        assert!(ServerUri::parse("tcp://broker.example.com").is_err());
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(ServerUri::parse("http://broker.example.com:80").is_err());
        assert!(ServerUri::parse("not a uri").is_err());
    }
}
