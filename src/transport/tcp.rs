//! Persistent token-prefixed stream transport.
//!
//! Each payload goes out as `<token> <payload>\n` on a long-lived TCP
//! connection, optionally wrapped in TLS.

use std::{
    io::{self, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::debug;
use native_tls::{TlsConnector, TlsStream};

use super::{ConnectError, Transport, WriteError};

pub const DEFAULT_STREAM_HOST: &str = "data.logentries.com";
pub const DEFAULT_PLAIN_PORT: u16 = 80;
pub const DEFAULT_TLS_PORT: u16 = 443;

/// TLS connection options.
#[derive(Clone, Debug)]
pub struct TlsOptions {
    /// Domain name presented during the TLS handshake.
    pub domain: String,
    /// Skip certificate validation when true (intended for tests).
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            insecure_skip_verify: false,
        }
    }

    fn connector(&self) -> io::Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        builder.build().map_err(io::Error::other)
    }
}

enum Link {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Link {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Link::Plain(stream) => stream.write_all(buf),
            Link::Tls(stream) => stream.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Link::Plain(stream) => stream.flush(),
            Link::Tls(stream) => stream.flush(),
        }
    }

    fn shutdown(&mut self) {
        match self {
            Link::Plain(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            Link::Tls(stream) => {
                let _ = stream.shutdown();
            }
        }
    }
}

/// Stream transport writing `<token> <payload>\n` lines.
pub struct TokenStreamTransport {
    host: String,
    port: u16,
    token: String,
    tls: Option<TlsOptions>,
    connect_timeout: Duration,
    write_timeout: Duration,
    link: Option<Link>,
}

impl TokenStreamTransport {
    /// Transport for `host:port` prefixing every payload with `token`.
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
            tls: None,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            link: None,
        }
    }

    /// Transport for the public collector endpoint.
    pub fn collector(token: impl Into<String>, use_tls: bool) -> Self {
        let transport = Self::new(
            DEFAULT_STREAM_HOST,
            if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT },
            token,
        );
        if use_tls {
            transport.with_tls(TlsOptions::new(DEFAULT_STREAM_HOST))
        } else {
            transport
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(|iter| iter.collect())
    }

    fn connect_tcp(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}", self.endpoint()),
            )
        }))
    }

    fn connect_link(&self) -> io::Result<Link> {
        let stream = self.connect_tcp()?;
        let Some(tls) = &self.tls else {
            return Ok(Link::Plain(stream));
        };
        let connector = tls.connector()?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        let stream = connector
            .connect(&tls.domain, stream)
            .map_err(io::Error::other)?;
        stream.get_ref().set_read_timeout(None)?;
        Ok(Link::Tls(Box::new(stream)))
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.token.len() + payload.len() + 2);
        frame.extend_from_slice(self.token.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(payload);
        frame.push(b'\n');
        frame
    }
}

impl Transport for TokenStreamTransport {
    fn open(&mut self) -> Result<(), ConnectError> {
        if let Some(mut old) = self.link.take() {
            old.shutdown();
        }
        let link = self
            .connect_link()
            .map_err(|err| ConnectError::new(self.endpoint(), err))?;
        debug!("connected to {}", self.endpoint());
        self.link = Some(link);
        Ok(())
    }

    fn write_line(&mut self, payload: &[u8]) -> Result<(), WriteError> {
        let frame = self.frame(payload);
        let link = self.link.as_mut().ok_or(WriteError::NotConnected)?;
        let result = link.write_all(&frame).and_then(|()| link.flush());
        if result.is_err() {
            self.link = None;
        }
        result.map_err(WriteError::from)
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
    }

    fn describe(&self) -> String {
        let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
        format!("{scheme}://{}", self.endpoint())
    }
}

impl std::fmt::Debug for TokenStreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStreamTransport")
            .field("endpoint", &self.endpoint())
            .field("tls", &self.tls.is_some())
            .field("connected", &self.link.is_some())
            .finish()
    }
}
