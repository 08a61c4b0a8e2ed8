//! Request/response transport: one HTTP POST per payload.
//!
//! The `ureq` agent is created on `open` and reused for connection pooling.
//! Response codes are classified so the appender can tell a transient
//! outage from a payload the collector will never accept.

use std::{sync::Arc, time::Duration};

use log::debug;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use ureq::{Agent, AgentBuilder};

use super::{ConnectError, Transport, WriteError};

pub const DEFAULT_HTTP_BASE_URL: &str = "https://js.logentries.com/v1/logs/";

/// Characters escaped when the token is appended as a path segment.
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Classification of HTTP response for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx responses - request succeeded.
    Success,
    /// 5xx or 429 - retry later.
    Retryable,
    /// Other statuses - the payload will never be accepted.
    Permanent,
}

/// Classifies an HTTP status code for retry logic.
pub(crate) fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        429 | 500..=599 => ResponseClass::Retryable,
        _ => ResponseClass::Permanent,
    }
}

/// Join `base` and the percent-encoded `token` into the ingestion URL.
pub fn ingestion_url(base: &str, token: &str) -> String {
    let separator = if base.ends_with('/') { "" } else { "/" };
    format!(
        "{base}{separator}{}",
        utf8_percent_encode(token, PATH_SEGMENT_ENCODE_SET)
    )
}

pub struct HttpPostTransport {
    url: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    agent: Option<Agent>,
}

impl HttpPostTransport {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            url: ingestion_url(base_url, token),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            agent: None,
        }
    }

    /// Transport for the public collector endpoint.
    pub fn collector(token: &str) -> Self {
        Self::new(DEFAULT_HTTP_BASE_URL, token)
    }

    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_agent(&self) -> Result<Agent, ConnectError> {
        let connector = native_tls::TlsConnector::new()
            .map_err(|err| ConnectError::new(self.url.clone(), std::io::Error::other(err)))?;
        Ok(AgentBuilder::new()
            .timeout_connect(self.connect_timeout)
            .timeout(self.connect_timeout + self.write_timeout)
            .tls_connector(Arc::new(connector))
            .build())
    }

    fn post(&self, agent: &Agent, payload: &[u8]) -> Result<u16, WriteError> {
        match agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_bytes(payload)
        {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(ureq::Error::Transport(err)) => Err(WriteError::Http(err.to_string())),
        }
    }
}

impl Transport for HttpPostTransport {
    fn open(&mut self) -> Result<(), ConnectError> {
        if self.agent.is_none() {
            self.agent = Some(self.build_agent()?);
            debug!("http transport ready for {}", self.url);
        }
        Ok(())
    }

    fn write_line(&mut self, payload: &[u8]) -> Result<(), WriteError> {
        let agent = self.agent.as_ref().ok_or(WriteError::NotConnected)?;
        let status = self.post(agent, payload)?;
        match classify_status(status) {
            ResponseClass::Success => Ok(()),
            ResponseClass::Retryable | ResponseClass::Permanent => {
                Err(WriteError::Rejected(status))
            }
        }
    }

    fn close(&mut self) {
        self.agent = None;
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

impl std::fmt::Debug for HttpPostTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPostTransport")
            .field("url", &self.url)
            .field("open", &self.agent.is_some())
            .finish()
    }
}
