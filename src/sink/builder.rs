//! Builder for [`ShippingSink`](super::ShippingSink).
//!
//! Validation happens eagerly in [`SinkBuilder::build`] so a misconfigured
//! sink fails at construction rather than on its worker thread.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{
    connection::BackoffPolicy,
    log_event::is_valid_host_tag,
    overflow_store::{CeilingPolicy, StorageError},
    queue::QueueOverflowPolicy,
    transport::{
        HttpPostTransport, TlsOptions, TokenStreamTransport, Transport, TransportKind,
        validate_token,
    },
};

use super::{
    ShippingSink,
    config::{HostTag, MessageFormat, Relay, SinkConfig},
};

/// Error raised while constructing a sink.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid user supplied configuration.
    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error whilst creating the sink.
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Settings file could not be read or parsed.
    #[error("invalid settings file: {0}")]
    Ini(String),
}

macro_rules! ensure_positive {
    ($value:expr, $field:expr) => {{
        if $value == 0 {
            Err(BuildError::InvalidConfig(format!(
                "{} must be greater than zero",
                $field
            )))
        } else {
            Ok($value)
        }
    }};
}

macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

/// Overrides for the reconnect backoff timings.
#[derive(Clone, Debug, Default)]
pub struct BackoffOverrides {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

impl BackoffOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    option_setter!(with_base_ms, base_ms, u64);
    option_setter!(with_cap_ms, cap_ms, u64);
    option_setter!(
        #[doc = "Upper bound of the random delay added to each wait; zero disables jitter."]
        with_jitter_ms,
        jitter_ms,
        u64
    );

    fn apply(&self, policy: &mut BackoffPolicy) -> Result<(), BuildError> {
        if let Some(base) = self.base_ms {
            ensure_positive!(base, "backoff_base_ms")?;
            policy.base = Duration::from_millis(base);
        }
        if let Some(cap) = self.cap_ms {
            ensure_positive!(cap, "backoff_cap_ms")?;
            policy.cap = Duration::from_millis(cap);
        }
        if let Some(jitter) = self.jitter_ms {
            policy.jitter = Duration::from_millis(jitter);
        }
        if policy.cap < policy.base {
            return Err(BuildError::InvalidConfig(
                "backoff_cap_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for constructing [`ShippingSink`] instances.
#[derive(Clone, Debug, Default)]
pub struct SinkBuilder {
    token: Option<String>,
    transport: Option<TransportKind>,
    use_tls: Option<bool>,
    relay: Option<Relay>,
    http_base_url: Option<String>,
    format: Option<MessageFormat>,
    host_tag: Option<HostTag>,
    queue_capacity: Option<usize>,
    overflow_policy: Option<QueueOverflowPolicy>,
    max_chunk_len: Option<usize>,
    poll_interval_ms: Option<u64>,
    failure_threshold: Option<u32>,
    store_path: Option<PathBuf>,
    store_ceiling: Option<u64>,
    ceiling_policy: Option<CeilingPolicy>,
    backoff: BackoffOverrides,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    flush_timeout_ms: Option<u64>,
    warn_interval_ms: Option<u64>,
}

impl SinkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authentication token (required).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Route payloads through a relay instead of the public endpoint.
    pub fn with_relay(mut self, host: impl Into<String>, port: u16) -> Self {
        self.relay = Some(Relay {
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_http_base_url(mut self, url: impl Into<String>) -> Self {
        self.http_base_url = Some(url.into());
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Toggle tagging with the local host name.
    pub fn with_host_tagging(mut self, enabled: bool) -> Self {
        self.host_tag = Some(if enabled { HostTag::Local } else { HostTag::Off });
        self
    }

    /// Tag events with a fixed host name.
    pub fn with_host_tag(mut self, tag: impl Into<String>) -> Self {
        self.host_tag = Some(HostTag::Custom(tag.into()));
        self
    }

    option_setter!(
        #[doc = "Select the persistent stream or the HTTP transport."]
        with_transport,
        transport,
        TransportKind
    );
    option_setter!(with_tls, use_tls, bool);
    option_setter!(with_format, format, MessageFormat);
    option_setter!(
        #[doc = "Set the in-memory queue capacity."]
        with_queue_capacity,
        queue_capacity,
        usize
    );
    option_setter!(with_overflow_policy, overflow_policy, QueueOverflowPolicy);
    option_setter!(with_max_chunk_len, max_chunk_len, usize);
    option_setter!(with_poll_interval_ms, poll_interval_ms, u64);
    option_setter!(with_failure_threshold, failure_threshold, u32);
    option_setter!(with_store_ceiling, store_ceiling, u64);
    option_setter!(with_ceiling_policy, ceiling_policy, CeilingPolicy);
    option_setter!(with_connect_timeout_ms, connect_timeout_ms, u64);
    option_setter!(with_write_timeout_ms, write_timeout_ms, u64);
    option_setter!(with_flush_timeout_ms, flush_timeout_ms, u64);
    option_setter!(with_warn_interval_ms, warn_interval_ms, u64);

    /// Override backoff timings using the provided overrides.
    pub fn with_backoff(mut self, overrides: BackoffOverrides) -> Self {
        self.backoff = overrides;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        self.validate_token()?;
        self.validate_transport()?;
        self.validate_sizes()?;
        self.validate_timeouts()?;
        self.validate_host_tag()?;
        Ok(())
    }

    fn validate_token(&self) -> Result<(), BuildError> {
        match &self.token {
            Some(token) if !token.trim().is_empty() => Ok(()),
            _ => Err(BuildError::InvalidConfig("token must not be empty".into())),
        }
    }

    fn validate_transport(&self) -> Result<(), BuildError> {
        let Some(relay) = &self.relay else {
            return Ok(());
        };
        if self.transport == Some(TransportKind::Http) {
            return Err(BuildError::InvalidConfig(
                "a relay cannot be combined with the http transport".into(),
            ));
        }
        if relay.host.trim().is_empty() {
            return Err(BuildError::InvalidConfig(
                "relay host must not be empty".into(),
            ));
        }
        ensure_positive!(relay.port, "relay port")?;
        Ok(())
    }

    fn validate_sizes(&self) -> Result<(), BuildError> {
        if let Some(capacity) = self.queue_capacity {
            ensure_positive!(capacity, "queue_capacity")?;
        }
        if let Some(len) = self.max_chunk_len {
            ensure_positive!(len, "max_chunk_len")?;
        }
        if let Some(threshold) = self.failure_threshold {
            ensure_positive!(threshold, "failure_threshold")?;
        }
        if let Some(ceiling) = self.store_ceiling {
            ensure_positive!(ceiling, "store_ceiling")?;
        }
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), BuildError> {
        if let Some(poll) = self.poll_interval_ms {
            ensure_positive!(poll, "poll_interval_ms")?;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            ensure_positive!(timeout, "connect_timeout_ms")?;
        }
        if let Some(timeout) = self.write_timeout_ms {
            ensure_positive!(timeout, "write_timeout_ms")?;
        }
        if let Some(timeout) = self.flush_timeout_ms {
            ensure_positive!(timeout, "flush_timeout_ms")?;
        }
        Ok(())
    }

    fn validate_host_tag(&self) -> Result<(), BuildError> {
        match &self.host_tag {
            Some(HostTag::Custom(tag)) if !is_valid_host_tag(tag) => Err(
                BuildError::InvalidConfig(format!("host tag {tag:?} contains reserved characters")),
            ),
            _ => Ok(()),
        }
    }

    /// Validate and resolve the configuration without starting a sink.
    pub fn build_config(&self) -> Result<SinkConfig, BuildError> {
        self.validate()?;
        let mut config = SinkConfig::default();
        self.apply_optional_fields(&mut config);
        self.backoff.apply(&mut config.backoff)?;
        Ok(config)
    }

    fn apply_optional_fields(&self, config: &mut SinkConfig) {
        let ms = Duration::from_millis;
        if let Some(token) = &self.token {
            config.token = token.trim().to_owned();
        }
        if let Some(kind) = self.transport {
            config.transport = kind;
        }
        if let Some(tls) = self.use_tls {
            config.use_tls = tls;
        }
        config.relay = self.relay.clone();
        if let Some(url) = &self.http_base_url {
            config.http_base_url = url.clone();
        }
        config.format = self.format;
        if let Some(tag) = &self.host_tag {
            config.host_tag = tag.clone();
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(policy) = self.overflow_policy {
            config.overflow_policy = policy;
        }
        if let Some(len) = self.max_chunk_len {
            config.max_chunk_len = len;
        }
        if let Some(poll) = self.poll_interval_ms {
            config.poll_interval = ms(poll);
        }
        if let Some(threshold) = self.failure_threshold {
            config.failure_threshold = threshold;
        }
        config.store_path = match &self.store_path {
            Some(path) => path.clone(),
            None => config.derived_store_path(),
        };
        if let Some(ceiling) = self.store_ceiling {
            config.store_ceiling = ceiling;
        }
        if let Some(policy) = self.ceiling_policy {
            config.ceiling_policy = policy;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.connect_timeout = ms(timeout);
        }
        if let Some(timeout) = self.write_timeout_ms {
            config.write_timeout = ms(timeout);
        }
        if let Some(timeout) = self.flush_timeout_ms {
            config.flush_timeout = ms(timeout);
        }
        if let Some(interval) = self.warn_interval_ms {
            config.warn_interval = ms(interval);
        }
    }

    /// Build a sink using the transport named by the configuration.
    pub fn build(&self) -> Result<ShippingSink, BuildError> {
        let config = self.build_config()?;
        let transport = network_transport(&config)?;
        ShippingSink::start(config, transport)
    }

    /// Build a sink delivering through a caller-supplied transport.
    ///
    /// The token is still required but its shape is not checked, since the
    /// transport decides what it means.
    pub fn build_with_transport<T>(&self, transport: T) -> Result<ShippingSink, BuildError>
    where
        T: Transport + 'static,
    {
        let config = self.build_config()?;
        ShippingSink::start(config, Box::new(transport))
    }
}

fn network_transport(config: &SinkConfig) -> Result<Box<dyn Transport>, BuildError> {
    match config.transport {
        TransportKind::Http => Ok(Box::new(
            HttpPostTransport::new(&config.http_base_url, &config.token)
                .with_timeouts(config.connect_timeout, config.write_timeout),
        )),
        TransportKind::Socket => {
            validate_token(&config.token)
                .map_err(|err| BuildError::InvalidConfig(err.to_string()))?;
            let transport = match &config.relay {
                Some(relay) => {
                    let transport =
                        TokenStreamTransport::new(&relay.host, relay.port, &config.token);
                    if config.use_tls {
                        transport.with_tls(TlsOptions::new(&relay.host))
                    } else {
                        transport
                    }
                }
                None => TokenStreamTransport::collector(&config.token, config.use_tls),
            };
            Ok(Box::new(transport.with_timeouts(
                config.connect_timeout,
                config.write_timeout,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TOKEN: &str = "2bfbea1e-10c3-4419-bdad-7e6435882e1f";

    fn invalid(builder: SinkBuilder) -> String {
        match builder.build_config() {
            Err(BuildError::InvalidConfig(msg)) => msg,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[rstest]
    fn defaults_apply_to_untouched_fields() {
        let config = SinkBuilder::new()
            .with_token(format!(" {TOKEN} "))
            .build_config()
            .expect("valid config");
        assert_eq!(config.token, TOKEN);
        assert_eq!(config.queue_capacity, 32_768);
        assert_eq!(config.max_chunk_len, 65_536);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.store_ceiling, 10 * 1024 * 1024);
        assert_eq!(config.effective_format(), MessageFormat::Line);
        assert_eq!(config.host_tag, HostTag::Off);
    }

    #[rstest]
    fn default_store_path_is_per_destination() {
        let build = |token: &str| {
            SinkBuilder::new()
                .with_token(token)
                .build_config()
                .expect("valid config")
        };
        let first = build(TOKEN);
        let other_token = build("5f0c1a52-8d7e-4b8e-9d3a-0c2f1e6b7a90");
        let http = SinkBuilder::new()
            .with_token(TOKEN)
            .with_transport(TransportKind::Http)
            .build_config()
            .expect("valid config");
        let explicit = SinkBuilder::new()
            .with_token(TOKEN)
            .with_store_path("/var/spool/app/overflow.log")
            .build_config()
            .expect("valid config");

        assert_eq!(first.store_path, build(TOKEN).store_path);
        assert_ne!(first.store_path, other_token.store_path);
        assert_ne!(first.store_path, http.store_path);
        assert!(first.store_path.starts_with(std::env::temp_dir().join("lineship")));
        assert_eq!(
            explicit.store_path,
            std::path::PathBuf::from("/var/spool/app/overflow.log")
        );
    }

    #[rstest]
    fn http_defaults_to_json() {
        let config = SinkBuilder::new()
            .with_token(TOKEN)
            .with_transport(TransportKind::Http)
            .build_config()
            .expect("valid config");
        assert_eq!(config.effective_format(), MessageFormat::Json);
    }

    #[rstest]
    #[case::missing_token(SinkBuilder::new(), "token")]
    #[case::blank_token(SinkBuilder::new().with_token("  "), "token")]
    #[case::http_relay(
        SinkBuilder::new().with_token(TOKEN).with_transport(TransportKind::Http).with_relay("r", 10000),
        "relay"
    )]
    #[case::empty_relay_host(SinkBuilder::new().with_token(TOKEN).with_relay(" ", 10000), "relay host")]
    #[case::zero_relay_port(SinkBuilder::new().with_token(TOKEN).with_relay("r", 0), "relay port")]
    #[case::zero_capacity(SinkBuilder::new().with_token(TOKEN).with_queue_capacity(0), "queue_capacity")]
    #[case::zero_chunk(SinkBuilder::new().with_token(TOKEN).with_max_chunk_len(0), "max_chunk_len")]
    #[case::zero_threshold(SinkBuilder::new().with_token(TOKEN).with_failure_threshold(0), "failure_threshold")]
    #[case::zero_poll(SinkBuilder::new().with_token(TOKEN).with_poll_interval_ms(0), "poll_interval_ms")]
    #[case::zero_ceiling(SinkBuilder::new().with_token(TOKEN).with_store_ceiling(0), "store_ceiling")]
    #[case::bad_host_tag(SinkBuilder::new().with_token(TOKEN).with_host_tag("web_1"), "host tag")]
    #[case::zero_backoff(
        SinkBuilder::new().with_token(TOKEN).with_backoff(BackoffOverrides::new().with_base_ms(0)),
        "backoff_base_ms"
    )]
    #[case::cap_below_base(
        SinkBuilder::new().with_token(TOKEN).with_backoff(BackoffOverrides::new().with_base_ms(500).with_cap_ms(100)),
        "backoff_cap_ms"
    )]
    fn rejects_invalid_settings(#[case] builder: SinkBuilder, #[case] field: &str) {
        let msg = invalid(builder);
        assert!(msg.contains(field), "{msg:?} should mention {field:?}");
    }

    #[rstest]
    fn stream_transport_requires_uuid_token() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = SinkBuilder::new()
            .with_token("not-a-uuid")
            .with_store_path(dir.path().join("overflow.log"))
            .build()
            .expect_err("token shape checked");
        assert!(matches!(err, BuildError::InvalidConfig(msg) if msg.contains("UUID")));
    }

    #[rstest]
    fn backoff_overrides_apply() {
        let config = SinkBuilder::new()
            .with_token(TOKEN)
            .with_backoff(
                BackoffOverrides::new()
                    .with_base_ms(20)
                    .with_cap_ms(80)
                    .with_jitter_ms(0),
            )
            .build_config()
            .expect("valid config");
        assert_eq!(
            config.backoff,
            BackoffPolicy {
                base: Duration::from_millis(20),
                cap: Duration::from_millis(80),
                jitter: Duration::ZERO,
            }
        );
    }
}
