//! Load [`SinkBuilder`] settings from an INI section.
//!
//! ```ini
//! [sink]
//! token = 2bfbea1e-10c3-4419-bdad-7e6435882e1f
//! transport = socket
//! tls = true
//! host_tag = local
//! store_path = /var/spool/app/overflow.log
//! ```
//!
//! Unknown keys are ignored so one file can carry settings for other tools.

use std::{fmt::Display, path::Path, str::FromStr};

use ini::{Ini, Properties};

use crate::{
    overflow_store::CeilingPolicy, queue::QueueOverflowPolicy, transport::TransportKind,
};

use super::{
    builder::{BackoffOverrides, BuildError, SinkBuilder},
    config::MessageFormat,
};

fn invalid(key: &str, value: &str, expected: impl Display) -> BuildError {
    BuildError::InvalidConfig(format!("{key} = {value:?}: expected {expected}"))
}

fn parse<T>(key: &str, value: &str) -> Result<T, BuildError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| invalid(key, value, err))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, BuildError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}

fn parse_transport(key: &str, value: &str) -> Result<TransportKind, BuildError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "socket" | "tcp" => Ok(TransportKind::Socket),
        "http" => Ok(TransportKind::Http),
        _ => Err(invalid(key, value, "socket or http")),
    }
}

fn parse_format(key: &str, value: &str) -> Result<MessageFormat, BuildError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "line" => Ok(MessageFormat::Line),
        "json" => Ok(MessageFormat::Json),
        "raw" => Ok(MessageFormat::Raw),
        _ => Err(invalid(key, value, "line, json or raw")),
    }
}

fn parse_overflow_policy(key: &str, value: &str) -> Result<QueueOverflowPolicy, BuildError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "evict" | "evict_oldest" => Ok(QueueOverflowPolicy::EvictOldest),
        "spill" | "spill_oldest" => Ok(QueueOverflowPolicy::SpillOldest),
        _ => Err(invalid(key, value, "evict_oldest or spill_oldest")),
    }
}

fn parse_ceiling_policy(key: &str, value: &str) -> Result<CeilingPolicy, BuildError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "discard_oldest" => Ok(CeilingPolicy::DiscardOldest),
        "reject_newest" => Ok(CeilingPolicy::RejectNewest),
        _ => Err(invalid(key, value, "discard_oldest or reject_newest")),
    }
}

fn apply_host_tag(builder: SinkBuilder, value: &str) -> SinkBuilder {
    match value.trim() {
        tag if tag.eq_ignore_ascii_case("off") || tag.is_empty() => builder.with_host_tagging(false),
        tag if tag.eq_ignore_ascii_case("local") => builder.with_host_tagging(true),
        tag => builder.with_host_tag(tag),
    }
}

fn apply_section(props: &Properties) -> Result<SinkBuilder, BuildError> {
    let mut builder = SinkBuilder::new();
    let mut backoff = BackoffOverrides::new();
    let mut relay_host = None;
    let mut relay_port = None;
    for (key, value) in props.iter() {
        builder = match key {
            "token" => builder.with_token(value.trim()),
            "transport" => builder.with_transport(parse_transport(key, value)?),
            "tls" => builder.with_tls(parse_bool(key, value)?),
            "relay_host" => {
                relay_host = Some(value.trim().to_owned());
                builder
            }
            "relay_port" => {
                relay_port = Some(parse::<u16>(key, value)?);
                builder
            }
            "http_url" => builder.with_http_base_url(value.trim()),
            "format" => builder.with_format(parse_format(key, value)?),
            "host_tag" => apply_host_tag(builder, value),
            "queue_capacity" => builder.with_queue_capacity(parse(key, value)?),
            "overflow_policy" => builder.with_overflow_policy(parse_overflow_policy(key, value)?),
            "max_chunk_len" => builder.with_max_chunk_len(parse(key, value)?),
            "poll_interval_ms" => builder.with_poll_interval_ms(parse(key, value)?),
            "failure_threshold" => builder.with_failure_threshold(parse(key, value)?),
            "store_path" => builder.with_store_path(value.trim()),
            "store_ceiling" => builder.with_store_ceiling(parse(key, value)?),
            "ceiling_policy" => builder.with_ceiling_policy(parse_ceiling_policy(key, value)?),
            "backoff_base_ms" => {
                backoff = backoff.with_base_ms(parse(key, value)?);
                builder
            }
            "backoff_cap_ms" => {
                backoff = backoff.with_cap_ms(parse(key, value)?);
                builder
            }
            "backoff_jitter_ms" => {
                backoff = backoff.with_jitter_ms(parse(key, value)?);
                builder
            }
            "connect_timeout_ms" => builder.with_connect_timeout_ms(parse(key, value)?),
            "write_timeout_ms" => builder.with_write_timeout_ms(parse(key, value)?),
            "flush_timeout_ms" => builder.with_flush_timeout_ms(parse(key, value)?),
            "warn_interval_ms" => builder.with_warn_interval_ms(parse(key, value)?),
            _ => builder,
        };
    }
    builder = match (relay_host, relay_port) {
        (Some(host), Some(port)) => builder.with_relay(host, port),
        (None, None) => builder,
        _ => {
            return Err(BuildError::InvalidConfig(
                "relay_host and relay_port must be set together".into(),
            ));
        }
    };
    Ok(builder.with_backoff(backoff))
}

fn select_section<'a>(ini: &'a Ini, section: &str) -> Result<&'a Properties, BuildError> {
    ini.section(Some(section))
        .ok_or_else(|| BuildError::Ini(format!("section [{section}] not found")))
}

impl SinkBuilder {
    /// Parse settings from INI text, reading the named section.
    pub fn from_ini_str(text: &str, section: &str) -> Result<Self, BuildError> {
        let ini = Ini::load_from_str(text).map_err(|err| BuildError::Ini(err.to_string()))?;
        apply_section(select_section(&ini, section)?)
    }

    /// Parse settings from an INI file, reading the named section.
    pub fn from_ini_file(path: impl AsRef<Path>, section: &str) -> Result<Self, BuildError> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path)
            .map_err(|err| BuildError::Ini(format!("{}: {err}", path.display())))?;
        apply_section(select_section(&ini, section)?)
    }
}
