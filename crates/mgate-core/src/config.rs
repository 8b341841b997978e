use std::time::Duration;

use clap::Parser;

/// Process configuration. Every relay knob is a flag with an environment
/// alias so deployments can configure the container either way; values are
/// trimmed and unresolved `${VAR}` placeholders from PaaS injection are
/// treated as unset.
#[derive(Debug, Clone, Parser)]
#[command(name = "mgate", version, about = "Multi-tenant AI API gateway")]
pub struct CliArgs {
    /// Database DSN (sqlite, mysql, or postgres).
    #[arg(long, env = "MGATE_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "MGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "MGATE_PORT")]
    pub port: Option<String>,

    /// Per-request wall-clock deadline, seconds (non-streaming).
    #[arg(long, env = "RELAY_TIMEOUT")]
    pub relay_timeout: Option<String>,

    /// Per-request wall-clock deadline, seconds (streaming).
    #[arg(long, env = "STREAM_RELAY_TIMEOUT")]
    pub stream_relay_timeout: Option<String>,

    /// Upper bound on dispatch attempts per request.
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<String>,

    /// Default (channel, model) cooldown after a retryable failure, seconds.
    #[arg(long, env = "RETRY_COOLDOWN_SECONDS")]
    pub retry_cooldown_seconds: Option<String>,

    /// Auto-disable channels on fatal upstream errors.
    #[arg(long, env = "AUTO_DISABLE_CHANNEL")]
    pub auto_disable_channel: Option<String>,

    /// Days to keep log_details rows.
    #[arg(long, env = "DETAILED_LOG_RETENTION_DAYS")]
    pub detailed_log_retention_days: Option<String>,

    /// Output-token ceiling used by pre-charge estimation when the client
    /// does not cap max tokens.
    #[arg(long, env = "MAX_OUTPUT_TOKENS_DEFAULT")]
    pub max_output_tokens_default: Option<String>,

    /// Capacity of the upstream-to-client stream event channel.
    #[arg(long, env = "STREAM_BUFFER_EVENTS")]
    pub stream_buffer_events: Option<String>,

    /// Seconds between channel registry refreshes from the store.
    #[arg(long, env = "CHANNEL_REFRESH_SECONDS")]
    pub channel_refresh_seconds: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub dsn: String,
    pub host: String,
    pub port: u16,
    pub relay_timeout: Duration,
    pub stream_relay_timeout: Duration,
    pub max_retries: u32,
    pub retry_cooldown: Duration,
    pub auto_disable_channel: bool,
    pub detailed_log_retention_days: u32,
    pub max_output_tokens_default: i64,
    pub stream_buffer_events: usize,
    pub channel_refresh: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite://mgate.db?mode=rwc".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3000,
            relay_timeout: Duration::from_secs(120),
            stream_relay_timeout: Duration::from_secs(600),
            max_retries: 3,
            retry_cooldown: Duration::from_secs(60),
            auto_disable_channel: true,
            detailed_log_retention_days: 7,
            max_output_tokens_default: 4096,
            stream_buffer_events: 64,
            channel_refresh: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            dsn: sanitize(args.dsn).unwrap_or(defaults.dsn),
            host: sanitize(args.host).unwrap_or(defaults.host),
            port: parse_num(args.port, "MGATE_PORT")?.unwrap_or(defaults.port),
            relay_timeout: parse_num(args.relay_timeout, "RELAY_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.relay_timeout),
            stream_relay_timeout: parse_num(args.stream_relay_timeout, "STREAM_RELAY_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream_relay_timeout),
            max_retries: parse_num(args.max_retries, "MAX_RETRIES")?
                .unwrap_or(defaults.max_retries),
            retry_cooldown: parse_num(args.retry_cooldown_seconds, "RETRY_COOLDOWN_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_cooldown),
            auto_disable_channel: parse_bool(args.auto_disable_channel, "AUTO_DISABLE_CHANNEL")?
                .unwrap_or(defaults.auto_disable_channel),
            detailed_log_retention_days: parse_num(
                args.detailed_log_retention_days,
                "DETAILED_LOG_RETENTION_DAYS",
            )?
            .unwrap_or(defaults.detailed_log_retention_days),
            max_output_tokens_default: parse_num(
                args.max_output_tokens_default,
                "MAX_OUTPUT_TOKENS_DEFAULT",
            )?
            .unwrap_or(defaults.max_output_tokens_default),
            stream_buffer_events: parse_num(args.stream_buffer_events, "STREAM_BUFFER_EVENTS")?
                .unwrap_or(defaults.stream_buffer_events),
            channel_refresh: parse_num(args.channel_refresh_seconds, "CHANNEL_REFRESH_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.channel_refresh),
        })
    }

    pub fn deadline_for(&self, stream: bool) -> Duration {
        if stream {
            self.stream_relay_timeout
        } else {
            self.relay_timeout
        }
    }
}

fn sanitize(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // PaaS systems sometimes inject unresolved `${VAR}` placeholders.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_num<T: std::str::FromStr>(value: Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = sanitize(value) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("invalid {name} value {raw:?}: {err}"))
}

fn parse_bool(value: Option<String>, name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize(value) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow::anyhow!("invalid {name} value: {raw}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_fall_back_to_defaults() {
        let args = CliArgs {
            dsn: Some("${MGATE_DSN}".to_string()),
            host: None,
            port: Some(" 8080 ".to_string()),
            relay_timeout: Some("30".to_string()),
            stream_relay_timeout: None,
            max_retries: None,
            retry_cooldown_seconds: None,
            auto_disable_channel: Some("off".to_string()),
            detailed_log_retention_days: None,
            max_output_tokens_default: None,
            stream_buffer_events: None,
            channel_refresh_seconds: None,
        };
        let config = RelayConfig::from_args(args).unwrap();
        assert_eq!(config.dsn, RelayConfig::default().dsn);
        assert_eq!(config.port, 8080);
        assert_eq!(config.relay_timeout, Duration::from_secs(30));
        assert!(!config.auto_disable_channel);
    }

    #[test]
    fn bad_number_is_an_error() {
        let args = CliArgs {
            dsn: None,
            host: None,
            port: Some("eighty".to_string()),
            relay_timeout: None,
            stream_relay_timeout: None,
            max_retries: None,
            retry_cooldown_seconds: None,
            auto_disable_channel: None,
            detailed_log_retention_days: None,
            max_output_tokens_default: None,
            stream_buffer_events: None,
            channel_refresh_seconds: None,
        };
        assert!(RelayConfig::from_args(args).is_err());
    }
}
